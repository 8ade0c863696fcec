//! Address-lease subsystem
//!
//! A durable pool of fixed address slots with single-holder and contiguity
//! guarantees: the store persists slots in SQLite, the service layers the
//! allocation policy on top, and the RPC server exposes the operator
//! reservation surface over loopback TCP.

pub mod allocator;
pub mod rpc;
pub mod store;

// Re-export main public API
pub use allocator::{LeaseAssignment, LeaseService, PoolConfig, StaticReservation};
pub use rpc::RpcServer;
pub use store::LeaseStore;
