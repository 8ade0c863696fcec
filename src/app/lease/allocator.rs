//! Allocation policy over the lease store
//!
//! The protocol-facing path (`get_response`) is quiet: any reason an address
//! cannot be produced comes back as `None`, logged, and the handler moves on.
//! The operator-facing reservation API raises structured `LeaseError`s
//! instead, since those callers want to know why.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::lease::store::LeaseStore;
use crate::constants::leases;
use crate::errors::{ConfigError, ConfigResult, LeaseError, LeaseResult};

/// A statically reserved address for one known MAC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticReservation {
    pub address: Ipv4Addr,
    pub hostname: String,
}

/// Configuration of one address pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    /// Lease duration for dynamic assignments
    pub lease_time: Duration,
    /// Lease duration for statically reserved assignments
    pub static_lease_time: Duration,
    /// Static reservations keyed by lower-cased MAC
    pub static_reservations: HashMap<String, StaticReservation>,
    /// MAC prefixes whose requests are skipped entirely
    pub mac_exclusions: Vec<String>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            lease_time: leases::DEFAULT_LEASE_TIME,
            static_lease_time: leases::STATIC_LEASE_TIME,
            static_reservations: HashMap::new(),
            mac_exclusions: leases::DEFAULT_MAC_EXCLUSIONS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if u32::from(self.start) > u32::from(self.end) {
            return Err(ConfigError::InvalidPoolBounds {
                pool: self.name.clone(),
                start: self.start.to_string(),
                end: self.end.to_string(),
            });
        }
        Ok(())
    }

    fn excludes(&self, mac: &str) -> bool {
        self.mac_exclusions.iter().any(|p| mac.starts_with(p.as_str()))
    }
}

/// Result of an allocation decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseAssignment {
    pub address: Ipv4Addr,
    pub hostname: String,
    /// Seconds the assignment is valid for
    pub lease_secs: u64,
    pub pool: String,
    pub is_static: bool,
}

/// Owns the lease store and the per-pool allocation policy
#[derive(Debug)]
pub struct LeaseService {
    store: LeaseStore,
    pools: HashMap<String, PoolConfig>,
}

impl LeaseService {
    /// Validate the pool configs and resync the store against their bounds
    pub async fn new(store: LeaseStore, pools: Vec<PoolConfig>) -> crate::errors::Result<Self> {
        let mut by_name = HashMap::new();
        for pool in pools {
            pool.validate()?;
            store.resync_pool(&pool.name, pool.start, pool.end).await?;
            by_name.insert(pool.name.clone(), pool);
        }
        Ok(Self { store, pools: by_name })
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    /// Decide an assignment for a protocol request
    ///
    /// Static reservation wins, then an address reserved for the MAC through
    /// the operator API, then renew-in-place for address stability, then a
    /// fresh claim. `None` means no assignment; the reason is logged.
    pub async fn get_response(&self, pool_name: &str, mac: &str) -> Option<LeaseAssignment> {
        let mac = mac.to_ascii_lowercase();
        let pool = match self.pools.get(pool_name) {
            Some(pool) => pool,
            None => {
                warn!("Request from {} for unknown pool {}", mac, pool_name);
                return None;
            }
        };
        if pool.excludes(&mac) {
            debug!("Ignoring excluded MAC {}", mac);
            return None;
        }

        if let Some(fixed) = pool.static_reservations.get(&mac) {
            // Configuration is the authority; the row update is bookkeeping
            if let Err(e) = self
                .store
                .pin(pool_name, &mac, fixed.address, pool.static_lease_time)
                .await
            {
                warn!("Could not record static lease for {}: {}", mac, e);
            }
            debug!("Static reservation {} for {}", fixed.address, mac);
            return Some(LeaseAssignment {
                address: fixed.address,
                hostname: fixed.hostname.clone(),
                lease_secs: pool.static_lease_time.as_secs(),
                pool: pool_name.to_string(),
                is_static: true,
            });
        }

        match self.store.find_reserved_for_mac(pool_name, &mac).await {
            Ok(Some(addr)) => {
                // Keep the expiry current so the row reads as held while reserved
                if let Err(e) = self.store.renew(pool_name, &mac, addr, pool.lease_time).await {
                    warn!("Could not refresh reserved lease for {}: {}", mac, e);
                }
                debug!("Operator reservation {} for {}", addr, mac);
                return Some(LeaseAssignment {
                    hostname: synthesize_hostname(addr),
                    address: addr,
                    lease_secs: pool.lease_time.as_secs(),
                    pool: pool_name.to_string(),
                    is_static: false,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Reservation lookup failed for {}: {}", mac, e);
                return None;
            }
        }

        match self.dynamic_assignment(pool, &mac).await {
            Ok(Some(address)) => Some(LeaseAssignment {
                hostname: synthesize_hostname(address),
                address,
                lease_secs: pool.lease_time.as_secs(),
                pool: pool_name.to_string(),
                is_static: false,
            }),
            Ok(None) => {
                info!("Pool {} has no free address for {}", pool_name, mac);
                None
            }
            Err(e) => {
                warn!("Allocation in pool {} failed for {}: {}", pool_name, mac, e);
                None
            }
        }
    }

    async fn dynamic_assignment(
        &self,
        pool: &PoolConfig,
        mac: &str,
    ) -> LeaseResult<Option<Ipv4Addr>> {
        if let Some(addr) = self.store.find_active_lease(&pool.name, mac).await? {
            if self.store.renew(&pool.name, mac, addr, pool.lease_time).await? {
                debug!("Renewed {} for {}", addr, mac);
                return Ok(Some(addr));
            }
            // Raced away between lookup and renewal; fall through to a claim
        }
        self.store.claim_free(&pool.name, mac, pool.lease_time).await
    }

    /// Reserve one free address under a label
    pub async fn reserve_single(
        &self,
        pool_name: &str,
        label: &str,
        mac: Option<&str>,
    ) -> LeaseResult<Ipv4Addr> {
        self.require_pool(pool_name)?;
        let mac = mac.map(|m| m.to_ascii_lowercase());
        let addr = self
            .store
            .reserve_one(pool_name, label, mac.as_deref())
            .await?;
        info!("Reserved {} in pool {} as {:?}", addr, pool_name, label);
        Ok(addr)
    }

    /// Reserve a contiguous run of addresses, all or nothing
    pub async fn reserve_range(
        &self,
        pool_name: &str,
        count: usize,
        label: &str,
    ) -> LeaseResult<Vec<Ipv4Addr>> {
        self.require_pool(pool_name)?;
        let addrs = self.store.reserve_contiguous(pool_name, count, label).await?;
        info!(
            "Reserved {} contiguous addresses in pool {} as {:?}",
            addrs.len(),
            pool_name,
            label
        );
        Ok(addrs)
    }

    /// Release a reservation by address
    pub async fn release(&self, addr: Ipv4Addr) -> LeaseResult<()> {
        self.store.release(addr).await
    }

    /// Reserved addresses of a pool with their labels
    pub async fn list_reserved(&self, pool_name: &str) -> LeaseResult<Vec<(Ipv4Addr, String)>> {
        self.require_pool(pool_name)?;
        self.store.list_reserved(pool_name).await
    }

    /// Force a dynamic lease to expire, freeing its slot
    pub async fn expire(&self, addr: Ipv4Addr) -> LeaseResult<()> {
        self.store.force_expire(addr).await
    }

    fn require_pool(&self, pool_name: &str) -> LeaseResult<&PoolConfig> {
        self.pools.get(pool_name).ok_or_else(|| LeaseError::UnknownPool {
            pool: pool_name.to_string(),
        })
    }
}

/// Hostname handed out with dynamic assignments
fn synthesize_hostname(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{}-{}-{}-{}-{}", leases::HOSTNAME_PREFIX, a, b, c, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: &str = "mgmt";

    fn pool_config() -> PoolConfig {
        PoolConfig::new(POOL, Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 14))
    }

    async fn service(config: PoolConfig) -> LeaseService {
        let store = LeaseStore::in_memory().await.unwrap();
        LeaseService::new(store, vec![config]).await.unwrap()
    }

    #[tokio::test]
    async fn test_renewal_keeps_the_same_address() {
        let service = service(pool_config()).await;
        let first = service.get_response(POOL, "AA:BB:CC:DD:EE:01").await.unwrap();
        // Another consumer takes the next slot in between
        service.get_response(POOL, "aa:bb:cc:dd:ee:02").await.unwrap();
        let second = service.get_response(POOL, "aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(first.address, second.address);
        assert!(!second.is_static);
    }

    #[tokio::test]
    async fn test_static_reservation_wins() {
        let mut config = pool_config();
        config.static_reservations.insert(
            "aa:bb:cc:dd:ee:01".to_string(),
            StaticReservation {
                address: Ipv4Addr::new(10, 0, 0, 13),
                hostname: "build-controller".to_string(),
            },
        );
        let service = service(config).await;

        let assignment = service.get_response(POOL, "AA:BB:CC:DD:EE:01").await.unwrap();
        assert_eq!(assignment.address, Ipv4Addr::new(10, 0, 0, 13));
        assert_eq!(assignment.hostname, "build-controller");
        assert!(assignment.is_static);
        assert_eq!(
            assignment.lease_secs,
            crate::constants::leases::STATIC_LEASE_TIME.as_secs()
        );
    }

    #[tokio::test]
    async fn test_excluded_mac_prefixes_are_ignored() {
        let service = service(pool_config()).await;
        assert!(service.get_response(POOL, "02:00:00:00:00:01").await.is_none());
        assert!(service.get_response(POOL, "06:12:34:56:78:9a").await.is_none());
        assert!(service.get_response(POOL, "aa:00:00:00:00:01").await.is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_is_quiet_on_the_protocol_path() {
        let service = service(pool_config()).await;
        for i in 0..5 {
            let mac = format!("aa:bb:cc:dd:ee:{:02x}", i);
            assert!(service.get_response(POOL, &mac).await.is_some());
        }
        assert!(service.get_response(POOL, "aa:bb:cc:dd:ee:ff").await.is_none());

        // Freeing one slot makes the next request succeed
        service.expire(Ipv4Addr::new(10, 0, 0, 11)).await.unwrap();
        let assignment = service.get_response(POOL, "aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(assignment.address, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_share_an_address() {
        let service = std::sync::Arc::new(service(pool_config()).await);

        let mut handles = Vec::new();
        for i in 0..6 {
            let s = service.clone();
            handles.push(tokio::spawn(async move {
                let mac = format!("aa:bb:cc:dd:ee:{:02x}", i);
                s.get_response(POOL, &mac).await
            }));
        }

        let mut addresses = std::collections::HashSet::new();
        let mut misses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Some(assignment) => {
                    assert!(
                        addresses.insert(assignment.address),
                        "address {} handed out twice",
                        assignment.address
                    );
                }
                None => misses += 1,
            }
        }
        // Five slots, six claimants: exactly one goes without
        assert_eq!(addresses.len(), 5);
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn test_reserved_address_is_handed_to_its_mac() {
        let service = service(pool_config()).await;
        let reserved = service
            .reserve_single(POOL, "build-host", Some("AA:BB:CC:DD:EE:01"))
            .await
            .unwrap();
        // Another consumer claims the next dynamic slot in between
        service.get_response(POOL, "aa:bb:cc:dd:ee:02").await.unwrap();

        let assignment = service.get_response(POOL, "aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(assignment.address, reserved);
        assert!(!assignment.is_static);

        // Released reservations stop pinning; the MAC carries on as a normal
        // lease holder at the same address
        service.release(reserved).await.unwrap();
        let after = service.get_response(POOL, "aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(after.address, reserved);
    }

    #[tokio::test]
    async fn test_unknown_pool_in_reservation_api() {
        let service = service(pool_config()).await;
        let err = service.reserve_single("nope", "infra", None).await;
        assert!(matches!(err, Err(LeaseError::UnknownPool { .. })));
    }

    #[tokio::test]
    async fn test_invalid_pool_bounds_rejected() {
        let config = PoolConfig::new(POOL, Ipv4Addr::new(10, 0, 0, 20), Ipv4Addr::new(10, 0, 0, 10));
        let store = LeaseStore::in_memory().await.unwrap();
        assert!(LeaseService::new(store, vec![config]).await.is_err());
    }

    #[test]
    fn test_hostname_synthesis() {
        assert_eq!(
            synthesize_hostname(Ipv4Addr::new(10, 0, 0, 12)),
            "rig-10-0-0-12"
        );
    }
}
