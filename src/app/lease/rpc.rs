//! Loopback reservation RPC
//!
//! Newline-delimited JSON over TCP, bound to loopback by convention. One
//! request object per line, one response object per line. Only the operator
//! reservation surface is exposed here; protocol allocation stays in-process.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::app::lease::allocator::LeaseService;
use crate::constants::rpc;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    ReserveSingleAddress {
        pool: String,
        label: String,
        mac: Option<String>,
    },
    ReserveAddressRange {
        pool: String,
        count: usize,
        label: String,
    },
    ReleaseAddress {
        address: Ipv4Addr,
    },
    ListReservedAddresses {
        pool: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Address { address: Ipv4Addr },
    Addresses { addresses: Vec<Ipv4Addr> },
    Reservations { reservations: BTreeMap<String, String> },
    Released { released: Ipv4Addr },
    Error { error: String },
}

/// Reservation API server for one lease service
pub struct RpcServer {
    service: Arc<LeaseService>,
    listener: TcpListener,
}

impl RpcServer {
    /// Bind to `addr`, or the default loopback address when `None`
    pub async fn bind(service: Arc<LeaseService>, addr: Option<&str>) -> std::io::Result<Self> {
        let addr = addr.unwrap_or(rpc::DEFAULT_BIND_ADDR);
        let listener = TcpListener::bind(addr).await?;
        info!("Reservation API listening on {}", listener.local_addr()?);
        Ok(Self { service, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is cancelled
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!("Reservation connection from {}", peer);
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, service).await {
                    warn!("Reservation connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<LeaseService>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let cap = rpc::MAX_REQUEST_BYTES as u64;

    loop {
        buf.clear();
        // Bound each read so a line that never terminates cannot grow the
        // buffer past the request cap
        let n = (&mut reader)
            .take(cap + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(());
        }
        let terminated = buf.last() == Some(&b'\n');
        if !terminated && buf.len() as u64 > cap {
            // Mid-line there is no way back in sync with the peer
            let response = Response::Error {
                error: format!("request exceeds {} bytes", rpc::MAX_REQUEST_BYTES),
            };
            write_response(&mut write_half, &response).await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => dispatch(&service, request).await,
            Err(e) => Response::Error {
                error: format!("malformed request: {}", e),
            },
        };
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response(
    write_half: &mut OwnedWriteHalf,
    response: &Response,
) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await
}

async fn dispatch(service: &LeaseService, request: Request) -> Response {
    match request {
        Request::ReserveSingleAddress { pool, label, mac } => {
            match service.reserve_single(&pool, &label, mac.as_deref()).await {
                Ok(address) => Response::Address { address },
                Err(e) => Response::Error { error: e.to_string() },
            }
        }
        Request::ReserveAddressRange { pool, count, label } => {
            match service.reserve_range(&pool, count, &label).await {
                Ok(addresses) => Response::Addresses { addresses },
                Err(e) => Response::Error { error: e.to_string() },
            }
        }
        Request::ReleaseAddress { address } => match service.release(address).await {
            Ok(()) => Response::Released { released: address },
            Err(e) => Response::Error { error: e.to_string() },
        },
        Request::ListReservedAddresses { pool } => match service.list_reserved(&pool).await {
            Ok(reserved) => Response::Reservations {
                reservations: reserved
                    .into_iter()
                    .map(|(addr, label)| (addr.to_string(), label))
                    .collect(),
            },
            Err(e) => Response::Error { error: e.to_string() },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease::allocator::PoolConfig;
    use crate::app::lease::store::LeaseStore;

    async fn start_server() -> (SocketAddr, Arc<LeaseService>) {
        let store = LeaseStore::in_memory().await.unwrap();
        let config = PoolConfig::new(
            "mgmt",
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 14),
        );
        let service = Arc::new(LeaseService::new(store, vec![config]).await.unwrap());
        let server = RpcServer::bind(Arc::clone(&service), Some("127.0.0.1:0"))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        (addr, service)
    }

    async fn roundtrip(stream: &mut TcpStream, request: &str) -> serde_json::Value {
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_release_list_over_the_wire() {
        let (addr, _service) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"reserve_single_address","pool":"mgmt","label":"infra"}"#,
        )
        .await;
        assert_eq!(reply["address"], "10.0.0.10");

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"reserve_address_range","pool":"mgmt","count":2,"label":"cluster"}"#,
        )
        .await;
        assert_eq!(
            reply["addresses"],
            serde_json::json!(["10.0.0.11", "10.0.0.12"])
        );

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"list_reserved_addresses","pool":"mgmt"}"#,
        )
        .await;
        assert_eq!(reply["reservations"]["10.0.0.10"], "infra");
        assert_eq!(reply["reservations"]["10.0.0.12"], "cluster");

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"release_address","address":"10.0.0.10"}"#,
        )
        .await;
        assert_eq!(reply["released"], "10.0.0.10");

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"list_reserved_addresses","pool":"mgmt"}"#,
        )
        .await;
        assert!(reply["reservations"].get("10.0.0.10").is_none());
    }

    #[tokio::test]
    async fn test_errors_are_structured() {
        let (addr, _service) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"reserve_address_range","pool":"mgmt","count":50,"label":"huge"}"#,
        )
        .await;
        let error = reply["error"].as_str().unwrap();
        assert!(error.contains("mgmt"), "error should name the pool: {}", error);

        let reply = roundtrip(
            &mut stream,
            r#"{"op":"reserve_single_address","pool":"nope","label":"x"}"#,
        )
        .await;
        assert!(reply["error"].as_str().unwrap().contains("nope"));

        let reply = roundtrip(&mut stream, r#"{"not":"a request"}"#).await;
        assert!(reply["error"].as_str().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_unterminated_oversized_request_is_rejected() {
        let (addr, _service) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // More than the cap without ever sending a newline: the server must
        // answer and hang up instead of buffering until one arrives
        let oversized = vec![b'x'; rpc::MAX_REQUEST_BYTES + 10];
        stream.write_all(&oversized).await.unwrap();

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(reply["error"].as_str().unwrap().contains("exceeds"));

        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);
    }
}
