//! Durable lease-slot table
//!
//! One row per (pool, address). Expiry is the authority for whether a slot is
//! free: stale owner metadata on an expired row never blocks a new claim.
//! Every mutation that hands out an address is a single conditional statement,
//! so "find candidate" and "mark it owned" can never interleave across two
//! callers.

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

use crate::errors::{LeaseError, LeaseResult};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS leases (
    addr_int INTEGER PRIMARY KEY,
    addr     TEXT NOT NULL,
    pool     TEXT NOT NULL,
    mac      TEXT,
    expiry   INTEGER NOT NULL DEFAULT 0,
    reserved TEXT
);
CREATE INDEX IF NOT EXISTS idx_leases_pool ON leases(pool);
";

/// SQLite-backed store of lease slots
#[derive(Debug, Clone)]
pub struct LeaseStore {
    pool: Pool<Sqlite>,
}

impl LeaseStore {
    /// Open (creating if missing) the lease database at `path`
    pub async fn new(path: impl AsRef<Path>) -> LeaseResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LeaseError::Database(e.into()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // Prevent transient "database is locked" errors under concurrent access
            .busy_timeout(Duration::from_secs(5));

        Self::connect(opts).await
    }

    /// Open a process-private in-memory store
    pub async fn in_memory() -> LeaseResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> LeaseResult<Self> {
        // SQLite permits limited write concurrency; a single pinned connection
        // avoids "database is locked" failures and keeps in-memory databases
        // alive for the lifetime of the store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Reconcile the table with the configured boundaries of a pool
    ///
    /// Deletes rows outside [start, end] that carry this pool's name, deletes
    /// in-range rows claimed by a different pool name, and inserts any address
    /// in range that has no row yet. Safe to run on every process start;
    /// repeated calls with identical bounds never churn in-range owner or
    /// expiry data.
    pub async fn resync_pool(
        &self,
        pool_name: &str,
        start: Ipv4Addr,
        end: Ipv4Addr,
    ) -> LeaseResult<()> {
        let (start_int, end_int) = (addr_to_int(start), addr_to_int(end));
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM leases WHERE pool = ? AND (addr_int < ? OR addr_int > ?)")
            .bind(pool_name)
            .bind(start_int)
            .bind(end_int)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM leases WHERE pool != ? AND addr_int BETWEEN ? AND ?")
            .bind(pool_name)
            .bind(start_int)
            .bind(end_int)
            .execute(&mut *tx)
            .await?;

        let mut inserted = 0u64;
        for addr_int in start_int..=end_int {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO leases (addr_int, addr, pool) VALUES (?, ?, ?)",
            )
            .bind(addr_int)
            .bind(int_to_addr(addr_int).to_string())
            .bind(pool_name)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        if inserted > 0 {
            info!(
                "Pool {} resynced to {}-{} ({} new slots)",
                pool_name, start, end, inserted
            );
        }
        Ok(())
    }

    /// Most-recently-expiring unexpired address held by `mac`, if any
    pub async fn find_active_lease(
        &self,
        pool_name: &str,
        mac: &str,
    ) -> LeaseResult<Option<Ipv4Addr>> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT addr_int FROM leases
             WHERE pool = ? AND mac = ? AND expiry > ?
             ORDER BY expiry DESC LIMIT 1",
        )
        .bind(pool_name)
        .bind(mac)
        .bind(now_ts())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(int_to_addr))
    }

    /// Reserved address recorded for `mac`, if any
    ///
    /// Reservations pin an address to a MAC independently of lease expiry, so
    /// the row matches on owner alone.
    pub async fn find_reserved_for_mac(
        &self,
        pool_name: &str,
        mac: &str,
    ) -> LeaseResult<Option<Ipv4Addr>> {
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT addr_int FROM leases
             WHERE pool = ? AND mac = ? AND reserved IS NOT NULL
             ORDER BY addr_int LIMIT 1",
        )
        .bind(pool_name)
        .bind(mac)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(int_to_addr))
    }

    /// Extend the expiry of an existing lease
    ///
    /// Conditional on the row still being held by `mac`; returns false (no
    /// row mutated) when the lease has raced away.
    pub async fn renew(
        &self,
        pool_name: &str,
        mac: &str,
        addr: Ipv4Addr,
        lease_time: Duration,
    ) -> LeaseResult<bool> {
        let result = sqlx::query(
            "UPDATE leases SET expiry = ?
             WHERE pool = ? AND addr_int = ? AND mac = ?",
        )
        .bind(now_ts() + lease_time.as_secs() as i64)
        .bind(pool_name)
        .bind(addr_to_int(addr))
        .bind(mac)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Atomically claim the lowest free address for `mac`
    ///
    /// Free means not statically reserved and either never owned or expired.
    /// Selection and claim are one conditional UPDATE with the free predicate
    /// repeated on the outer statement, so two concurrent claimers can never
    /// receive the same address.
    pub async fn claim_free(
        &self,
        pool_name: &str,
        mac: &str,
        lease_time: Duration,
    ) -> LeaseResult<Option<Ipv4Addr>> {
        let now = now_ts();
        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE leases SET mac = ?, expiry = ?
             WHERE addr_int = (
                 SELECT addr_int FROM leases
                 WHERE pool = ? AND reserved IS NULL
                   AND (mac IS NULL OR expiry <= ?)
                 ORDER BY addr_int LIMIT 1
             )
             AND reserved IS NULL AND (mac IS NULL OR expiry <= ?)
             RETURNING addr_int",
        )
        .bind(mac)
        .bind(now + lease_time.as_secs() as i64)
        .bind(pool_name)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(addr_int) = claimed {
            debug!("Claimed {} in pool {} for {}", int_to_addr(addr_int), pool_name, mac);
        }
        Ok(claimed.map(int_to_addr))
    }

    /// Pin a specific address to a holder, regardless of prior row state
    ///
    /// Used for statically reserved addresses, where configuration is the
    /// authority and the row only mirrors it for bookkeeping.
    pub async fn pin(
        &self,
        pool_name: &str,
        mac: &str,
        addr: Ipv4Addr,
        lease_time: Duration,
    ) -> LeaseResult<()> {
        sqlx::query(
            "UPDATE leases SET mac = ?, expiry = ?
             WHERE pool = ? AND addr_int = ?",
        )
        .bind(mac)
        .bind(now_ts() + lease_time.as_secs() as i64)
        .bind(pool_name)
        .bind(addr_to_int(addr))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reserve the lowest free address under an opaque label
    ///
    /// A `mac` recorded here pins the address: protocol requests from that
    /// MAC are answered with the reserved address until it is released.
    pub async fn reserve_one(
        &self,
        pool_name: &str,
        label: &str,
        mac: Option<&str>,
    ) -> LeaseResult<Ipv4Addr> {
        let now = now_ts();
        let claimed: Option<i64> = sqlx::query_scalar(
            "UPDATE leases SET reserved = ?, mac = COALESCE(?, mac)
             WHERE addr_int = (
                 SELECT addr_int FROM leases
                 WHERE pool = ? AND reserved IS NULL
                   AND (mac IS NULL OR expiry <= ?)
                 ORDER BY addr_int LIMIT 1
             )
             AND reserved IS NULL AND (mac IS NULL OR expiry <= ?)
             RETURNING addr_int",
        )
        .bind(label)
        .bind(mac)
        .bind(pool_name)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        claimed.map(int_to_addr).ok_or_else(|| LeaseError::Exhausted {
            pool: pool_name.to_string(),
            reason: "no free address to reserve".to_string(),
        })
    }

    /// Reserve `count` strictly consecutive free addresses, all or nothing
    ///
    /// The scan and the marking happen inside one transaction on the store's
    /// single writer connection; on any shortfall nothing is mutated.
    pub async fn reserve_contiguous(
        &self,
        pool_name: &str,
        count: usize,
        label: &str,
    ) -> LeaseResult<Vec<Ipv4Addr>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let free: Vec<i64> = sqlx::query_scalar(
            "SELECT addr_int FROM leases
             WHERE pool = ? AND reserved IS NULL
               AND (mac IS NULL OR expiry <= ?)
             ORDER BY addr_int",
        )
        .bind(pool_name)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let run = find_consecutive_run(&free, count).ok_or_else(|| LeaseError::Exhausted {
            pool: pool_name.to_string(),
            reason: format!("no run of {} consecutive free addresses", count),
        })?;

        for &addr_int in run {
            let result = sqlx::query(
                "UPDATE leases SET reserved = ?
                 WHERE addr_int = ? AND reserved IS NULL",
            )
            .bind(label)
            .bind(addr_int)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                // Dropping the transaction rolls back the partial set
                return Err(LeaseError::Exhausted {
                    pool: pool_name.to_string(),
                    reason: "candidate run was claimed concurrently".to_string(),
                });
            }
        }
        tx.commit().await?;

        Ok(run.iter().copied().map(int_to_addr).collect())
    }

    /// Clear the reservation label on an address (owner and expiry untouched)
    pub async fn release(&self, addr: Ipv4Addr) -> LeaseResult<()> {
        sqlx::query("UPDATE leases SET reserved = NULL WHERE addr_int = ?")
            .bind(addr_to_int(addr))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All reserved addresses of a pool with their labels, in address order
    pub async fn list_reserved(&self, pool_name: &str) -> LeaseResult<Vec<(Ipv4Addr, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT addr_int, reserved FROM leases
             WHERE pool = ? AND reserved IS NOT NULL
             ORDER BY addr_int",
        )
        .bind(pool_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(addr_int, label)| (int_to_addr(addr_int), label))
            .collect())
    }

    /// Force a lease to expire immediately
    pub async fn force_expire(&self, addr: Ipv4Addr) -> LeaseResult<()> {
        sqlx::query("UPDATE leases SET expiry = 0 WHERE addr_int = ?")
            .bind(addr_to_int(addr))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of slot rows a pool currently has
    pub async fn slot_count(&self, pool_name: &str) -> LeaseResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE pool = ?")
            .bind(pool_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn addr_to_int(addr: Ipv4Addr) -> i64 {
    u32::from(addr) as i64
}

fn int_to_addr(addr_int: i64) -> Ipv4Addr {
    Ipv4Addr::from(addr_int as u32)
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// First window of `count` strictly consecutive values in a sorted slice
fn find_consecutive_run(sorted: &[i64], count: usize) -> Option<&[i64]> {
    if sorted.len() < count {
        return None;
    }
    for start in 0..=(sorted.len() - count) {
        let window = &sorted[start..start + count];
        if window[count - 1] - window[0] == (count - 1) as i64 {
            return Some(window);
        }
    }
    None
}
