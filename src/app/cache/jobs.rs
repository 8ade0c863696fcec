//! Job-status oracle
//!
//! Waiters use this collaborator to decide whether a fetch marker left by
//! another process is stale: if the owning job is no longer running, the
//! marker may be force-cleared. The original creator never clears its own
//! marker after the fact; only waiters do.

use async_trait::async_trait;
use tracing::warn;

/// Answers "is this job still running?" for fetch-marker owners
#[async_trait]
pub trait JobOracle: Send + Sync {
    async fn is_job_running(&self, job_id: &str) -> bool;
}

/// Oracle for deployments without a job system
///
/// Reports every owner as dead, so stale markers are cleared on the first
/// poll. Suitable for single-host use where a marker without a live fetch
/// can only mean a crashed process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJobs;

#[async_trait]
impl JobOracle for NoJobs {
    async fn is_job_running(&self, _job_id: &str) -> bool {
        false
    }
}

/// Oracle backed by an HTTP job-status endpoint
///
/// Queries `<status_url>/<job_id>`; a 2xx response whose body starts with
/// "running" means alive. Probe failures are treated as "still running" so a
/// flaky status service cannot cause a live fetch's marker to be cleared.
#[derive(Debug, Clone)]
pub struct HttpJobOracle {
    client: reqwest::Client,
    status_url: String,
}

impl HttpJobOracle {
    pub fn new(client: reqwest::Client, status_url: impl Into<String>) -> Self {
        Self {
            client,
            status_url: status_url.into(),
        }
    }
}

#[async_trait]
impl JobOracle for HttpJobOracle {
    async fn is_job_running(&self, job_id: &str) -> bool {
        let url = format!("{}/{}", self.status_url.trim_end_matches('/'), job_id);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => body.trim().starts_with("running"),
                Err(_) => true,
            },
            Ok(_) => false,
            Err(e) => {
                warn!("Job status probe for {} failed ({}), assuming alive", job_id, e);
                true
            }
        }
    }
}
