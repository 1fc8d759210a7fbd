// Bounded retry for idempotent reads.
//
// Cluster-wide listings (nodes, storages, resources) and live config
// reads occasionally fail on busy clusters; a few spaced attempts are
// enough. This is deliberately separate from task polling, which waits
// for long-running work rather than tolerating flaky reads.

use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use crate::client::Client;
use crate::error::Error;

/// Default number of attempts for retryable reads.
pub const READ_RETRY_TRIES: u32 = 3;

/// Default pause between read attempts.
pub const READ_RETRY_INTERVAL: Duration = Duration::from_secs(5);

impl Client {
    /// GET a path, retrying up to [`READ_RETRY_TRIES`] times with
    /// [`READ_RETRY_INTERVAL`] between attempts. Returns the first
    /// successful envelope or the last observed error.
    pub async fn get_json_retryable(&self, path: &str) -> Result<Value, Error> {
        self.get_json_retryable_with(path, READ_RETRY_TRIES, READ_RETRY_INTERVAL)
            .await
    }

    /// GET with an explicit attempt count and pause.
    pub async fn get_json_retryable_with(
        &self,
        path: &str,
        tries: u32,
        interval: Duration,
    ) -> Result<Value, Error> {
        let mut last_err = None;
        for attempt in 1..=tries.max(1) {
            match self.get_json(path).await {
                Ok(envelope) => return Ok(envelope),
                Err(e) => {
                    debug!("read attempt {attempt}/{tries} for {path} failed: {e}");
                    last_err = Some(e);
                }
            }
            if attempt < tries {
                sleep(interval).await;
            }
        }
        // tries >= 1, so an error was recorded before falling through
        Err(last_err.expect("retry loop ran at least once"))
    }
}
