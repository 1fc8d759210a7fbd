// Asynchronous task lifecycle.
//
// Mutating operations return a UPID task handle in the response envelope;
// the node then has to be polled until the task reports an exit status.
// `wait_for_task` folds that fire-and-poll protocol into a single
// awaitable outcome.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::client::Client;
use crate::error::Error;

/// Exit status a node reports for a successfully finished task.
pub const EXIT_STATUS_OK: &str = "OK";

static RX_UPID_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^UPID:([^:]+):").expect("valid UPID regex"));

/// A task handle: `UPID:<node>:<rest>`.
///
/// The owning node is extracted at parse time; status polls are issued
/// against that node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upid {
    raw: String,
    node: String,
}

impl Upid {
    /// Parse a raw UPID string, extracting the owning node.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let node = RX_UPID_NODE
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .ok_or_else(|| Error::InvalidUpid { upid: raw.to_owned() })?;
        Ok(Self {
            raw: raw.to_owned(),
            node,
        })
    }

    /// The node that owns this task.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The full UPID string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }
}

impl std::fmt::Display for Upid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Terminal outcome of waiting on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task finished successfully. Carries the exit status string,
    /// empty when the operation completed synchronously and never
    /// produced a task handle.
    Success(String),
    /// The task finished with a non-success exit status (verbatim).
    Failure(String),
    /// The deadline elapsed before a terminal status was observed.
    Timeout(Upid),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Polling parameters for [`Client::wait_for_task`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Pause between status queries.
    pub poll_interval: Duration,
    /// Wall-clock budget for the whole wait.
    pub deadline: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(300),
        }
    }
}

impl Client {
    /// Fetch a task's exit status, `None` while it is still running.
    ///
    /// `GET /nodes/{node}/tasks/{upid}/status`
    pub async fn task_exit_status(&self, upid: &Upid) -> Result<Option<String>, Error> {
        let path = format!("/nodes/{}/tasks/{}/status", upid.node(), upid.as_str());
        let envelope = self.get_json(&path).await?;
        Ok(envelope
            .get("data")
            .and_then(|d| d.get("exitstatus"))
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    /// Wait for the task referenced by a submission envelope to finish.
    ///
    /// The envelope drives the initial transition:
    /// - a non-null `errors` field is a submission rejection: immediate
    ///   [`TaskOutcome::Failure`], no polling;
    /// - a null or non-string `data` field means the operation completed
    ///   synchronously: immediate [`TaskOutcome::Success`] with empty status;
    /// - otherwise `data` is the UPID and the owning node is polled every
    ///   `poll_interval` until an exit status appears or `deadline` elapses.
    ///
    /// Truncated status reads are tolerated and polling continues (the
    /// node may still be writing the status record); any other query
    /// error aborts the wait. Terminal outcomes are never retried.
    pub async fn wait_for_task(
        &self,
        envelope: &Value,
        opts: &WaitOptions,
    ) -> Result<TaskOutcome, Error> {
        if let Some(errors) = envelope.get("errors").filter(|e| !e.is_null()) {
            let detail = match errors {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(TaskOutcome::Failure(detail));
        }

        let Some(upid_raw) = envelope.get("data").and_then(Value::as_str) else {
            return Ok(TaskOutcome::Success(String::new()));
        };
        let upid = Upid::parse(upid_raw)?;

        debug!("waiting for task {}", upid);
        let started = Instant::now();
        while started.elapsed() < opts.deadline {
            match self.task_exit_status(&upid).await {
                Ok(Some(status)) => {
                    return Ok(if status == EXIT_STATUS_OK {
                        TaskOutcome::Success(status)
                    } else {
                        TaskOutcome::Failure(status)
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_truncated_read() => {
                    debug!("truncated status read for {}, still polling", upid);
                }
                Err(e) => return Err(e),
            }
            sleep(opts.poll_interval).await;
        }

        Ok(TaskOutcome::Timeout(upid))
    }

    /// Like [`wait_for_task`](Self::wait_for_task), but folds failure and
    /// timeout into errors. Returns the exit status string.
    pub async fn wait_task_success(
        &self,
        envelope: &Value,
        opts: &WaitOptions,
    ) -> Result<String, Error> {
        match self.wait_for_task(envelope, opts).await? {
            TaskOutcome::Success(status) => Ok(status),
            TaskOutcome::Failure(status) => Err(Error::TaskFailed { status }),
            TaskOutcome::Timeout(upid) => Err(Error::TaskTimeout {
                upid: upid.into_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upid_node_extraction() {
        let upid = Upid::parse(
            "UPID:pve1:00051234:1A2B3C4D:65CB1234:qmcreate:100:root@pam:",
        )
        .expect("valid upid");
        assert_eq!(upid.node(), "pve1");
        assert!(upid.as_str().starts_with("UPID:pve1:"));
    }

    #[test]
    fn malformed_upid_is_rejected() {
        let err = Upid::parse("not-a-upid").expect_err("should fail");
        assert!(matches!(err, Error::InvalidUpid { .. }));
    }
}
