// Cluster-wide listings and identifier allocation.

use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::error::Error;
use crate::storage::data_array;

impl Client {
    /// List the cluster's nodes.
    ///
    /// `GET /nodes` (retryable read)
    pub async fn list_nodes(&self) -> Result<Vec<Value>, Error> {
        let envelope = self.get_json_retryable("/nodes").await?;
        data_array(envelope, "node list")
    }

    /// List every VM and container known to the cluster.
    ///
    /// `GET /cluster/resources?type=vm` (retryable read)
    pub async fn list_vms(&self) -> Result<Vec<Value>, Error> {
        let envelope = self.get_json_retryable("/cluster/resources?type=vm").await?;
        data_array(envelope, "vm list")
    }

    /// The highest VM identifier currently in use, 0 on an empty cluster.
    pub async fn max_vm_id(&self) -> Result<u32, Error> {
        let vms = self.list_vms().await?;
        Ok(vms
            .iter()
            .filter_map(|vm| vm.get("vmid").and_then(Value::as_u64))
            .map(|id| u32::try_from(id).unwrap_or(u32::MAX))
            .max()
            .unwrap_or(0))
    }

    /// Ask the cluster for a free VM identifier.
    ///
    /// With a starting candidate of 100 or above, `/cluster/nextid` is
    /// probed upward until the cluster accepts one; without a candidate a
    /// single free-choice query is made.
    pub async fn next_vm_id(&self, current: Option<u32>) -> Result<u32, Error> {
        let mut candidate = current;
        loop {
            let path = match candidate {
                Some(id) if id >= 100 => format!("/cluster/nextid?vmid={id}"),
                _ => "/cluster/nextid".to_owned(),
            };
            debug!("asking for next vm id via {}", path);
            let envelope = self.get_json(&path).await?;

            if envelope.get("errors").is_some_and(|e| !e.is_null()) {
                match candidate {
                    // candidate taken, probe the next one
                    Some(id) if id >= 100 => {
                        candidate = Some(id + 1);
                        continue;
                    }
                    _ => {
                        return Err(Error::Api {
                            message: "error using /cluster/nextid".into(),
                        });
                    }
                }
            }

            let id = envelope
                .get("data")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| Error::Api {
                    message: "unparseable /cluster/nextid response".into(),
                })?;
            return Ok(id);
        }
    }
}
