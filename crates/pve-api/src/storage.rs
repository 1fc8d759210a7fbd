// Storage endpoints: pool listing and per-node volume content.
//
// Volume names are storage-qualified (`local-lvm:vm-100-disk-1`); on
// directory storages the volume part carries a `vmid/` prefix and a file
// extension that the content API does not want back.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::client::{Client, Params};
use crate::error::Error;

// Dir-storage volume names look like `100/vm-100-disk-0.raw`.
static RX_DIR_VOLUME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+/(\S+\.\S+)").expect("valid volume regex"));

/// Split a full `storage:volume` name into its parts, normalizing the
/// dir-storage `<vmid>/<file>.<ext>` form down to the bare file name.
pub fn split_volume_name(full: &str) -> Result<(&str, &str), Error> {
    let (storage, volume) = full.split_once(':').ok_or_else(|| Error::InvalidDevice {
        message: format!("volume name '{full}' is not storage-qualified"),
    })?;
    let volume = RX_DIR_VOLUME
        .captures(volume)
        .and_then(|c| c.get(1))
        .map_or(volume, |m| m.as_str());
    Ok((storage, volume))
}

impl Client {
    /// List every storage pool defined on the cluster.
    ///
    /// `GET /storage` (retryable read)
    pub async fn list_storages(&self) -> Result<Vec<Value>, Error> {
        let envelope = self.get_json_retryable("/storage").await?;
        data_array(envelope, "storage list")
    }

    /// Look a storage pool up by name.
    pub async fn find_storage(&self, name: &str) -> Result<Value, Error> {
        let storages = self.list_storages().await?;
        storages
            .into_iter()
            .find(|s| s.get("storage").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| Error::NotFound {
                what: format!("storage '{name}'"),
            })
    }

    /// Create a single backing volume on a node.
    ///
    /// `POST /nodes/{node}/storage/{storage}/content`. The response must
    /// echo the full volume name; anything else means the storage created
    /// something other than what the configuration references.
    pub async fn create_volume(
        &self,
        node: &str,
        full_name: &str,
        params: &Params,
    ) -> Result<(), Error> {
        let (storage, _) = split_volume_name(full_name)?;
        let path = format!("/nodes/{node}/storage/{storage}/content");
        debug!("creating volume {} on {}", full_name, node);

        let envelope = self.post_form(&path, Some(params)).await?;
        match envelope.get("data").and_then(Value::as_str) {
            Some(created) if created == full_name => Ok(()),
            _ => Err(Error::Api {
                message: format!("cannot create volume {full_name}"),
            }),
        }
    }

    /// Delete a volume from a node.
    ///
    /// `DELETE /nodes/{node}/storage/{storage}/content/{volume}`
    pub async fn delete_volume(&self, node: &str, full_name: &str) -> Result<(), Error> {
        let (storage, volume) = split_volume_name(full_name)?;
        let path = format!("/nodes/{node}/storage/{storage}/content/{volume}");
        debug!("deleting volume {} on {}", full_name, node);

        self.delete_json(&path).await?;
        Ok(())
    }
}

/// Pull the `data` array out of an envelope.
pub(crate) fn data_array(envelope: Value, what: &str) -> Result<Vec<Value>, Error> {
    match envelope.get("data").and_then(Value::as_array) {
        Some(items) => Ok(items.clone()),
        None => Err(Error::Api {
            message: format!("{what} not readable"),
        }),
    }
}
