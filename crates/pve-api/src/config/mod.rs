// Typed configuration bundles.
//
// `QemuConfig` and `LxcConfig` gather the user-facing options of a VM or
// container, translate them through the device codec into flat API
// parameters, and rebuild themselves from a live configuration fetch.

mod lxc;
mod qemu;

pub use lxc::LxcConfig;
pub use qemu::QemuConfig;

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::client::Client;
use crate::error::Error;
use crate::vm::VmRef;

const LOCK_RETRY_TRIES: u32 = 3;

/// Default pause between fetches of a locked configuration.
pub(crate) const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(8);

/// Fetch an entity's live configuration, waiting out short-lived locks.
///
/// A config fetched mid-clone carries only a `lock` marker and a digest;
/// the read is retried a few times, `interval` apart, before giving up
/// with [`Error::Locked`].
pub(crate) async fn fetch_unlocked_config(
    client: &Client,
    vmr: &VmRef,
    interval: Duration,
) -> Result<Map<String, Value>, Error> {
    for attempt in 0..LOCK_RETRY_TRIES {
        let config = client.vm_config(vmr).await?;
        match config.get("lock").filter(|l| !l.is_null()) {
            None => return Ok(config),
            Some(lock) => {
                debug!("vm {} is locked ({}), attempt {}", vmr.id(), lock, attempt + 1);
                if attempt + 1 < LOCK_RETRY_TRIES {
                    sleep(interval).await;
                }
            }
        }
    }
    Err(Error::Locked {
        what: format!("vm {}", vmr.id()),
    })
}

pub(crate) fn str_field(config: &Map<String, Value>, key: &str) -> Option<String> {
    config.get(key).and_then(Value::as_str).map(str::to_owned)
}

pub(crate) fn int_field(config: &Map<String, Value>, key: &str) -> Option<i64> {
    config.get(key).and_then(Value::as_i64)
}

/// Numeric boolean field (`0`/`1` on the wire).
pub(crate) fn bool_field(config: &Map<String, Value>, key: &str) -> Option<bool> {
    int_field(config, key).map(|i| i != 0)
}
