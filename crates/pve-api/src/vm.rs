// VM and container entity operations.
//
// `VmRef` is a fully-resolved, immutable reference: resolution against
// the cluster resource list happens once, explicitly, and the resolved
// record is passed onward. Creation is a compensating sequence: backing
// volumes are created first so their names are known, and deleted again
// if the entity itself fails to come up.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use tracing::warn;

use crate::client::{Client, Params};
use crate::device::decode_disk;
use crate::error::Error;
use crate::storage::split_volume_name;
use crate::task::{TaskOutcome, WaitOptions};

static RX_DISK_SLOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(ide|sata|scsi|virtio)\d+$").expect("valid disk slot regex"));
static RX_MOUNT_SLOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mp\d+$").expect("valid mount slot regex"));

/// The kind of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    /// A QEMU virtual machine.
    Qemu,
    /// An LXC container.
    Lxc,
}

impl VmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Lxc => "lxc",
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "qemu" => Ok(Self::Qemu),
            "lxc" => Ok(Self::Lxc),
            other => Err(Error::Api {
                message: format!("unknown vm type '{other}'"),
            }),
        }
    }
}

/// A resolved reference to a VM or container: identifier, hosting node,
/// and kind. Construct one through [`Client::resolve_vm`] or
/// [`Client::find_vm`], or directly when all three parts are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    id: u32,
    node: String,
    kind: VmKind,
}

impl VmRef {
    pub fn new(id: u32, node: impl Into<String>, kind: VmKind) -> Self {
        Self {
            id,
            node: node.into(),
            kind,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn kind(&self) -> VmKind {
        self.kind
    }

    /// `/nodes/{node}/{kind}/{id}` path prefix for entity endpoints.
    fn base_path(&self) -> String {
        format!("/nodes/{}/{}/{}", self.node, self.kind, self.id)
    }
}

fn vm_ref_from_resource(resource: &Value) -> Result<VmRef, Error> {
    let id = resource
        .get("vmid")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| Error::Api {
            message: "cluster resource carries no vmid".into(),
        })?;
    let node = resource
        .get("node")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Api {
            message: format!("cluster resource {id} carries no node"),
        })?;
    let kind = resource
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Api {
            message: format!("cluster resource {id} carries no type"),
        })?
        .parse()?;
    Ok(VmRef::new(id, node, kind))
}

impl Client {
    // ── Resolution ──────────────────────────────────────────────────

    /// Resolve a VM identifier to a full reference (node + kind) against
    /// the cluster resource list.
    pub async fn resolve_vm(&self, id: u32) -> Result<VmRef, Error> {
        let vms = self.list_vms().await?;
        vms.iter()
            .find(|vm| vm.get("vmid").and_then(Value::as_u64) == Some(u64::from(id)))
            .map(vm_ref_from_resource)
            .transpose()?
            .ok_or_else(|| Error::NotFound {
                what: format!("vm {id}"),
            })
    }

    /// Resolve a VM by name.
    pub async fn find_vm(&self, name: &str) -> Result<VmRef, Error> {
        let vms = self.list_vms().await?;
        vms.iter()
            .find(|vm| vm.get("name").and_then(Value::as_str) == Some(name))
            .map(vm_ref_from_resource)
            .transpose()?
            .ok_or_else(|| Error::NotFound {
                what: format!("vm '{name}'"),
            })
    }

    // ── Creation orchestration ──────────────────────────────────────

    /// Create an entity whose configuration references backing volumes,
    /// with compensating cleanup.
    ///
    /// Disk and mount-point slots in `params` that designate real storage
    /// are pre-created so their names are fixed, then the entity-creation
    /// request is submitted and awaited. If creation does not succeed,
    /// every volume created here is deleted again (best-effort: all
    /// deletions are attempted, and a deletion failure is reported
    /// alongside the original creation failure, never instead of it).
    pub async fn create_vm(
        &self,
        vmr: &VmRef,
        params: &Params,
        opts: &WaitOptions,
    ) -> Result<(), Error> {
        let created = self.create_missing_volumes(vmr, params).await?;

        let path = format!("/nodes/{}/{}", vmr.node(), vmr.kind());
        let creation = match self.post_form(&path, Some(params)).await {
            Ok(envelope) => self.wait_task_success(&envelope, opts).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match creation {
            Ok(()) => Ok(()),
            Err(creation) => {
                warn!(
                    "creation of vm {} failed, rolling back {} volume(s)",
                    vmr.id(),
                    created.len()
                );
                match self.rollback_volumes(vmr.node(), &created).await {
                    None => Err(creation),
                    Some(cleanup) => Err(Error::Rollback {
                        creation: Box::new(creation),
                        cleanup: Box::new(cleanup),
                    }),
                }
            }
        }
    }

    /// Pre-create the backing volume for every disk/mount-point slot in
    /// `params` that designates real storage. Returns the full names of
    /// the volumes created, in order. Stops at the first failure; volumes
    /// already created are left for the caller's rollback.
    async fn create_missing_volumes(
        &self,
        vmr: &VmRef,
        params: &Params,
    ) -> Result<Vec<String>, Error> {
        let mut created = Vec::new();

        for (key, value) in params {
            let Some(flat) = value.as_str() else { continue };

            let slot = if RX_DISK_SLOT.is_match(key) {
                let slot = decode_disk(flat);
                // cdrom and other removable entries have no backing volume
                if slot.str_prop("media") != Some("disk") {
                    continue;
                }
                slot
            } else if RX_MOUNT_SLOT.is_match(key) {
                decode_disk(flat)
            } else {
                continue;
            };

            let storage = slot.str_prop("storage").ok_or_else(|| Error::InvalidDevice {
                message: format!("device '{key}' has no storage reference"),
            })?;
            let file = slot.get("file").ok_or_else(|| Error::InvalidDevice {
                message: format!("device '{key}' has no volume reference"),
            })?;
            let full = format!("{storage}:{file}");
            let (_, volume) = split_volume_name(&full)?;

            let size = slot.get("size").ok_or_else(|| Error::InvalidDevice {
                message: format!("device '{key}' has no size"),
            })?;

            let mut disk_params = Params::new();
            disk_params.insert("vmid".into(), json!(vmr.id()));
            disk_params.insert("filename".into(), json!(volume));
            disk_params.insert("size".into(), json!(size.to_string()));

            self.create_volume(vmr.node(), &full, &disk_params).await?;
            created.push(full);
        }

        Ok(created)
    }

    /// Delete volumes created during a failed creation. Attempts every
    /// deletion and returns the first error observed, if any.
    async fn rollback_volumes(&self, node: &str, volumes: &[String]) -> Option<Error> {
        let mut first = None;
        for full in volumes {
            if let Err(e) = self.delete_volume(node, full).await {
                warn!("rollback deletion of {} failed: {}", full, e);
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        first
    }

    // ── Entity operations ───────────────────────────────────────────

    /// Delete an entity and wait for the removal task.
    pub async fn delete_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        let envelope = self.delete_json(&vmr.base_path()).await?;
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Fetch the entity's live configuration (retryable read).
    pub async fn vm_config(&self, vmr: &VmRef) -> Result<Map<String, Value>, Error> {
        let path = format!("{}/config", vmr.base_path());
        let envelope = self.get_json_retryable(&path).await?;
        envelope
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::Api {
                message: format!("vm {} config not readable", vmr.id()),
            })
    }

    /// Apply configuration parameters to a live entity.
    ///
    /// QEMU VMs use the asynchronous POST config API; containers only
    /// offer PUT.
    pub async fn set_vm_config(&self, vmr: &VmRef, params: &Params) -> Result<(), Error> {
        let path = format!("{}/config", vmr.base_path());
        let envelope = match vmr.kind() {
            VmKind::Qemu => self.post_form(&path, Some(params)).await?,
            VmKind::Lxc => self.put_form(&path, Some(params)).await?,
        };
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Fetch the entity's current status record (retryable read).
    pub async fn vm_status(&self, vmr: &VmRef) -> Result<Map<String, Value>, Error> {
        let path = format!("{}/status/current", vmr.base_path());
        let envelope = self.get_json_retryable(&path).await?;
        envelope
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::Api {
                message: format!("vm {} state not readable", vmr.id()),
            })
    }

    /// Drive a status transition (`start`, `stop`, `shutdown`, ...).
    ///
    /// Some transitions complete without producing a task handle; those
    /// are re-submitted up to 3 times with a pause in between before the
    /// transition is assumed to have taken effect.
    pub async fn set_vm_status(&self, vmr: &VmRef, status: &str) -> Result<(), Error> {
        let path = format!("{}/status/{status}", vmr.base_path());
        let opts = WaitOptions::default();
        for _ in 0..3 {
            let envelope = self.post_form(&path, None).await?;
            match self.wait_for_task(&envelope, &opts).await? {
                TaskOutcome::Success(s) if s.is_empty() => sleep(opts.poll_interval).await,
                TaskOutcome::Success(_) => return Ok(()),
                TaskOutcome::Failure(status) => return Err(Error::TaskFailed { status }),
                TaskOutcome::Timeout(upid) => {
                    return Err(Error::TaskTimeout {
                        upid: upid.into_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn start_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "start").await
    }

    pub async fn stop_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "stop").await
    }

    pub async fn shutdown_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "shutdown").await
    }

    pub async fn suspend_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "suspend").await
    }

    pub async fn resume_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "resume").await
    }

    pub async fn reset_vm(&self, vmr: &VmRef) -> Result<(), Error> {
        self.set_vm_status(vmr, "reset").await
    }

    /// Poll until the entity reports `stopped`. Useful while waiting for
    /// an in-guest installer to power the machine off.
    pub async fn wait_for_shutdown(&self, vmr: &VmRef) -> Result<(), Error> {
        for _ in 0..100 {
            match self.vm_status(vmr).await {
                Ok(state) => {
                    if state.get("status").and_then(Value::as_str) == Some("stopped") {
                        return Ok(());
                    }
                }
                Err(e) => warn!("status poll while waiting for shutdown failed: {}", e),
            }
            sleep(Duration::from_secs(5)).await;
        }
        Err(Error::Api {
            message: format!("vm {} not shut down within wait time", vmr.id()),
        })
    }

    /// Clone an entity into a new identifier and wait for the clone task.
    pub async fn clone_vm(
        &self,
        source: &VmRef,
        newid: u32,
        mut params: Params,
    ) -> Result<(), Error> {
        params.insert("newid".into(), json!(newid));
        let path = format!("{}/clone", source.base_path());
        let envelope = self.post_form(&path, Some(&params)).await?;
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Migrate an entity to another node and wait for the migration task.
    pub async fn migrate_vm(&self, vmr: &VmRef, params: &Params) -> Result<(), Error> {
        let path = format!("{}/migrate", vmr.base_path());
        let envelope = self.post_form(&path, Some(params)).await?;
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Roll an entity back to a snapshot and wait for the rollback task.
    pub async fn rollback_snapshot(&self, vmr: &VmRef, snapshot: &str) -> Result<(), Error> {
        let path = format!("{}/snapshot/{snapshot}/rollback", vmr.base_path());
        let envelope = self.post_form(&path, None).await?;
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Grow a disk by `more_gb` gigabytes. `disk` defaults to `virtio0`.
    pub async fn resize_disk(
        &self,
        vmr: &VmRef,
        disk: Option<&str>,
        more_gb: u32,
    ) -> Result<(), Error> {
        let mut params = Params::new();
        params.insert("disk".into(), json!(disk.unwrap_or("virtio0")));
        params.insert("size".into(), json!(format!("+{more_gb}G")));
        let path = format!("{}/resize", vmr.base_path());
        let envelope = self.put_form(&path, Some(&params)).await?;
        self.wait_task_success(&envelope, &WaitOptions::default())
            .await?;
        Ok(())
    }

    /// Convert an entity into a template.
    pub async fn create_template(&self, vmr: &VmRef) -> Result<(), Error> {
        let mut params = Params::new();
        params.insert("experimental".into(), json!(true));
        let path = format!("{}/template", vmr.base_path());
        self.post_form(&path, Some(&params)).await?;
        Ok(())
    }

    /// Run a QEMU monitor command and return the raw response envelope.
    pub async fn monitor_cmd(&self, vmr: &VmRef, command: &str) -> Result<Value, Error> {
        let mut params = Params::new();
        params.insert("command".into(), json!(command));
        let path = format!("{}/monitor", vmr.base_path());
        self.post_form(&path, Some(&params)).await
    }

    /// List every VM and container hosted on the cluster. See
    /// [`list_vms`](Self::list_vms) for the raw resource records.
    pub async fn list_vm_refs(&self) -> Result<Vec<VmRef>, Error> {
        let vms = self.list_vms().await?;
        vms.iter().map(vm_ref_from_resource).collect()
    }
}
