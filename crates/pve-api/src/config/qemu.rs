// QEMU VM configuration bundle.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{Client, Params};
use crate::config::{bool_field, fetch_unlocked_config, int_field, str_field};
use crate::device::{DeviceSet, decode_disk, decode_net, encode_disk, encode_net};
use crate::error::Error;
use crate::task::WaitOptions;
use crate::vm::{VmKind, VmRef};

// ISO references look like `local:iso/debian-12.iso,media=cdrom`.
static RX_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(.*?),media").expect("valid iso regex"));
static RX_DISK_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(virtio|scsi)(\d+)$").expect("valid disk key regex"));
static RX_NIC_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^net(\d+)$").expect("valid nic key regex"));

/// User-facing options of a QEMU VM.
///
/// Deserializes from the same JSON shape it round-trips through the API:
/// devices are indexed maps of typed slots, everything else is scalar.
/// Cloud-init settings only apply to clones and updates, never to fresh
/// creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QemuConfig {
    pub name: String,
    #[serde(rename = "desc")]
    pub description: String,
    pub onboot: bool,
    pub agent: String,
    pub memory: i64,
    pub ostype: String,
    pub cores: i64,
    pub sockets: i64,
    pub iso: String,
    pub disk: DeviceSet,
    pub net: DeviceSet,

    // cloud-init options
    pub ciuser: String,
    pub cipassword: String,
    pub searchdomain: String,
    pub nameserver: String,
    pub sshkeys: String,
    pub ipconfig0: String,
    pub ipconfig1: String,

    pub delete: String,
}

impl QemuConfig {
    /// Whether any cloud-init option is set.
    pub fn has_cloud_init(&self) -> bool {
        !self.ciuser.is_empty()
            || !self.cipassword.is_empty()
            || !self.searchdomain.is_empty()
            || !self.nameserver.is_empty()
            || !self.sshkeys.is_empty()
            || !self.ipconfig0.is_empty()
            || !self.ipconfig1.is_empty()
    }

    /// Create a fresh VM from this configuration.
    ///
    /// Generated NIC MAC addresses are written back into [`Self::net`].
    pub async fn create(
        &mut self,
        client: &Client,
        vmr: &VmRef,
        opts: &WaitOptions,
    ) -> Result<(), Error> {
        if self.has_cloud_init() {
            return Err(Error::Api {
                message: "cloud-init parameters are only supported on clones or updates".into(),
            });
        }
        expect_kind(vmr, VmKind::Qemu)?;

        let mut params = Params::new();
        params.insert("vmid".into(), json!(vmr.id()));
        params.insert("name".into(), json!(self.name));
        params.insert("onboot".into(), json!(self.onboot));
        params.insert("agent".into(), json!(self.agent));
        params.insert("ide2".into(), json!(format!("{},media=cdrom", self.iso)));
        params.insert("ostype".into(), json!(self.ostype));
        params.insert("sockets".into(), json!(self.sockets));
        params.insert("cores".into(), json!(self.cores));
        params.insert("cpu".into(), json!("host"));
        params.insert("memory".into(), json!(self.memory));
        params.insert("description".into(), json!(self.description));

        self.disk_params(vmr.id(), &mut params, false)?;
        self.net_params(&mut params);

        client.create_vm(vmr, &params, opts).await
    }

    /// Apply this configuration to an existing VM.
    ///
    /// The primary disk is left untouched (a clone target already has
    /// one), and only cloud-init options that are actually set are sent,
    /// so unset ones keep their server-side values.
    pub async fn update(&mut self, client: &Client, vmr: &VmRef) -> Result<(), Error> {
        expect_kind(vmr, VmKind::Qemu)?;

        let mut params = Params::new();
        params.insert("name".into(), json!(self.name));
        params.insert("description".into(), json!(self.description));
        params.insert("onboot".into(), json!(self.onboot));
        params.insert("agent".into(), json!(self.agent));
        params.insert("sockets".into(), json!(self.sockets));
        params.insert("cores".into(), json!(self.cores));
        params.insert("memory".into(), json!(self.memory));

        self.disk_params(vmr.id(), &mut params, true)?;
        self.net_params(&mut params);

        for (key, value) in [
            ("ciuser", &self.ciuser),
            ("cipassword", &self.cipassword),
            ("searchdomain", &self.searchdomain),
            ("nameserver", &self.nameserver),
            ("ipconfig0", &self.ipconfig0),
            ("ipconfig1", &self.ipconfig1),
            ("delete", &self.delete),
        ] {
            if !value.is_empty() {
                params.insert(key.into(), json!(value));
            }
        }
        if !self.sshkeys.is_empty() {
            params.insert("sshkeys".into(), json!(escape_ssh_keys(&self.sshkeys)));
        }

        client.set_vm_config(vmr, &params).await
    }

    /// Rebuild the configuration from a live VM.
    pub async fn from_api(client: &Client, vmr: &VmRef) -> Result<Self, Error> {
        Self::from_api_with(client, vmr, crate::config::LOCK_RETRY_INTERVAL).await
    }

    /// Like [`from_api`](Self::from_api) with an explicit pause between
    /// fetches of a locked configuration.
    pub async fn from_api_with(
        client: &Client,
        vmr: &VmRef,
        lock_retry_interval: std::time::Duration,
    ) -> Result<Self, Error> {
        let raw = fetch_unlocked_config(client, vmr, lock_retry_interval).await?;
        debug!("read config for qemu vm {}", vmr.id());

        let mut config = Self {
            name: str_field(&raw, "name").unwrap_or_default(),
            description: str_field(&raw, "description")
                .map(|d| d.trim().to_owned())
                .unwrap_or_default(),
            onboot: bool_field(&raw, "onboot").unwrap_or(true),
            agent: agent_field(&raw).unwrap_or_else(|| "1".to_owned()),
            ostype: str_field(&raw, "ostype").unwrap_or_else(|| "other".to_owned()),
            memory: int_field(&raw, "memory").unwrap_or(0),
            cores: int_field(&raw, "cores").unwrap_or(1),
            sockets: int_field(&raw, "sockets").unwrap_or(1),
            ciuser: str_field(&raw, "ciuser").unwrap_or_default(),
            cipassword: str_field(&raw, "cipassword").unwrap_or_default(),
            searchdomain: str_field(&raw, "searchdomain").unwrap_or_default(),
            nameserver: str_field(&raw, "nameserver").unwrap_or_default(),
            sshkeys: str_field(&raw, "sshkeys")
                .map(|k| unescape_ssh_keys(&k))
                .unwrap_or_default(),
            ipconfig0: str_field(&raw, "ipconfig0").unwrap_or_default(),
            ipconfig1: str_field(&raw, "ipconfig1").unwrap_or_default(),
            ..Self::default()
        };

        if let Some(ide2) = str_field(&raw, "ide2") {
            if let Some(m) = RX_ISO.captures(&ide2).and_then(|c| c.get(1)) {
                config.iso = m.as_str().to_owned();
            }
        }

        for (key, value) in &raw {
            let Some(flat) = value.as_str() else { continue };
            if let Some(caps) = RX_DISK_KEY.captures(key) {
                let bus = &caps[1];
                let index = parse_index(&caps[2])?;
                let mut slot = decode_disk(flat);
                slot.insert("type", bus);
                config.disk.insert(index, slot);
            } else if let Some(caps) = RX_NIC_KEY.captures(key) {
                let index = parse_index(&caps[1])?;
                config.net.insert(index, decode_net(flat));
            }
        }

        Ok(config)
    }

    /// Render every disk slot into a flat parameter keyed by bus + index.
    /// `media=disk` is stamped on each so the volume pre-creation scan
    /// recognizes them.
    fn disk_params(&self, vmid: u32, params: &mut Params, skip_primary: bool) -> Result<(), Error> {
        for (index, slot) in self.disk.iter() {
            if index == 0 && skip_primary {
                continue;
            }
            let bus = slot
                .str_prop("type")
                .ok_or_else(|| Error::InvalidDevice {
                    message: format!("disk slot {index} has no bus type"),
                })?
                .to_owned();
            let mut slot = slot.clone();
            slot.insert("media", "disk");
            // `none` is the cache default and is never sent explicitly
            if slot.str_prop("cache") == Some("none") {
                slot.remove("cache");
            }
            let flat = encode_disk(&slot, vmid, index, false)?;
            params.insert(format!("{bus}{index}"), json!(flat));
        }
        Ok(())
    }

    fn net_params(&mut self, params: &mut Params) {
        for (index, slot) in self.net.iter_mut() {
            let flat = encode_net(slot);
            params.insert(format!("net{index}"), json!(flat));
        }
    }
}

fn agent_field(raw: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    // older API versions report the agent flag as a bare number
    match raw.get("agent")? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn expect_kind(vmr: &VmRef, kind: VmKind) -> Result<(), Error> {
    if vmr.kind() == kind {
        Ok(())
    } else {
        Err(Error::Api {
            message: format!("vm {} is {}, not {}", vmr.id(), vmr.kind(), kind),
        })
    }
}

pub(crate) fn parse_index(digits: &str) -> Result<u32, Error> {
    digits.parse().map_err(|_| Error::InvalidDevice {
        message: format!("device index '{digits}' out of range"),
    })
}

/// Percent-escape an ssh public key block for the config API. A trailing
/// newline is appended the way the web UI does.
pub(crate) fn escape_ssh_keys(keys: &str) -> String {
    urlencoding::encode(&format!("{keys}\n")).into_owned()
}

pub(crate) fn unescape_ssh_keys(escaped: &str) -> String {
    urlencoding::decode(escaped)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| escaped.to_owned())
}
