// LXC container configuration bundle.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{Client, Params};
use crate::config::qemu::{expect_kind, parse_index, unescape_ssh_keys};
use crate::config::{bool_field, fetch_unlocked_config, int_field, str_field};
use crate::device::{DeviceSet, DeviceSlot, decode_disk, decode_pairs, encode_disk, encode_net};
use crate::error::Error;
use crate::task::WaitOptions;
use crate::vm::{VmKind, VmRef};

static RX_MP_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mp(\d+)$").expect("valid mount key regex"));
static RX_NIC_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^net(\d+)$").expect("valid nic key regex"));

/// User-facing options of an LXC container.
///
/// [`Self::default`] carries the API's effective defaults so a partially
/// specified JSON document deserializes into a complete configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LxcConfig {
    pub arch: String,
    pub cmode: String,
    pub console: bool,
    pub cores: i64,
    pub cpuunits: i64,
    pub description: String,
    pub digest: String,
    pub hostname: String,
    pub memory: i64,
    pub mp: DeviceSet,
    pub nameserver: String,
    pub net: DeviceSet,
    pub onboot: bool,
    pub ostype: String,
    pub ostemplate: String,
    pub password: String,
    pub protection: bool,
    pub rootfs: DeviceSlot,
    pub searchdomain: String,
    pub startup: String,
    #[serde(rename = "ssh-public-keys")]
    pub ssh_public_keys: String,
    pub swap: i64,
    pub tty: i64,
    pub unprivileged: bool,
    #[serde(rename = "clone")]
    pub clone_params: Params,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            arch: "amd64".into(),
            cmode: "tty".into(),
            console: true,
            cores: 1,
            cpuunits: 1024,
            description: String::new(),
            digest: String::new(),
            hostname: String::new(),
            memory: 512,
            mp: DeviceSet::new(),
            nameserver: String::new(),
            net: DeviceSet::new(),
            onboot: false,
            ostype: "unmanaged".into(),
            ostemplate: String::new(),
            password: String::new(),
            protection: false,
            rootfs: DeviceSlot::new(),
            searchdomain: String::new(),
            startup: String::new(),
            ssh_public_keys: String::new(),
            swap: 512,
            tty: 2,
            unprivileged: false,
            clone_params: Params::new(),
        }
    }
}

impl LxcConfig {
    /// Create a fresh container from this configuration.
    pub async fn create(
        &mut self,
        client: &Client,
        vmr: &VmRef,
        opts: &WaitOptions,
    ) -> Result<(), Error> {
        expect_kind(vmr, VmKind::Lxc)?;

        let mut params = Params::new();
        params.insert("vmid".into(), json!(vmr.id()));
        params.insert("arch".into(), json!(self.arch));
        params.insert("cmode".into(), json!(self.cmode));
        params.insert("console".into(), json!(self.console));
        params.insert("cores".into(), json!(self.cores));
        params.insert("cpuunits".into(), json!(self.cpuunits));
        params.insert("description".into(), json!(self.description));
        params.insert("hostname".into(), json!(self.hostname));
        params.insert("memory".into(), json!(self.memory));
        params.insert("nameserver".into(), json!(self.nameserver));
        params.insert("onboot".into(), json!(self.onboot));
        params.insert("ostype".into(), json!(self.ostype));
        params.insert("protection".into(), json!(self.protection));
        params.insert("swap".into(), json!(self.swap));
        params.insert("searchdomain".into(), json!(self.searchdomain));
        params.insert("ostemplate".into(), json!(self.ostemplate));
        params.insert("tty".into(), json!(self.tty));
        params.insert("unprivileged".into(), json!(self.unprivileged));
        params.insert("ssh-public-keys".into(), json!(self.ssh_public_keys));

        self.mount_params(vmr.id(), &mut params)?;
        self.net_params(&mut params);

        client.create_vm(vmr, &params, opts).await
    }

    /// Clone a source container into `vmr`, then push this configuration
    /// onto the clone. `clone_params` is sent as-is to the clone endpoint
    /// (`full`, `storage`, `target`, ...).
    pub async fn clone_from(
        &mut self,
        client: &Client,
        source: &VmRef,
        vmr: &VmRef,
    ) -> Result<(), Error> {
        expect_kind(vmr, VmKind::Lxc)?;
        client
            .clone_vm(source, vmr.id(), self.clone_params.clone())
            .await?;
        self.update(client, vmr).await
    }

    /// Apply this configuration to an existing container.
    ///
    /// Scalar options with a meaningful zero value (`console`, `cores`,
    /// `memory`, ...) are always sent; a deserialized default is
    /// indistinguishable from an explicit zero, so callers wanting the
    /// server default must spell it out. String options are only sent
    /// when non-empty.
    pub async fn update(&mut self, client: &Client, vmr: &VmRef) -> Result<(), Error> {
        expect_kind(vmr, VmKind::Lxc)?;

        let mut params = Params::new();
        for (key, value) in [
            ("arch", &self.arch),
            ("description", &self.description),
            ("hostname", &self.hostname),
            ("nameserver", &self.nameserver),
            ("searchdomain", &self.searchdomain),
        ] {
            if !value.is_empty() {
                params.insert(key.into(), json!(value));
            }
        }

        params.insert("console".into(), json!(self.console));
        params.insert("cores".into(), json!(self.cores));
        params.insert("cpuunits".into(), json!(self.cpuunits));
        params.insert("memory".into(), json!(self.memory));
        params.insert("ostype".into(), json!(self.ostype));
        params.insert("protection".into(), json!(self.protection));
        params.insert("swap".into(), json!(self.swap));
        params.insert("tty".into(), json!(self.tty));

        self.mount_params(vmr.id(), &mut params)?;
        self.net_params(&mut params);

        client.set_vm_config(vmr, &params).await
    }

    /// Rebuild the configuration from a live container. Unreported
    /// options keep their defaults.
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
        debug!("read config for lxc vm {}", vmr.id());

        let mut config = Self::default();
        if let Some(v) = str_field(&raw, "arch") {
            config.arch = v;
        }
        if let Some(v) = str_field(&raw, "cmode") {
            config.cmode = v;
        }
        if let Some(v) = bool_field(&raw, "console") {
            config.console = v;
        }
        if let Some(v) = int_field(&raw, "cores") {
            config.cores = v;
        }
        if let Some(v) = int_field(&raw, "cpuunits") {
            config.cpuunits = v;
        }
        if let Some(v) = str_field(&raw, "description") {
            config.description = v;
        }
        if let Some(v) = str_field(&raw, "digest") {
            config.digest = v;
        }
        if let Some(v) = str_field(&raw, "hostname") {
            config.hostname = v;
        }
        if let Some(v) = int_field(&raw, "memory") {
            config.memory = v;
        }
        if let Some(v) = str_field(&raw, "nameserver") {
            config.nameserver = v;
        }
        if let Some(v) = bool_field(&raw, "onboot") {
            config.onboot = v;
        }
        if let Some(v) = str_field(&raw, "ostype") {
            config.ostype = v;
        }
        if let Some(v) = bool_field(&raw, "protection") {
            config.protection = v;
        }
        if let Some(v) = str_field(&raw, "rootfs") {
            config.rootfs = decode_disk(&v);
        }
        if let Some(v) = str_field(&raw, "searchdomain") {
            config.searchdomain = v;
        }
        if let Some(v) = int_field(&raw, "swap") {
            config.swap = v;
        }
        if let Some(v) = str_field(&raw, "ostemplate") {
            config.ostemplate = v;
        }
        if let Some(v) = int_field(&raw, "tty") {
            config.tty = v;
        }
        if let Some(v) = bool_field(&raw, "unprivileged") {
            config.unprivileged = v;
        }
        if let Some(v) = str_field(&raw, "ssh-public-keys") {
            config.ssh_public_keys = unescape_ssh_keys(&v);
        }

        for (key, value) in &raw {
            let Some(flat) = value.as_str() else { continue };
            if let Some(caps) = RX_MP_KEY.captures(key) {
                let index = parse_index(&caps[1])?;
                config.mp.insert(index, decode_disk(flat));
            } else if let Some(caps) = RX_NIC_KEY.captures(key) {
                let index = parse_index(&caps[1])?;
                // container NIC strings have no positional first token
                config.net.insert(index, decode_pairs(flat));
            }
        }

        Ok(config)
    }

    /// Render the root filesystem and every mount point into flat
    /// parameters. The rootfs uses the primary auto-creation form; mount
    /// points auto-name their volumes past the rootfs indices.
    fn mount_params(&self, vmid: u32, params: &mut Params) -> Result<(), Error> {
        if !self.rootfs.is_empty() {
            let flat = encode_disk(&self.rootfs, vmid, 0, true)?;
            params.insert("rootfs".into(), json!(flat));
        }
        for (index, slot) in self.mp.iter() {
            let flat = encode_disk(slot, vmid, index, false)?;
            params.insert(format!("mp{index}"), json!(flat));
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
