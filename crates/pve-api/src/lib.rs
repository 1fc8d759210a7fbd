// pve-api: Async Rust client for the Proxmox VE API (QEMU VMs and LXC containers)

pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod device;
pub mod error;
pub mod retry;
pub mod storage;
pub mod task;
pub mod transport;
pub mod vm;

pub use client::{Client, Params};
pub use config::{LxcConfig, QemuConfig};
pub use device::{DeviceSet, DeviceSlot, DeviceValue};
pub use error::Error;
pub use task::{TaskOutcome, Upid, WaitOptions};
pub use transport::{TlsMode, TransportConfig};
pub use vm::{VmKind, VmRef};
