// Device configuration codec.
//
// The API describes each virtual device (disk, mount point, NIC) as one
// flat string: a positional first token followed by `key=value` pairs,
// comma-separated. This module translates between that format and typed
// device slots, in both directions.
//
// Sample strings:
//   rootfs     `local-lvm:vm-100-disk-0,size=8G`
//   mp0        `volume=local-lvm:vm-100-disk-2,size=10G,mp=/data`
//   net0       `virtio=62:DF:FA:10:02:BC,bridge=vmbr0,firewall=1`

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::de::{self, Deserializer};

use crate::error::Error;

/// Keys a disk/mount-point encoding consumes itself; they never appear in
/// the generic trailing emission. `type` names the bus (virtio, scsi, ...)
/// and only drives the parameter key.
const DISK_RESERVED: &[&str] = &["id", "storage", "size", "filename", "file", "volume", "type"];

/// Keys a NIC encoding consumes itself.
const NET_RESERVED: &[&str] = &["id", "bridge", "hwaddr", "macaddr", "model"];

/// A typed device property value.
///
/// The API returns every sub-configuration value as a string; decoding
/// re-types them with an ordered, best-effort coercion (integer, then
/// boolean, then string) that never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl DeviceValue {
    /// Re-type a raw string: base-10 integer first, then boolean, else
    /// the string is kept as-is. `"1"`/`"0"` become integers, which the
    /// emission policy treats the same as booleans.
    pub fn coerce(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        if raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("t") {
            return Self::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") || raw.eq_ignore_ascii_case("f") {
            return Self::Bool(false);
        }
        Self::Str(raw.to_owned())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Render this value for emission, or `None` if it must be suppressed.
    ///
    /// `true` renders as `"1"`; non-empty strings and positive integers
    /// render as themselves. `false`, zero, negatives, and empty strings
    /// are suppressed so an update never overrides a server-side default
    /// the caller left unset.
    fn emit(&self) -> Option<String> {
        match self {
            Self::Bool(true) => Some("1".to_owned()),
            Self::Str(s) if !s.is_empty() => Some(s.clone()),
            Self::Int(i) if *i > 0 => Some(i.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for DeviceValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for DeviceValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for DeviceValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for DeviceValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<'de> Deserialize<'de> for DeviceValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = DeviceValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, integer, or boolean")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<DeviceValue, E> {
                Ok(DeviceValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<DeviceValue, E> {
                Ok(DeviceValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DeviceValue, E> {
                i64::try_from(v)
                    .map(DeviceValue::Int)
                    .map_err(|_| E::custom("integer out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DeviceValue, E> {
                Ok(DeviceValue::Str(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<DeviceValue, E> {
                Ok(DeviceValue::Str(v))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// One indexed virtual device: a mapping from property name to typed value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct DeviceSlot {
    props: BTreeMap<String, DeviceValue>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DeviceValue>) {
        self.props.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DeviceValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&DeviceValue> {
        self.props.get(key)
    }

    /// String-typed property lookup.
    pub fn str_prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(DeviceValue::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<DeviceValue> {
        self.props.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceValue)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `key=value` tokens into the slot, re-typing each value.
    fn absorb_pairs<'a>(&mut self, tokens: impl Iterator<Item = &'a str>) {
        for token in tokens {
            if let Some((key, value)) = parse_sub_conf(token, '=') {
                self.props.insert(key.to_owned(), value);
            }
        }
    }
}

/// An indexed set of device slots. Index uniqueness is enforced by the
/// map; insertion order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct DeviceSet {
    slots: BTreeMap<u32, DeviceSlot>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a slot at an index, replacing any previous occupant.
    pub fn insert(&mut self, index: u32, slot: DeviceSlot) -> Option<DeviceSlot> {
        self.slots.insert(index, slot)
    }

    pub fn get(&self, index: u32) -> Option<&DeviceSlot> {
        self.slots.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut DeviceSlot> {
        self.slots.get_mut(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &DeviceSlot)> {
        self.slots.iter().map(|(i, s)| (*i, s))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut DeviceSlot)> {
        self.slots.iter_mut().map(|(i, s)| (*i, s))
    }
}

/// Parse one `key<sep>value` token into a typed pair.
///
/// Splits on the first separator; tokens without the separator yield
/// `None`. The value goes through [`DeviceValue::coerce`].
pub fn parse_sub_conf(token: &str, separator: char) -> Option<(&str, DeviceValue)> {
    let (key, value) = token.split_once(separator)?;
    Some((key, DeviceValue::coerce(value)))
}

/// Decode a disk or mount-point flat string.
///
/// The volume reference may appear as a bare positional `storage:path`
/// token (the format the API reports) or as a `volume=`/`file=` pair (the
/// format this codec emits); both split into `storage` and `file`
/// properties. Everything else is a `key=value` pair.
pub fn decode_disk(flat: &str) -> DeviceSlot {
    let mut slot = DeviceSlot::new();
    for token in flat.split(',') {
        match token.split_once('=') {
            Some((key @ ("volume" | "file"), rest)) => {
                if let Some((storage, file)) = rest.split_once(':') {
                    slot.insert("storage", storage);
                    slot.insert("file", DeviceValue::coerce(file));
                } else {
                    slot.insert(key, DeviceValue::coerce(rest));
                }
            }
            Some((key, value)) => slot.insert(key, DeviceValue::coerce(value)),
            None => {
                if let Some((storage, file)) = token.split_once(':') {
                    slot.insert("storage", storage);
                    slot.insert("file", DeviceValue::coerce(file));
                }
            }
        }
    }
    slot
}

/// Decode a network-interface flat string.
///
/// The first token is positional `model=mac` (QEMU style); a leading
/// `hwaddr=` pair (container style) is kept as a plain property instead.
/// Remaining tokens are `key=value` pairs.
pub fn decode_net(flat: &str) -> DeviceSlot {
    let mut slot = DeviceSlot::new();
    let mut tokens = flat.split(',');
    if let Some(first) = tokens.next() {
        match first.split_once('=') {
            Some(("hwaddr", mac)) => slot.insert("hwaddr", DeviceValue::coerce(mac)),
            Some((model, mac)) => {
                slot.insert("model", model);
                slot.insert("macaddr", DeviceValue::coerce(mac));
            }
            None => {}
        }
    }
    slot.absorb_pairs(tokens);
    slot
}

/// Decode a flat string with no positional token, where every token is a
/// `key=value` pair. Container NIC strings
/// (`name=eth0,bridge=vmbr0,hwaddr=...,ip=dhcp`) take this form.
pub fn decode_pairs(flat: &str) -> DeviceSlot {
    let mut slot = DeviceSlot::new();
    slot.absorb_pairs(flat.split(','));
    slot
}

/// Encode a disk or mount-point slot.
///
/// Emits `size=` first, then the volume reference: an explicit
/// `filename`/`file` property always wins; otherwise the primary slot
/// uses the bare `storage:<numeric size prefix>` auto-creation form and
/// any other slot is auto-named `vm-<vmid>-disk-<index + 2>` (indices 0
/// and 1 are taken by the root filesystem). Remaining properties follow
/// under the suppression policy of [`DeviceValue`].
pub fn encode_disk(
    slot: &DeviceSlot,
    vmid: u32,
    index: u32,
    primary: bool,
) -> Result<String, Error> {
    let size = slot
        .get("size")
        .ok_or_else(|| Error::InvalidDevice {
            message: format!("disk slot {index} has no size"),
        })?
        .to_string();
    let storage = slot.str_prop("storage").ok_or_else(|| Error::InvalidDevice {
        message: format!("disk slot {index} has no storage"),
    })?;

    let mut parts = vec![format!("size={size}")];

    if let Some(name) = slot.str_prop("filename").or_else(|| slot.str_prop("file")) {
        parts.push(format!("volume={storage}:{name}"));
    } else if primary {
        // Undocumented rootfs auto-creation form: storage plus the size
        // with its unit suffix stripped.
        let prefix: String = size.chars().take_while(char::is_ascii_digit).collect();
        parts.push(format!("{storage}:{prefix}"));
    } else {
        parts.push(format!("volume={storage}:vm-{vmid}-disk-{}", index + 2));
    }

    parts.extend(trailing_params(slot, DISK_RESERVED));
    Ok(parts.join(","))
}

/// Encode a network-interface slot.
///
/// The MAC token comes first: `<model>=<MAC>` when a `model` property is
/// present, `hwaddr=<MAC>` otherwise. A missing MAC is generated
/// (locally administered, unicast, uppercase) and written back into the
/// slot so re-applying the same configuration is idempotent. `bridge` is
/// emitted unless it is the `"nat"` sentinel.
pub fn encode_net(slot: &mut DeviceSlot) -> String {
    let model = slot.str_prop("model").map(str::to_owned);
    let mac = slot
        .str_prop("macaddr")
        .or_else(|| slot.str_prop("hwaddr"))
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| {
            let generated = generate_mac();
            let key = if model.is_some() { "macaddr" } else { "hwaddr" };
            slot.insert(key, generated.clone());
            generated
        });

    let mut parts = vec![match &model {
        Some(model) => format!("{model}={mac}"),
        None => format!("hwaddr={mac}"),
    }];

    if let Some(bridge) = slot.str_prop("bridge") {
        if bridge != "nat" {
            parts.push(format!("bridge={bridge}"));
        }
    }

    parts.extend(trailing_params(slot, NET_RESERVED));
    parts.join(",")
}

/// Generic trailing emission: every property outside the reserved set,
/// rendered under the suppression policy.
fn trailing_params(slot: &DeviceSlot, reserved: &[&str]) -> Vec<String> {
    slot.iter()
        .filter(|(key, _)| !reserved.contains(key))
        .filter_map(|(key, value)| value.emit().map(|v| format!("{key}={v}")))
        .collect()
}

/// Generate a random locally-administered unicast MAC address, formatted
/// uppercase with colon separators.
fn generate_mac() -> String {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
    hex.join(":")
}
