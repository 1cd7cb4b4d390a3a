//! Typed action records for curtin storage and network configuration.
//!
//! Records serialize to the block-style YAML curtin expects under
//! `storage: config:` and `network: config:`. Ids are structured values
//! (`ActionId`) so partition, format and mount records refer to each other
//! through the same disk base name instead of ad-hoc string building.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumString};

use crate::error::{DriverError, Result};

/// Kernel device leaf name (`sda` for `/dev/sda`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskBaseName(String);

impl DiskBaseName {
    /// Strip directory components from a device path.
    ///
    /// # Errors
    ///
    /// `Validation` if nothing is left after stripping (empty input, `/`, `..`).
    pub fn from_device(device: &str) -> Result<Self> {
        let leaf = Path::new(device)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| {
                DriverError::validation(format!("'{}' does not name a disk device", device))
            })?;
        Ok(Self(leaf.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskBaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one action record: a base name plus a suffix.
///
/// Ids derived from a disk share its base name (`sda`, `sda1`, `sda1_root`,
/// `sda1_mount`). Equality and hashing use the rendered form, so an id parsed
/// back from YAML equals the one it was generated from.
#[derive(Debug, Clone)]
pub struct ActionId {
    base: String,
    suffix: String,
}

impl ActionId {
    /// An id with no derived suffix.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            suffix: String::new(),
        }
    }

    /// Id of the disk record itself.
    pub fn disk(disk: &DiskBaseName) -> Self {
        Self::new(disk.as_str())
    }

    /// Id of partition `number` on `disk`.
    pub fn partition(disk: &DiskBaseName, number: u32) -> Self {
        Self {
            base: disk.as_str().to_string(),
            suffix: number.to_string(),
        }
    }

    /// Id of the filesystem created on partition `number`, tagged with its role.
    pub fn format(disk: &DiskBaseName, number: u32, role: &str) -> Self {
        Self {
            base: disk.as_str().to_string(),
            suffix: format!("{}_{}", number, role),
        }
    }

    /// Id of the mount step for partition `number`.
    pub fn mount(disk: &DiskBaseName, number: u32) -> Self {
        Self {
            base: disk.as_str().to_string(),
            suffix: format!("{}_mount", number),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    fn rendered(&self) -> impl Iterator<Item = u8> + '_ {
        self.base.bytes().chain(self.suffix.bytes())
    }
}

impl PartialEq for ActionId {
    fn eq(&self, other: &Self) -> bool {
        self.base.len() + self.suffix.len() == other.base.len() + other.suffix.len()
            && self.rendered().eq(other.rendered())
    }
}

impl Eq for ActionId {}

impl Hash for ActionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.rendered() {
            state.write_u8(b);
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.suffix)
    }
}

impl PartialEq<str> for ActionId {
    fn eq(&self, other: &str) -> bool {
        self.base.len() + self.suffix.len() == other.len() && self.rendered().eq(other.bytes())
    }
}

impl PartialEq<&str> for ActionId {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

impl Serialize for ActionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Partition table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionTable {
    Msdos,
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAction {
    pub id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ptable: Option<PartitionTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grub_device: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAction {
    pub id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    pub size: String,
    pub device: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wipe: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatAction {
    pub id: ActionId,
    pub fstype: String,
    pub volume: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountAction {
    pub id: ActionId,
    pub path: String,
    pub device: ActionId,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve: bool,
}

/// One record under `storage: config:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageAction {
    Disk(DiskAction),
    Partition(PartitionAction),
    Format(FormatAction),
    Mount(MountAction),
}

impl StorageAction {
    pub fn id(&self) -> &ActionId {
        match self {
            Self::Disk(a) => &a.id,
            Self::Partition(a) => &a.id,
            Self::Format(a) => &a.id,
            Self::Mount(a) => &a.id,
        }
    }

    /// The record this one is layered on (partition → disk, format → partition,
    /// mount → format). Disks have none.
    pub fn parent(&self) -> Option<&ActionId> {
        match self {
            Self::Disk(_) => None,
            Self::Partition(a) => Some(&a.device),
            Self::Format(a) => Some(&a.volume),
            Self::Mount(a) => Some(&a.device),
        }
    }

    pub fn is_preserved(&self) -> bool {
        match self {
            Self::Disk(a) => a.preserve,
            Self::Partition(a) => a.preserve,
            Self::Format(a) => a.preserve,
            Self::Mount(a) => a.preserve,
        }
    }

    /// Mark the record so curtin leaves the existing structure untouched.
    pub fn into_preserved(mut self) -> Self {
        match &mut self {
            Self::Disk(a) => a.preserve = true,
            Self::Partition(a) => a.preserve = true,
            Self::Format(a) => a.preserve = true,
            Self::Mount(a) => a.preserve = true,
        }
        self
    }
}

/// Disk identity as reported by hardware probing.
///
/// Model and serial are optional because probing does not always report them;
/// the template path refuses to render without them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDisk {
    /// Kernel name, with or without `/dev/` (`/dev/sda`).
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
}

impl TargetDisk {
    pub fn new(name: impl Into<String>, model: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: Some(model.into()),
            serial: Some(serial.into()),
        }
    }

    pub fn base_name(&self) -> Result<DiskBaseName> {
        DiskBaseName::from_device(&self.name)
    }
}

/// Fixed single-disk layout: root and home partitions, both ext4.
pub mod layout {
    pub const ROOT_OFFSET: &str = "512MB";
    pub const ROOT_SIZE: &str = "8GB";
    pub const HOME_OFFSET: &str = "8512MB";
    pub const HOME_SIZE: &str = "1GB";
    pub const FSTYPE: &str = "ext4";
    pub const ROOT_PARTITION: u32 = 1;
    pub const HOME_PARTITION: u32 = 2;
}

/// The single-disk layout as typed records.
///
/// Produces exactly what the storage template renders, for callers that take
/// the structured path instead.
pub fn single_disk_layout(disk: &TargetDisk) -> Result<Vec<StorageAction>> {
    use layout::*;

    let base = disk.base_name()?;
    let root_part = ActionId::partition(&base, ROOT_PARTITION);
    let home_part = ActionId::partition(&base, HOME_PARTITION);
    let root_fmt = ActionId::format(&base, ROOT_PARTITION, "root");
    let home_fmt = ActionId::format(&base, HOME_PARTITION, "home");

    Ok(vec![
        StorageAction::Disk(DiskAction {
            id: ActionId::disk(&base),
            ptable: Some(PartitionTable::Msdos),
            model: disk.model.clone(),
            serial: disk.serial.clone(),
            path: None,
            wipe: None,
            grub_device: None,
            preserve: false,
        }),
        StorageAction::Partition(PartitionAction {
            id: root_part.clone(),
            number: None,
            offset: Some(ROOT_OFFSET.to_string()),
            size: ROOT_SIZE.to_string(),
            device: ActionId::disk(&base),
            flag: Some("boot".to_string()),
            wipe: None,
            preserve: false,
        }),
        StorageAction::Partition(PartitionAction {
            id: home_part.clone(),
            number: None,
            offset: Some(HOME_OFFSET.to_string()),
            size: HOME_SIZE.to_string(),
            device: ActionId::disk(&base),
            flag: None,
            wipe: None,
            preserve: false,
        }),
        StorageAction::Format(FormatAction {
            id: root_fmt.clone(),
            fstype: FSTYPE.to_string(),
            volume: root_part,
            label: None,
            preserve: false,
        }),
        StorageAction::Format(FormatAction {
            id: home_fmt.clone(),
            fstype: FSTYPE.to_string(),
            volume: home_part,
            label: None,
            preserve: false,
        }),
        StorageAction::Mount(MountAction {
            id: ActionId::mount(&base, ROOT_PARTITION),
            path: "/".to_string(),
            device: root_fmt,
            preserve: false,
        }),
        StorageAction::Mount(MountAction {
            id: ActionId::mount(&base, HOME_PARTITION),
            path: "/home".to_string(),
            device: home_fmt,
            preserve: false,
        }),
    ])
}

/// Subnet attached to a network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Subnet {
    #[serde(rename = "dhcp")]
    Dhcp4,
    #[serde(rename = "dhcp6")]
    Dhcp6,
    #[serde(rename = "static")]
    Static(StaticSubnet),
    #[serde(rename = "manual")]
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSubnet {
    /// Address in CIDR form (`192.168.1.10/24`)
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_nameservers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanInterface {
    pub name: String,
    pub vlan_link: String,
    pub vlan_id: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nameserver {
    pub address: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

/// One record under `network: config:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkAction {
    Physical(PhysicalInterface),
    Vlan(VlanInterface),
    Nameserver(Nameserver),
    Route(Route),
}
