use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub mod config;

pub use config::DiscoveryConfig;

pub const TOPOLOGY_SCHEMA_VERSION: &str = "1.0.0";

/// Point-in-time snapshot of every device discovered in one pass.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Topology {
    pub snapshot_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub devices: Vec<Device>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostInfo {
    pub os: String,        // "windows", "linux", "image"
    pub os_version: String,
    pub machine: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Device {
    /// Probe slot; stable within one pass only.
    pub index: u32,
    pub path: String,
    /// 0 when the geometry query was declined.
    pub sector_size: u32,
    pub cylinders: Option<u64>,
    pub total_sectors: Option<u64>,
    pub is_solid_state: Option<bool>,
    pub partition_style: PartitionScheme,
    pub table: Option<PartitionTable>,
    pub partitions: Vec<Partition>,
    pub issues: Vec<DeviceIssue>,
}

impl Device {
    pub fn capacity_bytes(&self) -> Option<u64> {
        if self.sector_size == 0 {
            return None;
        }
        self.total_sectors
            .and_then(|sectors| sectors.checked_mul(self.sector_size as u64))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Partition {
    /// OS volume identifier; `None` for partitions read straight off the table.
    pub volume_id: Option<String>,
    pub scheme: PartitionScheme,
    pub gpt_type: Option<GptType>,
    pub mbr_bootable: Option<bool>,
    pub number: u32,
    pub offset_bytes: u64,
    pub size_bytes: u64,
    pub sector_count: Option<u64>,
    pub filesystem: Filesystem,
    pub mount_path: Option<String>,
    pub owning_device_index: u32,
    /// Every device backing this partition, in extent order.
    pub spanned_devices: Vec<u32>,
    pub embedded: Vec<EmbeddedFilesystem>,
}

impl Partition {
    pub fn end_bytes(&self) -> u64 {
        self.offset_bytes.saturating_add(self.size_bytes)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
    Raw,
    Unknown,
}

impl fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionScheme::Mbr => write!(f, "MBR"),
            PartitionScheme::Gpt => write!(f, "GPT"),
            PartitionScheme::Raw => write!(f, "RAW"),
            PartitionScheme::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum GptType {
    Unused,
    Recovery,
    BasicData,
    System,
    Other(Uuid),
}

impl fmt::Display for GptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GptType::Unused => write!(f, "unused entry"),
            GptType::Recovery => write!(f, "Microsoft recovery"),
            GptType::BasicData => write!(f, "basic data"),
            GptType::System => write!(f, "EFI system"),
            GptType::Other(guid) => write!(f, "{}", guid),
        }
    }
}

/// Legacy MBR partition type byte, normalized to its unsigned value.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MbrPartitionKind {
    LinuxNative,
    LinuxSwap,
    Ntfs,
    Fat32Chs,
    Fat32Lba,
    Protective,
    Other(u8),
}

impl MbrPartitionKind {
    pub fn from_type_id(type_id: u8) -> Self {
        match type_id {
            0x83 => MbrPartitionKind::LinuxNative,
            0x82 => MbrPartitionKind::LinuxSwap,
            0x07 => MbrPartitionKind::Ntfs,
            0x0B => MbrPartitionKind::Fat32Chs,
            0x0C => MbrPartitionKind::Fat32Lba,
            0xEE => MbrPartitionKind::Protective,
            other => MbrPartitionKind::Other(other),
        }
    }

    /// Some platforms hand the type byte over as a signed char (0x83 == -125).
    pub fn from_signed(type_id: i8) -> Self {
        Self::from_type_id(type_id as u8)
    }

    pub fn type_id(&self) -> u8 {
        match self {
            MbrPartitionKind::LinuxNative => 0x83,
            MbrPartitionKind::LinuxSwap => 0x82,
            MbrPartitionKind::Ntfs => 0x07,
            MbrPartitionKind::Fat32Chs => 0x0B,
            MbrPartitionKind::Fat32Lba => 0x0C,
            MbrPartitionKind::Protective => 0xEE,
            MbrPartitionKind::Other(value) => *value,
        }
    }
}

impl fmt::Display for MbrPartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MbrPartitionKind::LinuxNative => write!(f, "Linux native"),
            MbrPartitionKind::LinuxSwap => write!(f, "Linux swap"),
            MbrPartitionKind::Ntfs => write!(f, "NTFS/exFAT"),
            MbrPartitionKind::Fat32Chs => write!(f, "FAT32"),
            MbrPartitionKind::Fat32Lba => write!(f, "FAT32 (LBA)"),
            MbrPartitionKind::Protective => write!(f, "GPT protective"),
            MbrPartitionKind::Other(value) => write!(f, "0x{:02x}", value),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filesystem {
    Ntfs,
    Fat,
    ExFat,
    AndroidSparse,
    Unknown,
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filesystem::Ntfs => write!(f, "NTFS"),
            Filesystem::Fat => write!(f, "FAT12/FAT16/FAT32"),
            Filesystem::ExFat => write!(f, "exFAT"),
            Filesystem::AndroidSparse => write!(f, "Android volume"),
            Filesystem::Unknown => write!(f, "unknown"),
        }
    }
}

/// A superblock found by the recovery scan, with its absolute device offset.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedFilesystem {
    Ext { superblock_offset: u64 },
    Btrfs { superblock_offset: u64 },
}

impl fmt::Display for EmbeddedFilesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddedFilesystem::Ext { superblock_offset } => {
                write!(f, "ext2/3/4 superblock @ {}", superblock_offset)
            }
            EmbeddedFilesystem::Btrfs { superblock_offset } => {
                write!(f, "btrfs superblock @ {}", superblock_offset)
            }
        }
    }
}

/// The device's own partition table, as read from its first sectors.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub boot_signature_present: bool,
    pub gpt_header_present: bool,
    pub entries: Vec<TableEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// 1-based slot in the table.
    pub slot: u32,
    pub bootable: bool,
    pub kind: TableEntryKind,
    pub start_sector: u64,
    pub sector_count: u64,
    pub embedded: Vec<EmbeddedFilesystem>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TableEntryKind {
    Mbr(MbrPartitionKind),
    Gpt(GptType),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum DeviceIssue {
    MissingBootSignature,
    MissingGptHeader,
    TableUnreadable(String),
    PartitionOutOfBounds {
        number: u32,
        end_bytes: u64,
        capacity_bytes: u64,
    },
}

impl fmt::Display for DeviceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIssue::MissingBootSignature => write!(f, "boot signature 0x55AA missing"),
            DeviceIssue::MissingGptHeader => write!(f, "GPT header missing at LBA 1"),
            DeviceIssue::TableUnreadable(reason) => write!(f, "partition table unreadable: {}", reason),
            DeviceIssue::PartitionOutOfBounds {
                number,
                end_bytes,
                capacity_bytes,
            } => write!(
                f,
                "partition #{} ends at {} bytes, past device capacity {}",
                number, end_bytes, capacity_bytes
            ),
        }
    }
}

impl Topology {
    pub fn new(host: HostInfo, devices: Vec<Device>) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            schema_version: TOPOLOGY_SCHEMA_VERSION.to_string(),
            host,
            devices,
            generated_at_utc: now_utc_rfc3339(),
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(sector_size: u32, total_sectors: Option<u64>) -> Device {
        Device {
            index: 0,
            path: "mem0".to_string(),
            sector_size,
            cylinders: None,
            total_sectors,
            is_solid_state: None,
            partition_style: PartitionScheme::Unknown,
            table: None,
            partitions: Vec::new(),
            issues: Vec::new(),
        }
    }

    #[test]
    fn capacity_requires_known_geometry() {
        assert_eq!(device(512, Some(2048)).capacity_bytes(), Some(1024 * 1024));
        assert_eq!(device(0, Some(2048)).capacity_bytes(), None);
        assert_eq!(device(512, None).capacity_bytes(), None);
    }

    #[test]
    fn signed_type_byte_normalizes() {
        assert_eq!(MbrPartitionKind::from_signed(-125), MbrPartitionKind::LinuxNative);
        assert_eq!(MbrPartitionKind::from_signed(-126), MbrPartitionKind::LinuxSwap);
        assert_eq!(MbrPartitionKind::from_type_id(0x83).type_id(), 0x83);
        assert_eq!(MbrPartitionKind::from_type_id(0x42), MbrPartitionKind::Other(0x42));
    }

    #[test]
    fn topology_serializes_with_schema_version() {
        let host = HostInfo {
            os: "linux".to_string(),
            os_version: "test".to_string(),
            machine: "test".to_string(),
        };
        let topology = Topology::new(host, vec![device(512, Some(8))]);
        let json = serde_json::to_value(&topology).unwrap();
        assert_eq!(json["schema_version"], TOPOLOGY_SCHEMA_VERSION);
        assert_eq!(json["devices"][0]["sector_size"], 512);
    }
}
