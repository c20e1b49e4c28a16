//! The OS boundary. Each host crate implements [`DeviceAccessPort`]; the
//! rest of the engine only ever talks to these two traits.

use crate::error::{ProbeError, ProbeResult};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub cylinders: Option<u64>,
    pub total_sectors: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStyle {
    Mbr,
    Gpt,
    Raw,
}

/// What the OS reports about one partition (or a whole disk) through its
/// partition-info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionQuery {
    pub style: PartitionStyle,
    pub number: u32,
    pub starting_offset: u64,
    pub length: u64,
    /// Only meaningful for [`PartitionStyle::Gpt`].
    pub gpt_type: Option<Uuid>,
    /// Only meaningful for [`PartitionStyle::Mbr`].
    pub mbr_boot_indicator: bool,
}

impl PartitionQuery {
    pub fn whole_disk(style: PartitionStyle, length: u64) -> Self {
        Self {
            style,
            number: 0,
            starting_offset: 0,
            length,
            gpt_type: None,
            mbr_boot_indicator: false,
        }
    }
}

/// One contiguous byte range of a physical device backing a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskExtent {
    pub device_index: u32,
    pub starting_offset: u64,
    pub length: u64,
}

/// An open device or volume. Dropping the handle closes it.
pub trait DeviceHandle {
    /// Reads exactly `count_bytes` starting at `start_byte`; a short read is an error.
    fn read_sectors(&mut self, start_byte: u64, count_bytes: usize) -> ProbeResult<Vec<u8>>;

    fn query_geometry(&mut self) -> ProbeResult<Geometry>;

    fn query_partition_info(&mut self) -> ProbeResult<PartitionQuery>;

    fn query_volume_extents(&mut self) -> ProbeResult<Vec<DiskExtent>> {
        Err(ProbeError::QueryUnsupported("volume extents"))
    }

    fn query_solid_state(&mut self) -> ProbeResult<bool> {
        Err(ProbeError::QueryUnsupported("solid state hint"))
    }
}

pub trait DeviceAccessPort: Sync {
    /// Path of probe slot `index`, or `None` when the host has nothing there.
    fn device_path(&self, index: u32) -> Option<String>;

    fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>>;

    /// Opaque identifiers of every OS-visible volume.
    fn enumerate_volumes(&self) -> ProbeResult<Vec<String>>;

    /// Raw mount-path lookup. `capacity` is the caller's buffer size in
    /// characters; hosts with fixed-size APIs answer `BufferTooSmall` when
    /// the result would not fit.
    fn volume_path_names(&self, volume: &str, capacity: usize) -> ProbeResult<Vec<String>>;

    /// Path to hand to [`DeviceAccessPort::open`] for a volume.
    fn volume_device_path(&self, volume: &str, _mount_path: Option<&str>) -> String {
        volume.trim_end_matches('\\').to_string()
    }
}

/// Sum of the multi-string layout (`a\0b\0\0`) in characters, the way
/// fixed-buffer path APIs size their answer.
pub fn multi_sz_len(names: &[String]) -> usize {
    names.iter().map(|name| name.chars().count() + 1).sum::<usize>() + 1
}
