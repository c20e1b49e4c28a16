//! In-memory [`DeviceAccessPort`] backed by byte vectors. Volumes read
//! through their first extent into the owning device's bytes, so a
//! synthetic disk image drives the whole pipeline.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::{ProbeError, ProbeResult, Unavailable};
use crate::port::{
    multi_sz_len, DeviceAccessPort, DeviceHandle, DiskExtent, Geometry, PartitionQuery,
    PartitionStyle,
};

#[derive(Debug, Clone)]
pub struct MemoryDevice {
    pub bytes: Vec<u8>,
    pub geometry: Option<Geometry>,
    pub partition_info: Option<PartitionQuery>,
    pub open_error: Option<Unavailable>,
    pub solid_state: Option<bool>,
}

impl MemoryDevice {
    pub fn new(bytes: Vec<u8>, sector_size: u32) -> Self {
        let total_sectors = if sector_size == 0 {
            None
        } else {
            Some(bytes.len() as u64 / sector_size as u64)
        };
        Self {
            bytes,
            geometry: Some(Geometry {
                sector_size,
                cylinders: None,
                total_sectors,
            }),
            partition_info: None,
            open_error: None,
            solid_state: None,
        }
    }

    pub fn with_style(mut self, style: PartitionStyle) -> Self {
        self.partition_info = Some(PartitionQuery::whole_disk(style, self.bytes.len() as u64));
        self
    }

    pub fn without_geometry(mut self) -> Self {
        self.geometry = None;
        self
    }

    pub fn with_total_sectors(mut self, total_sectors: u64) -> Self {
        if let Some(geometry) = self.geometry.as_mut() {
            geometry.total_sectors = Some(total_sectors);
        }
        self
    }

    pub fn solid_state(mut self, value: bool) -> Self {
        self.solid_state = Some(value);
        self
    }

    pub fn unavailable(reason: Unavailable) -> Self {
        Self {
            bytes: Vec::new(),
            geometry: None,
            partition_info: None,
            open_error: Some(reason),
            solid_state: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryVolume {
    pub id: String,
    pub path_names: Vec<String>,
    pub extents: Vec<DiskExtent>,
    pub query: Option<PartitionQuery>,
    pub sector_size: Option<u32>,
}

impl MemoryVolume {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path_names: Vec::new(),
            extents: Vec::new(),
            query: None,
            sector_size: Some(512),
        }
    }

    pub fn mounted_at(mut self, path: impl Into<String>) -> Self {
        self.path_names.push(path.into());
        self
    }

    pub fn on_device(mut self, device_index: u32, starting_offset: u64, length: u64) -> Self {
        self.extents.push(DiskExtent {
            device_index,
            starting_offset,
            length,
        });
        self
    }

    /// GPT partition record spanning the first extent.
    pub fn gpt(mut self, number: u32, type_guid: Uuid) -> Self {
        let (offset, length) = self.first_extent();
        self.query = Some(PartitionQuery {
            style: PartitionStyle::Gpt,
            number,
            starting_offset: offset,
            length,
            gpt_type: Some(type_guid),
            mbr_boot_indicator: false,
        });
        self
    }

    /// MBR partition record spanning the first extent.
    pub fn mbr(mut self, number: u32, bootable: bool) -> Self {
        let (offset, length) = self.first_extent();
        self.query = Some(PartitionQuery {
            style: PartitionStyle::Mbr,
            number,
            starting_offset: offset,
            length,
            gpt_type: None,
            mbr_boot_indicator: bootable,
        });
        self
    }

    fn first_extent(&self) -> (u64, u64) {
        self.extents
            .first()
            .map(|extent| (extent.starting_offset, extent.length))
            .unwrap_or((0, 0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPort {
    devices: BTreeMap<u32, MemoryDevice>,
    volumes: Vec<MemoryVolume>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, index: u32, device: MemoryDevice) -> Self {
        self.devices.insert(index, device);
        self
    }

    pub fn with_volume(mut self, volume: MemoryVolume) -> Self {
        self.volumes.push(volume);
        self
    }

    fn volume_by_path(&self, path: &str) -> Option<&MemoryVolume> {
        self.volumes.iter().find(|volume| {
            volume.id.trim_end_matches('\\') == path
                || volume.path_names.iter().any(|name| name == path)
        })
    }
}

impl DeviceAccessPort for MemoryPort {
    fn device_path(&self, index: u32) -> Option<String> {
        Some(format!("mem{}", index))
    }

    fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>> {
        if let Some(index) = path.strip_prefix("mem").and_then(|n| n.parse::<u32>().ok()) {
            let device = self
                .devices
                .get(&index)
                .ok_or_else(|| ProbeError::not_found(path))?;
            if let Some(reason) = device.open_error {
                return Err(ProbeError::DeviceUnavailable {
                    path: path.to_string(),
                    reason,
                });
            }
            return Ok(Box::new(MemoryHandle::Device(device)));
        }

        let volume = self
            .volume_by_path(path)
            .ok_or_else(|| ProbeError::not_found(path))?;
        let backing = volume
            .extents
            .first()
            .and_then(|extent| self.devices.get(&extent.device_index).map(|d| (d, *extent)));
        Ok(Box::new(MemoryHandle::Volume { volume, backing }))
    }

    fn enumerate_volumes(&self) -> ProbeResult<Vec<String>> {
        Ok(self.volumes.iter().map(|volume| volume.id.clone()).collect())
    }

    fn volume_path_names(&self, volume: &str, capacity: usize) -> ProbeResult<Vec<String>> {
        let entry = self
            .volumes
            .iter()
            .find(|candidate| candidate.id == volume)
            .ok_or_else(|| ProbeError::not_found(volume))?;
        let required = multi_sz_len(&entry.path_names);
        if required > capacity {
            return Err(ProbeError::BufferTooSmall {
                required: Some(required),
            });
        }
        Ok(entry.path_names.clone())
    }
}

enum MemoryHandle<'a> {
    Device(&'a MemoryDevice),
    Volume {
        volume: &'a MemoryVolume,
        backing: Option<(&'a MemoryDevice, DiskExtent)>,
    },
}

fn slice_at(bytes: &[u8], start: u64, count: usize, limit: u64) -> ProbeResult<Vec<u8>> {
    let end = start.checked_add(count as u64);
    match end {
        Some(end) if end <= limit && end <= bytes.len() as u64 => {
            Ok(bytes[start as usize..end as usize].to_vec())
        }
        _ => Err(ProbeError::Io {
            offset: start,
            len: count,
            source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        }),
    }
}

impl DeviceHandle for MemoryHandle<'_> {
    fn read_sectors(&mut self, start_byte: u64, count_bytes: usize) -> ProbeResult<Vec<u8>> {
        match self {
            MemoryHandle::Device(device) => {
                slice_at(&device.bytes, start_byte, count_bytes, device.bytes.len() as u64)
            }
            MemoryHandle::Volume { backing, .. } => {
                let Some((device, extent)) = backing else {
                    return Err(ProbeError::Io {
                        offset: start_byte,
                        len: count_bytes,
                        source: std::io::Error::from(std::io::ErrorKind::NotFound),
                    });
                };
                let limit = extent.starting_offset.saturating_add(extent.length);
                slice_at(
                    &device.bytes,
                    extent.starting_offset.saturating_add(start_byte),
                    count_bytes,
                    limit,
                )
            }
        }
    }

    fn query_geometry(&mut self) -> ProbeResult<Geometry> {
        match self {
            MemoryHandle::Device(device) => device
                .geometry
                .ok_or(ProbeError::QueryUnsupported("geometry")),
            MemoryHandle::Volume { volume, .. } => {
                let sector_size = volume
                    .sector_size
                    .ok_or(ProbeError::QueryUnsupported("geometry"))?;
                let length = volume.extents.iter().map(|extent| extent.length).sum::<u64>();
                Ok(Geometry {
                    sector_size,
                    cylinders: None,
                    total_sectors: (sector_size > 0).then(|| length / sector_size as u64),
                })
            }
        }
    }

    fn query_partition_info(&mut self) -> ProbeResult<PartitionQuery> {
        match self {
            MemoryHandle::Device(device) => device
                .partition_info
                .ok_or(ProbeError::QueryUnsupported("partition info")),
            MemoryHandle::Volume { volume, .. } => volume
                .query
                .ok_or(ProbeError::QueryUnsupported("partition info")),
        }
    }

    fn query_volume_extents(&mut self) -> ProbeResult<Vec<DiskExtent>> {
        match self {
            MemoryHandle::Device(_) => Err(ProbeError::QueryUnsupported("volume extents")),
            MemoryHandle::Volume { volume, .. } => Ok(volume.extents.clone()),
        }
    }

    fn query_solid_state(&mut self) -> ProbeResult<bool> {
        match self {
            MemoryHandle::Device(device) => device
                .solid_state
                .ok_or(ProbeError::QueryUnsupported("solid state hint")),
            MemoryHandle::Volume { .. } => Err(ProbeError::QueryUnsupported("solid state hint")),
        }
    }
}
