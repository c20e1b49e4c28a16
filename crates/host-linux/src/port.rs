use anyhow::Result;
use diskscope_probe::{
    DeviceAccessPort, DeviceHandle, DiskExtent, Geometry, PartitionQuery, PartitionStyle,
    ProbeError, ProbeResult,
};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use tracing::debug;
use uuid::Uuid;

use crate::sysfs::{scan_inventory, BlockDisk, BlockInventory, BlockVolume, SysPaths};

/// Block devices as the kernel exposes them: disks are probe slots in
/// name order, partitions and md/dm devices are volumes.
pub struct LinuxPort {
    paths: SysPaths,
    inventory: BlockInventory,
}

impl LinuxPort {
    pub fn scan() -> Result<Self> {
        Self::scan_with(SysPaths::default())
    }

    pub fn scan_with(paths: SysPaths) -> Result<Self> {
        let inventory = scan_inventory(&paths)?;
        debug!(
            disks = inventory.disks.len(),
            volumes = inventory.volumes.len(),
            "block inventory read"
        );
        Ok(Self { paths, inventory })
    }

    pub fn inventory(&self) -> &BlockInventory {
        &self.inventory
    }

    fn dev_path(&self, name: &str) -> String {
        self.paths.dev.join(name).display().to_string()
    }
}

impl DeviceAccessPort for LinuxPort {
    fn device_path(&self, index: u32) -> Option<String> {
        self.inventory
            .disks
            .get(index as usize)
            .map(|disk| self.dev_path(&disk.name))
    }

    fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>> {
        let target = if let Some(disk) = self
            .inventory
            .disks
            .iter()
            .find(|disk| self.dev_path(&disk.name) == path)
        {
            Target::Disk(disk)
        } else if let Some(volume) = self
            .inventory
            .volumes
            .iter()
            .find(|volume| self.dev_path(&volume.name) == path)
        {
            Target::Volume(volume)
        } else {
            return Err(ProbeError::not_found(path));
        };
        let file = File::open(path).map_err(|err| ProbeError::from_open(path, &err))?;
        Ok(Box::new(LinuxHandle {
            file,
            target,
            inventory: &self.inventory,
        }))
    }

    fn enumerate_volumes(&self) -> ProbeResult<Vec<String>> {
        Ok(self
            .inventory
            .volumes
            .iter()
            .map(|volume| volume.name.clone())
            .collect())
    }

    /// The kernel hands back every mount at once, so `capacity` never binds.
    fn volume_path_names(&self, volume: &str, _capacity: usize) -> ProbeResult<Vec<String>> {
        if !self.inventory.volumes.iter().any(|v| v.name == volume) {
            return Err(ProbeError::not_found(volume));
        }
        Ok(self
            .inventory
            .mounts
            .get(volume)
            .map(|mounts| mounts.iter().map(|m| m.mount_point.clone()).collect())
            .unwrap_or_default())
    }

    fn volume_device_path(&self, volume: &str, _mount_path: Option<&str>) -> String {
        self.dev_path(volume)
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Disk(&'a BlockDisk),
    Volume(&'a BlockVolume),
}

struct LinuxHandle<'a> {
    file: File,
    target: Target<'a>,
    inventory: &'a BlockInventory,
}

impl LinuxHandle<'_> {
    fn disk_sector_size(&self, disk: &BlockDisk) -> Option<u32> {
        ioctl_sector_size(&self.file)
            .or(disk.logical_block_size)
            .filter(|size| *size > 0)
    }
}

impl DeviceHandle for LinuxHandle<'_> {
    fn read_sectors(&mut self, start_byte: u64, count_bytes: usize) -> ProbeResult<Vec<u8>> {
        let mut buf = vec![0u8; count_bytes];
        self.file
            .read_exact_at(&mut buf, start_byte)
            .map_err(|source| ProbeError::Io {
                offset: start_byte,
                len: count_bytes,
                source,
            })?;
        Ok(buf)
    }

    fn query_geometry(&mut self) -> ProbeResult<Geometry> {
        match self.target {
            Target::Disk(disk) => {
                let sector_size = self
                    .disk_sector_size(disk)
                    .ok_or(ProbeError::QueryUnsupported("geometry"))?;
                let bytes = ioctl_size_bytes(&self.file)
                    .or_else(|| disk.size_sectors.map(|sectors| sectors.saturating_mul(512)));
                Ok(Geometry {
                    sector_size,
                    cylinders: None,
                    total_sectors: bytes.map(|bytes| bytes / sector_size as u64),
                })
            }
            Target::Volume(volume) => {
                let disk = volume
                    .extents
                    .first()
                    .and_then(|extent| self.inventory.disks.get(extent.disk_index as usize))
                    .ok_or(ProbeError::QueryUnsupported("geometry"))?;
                let sector_size = self
                    .disk_sector_size(disk)
                    .ok_or(ProbeError::QueryUnsupported("geometry"))?;
                let bytes: u64 = volume.extents.iter().map(|extent| extent.length_bytes).sum();
                Ok(Geometry {
                    sector_size,
                    cylinders: None,
                    total_sectors: Some(bytes / sector_size as u64),
                })
            }
        }
    }

    fn query_partition_info(&mut self) -> ProbeResult<PartitionQuery> {
        match self.target {
            Target::Disk(disk) => {
                let style = disk
                    .table_type
                    .as_deref()
                    .and_then(style_from_udev)
                    .ok_or(ProbeError::QueryUnsupported("partition info"))?;
                let length = disk.size_sectors.unwrap_or(0).saturating_mul(512);
                Ok(PartitionQuery::whole_disk(style, length))
            }
            Target::Volume(volume) => partition_query_from_udev(volume)
                .ok_or(ProbeError::QueryUnsupported("partition info")),
        }
    }

    fn query_volume_extents(&mut self) -> ProbeResult<Vec<DiskExtent>> {
        match self.target {
            Target::Disk(_) => Err(ProbeError::QueryUnsupported("volume extents")),
            Target::Volume(volume) => Ok(volume
                .extents
                .iter()
                .map(|extent| DiskExtent {
                    device_index: extent.disk_index,
                    starting_offset: extent.start_bytes,
                    length: extent.length_bytes,
                })
                .collect()),
        }
    }

    fn query_solid_state(&mut self) -> ProbeResult<bool> {
        match self.target {
            Target::Disk(disk) => disk
                .rotational
                .map(|rotational| !rotational)
                .ok_or(ProbeError::QueryUnsupported("solid state hint")),
            Target::Volume(_) => Err(ProbeError::QueryUnsupported("solid state hint")),
        }
    }
}

fn style_from_udev(value: &str) -> Option<PartitionStyle> {
    match value {
        "gpt" => Some(PartitionStyle::Gpt),
        "dos" => Some(PartitionStyle::Mbr),
        _ => None,
    }
}

/// Partition record from udev's `ID_PART_ENTRY_*` properties.
pub(crate) fn partition_query_from_udev(volume: &BlockVolume) -> Option<PartitionQuery> {
    let style = volume
        .udev
        .get("ID_PART_ENTRY_SCHEME")
        .and_then(|scheme| style_from_udev(scheme))?;
    let extent = volume.extents.first()?;
    let number = volume
        .udev
        .get("ID_PART_ENTRY_NUMBER")
        .and_then(|value| value.parse::<u32>().ok())
        .or(volume.number)
        .unwrap_or(0);
    let entry_type = volume.udev.get("ID_PART_ENTRY_TYPE");
    let gpt_type = match style {
        PartitionStyle::Gpt => entry_type.and_then(|value| Uuid::parse_str(value).ok()),
        _ => None,
    };
    let mbr_boot_indicator = style == PartitionStyle::Mbr
        && volume
            .udev
            .get("ID_PART_ENTRY_FLAGS")
            .and_then(|flags| u64::from_str_radix(flags.trim_start_matches("0x"), 16).ok())
            .map(|flags| flags & 0x80 != 0)
            .unwrap_or(false);
    Some(PartitionQuery {
        style,
        number,
        starting_offset: extent.start_bytes,
        length: extent.length_bytes,
        gpt_type,
        mbr_boot_indicator,
    })
}

const BLKSSZGET: u64 = 0x1268;
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64"
))]
const BLKGETSIZE64: u64 = 0x8008_1272;

fn ioctl_sector_size(file: &File) -> Option<u32> {
    let mut value: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut value as *mut libc::c_int) };
    (rc == 0 && value > 0).then_some(value as u32)
}

#[cfg(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64"
))]
fn ioctl_size_bytes(file: &File) -> Option<u64> {
    let mut value: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut value as *mut u64) };
    (rc == 0 && value > 0).then_some(value)
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64"
)))]
fn ioctl_size_bytes(_file: &File) -> Option<u64> {
    None
}
