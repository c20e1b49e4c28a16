use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem roots the inventory is read from; overridable for tests.
#[derive(Debug, Clone)]
pub struct SysPaths {
    pub sys_block: PathBuf,
    pub dev: PathBuf,
    pub mounts: PathBuf,
    pub udev_data: PathBuf,
}

impl Default for SysPaths {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            dev: PathBuf::from("/dev"),
            mounts: PathBuf::from("/proc/self/mounts"),
            udev_data: PathBuf::from("/run/udev/data"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockDisk {
    pub name: String,
    pub logical_block_size: Option<u32>,
    /// In 512-byte units, as sysfs reports it.
    pub size_sectors: Option<u64>,
    pub rotational: Option<bool>,
    pub table_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeExtent {
    pub disk_index: u32,
    pub start_bytes: u64,
    pub length_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BlockVolume {
    pub name: String,
    pub number: Option<u32>,
    pub extents: Vec<VolumeExtent>,
    pub udev: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct BlockInventory {
    pub disks: Vec<BlockDisk>,
    pub volumes: Vec<BlockVolume>,
    pub mounts: HashMap<String, Vec<MountInfo>>,
}

#[derive(Debug, Clone)]
pub struct MountInfo {
    pub mount_point: String,
    pub fs_type: String,
}

/// Physical disks get slots in name order; their partitions and any
/// md/dm device stacked on them become volumes.
pub fn scan_inventory(paths: &SysPaths) -> Result<BlockInventory> {
    let mut names = Vec::new();
    for entry in fs::read_dir(&paths.sys_block)
        .with_context(|| format!("read {}", paths.sys_block.display()))?
    {
        let entry = entry?;
        names.push((entry.file_name().to_string_lossy().to_string(), entry.path()));
    }
    names.sort();

    let mut inventory = BlockInventory {
        mounts: read_mounts(&paths.mounts),
        ..BlockInventory::default()
    };
    let mut stacked = Vec::new();
    for (name, path) in names {
        if is_virtual_disk(&name, &path) {
            stacked.push((name, path));
            continue;
        }
        let disk_index = inventory.disks.len() as u32;
        let udev = read_udev_props(&paths.udev_data, &path);
        inventory.disks.push(BlockDisk {
            logical_block_size: read_u64(path.join("queue/logical_block_size")).map(|v| v as u32),
            size_sectors: read_u64(path.join("size")),
            rotational: read_u64(path.join("queue/rotational")).map(|v| v == 1),
            table_type: udev.get("ID_PART_TABLE_TYPE").cloned(),
            name,
        });
        inventory
            .volumes
            .extend(enumerate_partitions(&path, disk_index, &paths.udev_data)?);
    }

    for (name, path) in stacked {
        let extents = slave_extents(&path, &inventory);
        if extents.is_empty() {
            continue;
        }
        debug!(volume = %name, extents = extents.len(), "stacked block device");
        inventory.volumes.push(BlockVolume {
            udev: read_udev_props(&paths.udev_data, &path),
            name,
            number: None,
            extents,
        });
    }
    Ok(inventory)
}

fn enumerate_partitions(disk_path: &Path, disk_index: u32, udev_data: &Path) -> Result<Vec<BlockVolume>> {
    let mut partitions = Vec::new();
    let entries = fs::read_dir(disk_path).context("read disk entries")?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(number) = read_u64(path.join("partition")) else {
            continue;
        };
        let start = read_u64(path.join("start")).unwrap_or(0);
        let size = read_u64(path.join("size")).unwrap_or(0);
        partitions.push(BlockVolume {
            name: entry.file_name().to_string_lossy().to_string(),
            number: Some(number as u32),
            extents: vec![VolumeExtent {
                disk_index,
                start_bytes: start.saturating_mul(512),
                length_bytes: size.saturating_mul(512),
            }],
            udev: read_udev_props(udev_data, &path),
        });
    }
    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(partitions)
}

/// Maps each member of an md/dm device to the physical extent it occupies.
fn slave_extents(path: &Path, inventory: &BlockInventory) -> Vec<VolumeExtent> {
    let Ok(entries) = fs::read_dir(path.join("slaves")) else {
        return Vec::new();
    };
    let mut slaves: Vec<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    slaves.sort();
    slaves
        .iter()
        .filter_map(|slave| {
            if let Some(volume) = inventory.volumes.iter().find(|v| &v.name == slave) {
                return volume.extents.first().copied();
            }
            inventory
                .disks
                .iter()
                .position(|disk| &disk.name == slave)
                .map(|idx| VolumeExtent {
                    disk_index: idx as u32,
                    start_bytes: 0,
                    length_bytes: inventory.disks[idx]
                        .size_sectors
                        .unwrap_or(0)
                        .saturating_mul(512),
                })
        })
        .collect()
}

/// `E:KEY=VALUE` lines of the udev database record for a block device.
fn read_udev_props(udev_data: &Path, sys_path: &Path) -> HashMap<String, String> {
    let Some(dev) = read_string(sys_path.join("dev")) else {
        return HashMap::new();
    };
    let data = fs::read_to_string(udev_data.join(format!("b{}", dev))).unwrap_or_default();
    parse_udev_props(&data)
}

pub fn parse_udev_props(data: &str) -> HashMap<String, String> {
    data.lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|prop| prop.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn read_mounts(path: &Path) -> HashMap<String, Vec<MountInfo>> {
    let mut mounts: HashMap<String, Vec<MountInfo>> = HashMap::new();
    let data = fs::read_to_string(path).unwrap_or_default();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let device = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        let mount_point = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let fs_type = match parts.next() {
            Some(value) => value.to_string(),
            None => continue,
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        // /dev/mapper/* and /dev/disk/by-* are symlinks to the kernel name
        let resolved = fs::canonicalize(device).unwrap_or_else(|_| PathBuf::from(device));
        let name = resolved
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(MountInfo { mount_point, fs_type });
    }
    mounts
}

pub fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

pub fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_ascii_digit() {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

fn is_virtual_disk(name: &str, path: &Path) -> bool {
    if name.starts_with("loop")
        || name.starts_with("ram")
        || name.starts_with("zram")
        || name.starts_with("md")
        || name.starts_with("dm-")
    {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}
