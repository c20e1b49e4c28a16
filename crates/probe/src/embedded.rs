//! Superblock probes for filesystems a stale table fails to describe.
//! Each probe is one sector-sized read at a fixed location; nothing here
//! walks the device.

use diskscope_core::EmbeddedFilesystem;
use tracing::debug;

use crate::port::DeviceHandle;

/// ext2/3/4 superblock sits 1024 bytes into the partition.
pub const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT_MAGIC_OFFSET: usize = 56;
pub const EXT_MAGIC: u16 = 0xEF53;

/// btrfs superblock replica, counted in sectors past the partition start.
pub const BTRFS_SUPERBLOCK_SECTORS: u64 = 128;
pub const BTRFS_MAGIC_OFFSET: usize = 0x40;
pub const BTRFS_MAGIC: &[u8; 8] = b"_BHRfS_M";

const MIN_WINDOW: usize = 512;

/// Only the exact offset counts; the magic bytes appearing elsewhere in
/// the window are ignored.
pub fn matches_ext_superblock(window: &[u8]) -> bool {
    window
        .get(EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) == EXT_MAGIC)
        .unwrap_or(false)
}

pub fn matches_btrfs_superblock(window: &[u8]) -> bool {
    window
        .get(BTRFS_MAGIC_OFFSET..BTRFS_MAGIC_OFFSET + BTRFS_MAGIC.len())
        .map(|bytes| bytes == BTRFS_MAGIC.as_slice())
        .unwrap_or(false)
}

/// Relative to the partition's first byte.
pub fn ext_window_offset(partition_start: u64) -> u64 {
    partition_start.saturating_add(EXT_SUPERBLOCK_OFFSET)
}

/// Measured from the device origin, not the partition.
pub fn btrfs_window_offset(start_sector: u64, sector_size: u32) -> u64 {
    start_sector
        .saturating_add(BTRFS_SUPERBLOCK_SECTORS)
        .saturating_mul(sector_size as u64)
}

/// Runs both probes for a partition beginning at `start_sector`. A failed
/// read abandons that probe only.
pub fn scan_partition(
    handle: &mut dyn DeviceHandle,
    start_sector: u64,
    sector_size: u32,
) -> Vec<EmbeddedFilesystem> {
    let window_len = (sector_size as usize).max(MIN_WINDOW);
    let partition_start = start_sector.saturating_mul(sector_size as u64);
    let mut found = Vec::new();

    let ext_at = ext_window_offset(partition_start);
    match handle.read_sectors(ext_at, window_len) {
        Ok(window) if matches_ext_superblock(&window) => {
            found.push(EmbeddedFilesystem::Ext {
                superblock_offset: ext_at,
            });
        }
        Ok(_) => {}
        Err(err) => debug!(offset = ext_at, error = %err, "ext probe read failed"),
    }

    let btrfs_at = btrfs_window_offset(start_sector, sector_size);
    match handle.read_sectors(btrfs_at, window_len) {
        Ok(window) if matches_btrfs_superblock(&window) => {
            found.push(EmbeddedFilesystem::Btrfs {
                superblock_offset: btrfs_at,
            });
        }
        Ok(_) => {}
        Err(err) => debug!(offset = btrfs_at, error = %err, "btrfs probe read failed"),
    }

    found
}
