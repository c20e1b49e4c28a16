//! Synthetic sector builders shared by the unit tests.

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct MbrSpec {
    pub boot_flag: u8,
    pub type_id: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrSpec {
    pub fn new(boot_flag: u8, type_id: u8, start_lba: u32, sector_count: u32) -> Self {
        Self {
            boot_flag,
            type_id,
            start_lba,
            sector_count,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

pub fn mbr_sector(slots: &[MbrSpec], signature: bool) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    write_mbr(&mut sector, slots, signature);
    sector
}

pub fn write_mbr(buf: &mut [u8], slots: &[MbrSpec], signature: bool) {
    for (idx, slot) in slots.iter().take(4).enumerate() {
        let base = 446 + idx * 16;
        buf[base] = slot.boot_flag;
        buf[base + 4] = slot.type_id;
        buf[base + 8..base + 12].copy_from_slice(&slot.start_lba.to_le_bytes());
        buf[base + 12..base + 16].copy_from_slice(&slot.sector_count.to_le_bytes());
    }
    if signature {
        buf[510] = 0x55;
        buf[511] = 0xAA;
    }
}

pub fn gpt_header_sector(entries_lba: u64, num_entries: u32, entry_size: u32) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    sector[0..8].copy_from_slice(b"EFI PART");
    sector[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    sector[12..16].copy_from_slice(&92u32.to_le_bytes());
    sector[24..32].copy_from_slice(&1u64.to_le_bytes());
    sector[40..48].copy_from_slice(&34u64.to_le_bytes());
    sector[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    sector[80..84].copy_from_slice(&num_entries.to_le_bytes());
    sector[84..88].copy_from_slice(&entry_size.to_le_bytes());
    sector
}

/// `(type, first_lba, last_lba, name)` per slot, padded to `count` entries.
pub fn gpt_entry_array(entries: &[(Uuid, u64, u64, &str)], count: usize) -> Vec<u8> {
    let mut array = vec![0u8; count * 128];
    for (idx, (type_guid, first, last, name)) in entries.iter().enumerate() {
        let base = idx * 128;
        array[base..base + 16].copy_from_slice(&type_guid.to_bytes_le());
        if !type_guid.is_nil() {
            array[base + 16] = idx as u8 + 1;
        }
        array[base + 32..base + 40].copy_from_slice(&first.to_le_bytes());
        array[base + 40..base + 48].copy_from_slice(&last.to_le_bytes());
        for (n, unit) in name.encode_utf16().take(36).enumerate() {
            let at = base + 56 + n * 2;
            array[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    array
}

/// Boot sector with `oem` in the identifier field (bytes 3..11).
pub fn boot_sector(oem: &[u8; 8]) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    sector[0] = 0xEB;
    sector[1] = 0x52;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(oem);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Writes an ext superblock magic for a partition starting at `partition_start`.
pub fn plant_ext_magic(image: &mut [u8], partition_start: u64) {
    let at = partition_start as usize + 1024 + 56;
    image[at] = 0x53;
    image[at + 1] = 0xEF;
}

/// Writes the btrfs magic where the scanner looks for a slot starting at `start_sector`.
pub fn plant_btrfs_magic(image: &mut [u8], start_sector: u64, sector_size: u64) {
    let at = ((start_sector + 128) * sector_size) as usize + 0x40;
    image[at..at + 8].copy_from_slice(b"_BHRfS_M");
}
