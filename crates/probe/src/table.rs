//! Partition table reading: the OS-record path (GPT type GUID taxonomy,
//! extents straight from the partition query) and the raw path (MBR boot
//! sector, GPT header and entry array parsed from sector bytes).

use diskscope_core::{
    GptType, MbrPartitionKind, PartitionScheme, TableEntry, TableEntryKind,
};
use thiserror::Error;
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::port::{PartitionQuery, PartitionStyle};

pub const MBR_SECTOR_LEN: usize = 512;
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_HEADER_LBA: u64 = 1;
pub const GPT_MIN_ENTRY_SIZE: u32 = 128;
/// Larger entries only come from corrupt headers.
pub const GPT_MAX_ENTRY_SIZE: u32 = 4096;
/// Upper bound on entries read from a raw GPT array.
pub const MAX_GPT_ENTRIES: u32 = 128;

pub const PARTITION_ENTRY_UNUSED: Uuid = Uuid::nil();
pub const PARTITION_MSFT_RECOVERY: Uuid = Uuid::from_u128(0xde94bba4_06d1_4d40_a16a_bfd50179d6ac);
pub const PARTITION_BASIC_DATA: Uuid = Uuid::from_u128(0xebd0a0a2_b9e5_4433_87c0_68b6b72699c7);
pub const PARTITION_SYSTEM: Uuid = Uuid::from_u128(0xc12a7328_f81f_11d2_ba4b_00a0c93ec93b);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("sector too short: {len} bytes, need {need}")]
    Truncated { len: usize, need: usize },
    #[error("GPT header invalid: {0}")]
    InvalidGptHeader(&'static str),
}

#[derive(FromBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
struct MbrSlotRaw {
    boot_flag: u8,
    _start_chs: [u8; 3],
    type_id: u8,
    _end_chs: [u8; 3],
    start_lba: u32,
    sector_count: u32,
}

#[derive(FromBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
struct MbrSectorRaw {
    _boot_code: [u8; 446],
    slots: [MbrSlotRaw; 4],
    signature: [u8; 2],
}

#[derive(FromBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
struct GptHeaderRaw {
    signature: [u8; 8],
    _revision: u32,
    _header_size: u32,
    _header_crc: u32,
    _reserved: u32,
    _current_lba: u64,
    _backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    entries_lba: u64,
    num_entries: u32,
    entry_size: u32,
    _entries_crc: u32,
}

#[derive(FromBytes, KnownLayout, Immutable, Copy, Clone)]
#[repr(C, packed)]
struct GptEntryRaw {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    _attributes: u64,
    name: [u16; 36],
}

/// Partition fields derived from one OS partition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRecord {
    pub scheme: PartitionScheme,
    pub gpt_type: Option<GptType>,
    pub mbr_bootable: Option<bool>,
    pub number: u32,
    pub offset_bytes: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrRecord {
    /// 1-based.
    pub slot: u32,
    pub bootable: bool,
    pub kind: MbrPartitionKind,
    pub start_lba: u32,
    pub sector_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbrTable {
    pub boot_signature_present: bool,
    pub records: Vec<MbrRecord>,
}

impl MbrTable {
    pub fn is_protective(&self) -> bool {
        self.records
            .iter()
            .any(|record| record.kind == MbrPartitionKind::Protective)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub disk_guid: Uuid,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
}

impl GptHeader {
    /// Bytes of the entry array actually worth reading.
    pub fn entries_len(&self) -> usize {
        self.num_entries.min(MAX_GPT_ENTRIES) as usize * self.entry_size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptRecord {
    /// 1-based.
    pub slot: u32,
    pub kind: GptType,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl GptRecord {
    pub fn sector_count(&self) -> u64 {
        self.last_lba
            .checked_sub(self.first_lba)
            .map(|span| span + 1)
            .unwrap_or(0)
    }
}

pub fn classify_gpt_type(guid: &Uuid) -> GptType {
    match *guid {
        g if g == PARTITION_ENTRY_UNUSED => GptType::Unused,
        g if g == PARTITION_MSFT_RECOVERY => GptType::Recovery,
        g if g == PARTITION_BASIC_DATA => GptType::BasicData,
        g if g == PARTITION_SYSTEM => GptType::System,
        other => GptType::Other(other),
    }
}

/// OS-record path: extent and number come straight from the query.
pub fn record_from_query(query: &PartitionQuery) -> PartitionRecord {
    let (scheme, gpt_type, mbr_bootable) = match query.style {
        PartitionStyle::Gpt => (
            PartitionScheme::Gpt,
            Some(
                query
                    .gpt_type
                    .map(|guid| classify_gpt_type(&guid))
                    .unwrap_or(GptType::Unused),
            ),
            None,
        ),
        PartitionStyle::Mbr => (PartitionScheme::Mbr, None, Some(query.mbr_boot_indicator)),
        PartitionStyle::Raw => (PartitionScheme::Raw, None, None),
    };
    PartitionRecord {
        scheme,
        gpt_type,
        mbr_bootable,
        number: query.number,
        offset_bytes: query.starting_offset,
        size_bytes: query.length,
    }
}

/// Parses the four primary slots of a boot sector. A missing `0x55AA` is
/// reported through `boot_signature_present`, not as an error.
pub fn parse_mbr(sector: &[u8]) -> Result<MbrTable, TableError> {
    let raw = sector
        .get(..MBR_SECTOR_LEN)
        .and_then(|bytes| MbrSectorRaw::read_from_bytes(bytes).ok())
        .ok_or(TableError::Truncated {
            len: sector.len(),
            need: MBR_SECTOR_LEN,
        })?;

    let signature = raw.signature;
    let slots = raw.slots;
    let records = slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.type_id != 0x00)
        .map(|(idx, slot)| MbrRecord {
            slot: idx as u32 + 1,
            bootable: slot.boot_flag == 0x80,
            kind: MbrPartitionKind::from_type_id(slot.type_id),
            start_lba: u32::from_le(slot.start_lba),
            sector_count: u32::from_le(slot.sector_count),
        })
        .collect();

    Ok(MbrTable {
        boot_signature_present: signature == MBR_SIGNATURE,
        records,
    })
}

/// Returns `Ok(None)` when LBA 1 carries no `"EFI PART"` signature.
pub fn parse_gpt_header(sector: &[u8]) -> Result<Option<GptHeader>, TableError> {
    let need = core::mem::size_of::<GptHeaderRaw>();
    let raw = sector
        .get(..need)
        .and_then(|bytes| GptHeaderRaw::read_from_bytes(bytes).ok())
        .ok_or(TableError::Truncated {
            len: sector.len(),
            need,
        })?;

    let signature = raw.signature;
    if &signature != GPT_SIGNATURE {
        return Ok(None);
    }
    let entry_size = u32::from_le(raw.entry_size);
    if !(GPT_MIN_ENTRY_SIZE..=GPT_MAX_ENTRY_SIZE).contains(&entry_size) || entry_size % 8 != 0 {
        return Err(TableError::InvalidGptHeader("entry size"));
    }
    let entries_lba = u64::from_le(raw.entries_lba);
    if entries_lba < 2 {
        return Err(TableError::InvalidGptHeader("entry array overlaps header"));
    }
    Ok(Some(GptHeader {
        disk_guid: Uuid::from_bytes_le(raw.disk_guid),
        first_usable_lba: u64::from_le(raw.first_usable_lba),
        last_usable_lba: u64::from_le(raw.last_usable_lba),
        entries_lba,
        num_entries: u32::from_le(raw.num_entries),
        entry_size,
    }))
}

/// Walks a raw entry array; unused (all-zero type) entries are skipped.
pub fn parse_gpt_entries(bytes: &[u8], entry_size: u32) -> Vec<GptRecord> {
    let entry_size = entry_size.max(GPT_MIN_ENTRY_SIZE) as usize;
    bytes
        .chunks_exact(entry_size)
        .take(MAX_GPT_ENTRIES as usize)
        .enumerate()
        .filter_map(|(idx, chunk)| {
            let raw = GptEntryRaw::read_from_bytes(&chunk[..GPT_MIN_ENTRY_SIZE as usize]).ok()?;
            let type_guid = Uuid::from_bytes_le(raw.type_guid);
            if type_guid.is_nil() {
                return None;
            }
            let name = raw.name;
            Some(GptRecord {
                slot: idx as u32 + 1,
                kind: classify_gpt_type(&type_guid),
                unique_guid: Uuid::from_bytes_le(raw.unique_guid),
                first_lba: u64::from_le(raw.first_lba),
                last_lba: u64::from_le(raw.last_lba),
                name: decode_gpt_name(&name),
            })
        })
        .collect()
}

fn decode_gpt_name(name: &[u16; 36]) -> String {
    let units: Vec<u16> = name.iter().map(|&unit| u16::from_le(unit)).collect();
    let end = units.iter().position(|&unit| unit == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

pub fn mbr_table_entries(table: &MbrTable) -> Vec<TableEntry> {
    table
        .records
        .iter()
        .map(|record| TableEntry {
            slot: record.slot,
            bootable: record.bootable,
            kind: TableEntryKind::Mbr(record.kind),
            start_sector: record.start_lba as u64,
            sector_count: record.sector_count as u64,
            embedded: Vec::new(),
        })
        .collect()
}

pub fn gpt_table_entries(records: &[GptRecord]) -> Vec<TableEntry> {
    records
        .iter()
        .map(|record| TableEntry {
            slot: record.slot,
            bootable: false,
            kind: TableEntryKind::Gpt(record.kind),
            start_sector: record.first_lba,
            sector_count: record.sector_count(),
            embedded: Vec::new(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gpt_entry_array, gpt_header_sector, mbr_sector, MbrSpec};

    #[test]
    fn parses_every_populated_slot_and_skips_empty_ones() {
        let sector = mbr_sector(
            &[
                MbrSpec::new(0x80, 0x07, 2048, 4096),
                MbrSpec::empty(),
                MbrSpec::new(0x00, 0x83, 8192, 16384),
                MbrSpec::new(0x00, 0x0C, 40000, 100),
            ],
            true,
        );
        let table = parse_mbr(&sector).unwrap();
        assert!(table.boot_signature_present);
        assert_eq!(table.records.len(), 3);

        assert_eq!(table.records[0].slot, 1);
        assert!(table.records[0].bootable);
        assert_eq!(table.records[0].kind, MbrPartitionKind::Ntfs);
        assert_eq!(table.records[0].start_lba, 2048);
        assert_eq!(table.records[0].sector_count, 4096);

        assert_eq!(table.records[1].slot, 3);
        assert_eq!(table.records[1].kind, MbrPartitionKind::LinuxNative);
        assert!(!table.records[1].bootable);

        assert_eq!(table.records[2].kind, MbrPartitionKind::Fat32Lba);
        assert_eq!(table.records[2].start_lba, 40000);
    }

    #[test]
    fn missing_signature_is_reported_not_fatal() {
        let sector = mbr_sector(&[MbrSpec::new(0x00, 0x83, 63, 1000)], false);
        let table = parse_mbr(&sector).unwrap();
        assert!(!table.boot_signature_present);
        assert_eq!(table.records.len(), 1);
    }

    #[test]
    fn type_byte_0x83_is_linux_native_unsigned() {
        let sector = mbr_sector(&[MbrSpec::new(0x00, 0x83, 63, 1000), MbrSpec::new(0x00, 0x82, 1063, 10)], true);
        let table = parse_mbr(&sector).unwrap();
        assert_eq!(table.records[0].kind, MbrPartitionKind::LinuxNative);
        assert_eq!(table.records[1].kind, MbrPartitionKind::LinuxSwap);
        assert_eq!(table.records[0].kind, MbrPartitionKind::from_signed(-125));
    }

    #[test]
    fn unknown_type_keeps_raw_byte() {
        let sector = mbr_sector(&[MbrSpec::new(0x00, 0xA5, 63, 1000)], true);
        let table = parse_mbr(&sector).unwrap();
        assert_eq!(table.records[0].kind, MbrPartitionKind::Other(0xA5));
    }

    #[test]
    fn truncated_sector_is_an_error() {
        assert_eq!(
            parse_mbr(&[0u8; 100]),
            Err(TableError::Truncated { len: 100, need: 512 })
        );
    }

    #[test]
    fn protective_entry_detected() {
        let sector = mbr_sector(&[MbrSpec::new(0x00, 0xEE, 1, 0xFFFF_FFFF)], true);
        assert!(parse_mbr(&sector).unwrap().is_protective());
    }

    #[test]
    fn gpt_query_classifies_well_known_guids() {
        let mut query = PartitionQuery {
            style: PartitionStyle::Gpt,
            number: 2,
            starting_offset: 1 << 20,
            length: 1 << 30,
            gpt_type: Some(PARTITION_ENTRY_UNUSED),
            mbr_boot_indicator: false,
        };
        let record = record_from_query(&query);
        assert_eq!(record.scheme, PartitionScheme::Gpt);
        assert_eq!(record.gpt_type, Some(GptType::Unused));
        assert_eq!(record.mbr_bootable, None);
        assert_eq!(record.number, 2);
        assert_eq!(record.offset_bytes, 1 << 20);

        query.gpt_type = Some(PARTITION_BASIC_DATA);
        assert_eq!(record_from_query(&query).gpt_type, Some(GptType::BasicData));
        query.gpt_type = Some(PARTITION_MSFT_RECOVERY);
        assert_eq!(record_from_query(&query).gpt_type, Some(GptType::Recovery));
        query.gpt_type = Some(PARTITION_SYSTEM);
        assert_eq!(record_from_query(&query).gpt_type, Some(GptType::System));

        let linux = Uuid::from_u128(0x0fc63daf_8483_4772_8e79_3d69d8477de4);
        query.gpt_type = Some(linux);
        assert_eq!(record_from_query(&query).gpt_type, Some(GptType::Other(linux)));
    }

    #[test]
    fn mbr_query_carries_boot_flag_only() {
        let query = PartitionQuery {
            style: PartitionStyle::Mbr,
            number: 1,
            starting_offset: 32256,
            length: 4096,
            gpt_type: None,
            mbr_boot_indicator: true,
        };
        let record = record_from_query(&query);
        assert_eq!(record.scheme, PartitionScheme::Mbr);
        assert_eq!(record.mbr_bootable, Some(true));
        assert_eq!(record.gpt_type, None);
    }

    #[test]
    fn gpt_header_and_entries_round_through_raw_bytes() {
        let header = gpt_header_sector(2, 4, 128);
        let parsed = parse_gpt_header(&header).unwrap().unwrap();
        assert_eq!(parsed.entries_lba, 2);
        assert_eq!(parsed.num_entries, 4);
        assert_eq!(parsed.entries_len(), 4 * 128);

        let array = gpt_entry_array(
            &[
                (PARTITION_SYSTEM, 2048, 4095, "EFI"),
                (PARTITION_ENTRY_UNUSED, 0, 0, ""),
                (PARTITION_BASIC_DATA, 4096, 8191, "data"),
            ],
            4,
        );
        let records = parse_gpt_entries(&array, parsed.entry_size);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, GptType::System);
        assert_eq!(records[0].name, "EFI");
        assert_eq!(records[0].sector_count(), 2048);
        assert_eq!(records[1].slot, 3);
        assert_eq!(records[1].kind, GptType::BasicData);
    }

    #[test]
    fn gpt_header_absent_without_signature() {
        assert_eq!(parse_gpt_header(&[0u8; 512]), Ok(None));
    }

    #[test]
    fn gpt_header_rejects_tiny_entries() {
        let header = gpt_header_sector(2, 4, 64);
        assert_eq!(
            parse_gpt_header(&header),
            Err(TableError::InvalidGptHeader("entry size"))
        );
    }

    #[test]
    fn gpt_header_rejects_oversized_entries() {
        for entry_size in [GPT_MAX_ENTRY_SIZE + 8, 0xFFFF_FFF8] {
            let header = gpt_header_sector(2, 128, entry_size);
            assert_eq!(
                parse_gpt_header(&header),
                Err(TableError::InvalidGptHeader("entry size"))
            );
        }
        let largest = parse_gpt_header(&gpt_header_sector(2, 128, GPT_MAX_ENTRY_SIZE))
            .unwrap()
            .unwrap();
        assert_eq!(largest.entries_len(), 128 * 4096);
    }
}
