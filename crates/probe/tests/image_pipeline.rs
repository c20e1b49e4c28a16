use std::io::Write;

use diskscope_core::{
    DeviceIssue, DiscoveryConfig, EmbeddedFilesystem, Filesystem, MbrPartitionKind, PartitionScheme,
    TableEntryKind,
};
use diskscope_probe::{discover_topology, ImageFilePort};

const SECTOR: usize = 512;

fn mbr_slot(image: &mut [u8], idx: usize, boot: u8, type_id: u8, start: u32, count: u32) {
    let base = 446 + idx * 16;
    image[base] = boot;
    image[base + 4] = type_id;
    image[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
    image[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
}

fn write_image(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn image_files_run_through_the_whole_pass() {
    let mut disk = vec![0u8; 4096 * SECTOR];
    mbr_slot(&mut disk, 0, 0x80, 0x0C, 64, 512);
    mbr_slot(&mut disk, 1, 0x00, 0x83, 1024, 2048);
    disk[510] = 0x55;
    disk[511] = 0xAA;
    disk[64 * SECTOR + 3..64 * SECTOR + 11].copy_from_slice(b"MSWIN4.1");
    // btrfs replica 128 sectors past the Linux slot's start
    let btrfs_at = (1024 + 128) * SECTOR + 0x40;
    disk[btrfs_at..btrfs_at + 8].copy_from_slice(b"_BHRfS_M");

    let blank = vec![0u8; 16 * SECTOR];

    let first = write_image(&disk);
    let second = write_image(&blank);
    let port = ImageFilePort::new(
        vec![first.path().to_path_buf(), second.path().to_path_buf()],
        512,
    );

    let devices = discover_topology(&port, &DiscoveryConfig::default());
    assert_eq!(devices.len(), 2);

    let disk = &devices[0];
    assert_eq!(disk.index, 0);
    assert_eq!(disk.partition_style, PartitionScheme::Mbr);
    assert_eq!(disk.total_sectors, Some(4096));
    let table = disk.table.as_ref().unwrap();
    assert!(table.boot_signature_present);
    assert_eq!(
        table.entries[1].kind,
        TableEntryKind::Mbr(MbrPartitionKind::LinuxNative)
    );
    assert_eq!(
        table.entries[1].embedded,
        vec![EmbeddedFilesystem::Btrfs {
            superblock_offset: ((1024 + 128) * SECTOR) as u64
        }]
    );
    assert_eq!(disk.partitions.len(), 2);
    assert_eq!(disk.partitions[0].filesystem, Filesystem::Fat);
    assert_eq!(disk.partitions[0].mbr_bootable, Some(true));
    assert_eq!(disk.partitions[1].embedded.len(), 1);

    let blank = &devices[1];
    assert_eq!(blank.index, 1);
    assert!(blank.table.is_none());
    assert!(blank.partitions.is_empty());
    assert!(blank.issues.is_empty());
}

#[test]
fn unreadable_image_is_omitted() {
    let disk = write_image(&vec![0u8; 8 * SECTOR]);
    let port = ImageFilePort::new(
        vec![
            std::path::PathBuf::from("/definitely/missing.img"),
            disk.path().to_path_buf(),
        ],
        512,
    );
    let devices = discover_topology(&port, &DiscoveryConfig::default());
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].index, 1);
}

#[test]
fn corrupt_gpt_entry_size_becomes_a_device_issue() {
    let mut disk = vec![0u8; 64 * SECTOR];
    mbr_slot(&mut disk, 0, 0x00, 0xEE, 1, 63);
    disk[510] = 0x55;
    disk[511] = 0xAA;
    let header = &mut disk[SECTOR..2 * SECTOR];
    header[0..8].copy_from_slice(b"EFI PART");
    header[72..80].copy_from_slice(&2u64.to_le_bytes());
    header[80..84].copy_from_slice(&128u32.to_le_bytes());
    header[84..88].copy_from_slice(&0xFFFF_FFF8u32.to_le_bytes());

    let healthy = write_image(&vec![0u8; 8 * SECTOR]);
    let corrupt = write_image(&disk);
    let port = ImageFilePort::new(
        vec![corrupt.path().to_path_buf(), healthy.path().to_path_buf()],
        512,
    );

    let devices = discover_topology(&port, &DiscoveryConfig::default());
    assert_eq!(devices.len(), 2);
    assert!(devices[0]
        .issues
        .iter()
        .any(|issue| matches!(issue, DeviceIssue::TableUnreadable(reason) if reason.contains("entry size"))));
    assert!(devices[0].table.as_ref().map_or(true, |table| !table.gpt_header_present));
    assert_eq!(devices[1].index, 1);
}
