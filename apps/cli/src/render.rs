use diskscope_core::{Device, Partition, TableEntryKind, Topology};
use std::fmt::Write;

pub fn render_topology(topology: &Topology) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({}), {} device(s)",
        topology.host.os,
        topology.host.os_version,
        topology.host.machine,
        topology.devices.len()
    );
    for device in &topology.devices {
        render_device(&mut out, device);
    }
    out
}

fn render_device(out: &mut String, device: &Device) {
    let media = match device.is_solid_state {
        Some(true) => "SSD",
        Some(false) => "HDD",
        None => "media unknown",
    };
    let capacity = device
        .capacity_bytes()
        .map(human_bytes)
        .unwrap_or_else(|| "size unknown".to_string());
    let _ = writeln!(
        out,
        "Disk {}  {}  {}  {}  {} B/sector  {}",
        device.index, device.path, device.partition_style, capacity, device.sector_size, media
    );

    for partition in &device.partitions {
        render_partition(out, partition);
    }

    if let Some(table) = &device.table {
        for entry in table.entries.iter().filter(|entry| !entry.embedded.is_empty()) {
            let kind = match entry.kind {
                TableEntryKind::Mbr(kind) => kind.to_string(),
                TableEntryKind::Gpt(kind) => kind.to_string(),
            };
            for hit in &entry.embedded {
                let _ = writeln!(out, "    table slot {} ({}): {}", entry.slot, kind, hit);
            }
        }
    }

    for issue in &device.issues {
        let _ = writeln!(out, "    ! {}", issue);
    }
}

fn render_partition(out: &mut String, partition: &Partition) {
    let kind = match (partition.gpt_type, partition.mbr_bootable) {
        (Some(gpt), _) => gpt.to_string(),
        (None, Some(true)) => "bootable".to_string(),
        (None, _) => partition.scheme.to_string(),
    };
    let mount = partition.mount_path.as_deref().unwrap_or("-");
    let _ = writeln!(
        out,
        "  #{:<3} {:<20} {:<18} offset {:<14} {:>10}  {}",
        partition.number,
        kind,
        partition.filesystem.to_string(),
        partition.offset_bytes,
        human_bytes(partition.size_bytes),
        mount
    );
    if partition.spanned_devices.len() > 1 {
        let _ = writeln!(out, "       spans disks {:?}", partition.spanned_devices);
    }
    for hit in &partition.embedded {
        let _ = writeln!(out, "       {}", hit);
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskscope_core::{
        DeviceIssue, EmbeddedFilesystem, Filesystem, GptType, HostInfo, PartitionScheme,
    };

    #[test]
    fn sizes_scale_by_1024() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(1 << 30), "1.0 GiB");
    }

    #[test]
    fn listing_shows_partitions_and_issues() {
        let device = Device {
            index: 2,
            path: "/dev/sdb".to_string(),
            sector_size: 512,
            cylinders: None,
            total_sectors: Some(2048),
            is_solid_state: Some(false),
            partition_style: PartitionScheme::Gpt,
            table: None,
            partitions: vec![Partition {
                volume_id: Some("sdb1".to_string()),
                scheme: PartitionScheme::Gpt,
                gpt_type: Some(GptType::BasicData),
                mbr_bootable: None,
                number: 1,
                offset_bytes: 32768,
                size_bytes: 491520,
                sector_count: Some(960),
                filesystem: Filesystem::Ntfs,
                mount_path: Some("/mnt/data".to_string()),
                owning_device_index: 2,
                spanned_devices: vec![2],
                embedded: vec![EmbeddedFilesystem::Ext {
                    superblock_offset: 33792,
                }],
            }],
            issues: vec![DeviceIssue::MissingBootSignature],
        };
        let topology = Topology::new(
            HostInfo {
                os: "linux".to_string(),
                os_version: "test".to_string(),
                machine: "box".to_string(),
            },
            vec![device],
        );
        let text = render_topology(&topology);
        assert!(text.starts_with("linux test (box), 1 device(s)\n"));
        assert!(text.contains("Disk 2  /dev/sdb  GPT  1.0 MiB  512 B/sector  HDD"));
        assert!(text.contains("basic data"));
        assert!(text.contains("/mnt/data"));
        assert!(text.contains("ext2/3/4 superblock @ 33792"));
        assert!(text.contains("! boot signature 0x55AA missing"));
    }
}
