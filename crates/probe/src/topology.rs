//! One discovery pass: census the OS volumes, probe device slots
//! `0..max_devices` on a bounded worker pool, correlate volumes onto the
//! devices they live on, and hand back devices in ascending slot order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use diskscope_core::{
    Device, DeviceIssue, DiscoveryConfig, Filesystem, MbrPartitionKind, Partition,
    PartitionScheme, PartitionTable, TableEntry, TableEntryKind,
};
use tracing::{debug, info, warn};

use crate::embedded::scan_partition;
use crate::port::{DeviceAccessPort, DeviceHandle, DiskExtent, PartitionStyle};
use crate::resolver::VolumeResolver;
use crate::signature::classify_filesystem;
use crate::table::{
    gpt_table_entries, mbr_table_entries, parse_gpt_entries, parse_gpt_header, parse_mbr,
    record_from_query, PartitionRecord, MBR_SECTOR_LEN,
};

/// What the census learned about one OS volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub id: String,
    pub mount_path: Option<String>,
    pub record: Option<PartitionRecord>,
    pub filesystem: Filesystem,
    pub extents: Vec<DiskExtent>,
    /// Deduplicated, in extent order.
    pub devices: Vec<u32>,
}

impl VolumeRecord {
    fn spans(&self, device_index: u32) -> bool {
        self.devices.contains(&device_index)
    }

    /// Offset and total length of the extents on `device_index`.
    fn extent_on(&self, device_index: u32) -> (u64, u64) {
        self.extents
            .iter()
            .filter(|extent| extent.device_index == device_index)
            .fold(None, |acc: Option<(u64, u64)>, extent| match acc {
                None => Some((extent.starting_offset, extent.length)),
                Some((offset, length)) => Some((offset, length.saturating_add(extent.length))),
            })
            .unwrap_or((0, 0))
    }
}

pub struct TopologyAggregator<'p, P: DeviceAccessPort + ?Sized> {
    port: &'p P,
    config: DiscoveryConfig,
}

impl<'p, P: DeviceAccessPort + ?Sized> TopologyAggregator<'p, P> {
    pub fn new(port: &'p P, config: DiscoveryConfig) -> Self {
        Self { port, config }
    }

    /// Never fails. Unavailable slots are omitted, degraded queries leave
    /// their fields unset.
    pub fn discover(&self) -> Vec<Device> {
        let volumes = self.volume_census();
        let workers = self.config.effective_workers();
        debug!(
            max_devices = self.config.max_devices,
            workers,
            volumes = volumes.len(),
            "starting discovery pass"
        );

        let mut devices = if workers <= 1 {
            (0..self.config.max_devices)
                .filter_map(|index| self.probe_device(index, &volumes))
                .collect::<Vec<_>>()
        } else {
            self.probe_parallel(workers, &volumes)
        };
        devices.sort_by_key(|device| device.index);
        info!(devices = devices.len(), "discovery pass complete");
        devices
    }

    fn probe_parallel(&self, workers: usize, volumes: &[VolumeRecord]) -> Vec<Device> {
        let next = AtomicU32::new(0);
        let next = &next;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut found = Vec::new();
                        loop {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            if index >= self.config.max_devices {
                                break;
                            }
                            if let Some(device) = self.probe_device(index, volumes) {
                                found.push(device);
                            }
                        }
                        found
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(found) => found,
                    Err(_) => {
                        warn!("device probe worker panicked; its slots are omitted");
                        Vec::new()
                    }
                })
                .collect()
        })
    }

    /// Resolves every OS volume once: mount path, partition record, header
    /// classification and backing devices.
    pub fn volume_census(&self) -> Vec<VolumeRecord> {
        let ids = match self.port.enumerate_volumes() {
            Ok(ids) => ids,
            Err(err) => {
                debug!(error = %err, "volume enumeration unavailable");
                return Vec::new();
            }
        };
        let resolver = VolumeResolver::new(self.port).with_limits(
            self.config.resolver_attempts,
            self.config.resolver_initial_capacity,
        );
        ids.into_iter()
            .filter_map(|id| self.resolve_volume(&resolver, id))
            .collect()
    }

    fn resolve_volume(&self, resolver: &VolumeResolver<'_, P>, id: String) -> Option<VolumeRecord> {
        let mount_path = resolver.path_for_volume(&id);
        let open_path = self.port.volume_device_path(&id, mount_path.as_deref());
        let mut handle = match self.port.open(&open_path) {
            Ok(handle) => handle,
            Err(err) => {
                debug!(volume = %id, error = %err, "volume open failed; skipped");
                return None;
            }
        };

        let record = match handle.query_partition_info() {
            Ok(query) => Some(record_from_query(&query)),
            Err(err) => {
                debug!(volume = %id, error = %err, "partition query declined");
                None
            }
        };
        let sector_size = handle
            .query_geometry()
            .ok()
            .map(|geometry| geometry.sector_size)
            .filter(|size| *size > 0)
            .unwrap_or(self.config.default_sector_size);
        let filesystem = match handle.read_sectors(0, sector_size as usize) {
            Ok(header) => classify_filesystem(&header),
            Err(err) => {
                debug!(volume = %id, error = %err, "volume header read failed");
                Filesystem::Unknown
            }
        };
        let extents = handle.query_volume_extents().unwrap_or_default();
        let devices = resolver.owning_devices_for_volume(handle.as_mut());

        Some(VolumeRecord {
            id,
            mount_path,
            record,
            filesystem,
            extents,
            devices,
        })
    }

    /// `None` when the slot has no device or it cannot be opened.
    pub fn probe_device(&self, index: u32, volumes: &[VolumeRecord]) -> Option<Device> {
        let path = self.port.device_path(index)?;
        let mut handle = match self.port.open(&path) {
            Ok(handle) => handle,
            Err(err) if err.is_unavailable() => {
                debug!(device = index, path = %path, error = %err, "slot skipped");
                return None;
            }
            Err(err) => {
                warn!(device = index, path = %path, error = %err, "slot skipped");
                return None;
            }
        };

        let geometry = match handle.query_geometry() {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                debug!(device = index, error = %err, "geometry query declined");
                None
            }
        };
        let sector_size = geometry.map(|g| g.sector_size).unwrap_or(0);
        let io_sector = if sector_size == 0 {
            self.config.default_sector_size
        } else {
            sector_size
        };
        let is_solid_state = handle.query_solid_state().ok();
        let os_style = match handle.query_partition_info() {
            Ok(query) => Some(query.style),
            Err(err) => {
                debug!(device = index, error = %err, "partition style query declined");
                None
            }
        };

        let (table, mut issues) =
            read_partition_table(handle.as_mut(), os_style, io_sector, self.config.scan_embedded);
        let partition_style = match os_style {
            Some(PartitionStyle::Gpt) => PartitionScheme::Gpt,
            Some(PartitionStyle::Mbr) => PartitionScheme::Mbr,
            Some(PartitionStyle::Raw) => PartitionScheme::Raw,
            None => table
                .as_ref()
                .map(|table| table.scheme)
                .unwrap_or(PartitionScheme::Unknown),
        };

        let mut partitions: Vec<Partition> = volumes
            .iter()
            .filter(|volume| volume.spans(index))
            .map(|volume| {
                self.correlate(handle.as_mut(), index, sector_size, io_sector, partition_style, volume)
            })
            .collect();

        if partitions.is_empty() && self.config.synthesize_from_table {
            if let Some(table) = table.as_ref() {
                partitions = synthesize_partitions(handle.as_mut(), index, sector_size, io_sector, table);
            }
        }
        partitions.sort_by_key(|partition| (partition.number, partition.offset_bytes));

        let mut device = Device {
            index,
            path,
            sector_size,
            cylinders: geometry.and_then(|g| g.cylinders),
            total_sectors: geometry.and_then(|g| g.total_sectors),
            is_solid_state,
            partition_style,
            table,
            partitions,
            issues: Vec::new(),
        };
        if let Some(capacity_bytes) = device.capacity_bytes() {
            for partition in &device.partitions {
                if partition.end_bytes() > capacity_bytes {
                    warn!(
                        device = index,
                        partition = partition.number,
                        end = partition.end_bytes(),
                        capacity = capacity_bytes,
                        "partition extends past device capacity"
                    );
                    issues.push(DeviceIssue::PartitionOutOfBounds {
                        number: partition.number,
                        end_bytes: partition.end_bytes(),
                        capacity_bytes,
                    });
                }
            }
        }
        device.issues = issues;

        info!(
            device = index,
            path = %device.path,
            style = %device.partition_style,
            partitions = device.partitions.len(),
            "device probed"
        );
        Some(device)
    }

    fn correlate(
        &self,
        handle: &mut dyn DeviceHandle,
        index: u32,
        sector_size: u32,
        io_sector: u32,
        device_style: PartitionScheme,
        volume: &VolumeRecord,
    ) -> Partition {
        let (extent_offset, extent_length) = volume.extent_on(index);
        let (scheme, gpt_type, mbr_bootable, number, offset_bytes, size_bytes) = match volume.record {
            Some(record) => (
                record.scheme,
                record.gpt_type,
                record.mbr_bootable,
                record.number,
                record.offset_bytes,
                record.size_bytes,
            ),
            None => (device_style, None, None, 0, extent_offset, extent_length),
        };

        let embedded = if self.config.scan_embedded && volume.filesystem == Filesystem::Unknown {
            scan_partition(handle, offset_bytes / io_sector as u64, io_sector)
        } else {
            Vec::new()
        };

        debug!(device = index, volume = %volume.id, number, "volume correlated");
        Partition {
            volume_id: Some(volume.id.clone()),
            scheme,
            gpt_type,
            mbr_bootable,
            number,
            offset_bytes,
            size_bytes,
            sector_count: (sector_size > 0).then(|| size_bytes / sector_size as u64),
            filesystem: volume.filesystem,
            mount_path: volume.mount_path.clone(),
            owning_device_index: index,
            spanned_devices: volume.devices.clone(),
            embedded,
        }
    }
}

/// Convenience entry point for a single pass.
pub fn discover_topology<P: DeviceAccessPort + ?Sized>(port: &P, config: &DiscoveryConfig) -> Vec<Device> {
    TopologyAggregator::new(port, config.clone()).discover()
}

/// Reads the device's own table from its first sectors. Problems become
/// issues; the pass carries on either way.
pub fn read_partition_table(
    handle: &mut dyn DeviceHandle,
    os_style: Option<PartitionStyle>,
    sector_size: u32,
    scan_embedded: bool,
) -> (Option<PartitionTable>, Vec<DeviceIssue>) {
    let mut issues = Vec::new();
    if os_style == Some(PartitionStyle::Raw) {
        return (None, issues);
    }
    let read_len = (sector_size as usize).max(MBR_SECTOR_LEN);

    let mbr = match handle
        .read_sectors(0, read_len)
        .map_err(|err| err.to_string())
        .and_then(|sector| parse_mbr(&sector).map_err(|err| err.to_string()))
    {
        Ok(mbr) => mbr,
        Err(reason) => {
            debug!(error = %reason, "boot sector unreadable");
            issues.push(DeviceIssue::TableUnreadable(reason));
            return (None, issues);
        }
    };

    if os_style == Some(PartitionStyle::Gpt) || mbr.is_protective() {
        match read_gpt(handle, sector_size, read_len) {
            Ok(Some(entries)) => {
                let table = PartitionTable {
                    scheme: PartitionScheme::Gpt,
                    boot_signature_present: mbr.boot_signature_present,
                    gpt_header_present: true,
                    entries,
                };
                return (Some(table), issues);
            }
            Ok(None) => issues.push(DeviceIssue::MissingGptHeader),
            Err(reason) => issues.push(DeviceIssue::TableUnreadable(reason)),
        }
    }

    if !mbr.boot_signature_present && mbr.records.is_empty() {
        // blank media
        return (None, issues);
    }
    if !mbr.boot_signature_present {
        issues.push(DeviceIssue::MissingBootSignature);
    }

    let mut entries = mbr_table_entries(&mbr);
    if scan_embedded {
        for entry in entries
            .iter_mut()
            .filter(|entry| entry.kind == TableEntryKind::Mbr(MbrPartitionKind::LinuxNative))
        {
            entry.embedded = scan_partition(handle, entry.start_sector, sector_size);
        }
    }
    let table = PartitionTable {
        scheme: PartitionScheme::Mbr,
        boot_signature_present: mbr.boot_signature_present,
        gpt_header_present: false,
        entries,
    };
    (Some(table), issues)
}

fn read_gpt(
    handle: &mut dyn DeviceHandle,
    sector_size: u32,
    read_len: usize,
) -> Result<Option<Vec<TableEntry>>, String> {
    let header_at = sector_size as u64;
    let sector = handle
        .read_sectors(header_at, read_len)
        .map_err(|err| err.to_string())?;
    let Some(header) = parse_gpt_header(&sector).map_err(|err| err.to_string())? else {
        return Ok(None);
    };
    let entries_at = header.entries_lba.saturating_mul(sector_size as u64);
    let array = handle
        .read_sectors(entries_at, header.entries_len())
        .map_err(|err| err.to_string())?;
    let records = parse_gpt_entries(&array, header.entry_size);
    Ok(Some(gpt_table_entries(&records)))
}

/// Partitions read straight off the table for devices no OS volume maps to.
fn synthesize_partitions(
    handle: &mut dyn DeviceHandle,
    index: u32,
    sector_size: u32,
    io_sector: u32,
    table: &PartitionTable,
) -> Vec<Partition> {
    table
        .entries
        .iter()
        .filter(|entry| entry.kind != TableEntryKind::Mbr(MbrPartitionKind::Protective))
        .map(|entry| {
            let offset_bytes = entry.start_sector.saturating_mul(io_sector as u64);
            let size_bytes = entry.sector_count.saturating_mul(io_sector as u64);
            let filesystem = match handle.read_sectors(offset_bytes, io_sector as usize) {
                Ok(header) => classify_filesystem(&header),
                Err(err) => {
                    debug!(device = index, slot = entry.slot, error = %err, "partition header read failed");
                    Filesystem::Unknown
                }
            };
            let (gpt_type, mbr_bootable) = match entry.kind {
                TableEntryKind::Gpt(kind) => (Some(kind), None),
                TableEntryKind::Mbr(_) => (None, Some(entry.bootable)),
            };
            Partition {
                volume_id: None,
                scheme: table.scheme,
                gpt_type,
                mbr_bootable,
                number: entry.slot,
                offset_bytes,
                size_bytes,
                sector_count: (sector_size > 0).then_some(entry.sector_count),
                filesystem,
                mount_path: None,
                owning_device_index: index,
                spanned_devices: vec![index],
                embedded: entry.embedded.clone(),
            }
        })
        .collect()
}
