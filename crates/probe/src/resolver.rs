//! Volume → mount path and volume → parent device lookups.

use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::port::{DeviceAccessPort, DeviceHandle};

pub const DEFAULT_RESOLVER_ATTEMPTS: u32 = 16;
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

pub struct VolumeResolver<'p, P: DeviceAccessPort + ?Sized> {
    port: &'p P,
    max_attempts: u32,
    initial_capacity: usize,
}

impl<'p, P: DeviceAccessPort + ?Sized> VolumeResolver<'p, P> {
    pub fn new(port: &'p P) -> Self {
        Self {
            port,
            max_attempts: DEFAULT_RESOLVER_ATTEMPTS,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }

    pub fn with_limits(mut self, max_attempts: u32, initial_capacity: usize) -> Self {
        self.max_attempts = max_attempts;
        self.initial_capacity = initial_capacity.max(1);
        self
    }

    /// First mount path of `volume`. The buffer doubles on every
    /// `BufferTooSmall`; after `max_attempts` rounds the volume is treated
    /// as having no path. Never an error.
    pub fn path_for_volume(&self, volume: &str) -> Option<String> {
        let mut capacity = self.initial_capacity;
        for attempt in 1..=self.max_attempts {
            match self.port.volume_path_names(volume, capacity) {
                Ok(names) => return names.into_iter().find(|name| !name.is_empty()),
                Err(ProbeError::BufferTooSmall { required }) => {
                    debug!(volume, attempt, capacity, ?required, "path buffer too small");
                    capacity = capacity.saturating_mul(2);
                }
                Err(err) => {
                    debug!(volume, error = %err, "mount path lookup failed");
                    return None;
                }
            }
        }
        warn!(
            volume,
            attempts = self.max_attempts,
            "mount path lookup gave up after repeated buffer growth"
        );
        None
    }

    /// Every device backing the volume, in extent order, without repeats.
    pub fn owning_devices_for_volume(&self, handle: &mut dyn DeviceHandle) -> Vec<u32> {
        match handle.query_volume_extents() {
            Ok(extents) => {
                let mut devices: Vec<u32> = Vec::with_capacity(extents.len());
                for extent in extents {
                    if !devices.contains(&extent.device_index) {
                        devices.push(extent.device_index);
                    }
                }
                devices
            }
            Err(err) => {
                debug!(error = %err, "volume extent query failed");
                Vec::new()
            }
        }
    }

    /// Single-owner view: the device of the last reported extent.
    pub fn owning_device_for_volume(&self, handle: &mut dyn DeviceHandle) -> Option<u32> {
        handle
            .query_volume_extents()
            .ok()
            .and_then(|extents| extents.last().map(|extent| extent.device_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProbeResult;
    use crate::mem::{MemoryDevice, MemoryPort, MemoryVolume};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers `BufferTooSmall` forever and counts the calls.
    struct AlwaysTooSmall {
        calls: AtomicUsize,
        last_capacity: AtomicUsize,
    }

    impl DeviceAccessPort for AlwaysTooSmall {
        fn device_path(&self, _index: u32) -> Option<String> {
            None
        }

        fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>> {
            Err(ProbeError::not_found(path))
        }

        fn enumerate_volumes(&self) -> ProbeResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn volume_path_names(&self, _volume: &str, capacity: usize) -> ProbeResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_capacity.store(capacity, Ordering::SeqCst);
            Err(ProbeError::BufferTooSmall { required: None })
        }
    }

    #[test]
    fn gives_up_after_bounded_doublings() {
        let port = AlwaysTooSmall {
            calls: AtomicUsize::new(0),
            last_capacity: AtomicUsize::new(0),
        };
        let resolver = VolumeResolver::new(&port);
        assert_eq!(resolver.path_for_volume("\\\\?\\Volume{x}\\"), None);
        assert_eq!(port.calls.load(Ordering::SeqCst), 16);
        assert_eq!(port.last_capacity.load(Ordering::SeqCst), 16 << 15);
    }

    #[test]
    fn converges_once_buffer_is_large_enough() {
        let long_path = format!("C:\\{}\\", "m".repeat(100));
        let port = MemoryPort::new().with_volume(MemoryVolume::new("v").mounted_at(long_path.clone()));
        let resolver = VolumeResolver::new(&port);
        assert_eq!(resolver.path_for_volume("v"), Some(long_path));
    }

    #[test]
    fn volume_without_path_is_none() {
        let port = MemoryPort::new().with_volume(MemoryVolume::new("efi"));
        assert_eq!(VolumeResolver::new(&port).path_for_volume("efi"), None);
    }

    #[test]
    fn spanning_volume_reports_every_device_and_last_as_owner() {
        let port = MemoryPort::new()
            .with_device(0, MemoryDevice::new(vec![0u8; 4096], 512))
            .with_device(3, MemoryDevice::new(vec![0u8; 4096], 512))
            .with_volume(
                MemoryVolume::new("raid")
                    .on_device(0, 0, 2048)
                    .on_device(3, 0, 2048)
                    .on_device(0, 2048, 1024),
            );
        let resolver = VolumeResolver::new(&port);
        let mut handle = port.open("raid").unwrap();
        assert_eq!(resolver.owning_devices_for_volume(handle.as_mut()), vec![0, 3]);
        assert_eq!(resolver.owning_device_for_volume(handle.as_mut()), Some(0));
    }

    #[test]
    fn device_handle_has_no_owner() {
        let port = MemoryPort::new().with_device(1, MemoryDevice::new(vec![0u8; 512], 512));
        let resolver = VolumeResolver::new(&port);
        let mut handle = port.open("mem1").unwrap();
        assert!(resolver.owning_devices_for_volume(handle.as_mut()).is_empty());
        assert_eq!(resolver.owning_device_for_volume(handle.as_mut()), None);
    }
}
