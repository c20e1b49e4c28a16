use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::windows::fs::FileExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};

use diskscope_probe::{
    DeviceAccessPort, DeviceHandle, DiskExtent, Geometry, PartitionQuery, PartitionStyle,
    ProbeError, ProbeResult,
};
use tracing::debug;
use uuid::Uuid;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, ERROR_MORE_DATA, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FindFirstVolumeW, FindNextVolumeW, FindVolumeClose,
    GetVolumePathNamesForVolumeNameW, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{
    PropertyStandardQuery, StorageDeviceSeekPenaltyProperty, DEVICE_SEEK_PENALTY_DESCRIPTOR,
    DISK_GEOMETRY_EX, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, IOCTL_DISK_GET_PARTITION_INFO_EX,
    IOCTL_STORAGE_QUERY_PROPERTY, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, PARTITION_INFORMATION_EX,
    PARTITION_STYLE_GPT, PARTITION_STYLE_MBR, STORAGE_PROPERTY_QUERY,
};
use windows::Win32::System::IO::DeviceIoControl;
use windows::Win32::System::SystemInformation::{GetComputerNameW, GetVersionExW, OSVERSIONINFOW};

use crate::layout::{
    declared_extent_count, extents_buffer_len, parse_disk_extents, parse_multi_sz,
    volume_open_path, wide_to_string,
};

const MAX_PATH: usize = 260;
const MAX_EXTENT_ROUNDS: usize = 8;

fn wide(s: &str) -> Vec<u16> {
    use std::os::windows::prelude::*;
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn os_error(err: &windows::core::Error) -> io::Error {
    // HRESULT_FROM_WIN32 keeps the Win32 code in the low word
    io::Error::from_raw_os_error(err.code().0 & 0xFFFF)
}

/// `\\.\PhysicalDriveN` slots plus the volume-GUID namespace.
#[derive(Debug, Default)]
pub struct WindowsPort;

impl WindowsPort {
    pub fn new() -> Self {
        Self
    }
}

fn open_read(path: &str) -> ProbeResult<File> {
    let w = wide(path);
    let handle = unsafe {
        CreateFileW(
            PCWSTR(w.as_ptr()),
            FILE_GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            None,
        )
    }
    .map_err(|err| ProbeError::from_open(path, &os_error(&err)))?;
    // The File owns the handle from here on and closes it on drop.
    Ok(unsafe { File::from_raw_handle(handle.0 as RawHandle) })
}

impl DeviceAccessPort for WindowsPort {
    fn device_path(&self, index: u32) -> Option<String> {
        Some(format!(r"\\.\PhysicalDrive{}", index))
    }

    fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>> {
        Ok(Box::new(WindowsHandle {
            file: open_read(path)?,
        }))
    }

    fn enumerate_volumes(&self) -> ProbeResult<Vec<String>> {
        let mut name = [0u16; MAX_PATH];
        let find = unsafe { FindFirstVolumeW(&mut name) }
            .map_err(|_| ProbeError::QueryUnsupported("volume enumeration"))?;
        let mut volumes = vec![wide_to_string(&name)];
        loop {
            name.fill(0);
            if unsafe { FindNextVolumeW(find, &mut name) }.is_err() {
                break;
            }
            volumes.push(wide_to_string(&name));
        }
        if let Err(err) = unsafe { FindVolumeClose(find) } {
            debug!(error = %err, "FindVolumeClose failed");
        }
        Ok(volumes)
    }

    fn volume_path_names(&self, volume: &str, capacity: usize) -> ProbeResult<Vec<String>> {
        let w = wide(volume);
        let mut buf = vec![0u16; capacity.max(1)];
        let mut returned = 0u32;
        match unsafe {
            GetVolumePathNamesForVolumeNameW(PCWSTR(w.as_ptr()), Some(&mut buf), &mut returned)
        } {
            Ok(()) => Ok(parse_multi_sz(&buf)),
            Err(err) if err.code() == ERROR_MORE_DATA.to_hresult() => {
                Err(ProbeError::BufferTooSmall {
                    required: (returned > 0).then_some(returned as usize),
                })
            }
            Err(err) => {
                debug!(volume, error = %err, "GetVolumePathNamesForVolumeNameW failed");
                Err(ProbeError::QueryUnsupported("volume path names"))
            }
        }
    }

    fn volume_device_path(&self, volume: &str, mount_path: Option<&str>) -> String {
        volume_open_path(volume, mount_path)
    }
}

struct WindowsHandle {
    file: File,
}

impl WindowsHandle {
    fn raw(&self) -> HANDLE {
        HANDLE(self.file.as_raw_handle() as isize)
    }

    /// Fixed-size output ioctl; `T` must be a plain C struct.
    fn ioctl_out<T: Default>(&self, code: u32, what: &'static str) -> ProbeResult<T> {
        let mut out = T::default();
        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.raw(),
                code,
                None,
                0,
                Some(&mut out as *mut T as *mut c_void),
                size_of::<T>() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|err| {
            debug!(query = what, error = %err, "DeviceIoControl declined");
            ProbeError::QueryUnsupported(what)
        })?;
        Ok(out)
    }
}

impl DeviceHandle for WindowsHandle {
    fn read_sectors(&mut self, start_byte: u64, count_bytes: usize) -> ProbeResult<Vec<u8>> {
        let mut buf = vec![0u8; count_bytes];
        let mut filled = 0usize;
        while filled < count_bytes {
            match self.file.seek_read(&mut buf[filled..], start_byte + filled as u64) {
                Ok(0) => {
                    return Err(ProbeError::Io {
                        offset: start_byte,
                        len: count_bytes,
                        source: io::Error::from(io::ErrorKind::UnexpectedEof),
                    })
                }
                Ok(n) => filled += n,
                Err(source) => {
                    return Err(ProbeError::Io {
                        offset: start_byte,
                        len: count_bytes,
                        source,
                    })
                }
            }
        }
        Ok(buf)
    }

    fn query_geometry(&mut self) -> ProbeResult<Geometry> {
        let geometry: DISK_GEOMETRY_EX =
            self.ioctl_out(IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, "geometry")?;
        let sector_size = geometry.Geometry.BytesPerSector;
        let disk_size = geometry.DiskSize.max(0) as u64;
        Ok(Geometry {
            sector_size,
            cylinders: Some(geometry.Geometry.Cylinders.max(0) as u64),
            total_sectors: (sector_size > 0).then(|| disk_size / sector_size as u64),
        })
    }

    fn query_partition_info(&mut self) -> ProbeResult<PartitionQuery> {
        let info: PARTITION_INFORMATION_EX =
            self.ioctl_out(IOCTL_DISK_GET_PARTITION_INFO_EX, "partition info")?;
        let mut query = PartitionQuery {
            style: PartitionStyle::Raw,
            number: info.PartitionNumber,
            starting_offset: info.StartingOffset.max(0) as u64,
            length: info.PartitionLength.max(0) as u64,
            gpt_type: None,
            mbr_boot_indicator: false,
        };
        if info.PartitionStyle == PARTITION_STYLE_GPT {
            query.style = PartitionStyle::Gpt;
            let guid = unsafe { info.Anonymous.Gpt.PartitionType };
            query.gpt_type = Some(Uuid::from_u128(guid.to_u128()));
        } else if info.PartitionStyle == PARTITION_STYLE_MBR {
            query.style = PartitionStyle::Mbr;
            query.mbr_boot_indicator = unsafe { info.Anonymous.Mbr.BootIndicator }.as_bool();
        }
        Ok(query)
    }

    /// Every extent, growing the buffer when the volume spans more disks
    /// than the first guess.
    fn query_volume_extents(&mut self) -> ProbeResult<Vec<DiskExtent>> {
        let mut want = 4usize;
        for _ in 0..MAX_EXTENT_ROUNDS {
            let mut out = vec![0u8; extents_buffer_len(want)];
            let mut returned = 0u32;
            let result = unsafe {
                DeviceIoControl(
                    self.raw(),
                    IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS,
                    None,
                    0,
                    Some(out.as_mut_ptr() as *mut c_void),
                    out.len() as u32,
                    Some(&mut returned),
                    None,
                )
            };
            match result {
                Ok(()) => return Ok(parse_disk_extents(&out)),
                Err(err)
                    if err.code() == ERROR_MORE_DATA.to_hresult()
                        || err.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() =>
                {
                    want = declared_extent_count(&out)
                        .filter(|count| *count > want)
                        .unwrap_or(want * 2);
                }
                Err(err) => {
                    debug!(error = %err, "volume extent query declined");
                    return Err(ProbeError::QueryUnsupported("volume extents"));
                }
            }
        }
        Err(ProbeError::QueryUnsupported("volume extents"))
    }

    fn query_solid_state(&mut self) -> ProbeResult<bool> {
        let query = STORAGE_PROPERTY_QUERY {
            PropertyId: StorageDeviceSeekPenaltyProperty,
            QueryType: PropertyStandardQuery,
            AdditionalParameters: [0],
        };
        let mut out = DEVICE_SEEK_PENALTY_DESCRIPTOR::default();
        let mut returned = 0u32;
        unsafe {
            DeviceIoControl(
                self.raw(),
                IOCTL_STORAGE_QUERY_PROPERTY,
                Some(&query as *const _ as *const c_void),
                size_of::<STORAGE_PROPERTY_QUERY>() as u32,
                Some(&mut out as *mut _ as *mut c_void),
                size_of::<DEVICE_SEEK_PENALTY_DESCRIPTOR>() as u32,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|_| ProbeError::QueryUnsupported("solid state hint"))?;
        Ok(!out.IncursSeekPenalty.as_bool())
    }
}

pub fn os_version_string() -> String {
    unsafe {
        let mut info = OSVERSIONINFOW {
            dwOSVersionInfoSize: size_of::<OSVERSIONINFOW>() as u32,
            ..Default::default()
        };
        if GetVersionExW(&mut info).is_ok() {
            return format!(
                "{}.{}.{}",
                info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber
            );
        }
    }
    "unknown".to_string()
}

pub fn machine_name_string() -> String {
    unsafe {
        let mut buf = [0u16; 256];
        let mut size = buf.len() as u32;
        if GetComputerNameW(PWSTR(buf.as_mut_ptr()), &mut size).is_ok() {
            return String::from_utf16_lossy(&buf[..size as usize]);
        }
    }
    "unknown".to_string()
}
