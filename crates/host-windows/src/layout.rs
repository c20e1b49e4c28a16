//! Byte layouts of the Windows query results the port decodes by hand.
//! Host independent so the decoding is tested everywhere.

use diskscope_probe::DiskExtent;

/// `VOLUME_DISK_EXTENTS`: a u32 count padded to 8, then 24-byte
/// `DISK_EXTENT { DiskNumber: u32, pad, StartingOffset: i64, ExtentLength: i64 }`.
pub const EXTENTS_HEADER_LEN: usize = 8;
pub const DISK_EXTENT_LEN: usize = 24;

pub fn extents_buffer_len(count: usize) -> usize {
    EXTENTS_HEADER_LEN + count.max(1) * DISK_EXTENT_LEN
}

/// Every extent present in the buffer, in report order.
pub fn parse_disk_extents(bytes: &[u8]) -> Vec<DiskExtent> {
    let Some(count) = bytes.get(0..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])) else {
        return Vec::new();
    };
    bytes
        .get(EXTENTS_HEADER_LEN..)
        .unwrap_or(&[])
        .chunks_exact(DISK_EXTENT_LEN)
        .take(count as usize)
        .map(|chunk| {
            let disk = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let start = i64::from_le_bytes(le8(&chunk[8..16]));
            let length = i64::from_le_bytes(le8(&chunk[16..24]));
            DiskExtent {
                device_index: disk,
                starting_offset: start.max(0) as u64,
                length: length.max(0) as u64,
            }
        })
        .collect()
}

/// Extent count declared in the header, used to size a retry.
pub fn declared_extent_count(bytes: &[u8]) -> Option<usize> {
    bytes
        .get(0..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

/// `a\0b\0\0` to `["a", "b"]`.
pub fn parse_multi_sz(buf: &[u16]) -> Vec<String> {
    buf.split(|&unit| unit == 0)
        .take_while(|name| !name.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

pub fn wide_to_string(buf: &[u16]) -> String {
    let end = buf.iter().position(|&unit| unit == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

/// A volume mounted at a drive root opens as `\\.\X:`; anything else
/// opens through its GUID path without the trailing separator.
pub fn volume_open_path(volume: &str, mount_path: Option<&str>) -> String {
    if let Some(letter) = mount_path.and_then(drive_letter) {
        return format!(r"\\.\{}:", letter);
    }
    volume.trim_end_matches('\\').to_string()
}

fn drive_letter(mount: &str) -> Option<char> {
    let mut chars = mount.chars();
    let letter = chars.next()?;
    let rest: String = chars.collect();
    (letter.is_ascii_alphabetic() && (rest == ":\\" || rest == ":")).then(|| letter.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extents(raw: &[(u32, i64, i64)]) -> Vec<u8> {
        let mut buf = vec![0u8; extents_buffer_len(raw.len())];
        buf[0..4].copy_from_slice(&(raw.len() as u32).to_le_bytes());
        for (idx, (disk, start, len)) in raw.iter().enumerate() {
            let base = EXTENTS_HEADER_LEN + idx * DISK_EXTENT_LEN;
            buf[base..base + 4].copy_from_slice(&disk.to_le_bytes());
            buf[base + 8..base + 16].copy_from_slice(&start.to_le_bytes());
            buf[base + 16..base + 24].copy_from_slice(&len.to_le_bytes());
        }
        buf
    }

    #[test]
    fn every_extent_is_kept_in_order() {
        let parsed = parse_disk_extents(&extents(&[(2, 1 << 20, 4096), (0, 0, 8192)]));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].device_index, 2);
        assert_eq!(parsed[0].starting_offset, 1 << 20);
        assert_eq!(parsed[1].device_index, 0);
        assert_eq!(parsed[1].length, 8192);
    }

    #[test]
    fn truncated_extent_buffer_yields_what_fits() {
        let mut buf = extents(&[(1, 0, 512)]);
        buf[0..4].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(declared_extent_count(&buf), Some(3));
        assert_eq!(parse_disk_extents(&buf).len(), 1);
        assert!(parse_disk_extents(&[]).is_empty());
    }

    #[test]
    fn multi_sz_splits_and_stops_at_double_nul() {
        let buf: Vec<u16> = "C:\\\0D:\\mnt\\\0\0garbage".encode_utf16().collect();
        assert_eq!(parse_multi_sz(&buf), vec!["C:\\".to_string(), "D:\\mnt\\".to_string()]);
        assert!(parse_multi_sz(&[0, 0]).is_empty());
    }

    #[test]
    fn drive_roots_open_as_dos_devices() {
        let guid = "\\\\?\\Volume{0a1b2c3d-0000-0000-0000-100000000000}\\";
        assert_eq!(volume_open_path(guid, Some("c:\\")), "\\\\.\\C:");
        assert_eq!(
            volume_open_path(guid, Some("C:\\mnt\\data\\")),
            "\\\\?\\Volume{0a1b2c3d-0000-0000-0000-100000000000}"
        );
        assert_eq!(
            volume_open_path(guid, None),
            "\\\\?\\Volume{0a1b2c3d-0000-0000-0000-100000000000}"
        );
    }
}
