//! Boot-sector identifier matching. Pure: the caller reads the header.

use diskscope_core::Filesystem;

/// The OEM-name / identifier field of a boot sector.
const OEM_FIELD: std::ops::Range<usize> = 3..11;

const SIGNATURES: &[(&[u8; 8], Filesystem)] = &[
    (b"NTFS    ", Filesystem::Ntfs),
    (b"MSDOS5.0", Filesystem::Fat),
    (b"MSWIN4.0", Filesystem::Fat),
    (b"MSWIN4.1", Filesystem::Fat),
    (b"EXFAT   ", Filesystem::ExFat),
    (b"android ", Filesystem::AndroidSparse),
];

/// Classifies a partition header by the 8 bytes at offsets 3..11. Never
/// fails: short buffers and unrecognized identifiers are `Unknown`.
pub fn classify_filesystem(header: &[u8]) -> Filesystem {
    let Some(field) = header.get(OEM_FIELD) else {
        return Filesystem::Unknown;
    };
    SIGNATURES
        .iter()
        .find(|(magic, _)| field == magic.as_slice())
        .map(|(_, fs)| *fs)
        .unwrap_or(Filesystem::Unknown)
}
