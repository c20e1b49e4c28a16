//! Disk-image files as devices `0..n`. No OS volumes exist here, so every
//! partition a pass reports comes from the images' own tables.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::error::{ProbeError, ProbeResult};
use crate::port::{DeviceAccessPort, DeviceHandle, Geometry, PartitionQuery};

#[derive(Debug, Clone)]
pub struct ImageFilePort {
    images: Vec<PathBuf>,
    sector_size: u32,
}

impl ImageFilePort {
    pub fn new(images: Vec<PathBuf>, sector_size: u32) -> Self {
        Self {
            images,
            sector_size,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl DeviceAccessPort for ImageFilePort {
    fn device_path(&self, index: u32) -> Option<String> {
        self.images
            .get(index as usize)
            .map(|path| path.display().to_string())
    }

    fn open(&self, path: &str) -> ProbeResult<Box<dyn DeviceHandle + '_>> {
        let image = self
            .images
            .iter()
            .find(|image| image.display().to_string() == path)
            .ok_or_else(|| ProbeError::not_found(path))?;
        let file = File::open(image).map_err(|err| ProbeError::from_open(path, &err))?;
        let len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| ProbeError::from_open(path, &err))?;
        Ok(Box::new(ImageHandle {
            file,
            len,
            sector_size: self.sector_size,
        }))
    }

    fn enumerate_volumes(&self) -> ProbeResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn volume_path_names(&self, volume: &str, _capacity: usize) -> ProbeResult<Vec<String>> {
        Err(ProbeError::not_found(volume))
    }
}

struct ImageHandle {
    file: File,
    len: u64,
    sector_size: u32,
}

impl DeviceHandle for ImageHandle {
    fn read_sectors(&mut self, start_byte: u64, count_bytes: usize) -> ProbeResult<Vec<u8>> {
        let io_err = |source| ProbeError::Io {
            offset: start_byte,
            len: count_bytes,
            source,
        };
        let past_end = start_byte
            .checked_add(count_bytes as u64)
            .map_or(true, |end| end > self.len);
        if past_end {
            return Err(io_err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
        }
        self.file.seek(SeekFrom::Start(start_byte)).map_err(io_err)?;
        let mut buf = vec![0u8; count_bytes];
        self.file.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }

    fn query_geometry(&mut self) -> ProbeResult<Geometry> {
        if self.sector_size == 0 {
            return Err(ProbeError::QueryUnsupported("geometry"));
        }
        Ok(Geometry {
            sector_size: self.sector_size,
            cylinders: None,
            total_sectors: Some(self.len / self.sector_size as u64),
        })
    }

    fn query_partition_info(&mut self) -> ProbeResult<PartitionQuery> {
        Err(ProbeError::QueryUnsupported("partition info"))
    }
}
