//! Storage topology discovery: which physical devices exist, how each is
//! partitioned, what filesystem every partition carries and where it is
//! mounted. Host crates supply a [`DeviceAccessPort`]; everything here is
//! host independent.

pub mod embedded;
pub mod error;
pub mod image;
pub mod mem;
pub mod port;
pub mod resolver;
pub mod signature;
pub mod table;
pub mod topology;

#[cfg(test)]
mod testutil;

pub use error::{ProbeError, ProbeResult, Unavailable};
pub use image::ImageFilePort;
pub use port::{DeviceAccessPort, DeviceHandle, DiskExtent, Geometry, PartitionQuery, PartitionStyle};
pub use resolver::VolumeResolver;
pub use signature::classify_filesystem;
pub use topology::{discover_topology, TopologyAggregator};
