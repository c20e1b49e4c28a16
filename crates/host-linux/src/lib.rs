use anyhow::Result;
use diskscope_core::{DiscoveryConfig, HostInfo, Topology};
use std::fs;

#[cfg(unix)]
mod port;
pub mod sysfs;

#[cfg(unix)]
pub use port::LinuxPort;
pub use sysfs::SysPaths;

#[cfg(unix)]
pub fn build_topology(config: &DiscoveryConfig) -> Result<Topology> {
    let port = LinuxPort::scan()?;
    let devices = diskscope_probe::discover_topology(&port, config);
    Ok(Topology::new(host_info(), devices))
}

#[cfg(not(unix))]
pub fn build_topology(_config: &DiscoveryConfig) -> Result<Topology> {
    Err(anyhow::anyhow!("block-device discovery needs a unix host"))
}

pub fn host_info() -> HostInfo {
    HostInfo {
        os: "linux".to_string(),
        os_version: read_os_release(),
        machine: read_machine(),
    }
}

fn read_os_release() -> String {
    let data = fs::read_to_string("/etc/os-release").unwrap_or_default();
    parse_os_release(&data)
}

fn parse_os_release(data: &str) -> String {
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn trim_os_value(line: &str) -> String {
    let value = line.split_once('=').map(|(_, v)| v).unwrap_or("").trim();
    value.trim_matches('"').to_string()
}

fn read_machine() -> String {
    let vendor = sysfs::read_string("/sys/devices/virtual/dmi/id/sys_vendor");
    let product = sysfs::read_string("/sys/devices/virtual/dmi/id/product_name");
    match (vendor, product) {
        (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
        (Some(vendor), None) => vendor,
        (None, Some(product)) => product,
        _ => sysfs::read_string("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_name_and_version() {
        let data = "NAME=\"Debian GNU/Linux\"\nVERSION_ID=\"12\"\nVERSION=\"12 (bookworm)\"\n";
        assert_eq!(parse_os_release(data), "Debian GNU/Linux 12 (bookworm)");
        assert_eq!(parse_os_release("NAME=Arch\n"), "Arch");
        assert_eq!(parse_os_release(""), "unknown");
    }
}
