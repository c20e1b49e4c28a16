use anyhow::Result;
use diskscope_core::{DiscoveryConfig, HostInfo, Topology};

pub mod layout;
#[cfg(windows)]
mod win;

#[cfg(windows)]
pub use win::WindowsPort;

#[cfg(windows)]
pub fn build_topology(config: &DiscoveryConfig) -> Result<Topology> {
    let port = WindowsPort::new();
    let devices = diskscope_probe::discover_topology(&port, config);
    Ok(Topology::new(host_info(), devices))
}

#[cfg(not(windows))]
pub fn build_topology(_config: &DiscoveryConfig) -> Result<Topology> {
    Err(anyhow::anyhow!("physical-drive discovery requires Windows"))
}

pub fn host_info() -> HostInfo {
    #[cfg(windows)]
    let (os_version, machine) = (win::os_version_string(), win::machine_name_string());
    #[cfg(not(windows))]
    let (os_version, machine) = ("unknown".to_string(), "unknown".to_string());
    HostInfo {
        os: "windows".to_string(),
        os_version,
        machine,
    }
}
