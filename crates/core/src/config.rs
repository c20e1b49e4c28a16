use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs for one discovery pass. Every field has a default so partial
/// config files are fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Device slots 0..max_devices are probed; anything past the bound is never seen.
    pub max_devices: u32,
    pub workers: usize,
    pub scan_embedded: bool,
    pub synthesize_from_table: bool,
    pub resolver_attempts: u32,
    /// Starting mount-path buffer, in characters.
    pub resolver_initial_capacity: usize,
    pub default_sector_size: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_devices: 16,
            workers: 4,
            scan_embedded: true,
            synthesize_from_table: true,
            resolver_attempts: 16,
            resolver_initial_capacity: 16,
            default_sector_size: 512,
        }
    }
}

impl DiscoveryConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        let config: DiscoveryConfig = if is_yaml {
            serde_yaml::from_str(&data).with_context(|| format!("parse {}", path.display()))?
        } else {
            serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolver_initial_capacity == 0 {
            return Err(anyhow!("resolver_initial_capacity must be > 0"));
        }
        if !self.default_sector_size.is_power_of_two() || self.default_sector_size < 512 {
            return Err(anyhow!(
                "default_sector_size must be a power of two >= 512, got {}",
                self.default_sector_size
            ));
        }
        Ok(())
    }

    /// Worker count actually used for a pass, never more than there are slots.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, (self.max_devices as usize).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_probe_sixteen_slots() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.max_devices, 16);
        assert_eq!(config.resolver_attempts, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "max_devices: 4\nscan_embedded: false").unwrap();
        let config = DiscoveryConfig::load(file.path()).unwrap();
        assert_eq!(config.max_devices, 4);
        assert!(!config.scan_embedded);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn loads_json_and_rejects_odd_sector_size() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"default_sector_size": 500}}"#).unwrap();
        assert!(DiscoveryConfig::load(file.path()).is_err());
    }

    #[test]
    fn workers_clamped_to_slot_count() {
        let config = DiscoveryConfig {
            max_devices: 2,
            workers: 8,
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.effective_workers(), 2);
        let sequential = DiscoveryConfig {
            workers: 0,
            ..DiscoveryConfig::default()
        };
        assert_eq!(sequential.effective_workers(), 1);
    }
}
