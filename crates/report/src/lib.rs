use anyhow::{Context, Result};
use diskscope_core::{now_utc_rfc3339, Topology, TOPOLOGY_SCHEMA_VERSION};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub topology_json: PathBuf,
    pub run_json: PathBuf,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct TopologySummary {
    pub devices: usize,
    pub partitions: usize,
    pub mounted_partitions: usize,
    pub embedded_hits: usize,
    pub issues: usize,
}

impl TopologySummary {
    pub fn of(topology: &Topology) -> Self {
        let partitions = topology.devices.iter().flat_map(|device| &device.partitions);
        let embedded_in_tables: usize = topology
            .devices
            .iter()
            .filter_map(|device| device.table.as_ref())
            .flat_map(|table| &table.entries)
            .map(|entry| entry.embedded.len())
            .sum();
        // synthesized partitions copy their entry's hits
        let embedded_on_volumes: usize = partitions
            .clone()
            .filter(|partition| partition.volume_id.is_some())
            .map(|partition| partition.embedded.len())
            .sum();
        Self {
            devices: topology.devices.len(),
            partitions: partitions.clone().count(),
            mounted_partitions: partitions
                .filter(|partition| partition.mount_path.is_some())
                .count(),
            embedded_hits: embedded_in_tables + embedded_on_volumes,
            issues: topology.devices.iter().map(|device| device.issues.len()).sum(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    run_id: String,
    created_at_utc: String,
    snapshot_id: String,
    topology_schema_version: String,
    summary: TopologySummary,
    meta: Option<Value>,
}

/// Writes `reports/<run_id>/topology.json` and `run.json` under `base`.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    topology: &Topology,
    meta: Option<Value>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let base = base.as_ref();
    let root = base.join("reports").join(&run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let topology_json = root.join("topology.json");
    let run_json = root.join("run.json");

    let data = serde_json::to_string_pretty(topology)?;
    std::fs::write(&topology_json, data)
        .with_context(|| format!("write {}", topology_json.display()))?;

    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        snapshot_id: topology.snapshot_id.to_string(),
        topology_schema_version: TOPOLOGY_SCHEMA_VERSION.to_string(),
        summary: TopologySummary::of(topology),
        meta,
    };
    let run_json_data = serde_json::to_string_pretty(&run_meta)?;
    std::fs::write(&run_json, run_json_data)
        .with_context(|| format!("write {}", run_json.display()))?;

    Ok(ReportPaths {
        run_id,
        root,
        topology_json,
        run_json,
    })
}
