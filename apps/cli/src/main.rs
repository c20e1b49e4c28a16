use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use diskscope_core::{DiscoveryConfig, HostInfo, Topology};
use diskscope_probe::{discover_topology, ImageFilePort};
use diskscope_report::create_report_bundle;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod render;

#[derive(Parser, Debug)]
#[command(name = "diskscope", author, version, about = "Storage topology discovery", long_about = None)]
struct Cli {
    /// trace, debug, info, warn or error; RUST_LOG takes precedence per target
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the host's topology snapshot as JSON
    Topology {
        #[command(flatten)]
        discovery: DiscoveryArgs,
        #[arg(long)]
        pretty: bool,
    },
    /// Treat disk-image files as devices 0..n and print their topology
    Image {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        discovery: DiscoveryArgs,
        #[arg(long)]
        pretty: bool,
    },
    /// Write a topology report bundle under BASE/reports/<run_id>
    Report {
        #[arg(long, default_value = ".")]
        base: PathBuf,
        #[command(flatten)]
        discovery: DiscoveryArgs,
    },
    /// Human-readable device and partition listing
    List {
        #[command(flatten)]
        discovery: DiscoveryArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct DiscoveryArgs {
    /// JSON or YAML discovery config
    #[arg(long)]
    config: Option<PathBuf>,
    /// Probe device slots 0..N
    #[arg(long)]
    max_devices: Option<u32>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    sector_size: Option<u32>,
    /// Skip the ext/btrfs superblock probes
    #[arg(long)]
    no_embedded: bool,
    /// Do not turn raw table entries into partitions
    #[arg(long)]
    no_synthesize: bool,
}

impl DiscoveryArgs {
    fn resolve(&self) -> Result<DiscoveryConfig> {
        let mut config = match &self.config {
            Some(path) => DiscoveryConfig::load(path)?,
            None => DiscoveryConfig::default(),
        };
        if let Some(max_devices) = self.max_devices {
            config.max_devices = max_devices;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(sector_size) = self.sector_size {
            config.default_sector_size = sector_size;
        }
        if self.no_embedded {
            config.scan_embedded = false;
        }
        if self.no_synthesize {
            config.synthesize_from_table = false;
        }
        config.validate()?;
        debug!(?config, "discovery config");
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Topology { discovery, pretty } => {
            let topology = build_topology(&discovery.resolve()?)?;
            print_json(&topology, pretty)
        }
        Command::Image {
            files,
            discovery,
            pretty,
        } => {
            let topology = image_topology(files, &discovery.resolve()?);
            print_json(&topology, pretty)
        }
        Command::Report { base, discovery } => {
            let topology = build_topology(&discovery.resolve()?)?;
            let meta = serde_json::json!({ "command": "report" });
            let report = create_report_bundle(base, &topology, Some(meta))?;
            println!("report_root: {}", report.root.display());
            println!("topology: {}", report.topology_json.display());
            println!("run_json: {}", report.run_json.display());
            Ok(())
        }
        Command::List { discovery } => {
            let topology = build_topology(&discovery.resolve()?)?;
            print!("{}", render::render_topology(&topology));
            Ok(())
        }
    }
}

fn print_json(topology: &Topology, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(topology)?);
    } else {
        println!("{}", serde_json::to_string(topology)?);
    }
    Ok(())
}

fn image_topology(files: Vec<PathBuf>, config: &DiscoveryConfig) -> Topology {
    let config = DiscoveryConfig {
        max_devices: config.max_devices.max(files.len() as u32),
        ..config.clone()
    };
    let port = ImageFilePort::new(files, config.default_sector_size);
    let devices = discover_topology(&port, &config);
    let host = HostInfo {
        os: "image".to_string(),
        os_version: env!("CARGO_PKG_VERSION").to_string(),
        machine: format!("{} image file(s)", port.len()),
    };
    Topology::new(host, devices)
}

fn build_topology(config: &DiscoveryConfig) -> Result<Topology> {
    #[cfg(windows)]
    {
        diskscope_host_windows::build_topology(config)
    }
    #[cfg(target_os = "linux")]
    {
        diskscope_host_linux::build_topology(config)
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        let _ = config;
        Err(anyhow::anyhow!("unsupported OS for topology discovery; use `diskscope image`"))
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "diskscope",
            "topology",
            "--max-devices",
            "32",
            "--workers",
            "1",
            "--no-embedded",
        ]);
        let Command::Topology { discovery, pretty } = cli.command else {
            panic!("expected topology");
        };
        assert!(!pretty);
        let config = discovery.resolve().unwrap();
        assert_eq!(config.max_devices, 32);
        assert_eq!(config.workers, 1);
        assert!(!config.scan_embedded);
        assert!(config.synthesize_from_table);
    }

    #[test]
    fn image_requires_a_file() {
        assert!(Cli::try_parse_from(["diskscope", "image"]).is_err());
        let cli = Cli::try_parse_from(["diskscope", "--log-json", "image", "a.img", "b.img"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Image { ref files, .. } if files.len() == 2));
    }

    #[test]
    fn bad_sector_size_is_rejected() {
        let args = DiscoveryArgs {
            sector_size: Some(300),
            ..DiscoveryArgs::default()
        };
        assert!(args.resolve().is_err());
    }
}
