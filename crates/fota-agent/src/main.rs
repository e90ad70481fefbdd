use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fota_updater::{
    FlashPartitions, MemoryFlash, SimulatedDevice, UpdateConfig, UpdateManager, UpdatePhase,
    UpdateTarget,
};

#[derive(Parser, Debug)]
#[command(name = "fota-agent")]
#[command(version, about = "Firmware OTA agent - checks a manifest and flashes a simulated device")]
struct Cli {
    /// Command to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "fota.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Device id reported in the manifest query
    #[arg(long, global = true, default_value = "0000000000000000")]
    device_id: String,

    /// Size of each application slot in bytes
    #[arg(long, global = true, default_value_t = 1024 * 1024)]
    app_size: u64,

    /// Size of the data partition in bytes
    #[arg(long, global = true, default_value_t = 256 * 1024)]
    data_size: u64,

    /// Directory receiving the partition images after an update
    #[arg(long, global = true, default_value = "flash-out")]
    out: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch the manifest and report whether an update is available
    Check,
    /// Check, then install the filesystem and firmware images
    Update,
    /// Install without the version gate
    Force(ForceArgs),
}

#[derive(clap::Args, Debug)]
struct ForceArgs {
    /// Firmware URL to install
    #[arg(long, conflicts_with_all = ["host", "filesystem"])]
    url: Option<String>,

    /// Firmware host; https is used for ports 443 and 4433
    #[arg(long, requires = "path")]
    host: Option<String>,

    #[arg(long, default_value_t = 443)]
    port: u16,

    /// Firmware path on the host
    #[arg(long)]
    path: Option<String>,

    /// Filesystem image URL to install instead of firmware
    #[arg(long, conflicts_with = "host")]
    filesystem: Option<String>,

    /// Check the payload signature
    #[arg(long)]
    validate: bool,
}

type Manager = UpdateManager<MemoryFlash, SimulatedDevice>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "fota_agent={},fota_updater={}",
                    cli.log_level, cli.log_level
                ))
            }),
        )
        .init();

    let config = UpdateConfig::load_from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(
        firmware_type = %config.firmware_type,
        version = %config.firmware_version,
        "Starting fota-agent"
    );

    let flash = MemoryFlash::new(cli.app_size, cli.data_size);
    let device = SimulatedDevice::new(cli.device_id.clone());
    let mut manager = UpdateManager::from_config(config, flash, device.clone())?;

    match cli.command {
        Commands::Check => {
            if manager.check().await? {
                if let Some(entry) = manager.pending_update() {
                    println!("{}", serde_json::to_string_pretty(entry)?);
                }
            } else {
                println!("No update available");
            }
            return Ok(());
        }
        Commands::Update => {
            if !manager.handle().await? {
                println!("No update available");
                return Ok(());
            }
        }
        Commands::Force(args) => force(&mut manager, args).await?,
    }

    report(&manager, device.restarts());
    dump_partitions(manager.flash(), &cli.out).await?;
    Ok(())
}

async fn force(manager: &mut Manager, args: ForceArgs) -> anyhow::Result<()> {
    if let Some(url) = args.filesystem {
        manager.force_update_filesystem(&url, args.validate).await?;
    } else if let Some(url) = args.url {
        manager.force_update_url(&url, args.validate).await?;
    } else if let (Some(host), Some(path)) = (args.host, args.path) {
        manager
            .force_update_host(&host, args.port, &path, args.validate)
            .await?;
    } else {
        manager.force_update(args.validate).await?;
    }
    Ok(())
}

fn report(manager: &Manager, restarts: u64) {
    for target in [UpdateTarget::Filesystem, UpdateTarget::Firmware] {
        let phase = manager.phase(target);
        if phase != UpdatePhase::Idle {
            println!("{:<11} {:?}", target, phase);
        }
    }
    if let Some(boot) = manager.flash().boot_partition() {
        println!("boot        {}", boot.label);
    }
    if restarts > 0 {
        println!("device would restart now");
    }
}

async fn dump_partitions(flash: &MemoryFlash, out: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;

    for partition in flash.partitions() {
        let Some(contents) = flash.contents(&partition.label) else {
            warn!(label = %partition.label, "Partition has no backing storage");
            continue;
        };
        let path = out.join(format!("{}.bin", partition.label));
        tokio::fs::write(&path, contents).await?;
        info!(label = %partition.label, path = %path.display(), "Partition image written");
    }
    Ok(())
}
