use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bfs_config::{BfsConfig, DeviceKind};
use clap::Parser;
use device::{DaemonConfig, DeviceServer};
use tracing::{info, Level};

/// BFS storage daemon: serves one device's blocks to the file server.
#[derive(Parser)]
#[command(name = "bfsd", version, about)]
struct Args {
    /// Device id to serve, as configured in bfsDeviceLayer
    #[arg(short = 'd', long = "device")]
    device: u32,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = "bfs.json")]
    config: PathBuf,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    match &args.logfile {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open logfile {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
    Ok(())
}

fn daemon_config(cfg: &BfsConfig, did: u32) -> anyhow::Result<DaemonConfig> {
    let dev = cfg.device(did)?;
    if dev.kind != DeviceKind::Remote {
        return Err(anyhow!("device {did} is local; nothing to serve"));
    }
    let sa = dev
        .sa
        .as_ref()
        .ok_or_else(|| anyhow!("device {did} has no security association"))?;
    Ok(DaemonConfig {
        device_id: dev.did,
        user_id: cfg.device_layer.user_id,
        backing_path: dev
            .path
            .clone()
            .ok_or_else(|| anyhow!("device {did} has no backing path"))?,
        num_blocks: dev.num_blocks,
        listen_port: dev.port.ok_or_else(|| anyhow!("device {did} has no port"))?,
        sa_initiator: sa.initiator.clone(),
        sa_responder: sa.responder.clone(),
        sa_key: sa.key()?,
    })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let cfg = BfsConfig::load(&args.config)
        .with_context(|| format!("load configuration {}", args.config.display()))?;
    let dcfg = daemon_config(&cfg, args.device)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())
        .context("install SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())
        .context("install SIGTERM handler")?;

    let mut server = DeviceServer::new(dcfg, shutdown).context("initialize device server")?;
    server.run().context("device server failed")?;

    info!("clean shutdown");
    Ok(())
}
