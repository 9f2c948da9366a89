use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use iscsi_helper::{IscsiControl, TgtControl};
use scsi_device::device::HOST_NAMESPACE;
use scsi_device::{ScsiDevice, devnode, metrics};

#[derive(Parser, Debug)]
#[command(name = "scsi-device")]
#[command(about = "Expose a file-backed iSCSI target as a local block device")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9092)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Attach the device, wait for a shutdown signal, then detach it
    Serve {
        /// Volume name, appended to the target IQN
        #[arg(long)]
        name: String,

        /// File or block device backing the LUN
        #[arg(long)]
        backing_file: String,

        /// tgtd backing-store type (e.g., rdwr, aio)
        #[arg(long, default_value = "")]
        bs_type: String,

        /// Backing-store options passed through to tgtd
        #[arg(long, default_value = "")]
        bs_opts: String,

        /// Directory to expose a copy of the attached device node in
        #[arg(long, env = "DEV_DIR")]
        dev_dir: Option<PathBuf>,

        /// Namespace directory initiator commands run in (empty for current)
        #[arg(long, env = "HOST_NS", default_value = HOST_NAMESPACE)]
        host_ns: PathBuf,
    },

    /// Create a block device node with the same major/minor as another
    Duplicate {
        #[arg(long)]
        src: PathBuf,

        #[arg(long)]
        dest: PathBuf,
    },

    /// Remove a device node, giving up after 30 seconds
    Remove {
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    match args.command {
        Cmd::Serve {
            name,
            backing_file,
            bs_type,
            bs_opts,
            dev_dir,
            host_ns,
        } => serve(name, backing_file, bs_type, bs_opts, dev_dir, host_ns).await,
        Cmd::Duplicate { src, dest } => {
            devnode::duplicate_device(&src, &dest)?;
            Ok(())
        }
        Cmd::Remove { path } => {
            devnode::remove_device(&path).await?;
            info!("Removed {}", path.display());
            Ok(())
        }
    }
}

async fn serve(
    name: String,
    backing_file: String,
    bs_type: String,
    bs_opts: String,
    dev_dir: Option<PathBuf>,
    host_ns: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let control: Arc<dyn IscsiControl> = Arc::new(TgtControl::default());
    let dev = ScsiDevice::new(&name, &backing_file, &bs_type, &bs_opts, control)?
        .with_namespace(host_ns);

    info!("Target: {}", dev.target());
    info!("Portal: {}", dev.portal());
    info!("Backing file: {}", dev.backing_file());

    // iSCSI administration shells out and blocks
    let mut dev = tokio::task::spawn_blocking(move || {
        let mut dev = dev;
        dev.startup().map(|_| dev)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&dev)?);

    let exposed = match dev_dir {
        Some(dir) => {
            let path = dir.join(&name);
            if let Err(e) = devnode::duplicate_device(Path::new(dev.device()), &path) {
                error!("Failed to expose {} at {}: {}", dev.device(), path.display(), e);
                tokio::task::spawn_blocking(move || dev.shutdown()).await??;
                return Err(e.into());
            }
            Some(path)
        }
        None => None,
    };

    shutdown_signal().await?;
    info!("Shutdown signal received, detaching device...");

    if let Some(path) = exposed
        && let Err(e) = devnode::remove_device(&path).await
    {
        // Keep going so the target is still torn down
        error!("Failed to remove {}: {}", path.display(), e);
    }

    tokio::task::spawn_blocking(move || dev.shutdown()).await??;

    info!("scsi-device shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sighup.recv() => info!("Received SIGHUP"),
    }
    Ok(())
}
