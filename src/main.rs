// src/main.rs
//
// canserial daemon entry point. Brings the bridge up on a CAN interface and
// ticks the liveness scheduler until interrupted.
//
// The interface must be configured first:
//   sudo ip link set can0 up type can bitrate 500000

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use canserial::{BridgeConfig, CanBridge};

#[derive(Parser, Debug)]
#[command(name = "canserial", version, about = "Bridge CAN-attached serial devices to virtual serial ports")]
struct Cli {
    /// CAN interface to bind (overrides the config file)
    #[arg(short, long)]
    interface: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the port symlinks
    #[arg(long)]
    link_dir: Option<PathBuf>,

    /// Symlink name prefix (hardware id is appended in hex)
    #[arg(long)]
    link_base: Option<String>,

    /// Liveness tick period in milliseconds
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Mirror logs into this directory (canserial.log points at the newest file)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        if let Err(e) = canserial::init_file_logging(dir) {
            eprintln!("canserial: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut config = match &cli.config {
        Some(path) => match BridgeConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("canserial: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => BridgeConfig::default(),
    };
    if let Some(interface) = cli.interface {
        config.interface = interface;
    }
    if let Some(link_dir) = cli.link_dir {
        config.link_dir = link_dir;
    }
    if let Some(link_base) = cli.link_base {
        config.link_base = link_base;
    }
    if let Some(ping_interval_ms) = cli.ping_interval_ms {
        config.ping_interval_ms = ping_interval_ms;
    }

    let ping_interval = Duration::from_millis(config.ping_interval_ms.max(1));
    let mut bridge = match CanBridge::open(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("canserial: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut ticker = tokio::time::interval(ping_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => bridge.tick(),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    eprintln!("canserial: signal handler: {}", e);
                }
                break;
            }
        }
    }

    bridge.shutdown();
    ExitCode::SUCCESS
}
