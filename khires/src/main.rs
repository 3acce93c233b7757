use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use khires::{calibrate, Config, ControlServer, SharedRegion};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "khires")]
#[command(about = "HiRes event logger region owner")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Control socket path (overrides config)
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Log2 of the ring capacity in entries (overrides config)
    #[arg(long)]
    rb_size_log2: Option<u32>,
    /// Calibration interval in milliseconds (overrides config)
    #[arg(long)]
    calibration_ms: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref());
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }
    if let Some(log2) = args.rb_size_log2 {
        cfg.rb_size_log2 = log2;
    }
    if let Some(ms) = args.calibration_ms {
        cfg.calibration_ms = ms;
    }

    // Calibrate first: the measurement wants a quiet process, and a failure
    // must not take logging down with it.
    let cycles_per_us =
        match calibrate::calibrate_cycles_per_us(Duration::from_millis(cfg.calibration_ms)) {
            Ok(v) => {
                info!("cycle counter calibrated: {v} cycles/us");
                v
            }
            Err(err) => {
                warn!("cycle calibration failed ({err}); frequency queries will fail");
                0
            }
        };

    let region = Arc::new(
        SharedRegion::allocate(cfg.rb_size_log2).context("failed to allocate shared region")?,
    );
    if !khires::install_region(Arc::clone(&region)) {
        anyhow::bail!("a shared region is already installed in this process");
    }

    let server = ControlServer::bind(&cfg.socket_path, region, cycles_per_us)
        .context("failed to bind control socket")?;
    info!(
        "khires ready: {} entries, socket {}",
        1u64 << cfg.rb_size_log2,
        server.socket_path().display()
    );
    server.run();
    Ok(())
}
