//! Demonstration producer: logs a counter at a fixed interval.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hires_rt::{Connection, ProduceStatus};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hires-producer")]
#[command(about = "Log counter events into the HiRes ring buffer")]
struct Args {
    /// Path to the region owner's control socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Event id to log under
    #[arg(short, long, default_value_t = 1001)]
    event_id: u32,

    /// Interval between events in milliseconds
    #[arg(short, long, default_value_t = 2000)]
    interval_ms: u64,

    /// Stop after this many events (runs forever when omitted)
    #[arg(short, long)]
    count: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let conn = Connection::connect(args.socket.as_deref())?;
    info!(
        "producer connected: capacity {}, {} cycles/us",
        conn.capacity(),
        conn.cycles_per_us()
    );

    let mut counter = 0u64;
    loop {
        match conn.log(args.event_id, counter, counter * 2) {
            ProduceStatus::Logged => info!("logged event id={} data1={counter}", args.event_id),
            ProduceStatus::Dropped => warn!(
                "ring full, entry dropped (total drops: {})",
                conn.dropped_count()
            ),
        }
        counter += 1;
        if args.count.is_some_and(|limit| counter >= limit) {
            break;
        }
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }
    Ok(())
}
