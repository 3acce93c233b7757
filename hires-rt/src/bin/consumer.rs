//! Demonstration consumer: drains the ring and prints entries.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hires_rt::{cycles, Connection, PopStatus};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "hires-consumer")]
#[command(about = "Drain and print entries from the HiRes ring buffer")]
struct Args {
    /// Path to the region owner's control socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Polling interval in milliseconds when the buffer is empty
    #[arg(short, long, default_value_t = 10)]
    poll_interval_ms: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let conn = Connection::connect(args.socket.as_deref())?;
    let cycles_per_us = conn.cycles_per_us();
    info!(
        "consumer connected: capacity {}, {} cycles/us",
        conn.capacity(),
        cycles_per_us
    );

    loop {
        match conn.pop() {
            PopStatus::Entry(entry) => {
                println!(
                    "ts={} ({} us) event_id={} cpu={} flags={:#06x} data1={} data2={}",
                    entry.timestamp,
                    cycles::to_micros(entry.timestamp, cycles_per_us),
                    entry.event_id,
                    entry.cpu_id,
                    entry.flags,
                    entry.data1,
                    entry.data2,
                );
            }
            PopStatus::Empty => {
                std::thread::sleep(Duration::from_millis(args.poll_interval_ms));
            }
            PopStatus::NotReady => {
                // A producer is mid-publish; give it the core briefly.
                std::thread::yield_now();
            }
        }
    }
}
