//! tapd: the TAPRING software loopback daemon.
//!
//! Wires a reverse-mode producer and a normal consumer around one
//! simulated device, which exercises the full stream protocol — advisory
//! locks, the double-mapped hole, the synchronization handshake and the
//! safety-window cursor discipline — with no adapter in the machine.
//! Captured records are logged, and optionally served to one TCP consumer.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use tapring_core::{Capture, PollConfig, StreamError};
use tapring_erf::{build_record, RECORD_HEADER_SIZE, TYPE_ETH};
use tapring_io::platform::affinity::pin_thread_to_core;
use tapring_io::platform::topology::SystemTopology;
use tapring_io::{lock_memory_pages, page_size, ExportListener, PbmGeneration, SimDevice};

#[derive(Parser, Debug)]
#[command(author, version, about = "TAPRING software loopback capture daemon", long_about = None)]
struct Args {
    /// Records to inject before stopping (0 = run until SIGINT)
    #[arg(short, long, default_value_t = 0)]
    records: u64,

    /// Payload length of each injected record
    #[arg(short = 'l', long, default_value_t = 240)]
    payload_len: usize,

    /// Hole size in pages
    #[arg(long, default_value_t = 256)]
    hole_pages: usize,

    /// Burst-manager generation to simulate (0-3)
    #[arg(long, default_value_t = 3)]
    generation: u32,

    /// Pin the consumer to this core
    #[arg(long)]
    core: Option<usize>,

    /// Serve captured records to one TCP consumer on this port
    #[arg(short, long)]
    export_port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    info!("Starting tapd...");

    let topology = SystemTopology::probe();
    topology.print_summary();
    lock_memory_pages();
    if let Some(core) = args.core {
        pin_thread_to_core(core);
    }

    let hole = args.hole_pages.max(1) * page_size();
    if topology.pinning_is_risky(2 * hole as u64) {
        warn!("stream windows are large relative to available RAM");
    }
    let generation = PbmGeneration::from_code(args.generation)
        .context("unknown burst-manager generation")?;
    let device = SimDevice::new(generation, 1, hole)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install the SIGINT handler")?;
    }

    let max_payload = (u16::MAX as usize - RECORD_HEADER_SIZE).min(hole / 4);
    let payload_len = args.payload_len.min(max_payload);

    // Producer half: the reverse side of stream 0, standing in for the
    // adapter and injecting synthetic records.
    let producer = {
        let device = device.clone();
        let shutdown = shutdown.clone();
        let target = args.records;
        thread::Builder::new()
            .name("tapd-producer".into())
            .spawn(move || -> anyhow::Result<u64> {
                let mut session = Capture::open(device)?;
                let token = session.attach_reverse(0, 0)?;
                session.start(token)?;
                session.set_poll_config(
                    token,
                    PollConfig {
                        min_data: 16,
                        max_wait: Duration::from_millis(100),
                        poll_interval: Duration::from_millis(1),
                    },
                )?;

                let payload = vec![0xA5u8; payload_len];
                let mut sent = 0u64;
                while !shutdown.load(Ordering::SeqCst) && (target == 0 || sent < target) {
                    if session.stream_stats(token)?.paused {
                        // No peer yet (or the peer stopped); nothing to
                        // feed until the next synchronization.
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    let record = build_record(TYPE_ETH, sent, &payload);
                    match session.copy_and_commit(token, &record) {
                        Ok(_) => sent += 1,
                        Err(StreamError::TimedOut) => continue,
                        Err(e) => return Err(e).context("producer write failed"),
                    }
                }

                if target != 0 && !shutdown.load(Ordering::SeqCst) {
                    // One padding record pushes the published limit past
                    // the counted tail, which otherwise stays behind the
                    // safety window.
                    let flush = build_record(TYPE_ETH, sent, &payload);
                    let _ = session.copy_and_commit(token, &flush);
                }

                session.stop(token).ok();
                session.detach(token)?;
                Ok(sent)
            })
            .context("failed to spawn the producer")?
    };

    // Consumer half: the normal receive side.
    let mut session = Capture::open(device)?;
    let token = session.attach(0, 0)?;
    session.set_poll_config(
        token,
        PollConfig {
            min_data: 16,
            max_wait: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
        },
    )?;
    // The handshake is answered by the producer's synchronizer.
    session.start(token)?;

    let mut export = match args.export_port {
        Some(port) => {
            let listener = ExportListener::bind(port)?;
            info!("waiting for an export consumer on port {port}...");
            Some(listener.accept()?)
        }
        None => None,
    };

    let started = Instant::now();
    let mut received = 0u64;
    let mut bytes = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        if args.records != 0 && received >= args.records {
            break;
        }
        match session.next_record(token) {
            Ok(record) => {
                received += 1;
                bytes += record.len() as u64;
                if let Some(stream) = export.as_mut() {
                    stream
                        .write_all(record.as_bytes())
                        .context("export consumer went away")?;
                }
                if received % 100_000 == 0 {
                    info!("{received} records, {bytes} bytes so far");
                }
            }
            Err(StreamError::TimedOut) | Err(StreamError::WouldBlock) => {
                if args.records != 0 && producer.is_finished() {
                    warn!("producer finished with records still behind the safety window");
                    break;
                }
            }
            Err(e) => return Err(e).context("capture session failed"),
        }
    }
    let elapsed = started.elapsed();

    shutdown.store(true, Ordering::SeqCst);
    let sent = producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;

    session.stop(token).ok();
    session.detach(token)?;

    let rate = if elapsed.as_secs_f64() > 0.0 {
        received as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        "done: {sent} injected, {received} captured ({bytes} bytes) in {elapsed:.2?} — {rate:.0} rec/s"
    );
    Ok(())
}
