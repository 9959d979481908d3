//! Saturation benchmark for the stream engine: a reverse-mode producer
//! floods a hole while the normal consumer drains it, both in one process
//! over the simulated device. Reports throughput and record-delivery
//! latency percentiles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::RngCore;

use tapring_core::{Capture, PollConfig, StreamError};
use tapring_erf::{build_record, TYPE_ETH};
use tapring_io::platform::affinity::pin_thread_to_core;
use tapring_io::{lock_memory_pages, page_size, PbmGeneration, SimDevice};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 1_000_000)]
    records: u64,

    #[arg(short, long, default_value_t = 240)]
    payload_len: usize,

    #[arg(long, default_value_t = 1024)]
    hole_pages: usize,

    #[arg(long, default_value_t = 3)]
    generation: u32,
}

const BUCKET_THRESHOLDS_US: [u64; 12] =
    [1, 10, 50, 100, 200, 500, 1000, 5000, 10000, 50000, 100000, 500000];

/// A lock-free latency histogram with fixed microsecond buckets, cheap
/// enough to sit on the hot path.
struct LiveHistogram {
    buckets: [AtomicU64; 12],
}

impl LiveHistogram {
    fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self { buckets: [ZERO; 12] }
    }

    fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        let idx = BUCKET_THRESHOLDS_US
            .iter()
            .position(|&t| us < t)
            .unwrap_or(BUCKET_THRESHOLDS_US.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, p: f64) -> u64 {
        let total: u64 = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        if total == 0 {
            return 0;
        }
        let target = (total as f64 * p) as u64;
        let mut count = 0;
        for (i, bucket) in self.buckets.iter().enumerate() {
            count += bucket.load(Ordering::Relaxed);
            if count >= target {
                return BUCKET_THRESHOLDS_US[i];
            }
        }
        BUCKET_THRESHOLDS_US[BUCKET_THRESHOLDS_US.len() - 1]
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let hole = args.hole_pages.max(1) * page_size();
    let record_len = 16 + args.payload_len;
    let generation = PbmGeneration::from_code(args.generation).ok_or("unknown generation")?;

    println!("--- TAPRING SATURATION BENCHMARK ---");
    println!("Records:      {}", args.records);
    println!("Record size:  {} bytes", record_len);
    println!("Hole size:    {:#x} bytes", hole);
    println!("Generation:   {}", args.generation);
    println!("------------------------------------\n");

    lock_memory_pages();

    let device = SimDevice::new(generation, 1, hole)?;
    let stats = Arc::new(LiveHistogram::new());
    // One monotonic anchor shared by both halves; record timestamps carry
    // nanoseconds since this instant.
    let anchor = Instant::now();

    let producer = {
        let device = device.clone();
        let target = args.records;
        let payload_len = args.payload_len;
        thread::Builder::new()
            .name("stress-producer".into())
            .spawn(move || -> Result<u64, StreamError> {
                pin_thread_to_core(0);
                let mut session = Capture::open(device)?;
                let token = session.attach_reverse(0, 0)?;
                session.start(token)?;
                session.set_poll_config(
                    token,
                    PollConfig {
                        min_data: 16,
                        max_wait: Duration::from_millis(50),
                        poll_interval: Duration::from_micros(100),
                    },
                )?;

                let mut payload = vec![0u8; payload_len];
                rand::thread_rng().fill_bytes(&mut payload);

                let mut sent = 0u64;
                // One extra record pushes the counted tail past the
                // safety window.
                while sent <= target {
                    if session.stream_stats(token)?.paused {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    let ts = anchor.elapsed().as_nanos() as u64;
                    let record = build_record(TYPE_ETH, ts, &payload);
                    match session.copy_and_commit(token, &record) {
                        Ok(_) => sent += 1,
                        Err(StreamError::TimedOut) => continue,
                        Err(e) => return Err(e),
                    }
                }
                session.stop(token).ok();
                session.detach(token)?;
                Ok(sent)
            })?
    };

    pin_thread_to_core(1);
    let mut session = Capture::open(device)?;
    let token = session.attach(0, 0)?;
    session.set_poll_config(
        token,
        PollConfig {
            min_data: 16,
            max_wait: Duration::from_millis(200),
            poll_interval: Duration::from_micros(100),
        },
    )?;
    session.start(token)?;

    let started = Instant::now();
    let mut received = 0u64;
    let mut bytes = 0u64;
    let mut stalls = 0u32;
    while received < args.records {
        match session.next_record(token) {
            Ok(record) => {
                let sent_at = Duration::from_nanos(record.header().timestamp);
                stats.record(anchor.elapsed().saturating_sub(sent_at));
                bytes += record.len() as u64;
                received += 1;
                if received % 100_000 == 0 {
                    println!("[PROGRESS] {:>9} / {} records...", received, args.records);
                }
            }
            Err(StreamError::TimedOut) => {
                stalls += 1;
                if producer.is_finished() && stalls > 5 {
                    break;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    let total_time = started.elapsed();

    let sent = producer.join().expect("producer thread panicked")?;
    session.stop(token).ok();
    session.detach(token)?;

    let throughput = received as f64 / total_time.as_secs_f64();
    let gbps = (bytes as f64 * 8.0) / total_time.as_secs_f64() / 1e9;

    println!("\n==================================================");
    println!("          TAPRING BENCHMARK RECEIPT               ");
    println!("==================================================");
    println!(" [ BLOCK 1: TEST CONFIGURATION ]");
    println!(" Records:      {}", args.records);
    println!(" Record size:  {} bytes", record_len);
    println!(" Hole size:    {:#x} bytes", hole);
    println!("--------------------------------------------------");
    println!(" [ BLOCK 2: EXECUTION INTEGRITY ]");
    let status = if received == args.records { "PASS" } else { "FAIL" };
    println!(" Status:       {}", status);
    println!(" Captured:     {}/{} (injected {})", received, args.records, sent);
    println!("--------------------------------------------------");
    println!(" [ BLOCK 3: PERFORMANCE METRICS ]");
    println!(" Wall Clock:   {:.2?}", total_time);
    println!(" Throughput:   {:.0} records/sec", throughput);
    println!(" Bandwidth:    {:.2} Gbit/s", gbps);
    println!("--------------------------------------------------");
    println!(" [ BLOCK 4: DELIVERY LATENCY ]");
    println!(" P50 (Median): {} us", stats.percentile(0.50));
    println!(" P99 (Tail):   {} us", stats.percentile(0.99));
    println!("==================================================\n");

    Ok(())
}
