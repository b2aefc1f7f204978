//! Stress test - many producers, many flows
//!
//! Each producer thread owns a set of flows and dispatches numbered packets
//! on them. Handlers record `(flow, seq)` into a lock-free queue; at the end
//! every flow's sequence numbers must be strictly increasing (gaps are
//! allowed for packets dropped on a full queue).
//!
//! Usage: `stress [packets-per-producer] [producers]`

use crossbeam_queue::SegQueue;
use flowdisp::{DispatchConfig, DispatchError, FlowHint, PacketBuf, Protocol, Runtime};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROTO: u8 = 1;
const FLOWS_PER_PRODUCER: u32 = 16;

fn main() {
    println!("=== flowdisp Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let per_producer: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let producers: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(4);

    let config = DispatchConfig::from_env().default_queue_limit(4096);
    let mut runtime = Runtime::new(config).expect("dispatcher init");

    let seen: Arc<SegQueue<(u32, u32)>> = Arc::new(SegQueue::new());
    let handled = Arc::new(AtomicU64::new(0));
    let dropped = Arc::new(AtomicU64::new(0));

    runtime.block_on(|| {
        let (s, h) = (seen.clone(), handled.clone());
        flowdisp::register(
            Protocol::new(PROTO, "stress", move |pkt: Box<PacketBuf>| {
                let mut seq = [0u8; 4];
                seq.copy_from_slice(&pkt.data()[..4]);
                s.push((pkt.flow().unwrap_or(0), u32::from_le_bytes(seq)));
                h.fetch_add(1, Ordering::Relaxed);
            })
            .flow_classifier(|pkt: Box<PacketBuf>| {
                let flow = pkt.flow()?;
                Some((pkt, FlowHint::new(flow)))
            }),
        )
        .expect("register");

        println!(
            "{} producers x {} packets over {} workstreams",
            producers,
            per_producer,
            flowdisp::cpu_count()
        );
        let start = Instant::now();

        let threads: Vec<_> = (0..producers)
            .map(|p| {
                let dropped = dropped.clone();
                std::thread::spawn(move || {
                    for seq in 0..per_producer {
                        let flow = p * FLOWS_PER_PRODUCER + seq % FLOWS_PER_PRODUCER;
                        let pkt = PacketBuf::with_flow(seq.to_le_bytes().to_vec(), flow);
                        match flowdisp::dispatch(PROTO, pkt) {
                            Ok(()) => {}
                            Err(DispatchError::NoBufferSpace) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => panic!("dispatch failed: {}", e),
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("producer panicked");
        }
        let produce_time = start.elapsed();

        let total = producers as u64 * per_producer as u64;
        let run_start = Instant::now();
        loop {
            let done = handled.load(Ordering::Relaxed) + dropped.load(Ordering::Relaxed);
            if done >= total {
                break;
            }
            if run_start.elapsed() > Duration::from_secs(30) {
                println!("Timeout! Only {}/{} accounted for", done, total);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let total_time = start.elapsed();

        let mut last: HashMap<u32, u32> = HashMap::new();
        let mut violations = 0u64;
        while let Some((flow, seq)) = seen.pop() {
            if let Some(prev) = last.insert(flow, seq) {
                if seq <= prev {
                    violations += 1;
                }
            }
        }

        println!("\n=== Results ===");
        println!("Packets:         {}", total);
        println!("Handled:         {}", handled.load(Ordering::Relaxed));
        println!("Dropped:         {}", dropped.load(Ordering::Relaxed));
        println!("Flows seen:      {}", last.len());
        println!("Order errors:    {}", violations);
        println!("Produce time:    {:?}", produce_time);
        println!("Total time:      {:?}", total_time);
        println!(
            "Throughput:      {:.0} packets/sec",
            total as f64 / total_time.as_secs_f64()
        );
        println!("\n{}", flowdisp::stats());

        if violations > 0 {
            eprintln!("per-flow ordering violated");
            std::process::exit(1);
        }
    });

    println!("\n=== Stress Test Complete ===");
}
