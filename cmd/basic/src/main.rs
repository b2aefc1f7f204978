//! Basic flowdisp example
//!
//! Registers a flow-classified protocol, a CPU-classified one and one with
//! no classifier, pushes some packets through each entry point and prints
//! the stats dump.
//!
//! # Environment Variables
//!
//! - `FDP_FLUSH_EPRINT=1` - Flush debug output immediately
//! - `FDP_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `FDP_MAX_THREADS=N`, `FDP_DIRECT_DISPATCH=0`, ... - see `DispatchConfig`

use flowdisp::{kdebug, kinfo, Affinity, DispatchConfig, FlowHint, PacketBuf, Protocol, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROTO_IP: u8 = 1;
const PROTO_ARP: u8 = 2;
const PROTO_RAW: u8 = 3;

// FDP_LOG_LEVEL=debug FDP_FLUSH_EPRINT=1 cargo run -p flowdisp-basic
fn main() {
    println!("=== flowdisp Basic Example ===\n");

    let config = DispatchConfig::from_env().max_threads(4);
    config.print();
    let mut runtime = Runtime::new(config).expect("dispatcher init");

    let handled = Arc::new(AtomicUsize::new(0));

    runtime.block_on(|| {
        let h = handled.clone();
        flowdisp::register(
            Protocol::new(PROTO_IP, "ip", move |pkt: Box<PacketBuf>| {
                kdebug!("ip: {} bytes, flow {:?}", pkt.len(), pkt.flow());
                h.fetch_add(1, Ordering::SeqCst);
            })
            .flow_classifier(|pkt: Box<PacketBuf>| {
                let flow = pkt.flow().unwrap_or(0);
                Some((pkt, FlowHint::new(flow)))
            })
            .queue_limit(512),
        )
        .expect("register ip");

        let h = handled.clone();
        flowdisp::register(
            Protocol::new(PROTO_ARP, "arp", move |_pkt: Box<PacketBuf>| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .cpu_classifier(|pkt: Box<PacketBuf>| Some((pkt, 0, Affinity::Strong))),
        )
        .expect("register arp");

        let h = handled.clone();
        flowdisp::register(Protocol::new(PROTO_RAW, "raw", move |_pkt: Box<PacketBuf>| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("register raw");

        kinfo!("{} workstreams", flowdisp::cpu_count());

        let mut sent = 0;
        for flow in 0..64u32 {
            let pkt = PacketBuf::with_flow(vec![0u8; 64 + flow as usize], flow);
            if flowdisp::dispatch(PROTO_IP, pkt).is_ok() {
                sent += 1;
            }
        }
        for i in 0..16 {
            if flowdisp::queue(PROTO_ARP, PacketBuf::new(vec![i as u8; 28])).is_ok() {
                sent += 1;
            }
            if flowdisp::queue_flow(PROTO_RAW, PacketBuf::new(vec![0u8; 8]), i).is_ok() {
                sent += 1;
            }
        }

        let start = Instant::now();
        while handled.load(Ordering::SeqCst) < sent {
            if start.elapsed() > Duration::from_secs(10) {
                println!("WARNING: Timeout!");
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        println!("{} of {} packets handled\n", handled.load(Ordering::SeqCst), sent);
        println!("{}", flowdisp::stats());
    });

    println!("\n=== Example Complete ===");
}
