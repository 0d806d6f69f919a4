//! Benchmarks for the packet path and the rate-table dump.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

use ratemon::{MonitorConfig, RateMonitor, RawPacket};

fn generate_packets(n: usize, prefixes: u8) -> Vec<RawPacket> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..n)
        .map(|_| {
            let src = [rng.gen::<u8>() % prefixes, rng.gen(), rng.gen(), rng.gen()];
            let dst = [rng.gen::<u8>() % prefixes, rng.gen(), rng.gen(), rng.gen()];
            RawPacket::ipv4(src, dst, 1500)
        })
        .collect()
}

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push");

    for prefixes in [4u8, 64] {
        let packets = generate_packets(10_000, prefixes);

        group.bench_function(format!("{prefixes}_slash8s"), |b| {
            b.iter(|| {
                let monitor = RateMonitor::new(MonitorConfig {
                    thresh: 10,
                    memmax_kib: 1024,
                    ..MonitorConfig::default()
                })
                .unwrap();
                for pkt in &packets {
                    let mut pkt = pkt.clone();
                    monitor.push(0, &mut pkt);
                }
                black_box(monitor.allocated_bytes())
            });
        });
    }

    group.finish();
}

fn bench_look(c: &mut Criterion) {
    let packets = generate_packets(10_000, 16);
    let monitor = RateMonitor::new(MonitorConfig {
        thresh: 10,
        memmax_kib: 1024,
        ..MonitorConfig::default()
    })
    .unwrap();
    for pkt in &packets {
        let mut pkt = pkt.clone();
        monitor.push(0, &mut pkt);
    }

    c.bench_function("look_warm_tree", |b| {
        b.iter(|| black_box(monitor.look()));
    });
}

criterion_group!(benches, bench_push, bench_look);
criterion_main!(benches);
