//! Benchmark: host vs accelerator matmul chains, synced vs fetched.

use std::time::Instant;

use tarn_core::{Device, Engine, EngineConfig, Scope, Tensor};

fn chain(x: &Tensor, w: &Tensor, layers: usize) -> Tensor {
    let mut h = x.clone();
    for _ in 0..layers {
        h = h.matmul(w).unwrap().relu().unwrap();
    }
    h
}

fn bench_sync(scope: &Scope, w: &Tensor, data: &[Vec<f32>], iters: usize) -> f64 {
    let x = scope.array(data.to_vec()).unwrap();
    let start = Instant::now();
    for _ in 0..iters {
        chain(&x, w, 4).sync().unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_fetch(engine: &Engine, scope: &Scope, w: &Tensor, data: &[Vec<f32>], iters: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        let fresh = scope.array(data.to_vec()).unwrap();
        chain(&fresh, w, 4).fetch(|r| assert!(r.is_ok())).unwrap();
    }
    engine.sync_all(true).unwrap();
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    let engine = Engine::new(EngineConfig {
        link_latency_us: 1000,
        ..Default::default()
    })
    .unwrap();
    println!("=== Tarn Overlap Benchmark ===");
    println!("link latency: {:?}\n", engine.config().link_latency());

    println!(
        "{:<12} {:>12} {:>12} {:>12} {:>10}",
        "Size", "Host (ms)", "Sync (ms)", "Fetch (ms)", "Overlap"
    );
    println!("{}", "-".repeat(62));

    for &n in &[32usize, 64, 128, 256] {
        let data: Vec<Vec<f32>> = (0..n)
            .map(|r| (0..n).map(|c| ((r * 7 + c * 3) % 13) as f32 * 0.01 - 0.06).collect())
            .collect();
        let iters = if n <= 64 { 50 } else if n <= 128 { 20 } else { 5 };

        let host = engine.scope(Device::Cpu).unwrap();
        let w_host = host.array(data.clone()).unwrap();
        let host_s = bench_sync(&host, &w_host, &data, iters);
        drop(host);

        let accel = engine.scope(Device::Accel(0)).unwrap();
        let w = accel.array(data.clone()).unwrap();
        w.sync().unwrap();
        let sync_s = bench_sync(&accel, &w, &data, iters);
        engine.reset_stats();
        let fetch_s = bench_fetch(&engine, &accel, &w, &data, iters);
        let stats = engine.stats();

        println!(
            "{:<12} {:>10.3}ms {:>10.3}ms {:>10.3}ms {:>9.2}",
            format!("{n}x{n}"),
            host_s * 1000.0,
            sync_s * 1000.0,
            fetch_s * 1000.0,
            stats.overlap_efficiency(),
        );
    }
}
