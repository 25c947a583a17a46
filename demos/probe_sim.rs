use dyno::backend::{SimCompiler, SimDevice};
use dyno::runtime::cache::CompileCache;
use dyno::{
    CompileOptions, DynoError, Fingerprint, GraphRegion, Harness, KernelModule, LaunchSpec,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct ScaleCandidate {
    grid: u32,
    block: u32,
    shared_mem_bytes: u32,
}

fn main() {
    env_logger::init();

    let device = Arc::new(SimDevice::new());
    let compiler = Arc::new(SimCompiler::new(device.clone()));
    let cache = Arc::new(CompileCache::new());
    let harness = Harness::new(
        compiler.clone(),
        cache.clone(),
        device.clone(),
        device.clone(),
        0,
    );

    let region = GraphRegion::new("scale_region", CompileOptions::default());
    let fingerprint = Fingerprint::new("sim_0", "scale_region");

    // 1024 floats, doubled by every candidate kernel.
    let xs: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let out_bytes = xs.len() * 4;
    let input = device.copy_to_device(bytemuck::cast_slice(&xs)).unwrap();
    let output = device.copy_to_device(&vec![0u8; out_bytes]).unwrap();

    let rewrite = |c: &ScaleCandidate| {
        if c.block == 0 {
            return Err(DynoError::UncompilableCandidate(
                "block dimension is zero".into(),
            ));
        }
        let mut launch = LaunchSpec::linear(c.grid, c.block);
        launch.shared_mem_bytes = c.shared_mem_bytes;
        Ok(KernelModule::new("scale_f32", "", launch, 1, out_bytes))
    };

    let candidates = vec![
        ScaleCandidate { grid: 4, block: 256, shared_mem_bytes: 0 },
        ScaleCandidate { grid: 8, block: 128, shared_mem_bytes: 0 },
        ScaleCandidate { grid: 32, block: 32, shared_mem_bytes: 0 },
        // Asks for twice the sim device's 48 KiB budget.
        ScaleCandidate { grid: 8, block: 128, shared_mem_bytes: 96 * 1024 },
        // Rejected by the rewrite before it reaches the compiler.
        ScaleCandidate { grid: 8, block: 0, shared_mem_bytes: 0 },
    ];

    println!("=== Sweep: {} candidates over 'scale_region' ===", candidates.len());
    let mut best: Option<(usize, Duration)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let report = harness
            .measure(&region, candidate, &fingerprint, &[input], output, rewrite)
            .unwrap();
        match report {
            Some(report) => {
                println!(
                    "  [{}] {:?} -> {:?} (cache_hit: {})",
                    i, candidate, report.duration, report.cache_hit
                );
                if best.map_or(true, |(_, d)| report.duration < d) {
                    best = Some((i, report.duration));
                }
            }
            None => println!("  [{}] {:?} -> skipped", i, candidate),
        }
    }

    let (winner, duration) = best.unwrap();
    println!("\n=== Winner: candidate {} at {:?} ===", winner, duration);

    // Re-probe the winner; the artifact comes straight from the cache.
    let report = harness
        .measure(&region, &candidates[winner], &fingerprint, &[input], output, rewrite)
        .unwrap()
        .unwrap();
    println!("Re-probe: {:?} (cache_hit: {})", report.duration, report.cache_hit);

    let produced = device.copy_from_device(output);
    let head: Vec<f32> = produced[..16]
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();
    println!("Output head: {:?}", head);

    let stats = cache.stats();
    println!(
        "\nCache: {} entries, {} hits / {} misses, {} inserts, {} discards, {} compiler invocations",
        cache.len(),
        stats.hits,
        stats.misses,
        stats.inserts,
        stats.discards,
        compiler.compile_count()
    );
}
