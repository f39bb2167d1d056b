//! Normal runs versus capture replay on the demo graph.

use crate::demo::{demo_graph, demo_input, DemoShape};
use anyhow::{Context, Result};
use lumen_operators::core_operator_registry;
use lumen_runtime::{Backend, GpuDevice, MemoryStats, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Benchmark parameters.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub shape: DemoShape,
    /// Timed iterations per mode (after one warm-up run).
    pub iterations: usize,
    /// Seed for constants and inputs; random when unset.
    pub seed: Option<u64>,
}

/// Results of a benchmark.
#[derive(Debug)]
pub struct BenchStats {
    pub iterations: usize,
    /// Total time of the normal runs.
    pub run_time: Duration,
    /// Total time of the replays.
    pub replay_time: Duration,
    /// Pool statistics once both modes finished.
    pub memory: MemoryStats,
    pub programs: usize,
    /// Dispatches issued per run.
    pub dispatches: usize,
}

impl BenchStats {
    pub fn per_run(&self) -> Duration {
        self.run_time / self.iterations.max(1) as u32
    }

    pub fn per_replay(&self) -> Duration {
        self.replay_time / self.iterations.max(1) as u32
    }
}

/// Run the demo graph `iterations` times normally, then capture it once and
/// replay it `iterations` times with the same inputs.
///
/// Every replay output is compared against the normal run for the same
/// input; any difference is an error.
pub async fn bench<D: GpuDevice>(backend: &mut Backend<D>, config: &BenchConfig) -> Result<BenchStats> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_seed(rand::random()),
    };
    let shape = config.shape;
    let graph = demo_graph(shape, &mut rng);
    let dispatches = graph.nodes.len();
    let session = backend
        .load_session(graph, &core_operator_registry())
        .context("Failed to load demo graph")?;
    info!(
        rows = shape.rows,
        cols = shape.cols,
        iterations = config.iterations,
        "Loaded demo graph"
    );

    let inputs: Vec<Tensor> = (0..config.iterations)
        .map(|_| Tensor::from_vec(demo_input(shape, &mut rng), &shape.dims()))
        .collect::<std::result::Result<_, _>>()?;

    // Warm-up builds every program and fills the pools
    if let Some(first) = inputs.first() {
        backend.run(session, &[("x", first.clone())], &["y"]).await?;
        debug!(programs = backend.program_count(), "Warm-up run finished");
    }

    let mut expected = Vec::with_capacity(inputs.len());
    let start = Instant::now();
    for x in &inputs {
        let outputs = backend.run(session, &[("x", x.clone())], &["y"]).await?;
        expected.push(outputs);
    }
    let run_time = start.elapsed();
    info!(?run_time, "Normal runs finished");

    backend.begin_capture(session)?;
    if let Some(first) = inputs.first() {
        backend.run(session, &[("x", first.clone())], &["y"]).await?;
    }
    backend.end_capture(session).context("Failed to freeze capture")?;
    debug!(buffers = backend.memory_stats().captured, "Capture frozen");

    let start = Instant::now();
    for (i, (x, expected)) in inputs.iter().zip(&expected).enumerate() {
        let outputs = backend.replay(session, &[("x", x.clone())]).await?;
        if outputs["y"].as_bytes()? != expected["y"].as_bytes()? {
            anyhow::bail!("Replay {i} differs from the normal run");
        }
    }
    let replay_time = start.elapsed();
    info!(?replay_time, "Replays finished");

    let stats = BenchStats {
        iterations: config.iterations,
        run_time,
        replay_time,
        memory: backend.memory_stats(),
        programs: backend.program_count(),
        dispatches,
    };
    backend.dispose(session)?;
    Ok(stats)
}

/// Print a short report.
pub fn print_report(config: &BenchConfig, stats: &BenchStats) {
    println!(
        "Demo graph: {}x{} f32, {} dispatches per run",
        config.shape.rows, config.shape.cols, stats.dispatches
    );
    println!("  Iterations: {}", stats.iterations);
    println!("  Run:    {:>10.3?} per iteration", stats.per_run());
    println!("  Replay: {:>10.3?} per iteration", stats.per_replay());
    if !stats.replay_time.is_zero() {
        println!(
            "  Speedup: {:.2}x",
            stats.run_time.as_secs_f64() / stats.replay_time.as_secs_f64()
        );
    }
    println!();
    let memory = &stats.memory;
    println!("Pool statistics:");
    println!("  Created: {}", memory.created);
    println!("  Reused: {}", memory.reused);
    println!("  Destroyed: {}", memory.destroyed);
    println!(
        "  In use: {} ({} bytes), idle: {}, captured: {}",
        memory.in_use, memory.bytes_in_use, memory.idle, memory.captured
    );
    println!("  Programs: {}", stats.programs);
}
