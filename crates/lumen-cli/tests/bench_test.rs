//! Integration tests for the benchmark on a host-emulating device.

use lumen_cli::bench::{bench, BenchConfig};
use lumen_cli::demo::DemoShape;
use lumen_runtime::{Backend, BackendConfig, RecordingDevice};
use std::io::Write;
use std::sync::{Arc, Mutex};

fn read_u32(bytes: &[u8], index: usize) -> usize {
    bytemuck::pod_read_unaligned::<u32>(&bytes[index * 4..index * 4 + 4]) as usize
}

fn binary(f: fn(f32, f32) -> f32) -> impl Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync {
    move |inputs, outputs, uniforms| {
        let (n, a_size, b_size) = (
            read_u32(uniforms, 0),
            read_u32(uniforms, 1),
            read_u32(uniforms, 2),
        );
        let a: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[0]);
        let b: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[1]);
        let y: Vec<f32> = (0..n).map(|i| f(a[i % a_size], b[i % b_size])).collect();
        outputs[0][..n * 4].copy_from_slice(bytemuck::cast_slice(&y));
    }
}

fn unary(f: fn(f32) -> f32) -> impl Fn(&[&[u8]], &mut [Vec<u8>], &[u8]) + Send + Sync {
    move |inputs, outputs, uniforms| {
        let n = read_u32(uniforms, 0);
        let x: Vec<f32> = bytemuck::pod_collect_to_vec(inputs[0]);
        let y: Vec<f32> = x[..n].iter().map(|&v| f(v)).collect();
        outputs[0][..n * 4].copy_from_slice(bytemuck::cast_slice(&y));
    }
}

fn demo_device() -> Arc<RecordingDevice> {
    Arc::new(
        RecordingDevice::new()
            .with_host_kernel("Mul", binary(|a, b| a * b))
            .with_host_kernel("Add", binary(|a, b| a + b))
            .with_host_kernel("Relu", unary(|x| x.max(0.0)))
            .with_host_kernel("Sigmoid", unary(|x| 1.0 / (1.0 + (-x).exp()))),
    )
}

#[pollster::test]
async fn test_bench_replays_match_runs() {
    let device = demo_device();
    let mut backend = Backend::new(Arc::clone(&device), BackendConfig::default()).unwrap();
    let config = BenchConfig {
        shape: DemoShape { rows: 4, cols: 16 },
        iterations: 5,
        seed: Some(42),
    };

    let stats = bench(&mut backend, &config).await.unwrap();

    assert_eq!(stats.iterations, 5);
    assert_eq!(stats.dispatches, 4);
    assert_eq!(stats.programs, 4);
    // warm-up + 5 runs + capture run, then 5 replays
    assert_eq!(device.counters().dispatches, 4 * 7 + 4 * 5);
    assert!(stats.memory.reused > 0);
    assert_eq!(stats.memory.captured, 9);
}

#[pollster::test]
async fn test_bench_releases_everything() {
    let device = demo_device();
    let mut backend = Backend::new(Arc::clone(&device), BackendConfig::default()).unwrap();
    let config = BenchConfig {
        shape: DemoShape { rows: 1, cols: 3 },
        iterations: 2,
        seed: Some(1),
    };

    bench(&mut backend, &config).await.unwrap();

    let memory = backend.memory_stats();
    assert_eq!(memory.in_use, 0);
    assert_eq!(memory.captured, 0);
    assert_eq!(device.counters().live_buffers(), memory.idle);
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_bench_reports_its_phases() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let device = demo_device();
    let mut backend = Backend::new(Arc::clone(&device), BackendConfig::default()).unwrap();
    let config = BenchConfig {
        shape: DemoShape { rows: 2, cols: 4 },
        iterations: 1,
        seed: Some(7),
    };
    tracing::subscriber::with_default(subscriber, || {
        pollster::block_on(bench(&mut backend, &config)).unwrap();
    });

    let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    for phase in [
        "Loaded demo graph",
        "Warm-up run finished",
        "Normal runs finished",
        "Capture frozen",
        "Replays finished",
    ] {
        assert!(text.contains(phase), "missing '{phase}' in:\n{text}");
    }
}
