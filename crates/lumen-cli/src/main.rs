//! Lumen CLI - inspect the GPU adapter and benchmark execution.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lumen_cli::bench::{bench, print_report, BenchConfig};
use lumen_cli::demo::DemoShape;
use lumen_runtime::{Backend, BackendConfig, DeviceOptions, GpuDevice, WgpuDevice};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "GPU tensor execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level for the engine (overridden by RUST_LOG)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Graphics backend to request
    #[arg(long, global = true, default_value = "all")]
    backend: BackendChoice,

    /// Use the software fallback adapter
    #[arg(long, global = true)]
    fallback: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendChoice {
    All,
    Vulkan,
    Metal,
    Dx12,
    Gl,
}

impl BackendChoice {
    fn backends(self) -> wgpu::Backends {
        match self {
            BackendChoice::All => wgpu::Backends::all(),
            BackendChoice::Vulkan => wgpu::Backends::VULKAN,
            BackendChoice::Metal => wgpu::Backends::METAL,
            BackendChoice::Dx12 => wgpu::Backends::DX12,
            BackendChoice::Gl => wgpu::Backends::GL,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the selected adapter and its limits
    Info,
    /// Benchmark normal runs against capture replay on a demo graph
    Bench {
        /// Rows of the demo input
        #[arg(long, default_value = "256")]
        rows: usize,

        /// Columns of the demo input
        #[arg(long, default_value = "1024")]
        cols: usize,

        /// Timed iterations per mode
        #[arg(short = 'n', long, default_value = "100")]
        iterations: usize,

        /// Seed for constants and inputs
        #[arg(long)]
        seed: Option<u64>,

        /// Workgroup size passed to every kernel
        #[arg(long)]
        workgroup_size: Option<u32>,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lumen_runtime={level},lumen_cli={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = DeviceOptions {
        backends: cli.backend.backends(),
        force_fallback_adapter: cli.fallback,
        ..Default::default()
    };

    match cli.command {
        Commands::Info => cmd_info(&options),
        Commands::Bench {
            rows,
            cols,
            iterations,
            seed,
            workgroup_size,
        } => {
            let mut config = BackendConfig::default();
            if let Some(size) = workgroup_size {
                config = config.with_workgroup_size(size);
            }
            let bench_config = BenchConfig {
                shape: DemoShape { rows, cols },
                iterations,
                seed,
            };
            cmd_bench(&options, config, &bench_config)
        }
    }
}

fn cmd_info(options: &DeviceOptions) -> Result<()> {
    let device = pollster::block_on(WgpuDevice::new(options))
        .context("Failed to initialize GPU device")?;
    let info = device.adapter_info();
    let limits = device.limits();

    println!("Adapter: {}", info.name);
    println!("  Backend: {:?}", info.backend);
    println!("  Device type: {:?}", info.device_type);
    println!("  Driver: {} {}", info.driver, info.driver_info);
    println!();
    println!("Limits:");
    println!(
        "  Workgroups per dimension: {}",
        limits.max_workgroups_per_dimension
    );
    println!("  Max buffer size: {} bytes", limits.max_buffer_size);
    println!(
        "  Max storage binding: {} bytes",
        limits.max_storage_buffer_binding_size
    );
    Ok(())
}

fn cmd_bench(options: &DeviceOptions, config: BackendConfig, bench_config: &BenchConfig) -> Result<()> {
    if bench_config.shape.is_empty() {
        anyhow::bail!("Demo shape must have at least one element");
    }
    pollster::block_on(async {
        let mut backend = Backend::with_wgpu(options, config)
            .await
            .context("Failed to initialize GPU backend")?;
        let stats = bench(&mut backend, bench_config).await?;
        print_report(bench_config, &stats);
        Ok(())
    })
}
