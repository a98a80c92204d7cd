use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tarn_core::{DType, Device, Engine, EngineConfig, Result, Scope, TarnError, Tensor};
use tarn_kernels::Signature;
use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
 _____  _    ____  _   _
|_   _|/ \  |  _ \| \ | |
  | | / _ \ | |_) |  \| |
  | |/ ___ \|  _ <| |\  |
  |_/_/   \_\_| \_\_| \_|"#;

#[derive(Parser)]
#[command(
    name = "tarn",
    about = "Tarn lazy tensor engine CLI",
    long_about = "Inspect the engine configuration, measure transfer/compute overlap on\nthe virtual accelerator, and check custom kernel fragments.",
    version
)]
struct Cli {
    /// JSON engine configuration; TARN_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the effective engine configuration
    Info {
        /// Print the configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare synced runs on a resident input with fetched runs on fresh uploads
    Bench {
        /// Square matrix size
        #[arg(long, default_value = "128")]
        size: usize,
        /// Number of computations per phase
        #[arg(long, default_value = "10")]
        runs: usize,
        /// Matmul + relu layers per computation
        #[arg(long, default_value = "4")]
        layers: usize,
        /// Override the simulated link latency (microseconds)
        #[arg(long)]
        latency_us: Option<u64>,
    },
    /// Parse and check a kernel fragment
    Check {
        /// Fragment source file
        file: PathBuf,
        /// Rank of each input tensor (comma-separated, e.g. "2,1")
        #[arg(long, default_value = "")]
        inputs: String,
        /// Rank of the output tensor
        #[arg(long, default_value = "1")]
        output: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Info { json } => cmd_info(config, json),
        Commands::Bench {
            size,
            runs,
            layers,
            latency_us,
        } => cmd_bench(config, size, runs, layers, latency_us),
        Commands::Check { file, inputs, output } => cmd_check(&file, &inputs, output),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let base = match path {
        Some(p) => EngineConfig::from_json_file(p)?,
        None => EngineConfig::default(),
    };
    let config = base.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn cmd_info(config: EngineConfig, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(&config).map_err(|e| TarnError::Config(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    println!("{}", BANNER);
    println!("  v{}  lazy tensor engine\n", env!("CARGO_PKG_VERSION"));

    println!("Engine");
    println!("  accelerators:      {}", config.accelerators);
    println!("  default device:    {}", config.default_device);
    println!("  link latency:      {:?}", config.link_latency());
    println!("  overlap tolerance: {:?}", config.overlap_tolerance());
    println!("  eager:             {}", config.eager);

    println!("\nStreams");
    println!("  host, callback");
    for i in 0..config.accelerators {
        println!("  copy{i}, compute{i}");
    }

    println!("\nDTypes");
    println!("  {}", [DType::F32, DType::F64, DType::I32, DType::I64].map(|d| d.to_string()).join(", "));

    let live = tarn_core::liveness::snapshot();
    println!("\nLive objects: {} buffers, {} nodes", live.buffers, live.nodes);

    let kernels = tarn_kernels::cache::program_cache().stats();
    println!("Kernel cache: {}/{} programs", kernels.cached_programs, kernels.capacity);
    Ok(())
}

fn input_values(size: usize, seed: usize) -> Vec<Vec<f32>> {
    (0..size)
        .map(|r| (0..size).map(|c| (((r * 7 + c * 3 + seed) % 13) as f32 - 6.0) * 0.05).collect())
        .collect()
}

fn network(x: &Tensor, w: &Tensor, layers: usize) -> Result<Tensor> {
    let mut h = x.clone();
    for _ in 0..layers {
        h = h.matmul(w)?.relu()?;
    }
    Ok(h)
}

fn cmd_bench(mut config: EngineConfig, size: usize, runs: usize, layers: usize, latency_us: Option<u64>) -> Result<()> {
    if config.accelerators == 0 {
        return Err(TarnError::DeviceUnavailable {
            device: Device::Accel(0),
            available: 0,
        });
    }
    if let Some(us) = latency_us {
        config.link_latency_us = us;
    }
    let tolerance = config.overlap_tolerance();
    let engine = Engine::new(config)?;
    let scope: Scope = engine.scope(Device::Accel(0))?;

    println!("=== Tarn Overlap Benchmark ===");
    println!(
        "{size}x{size} f32, {layers} layers, {runs} runs, link latency {:?}\n",
        engine.config().link_latency()
    );

    let w = scope.array(input_values(size, 1))?;
    let x = scope.array(input_values(size, 0))?;
    network(&x, &w, layers)?.sync()?;
    engine.reset_stats();

    let start = Instant::now();
    for _ in 0..runs {
        network(&x, &w, layers)?.sync()?;
    }
    let t_sync = start.elapsed();
    let sync_stats = engine.stats();
    engine.reset_stats();

    let failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let start = Instant::now();
    for seed in 0..runs {
        let fresh = scope.array(input_values(size, seed))?;
        let failures = Arc::clone(&failures);
        network(&fresh, &w, layers)?.fetch(move |r| {
            if let Err(e) = r {
                tracing::error!(error = %e, "fetched run failed");
                failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        })?;
    }
    engine.sync_all(true)?;
    let t_fetch = start.elapsed();
    let fetch_stats = engine.stats();

    let per_run = |d: Duration| d.as_secs_f64() * 1000.0 / runs.max(1) as f64;
    println!("{:<28} {:>10} {:>12}", "Phase", "Total (ms)", "Per run (ms)");
    println!("{}", "-".repeat(52));
    println!("{:<28} {:>10.2} {:>12.2}", "sync, resident input", t_sync.as_secs_f64() * 1000.0, per_run(t_sync));
    println!("{:<28} {:>10.2} {:>12.2}", "fetch, fresh uploads", t_fetch.as_secs_f64() * 1000.0, per_run(t_fetch));
    println!("\n  {sync_stats}");
    println!("  {fetch_stats}");

    let within = t_fetch < t_sync + tolerance;
    println!(
        "\nOverlap: {} (tolerance {:?})",
        if within { "within tolerance" } else { "EXCEEDED" },
        tolerance
    );

    let failed = failures.load(std::sync::atomic::Ordering::Relaxed);
    if failed > 0 {
        return Err(TarnError::KernelExecution {
            kernel: "bench".into(),
            message: format!("{failed} fetched run(s) failed"),
        });
    }
    Ok(())
}

fn parse_ranks(list: &str) -> Result<Vec<usize>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| TarnError::Config(format!("invalid rank {s:?} in --inputs")))
        })
        .collect()
}

fn cmd_check(file: &PathBuf, inputs: &str, output: usize) -> Result<()> {
    let source = std::fs::read_to_string(file).map_err(|e| TarnError::Config(format!("{}: {e}", file.display())))?;
    let signature = Signature::new(parse_ranks(inputs)?, output);
    let name = file.display().to_string();

    tarn_kernels::parse(&source, &signature).map_err(|e| TarnError::from_kernel(&name, e))?;
    println!("{name}: ok ({} input(s), output rank {output})", signature.input_ranks.len());
    Ok(())
}
