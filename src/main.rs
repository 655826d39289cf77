// file: src/main.rs
// description: CLI entrypoint for analyzing routing traces and measuring routing capture overhead.
// author: cipher-rc5

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use moe_route_trace::benchmark::{Benchmark, RunMode, RunTiming, SyntheticRouter, TimingLog};
use moe_route_trace::{CaptureConfig, HeaderInfo, RoutingCapture, analyze_trace, render_text};
use std::path::{Path, PathBuf};
use tracing::{Level, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "MoE expert routing trace tools")]
struct Args {
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute expert usage metrics from a routing trace
    Analyze {
        #[arg(long, default_value = "moe_routes.jsonl")]
        trace: PathBuf,

        #[arg(long, default_value = "expert_metrics.json")]
        metrics_out: PathBuf,

        #[arg(long, action = ArgAction::SetTrue, help = "Check every record against the header")]
        strict: bool,
    },
    /// Drive the capture path with synthetic routing and record timing
    Bench {
        #[arg(long, default_value = "moe_routes.jsonl")]
        output: PathBuf,

        #[arg(long, default_value_t = 0)]
        layer: usize,

        #[arg(long, default_value_t = 4096)]
        tokens: usize,

        #[arg(long, default_value_t = 16)]
        batch: usize,

        #[arg(long, default_value_t = 4)]
        top_k: usize,

        #[arg(long, default_value_t = 60)]
        experts: usize,

        #[arg(long, default_value_t = 1234)]
        seed: u64,

        #[arg(long, default_value = "timing.json")]
        timing: PathBuf,

        #[arg(long, action = ArgAction::SetTrue)]
        no_log: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    match args.command {
        Command::Analyze {
            trace,
            metrics_out,
            strict,
        } => run_analyze(&trace, &metrics_out, strict),
        Command::Bench {
            output,
            layer,
            tokens,
            batch,
            top_k,
            experts,
            seed,
            timing,
            no_log,
        } => {
            let settings = BenchSettings {
                layer,
                tokens,
                batch: batch.max(1),
                top_k,
                experts,
                seed,
            };
            let config = if no_log {
                CaptureConfig::disabled()
            } else {
                CaptureConfig::new(output, layer)
            };
            run_bench(&config, &settings, &timing)
        }
    }
}

fn run_analyze(trace_path: &Path, metrics_out: &Path, strict: bool) -> Result<()> {
    let (trace, report) = analyze_trace(trace_path, strict)?;
    if trace.routes.is_empty() {
        anyhow::bail!("No routing records found in {}", trace_path.display());
    }
    info!("Loaded metadata and {} routing records", trace.routes.len());

    println!("{}", render_text(&trace.meta, &report));

    report.save(metrics_out)?;
    info!("Saved metrics to {}", metrics_out.display());
    Ok(())
}

struct BenchSettings {
    layer: usize,
    tokens: usize,
    batch: usize,
    top_k: usize,
    experts: usize,
    seed: u64,
}

fn run_bench(config: &CaptureConfig, s: &BenchSettings, timing_path: &Path) -> Result<()> {
    let mode = if config.enabled() {
        RunMode::Log
    } else {
        RunMode::NoLog
    };
    let capture = RoutingCapture::open(config);
    let header = HeaderInfo::new("synthetic-router", s.top_k, s.experts, "cpu")
        .with_seed(Some(s.seed));
    capture.write_header(&header);

    let mut router = SyntheticRouter::new(s.seed, s.top_k, s.experts)?;
    let mut degraded = 0usize;
    let bench = Benchmark::new(format!("routing capture ({:?})", mode));
    let mut remaining = s.tokens;
    while remaining > 0 {
        let n = remaining.min(s.batch);
        let (ids, weights) = router.route_batch(n);
        if capture
            .record_batch(s.layer, &ids, &weights, None)
            .is_degraded()
        {
            degraded += 1;
        }
        remaining -= n;
    }
    capture.close();
    let result = bench.finish_with_tokens(s.tokens);
    println!(
        "{:?}: {} tokens in {:.3}s ({:.2} tokens/sec)",
        mode,
        s.tokens,
        result.duration.as_secs_f64(),
        result.tokens_per_sec
    );

    if degraded > 0 {
        warn!("{} batches could not be captured", degraded);
    }

    let mut timing = TimingLog::load(timing_path)?;
    timing.record(mode, RunTiming::from_result(&result, s.tokens));
    timing.save(timing_path)?;
    info!("Updated {} with {:?} results", timing_path.display(), mode);

    if let Some(overhead) = timing.overhead() {
        println!(
            "Logging overhead: {:.3}s ({:.2}%)",
            overhead.seconds, overhead.percent
        );
    }
    Ok(())
}
