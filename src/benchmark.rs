// file: src/benchmark.rs
// description: Timing helpers and the log/no-log timing file used to measure routing capture overhead.
// author: cipher-rc5

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub duration: Duration,
    pub tokens_per_sec: f64,
}

pub struct Benchmark {
    start: Instant,
    operation: String,
}

impl Benchmark {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
        }
    }

    pub fn finish_with_tokens(self, num_tokens: usize) -> BenchmarkResult {
        let duration = self.start.elapsed();
        let tokens_per_sec = num_tokens as f64 / duration.as_secs_f64().max(f64::EPSILON);

        info!(
            "{} took {:?} ({:.2} tokens/sec)",
            self.operation, duration, tokens_per_sec
        );

        BenchmarkResult {
            duration,
            tokens_per_sec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Log,
    NoLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunTiming {
    pub wall_time_sec: f64,
    pub tokens_generated: usize,
}

impl RunTiming {
    pub fn from_result(result: &BenchmarkResult, tokens_generated: usize) -> Self {
        Self {
            wall_time_sec: result.duration.as_secs_f64(),
            tokens_generated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overhead {
    pub seconds: f64,
    pub percent: f64,
}

/// The `timing.json` file: one entry per capture mode, updated in place across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<RunTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_log: Option<RunTiming>,
}

impl TimingLog {
    /// A missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open timing file at {:?}", path))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse timing file at {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create timing file at {:?}", path))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn record(&mut self, mode: RunMode, timing: RunTiming) {
        match mode {
            RunMode::Log => self.log = Some(timing),
            RunMode::NoLog => self.no_log = Some(timing),
        }
    }

    pub fn overhead(&self) -> Option<Overhead> {
        let (log, no_log) = (self.log?, self.no_log?);
        if no_log.wall_time_sec <= 0.0 {
            return None;
        }
        let seconds = log.wall_time_sec - no_log.wall_time_sec;
        Some(Overhead {
            seconds,
            percent: seconds / no_log.wall_time_sec * 100.0,
        })
    }
}

/// Deterministic stand-in for a MoE router, for driving the capture path without a model.
pub struct SyntheticRouter {
    state: u64,
    top_k: usize,
    num_experts: usize,
}

impl SyntheticRouter {
    pub fn new(seed: u64, top_k: usize, num_experts: usize) -> Result<Self> {
        anyhow::ensure!(
            top_k > 0 && top_k <= num_experts,
            "top_k {} is not within 1..={}",
            top_k,
            num_experts
        );
        Ok(Self {
            state: seed | 1,
            top_k,
            num_experts,
        })
    }

    fn next_u64(&mut self) -> u64 {
        let mut s = self.state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.state = s;
        s
    }

    /// One token's distinct expert ids with weights summing to one.
    pub fn route_token(&mut self) -> (Vec<u32>, Vec<f32>) {
        let mut ids: Vec<u32> = Vec::with_capacity(self.top_k);
        while ids.len() < self.top_k {
            // skew towards low ids so the histogram is not flat
            let a = self.next_u64() % self.num_experts as u64;
            let b = self.next_u64() % self.num_experts as u64;
            let id = a.min(b) as u32;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        let mut weights: Vec<f32> = (0..self.top_k)
            .map(|_| ((self.next_u64() >> 40) as f32 / (1u64 << 24) as f32) + 0.01)
            .collect();
        let z: f32 = weights.iter().sum();
        for w in &mut weights {
            *w /= z;
        }
        weights.sort_by(|a, b| b.total_cmp(a));
        (ids, weights)
    }

    pub fn route_batch(&mut self, tokens: usize) -> (Vec<Vec<u32>>, Vec<Vec<f32>>) {
        (0..tokens).map(|_| self.route_token()).unzip()
    }
}
