// file: src/capture.rs
// description: Best-effort top-k routing capture for one MoE layer, safe to call from the inference hot loop.
// author: cipher-rc5

//! Routing capture sink.
//!
//! A [`RoutingCapture`] is built once by the process bootstrap and handed to the MoE
//! layers (usually behind an `Arc`). Every operation reports a [`CaptureStatus`] instead
//! of an error: a failed write degrades that one call and inference carries on.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CaptureConfig, ModelConfig, RoutingShape};
use crate::record::{MetaRecord, RouteRecord, TraceRecord, round_weight};
use crate::writer::TraceWriter;

pub const ENGINE_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("routing trace I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode routing record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("tensor conversion failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("expected a [tokens, top_k] tensor, got shape {0:?}")]
    TensorRank(Vec<usize>),
    #[error("invalid header: top_k {top_k} with {num_experts} experts")]
    InvalidHeader { top_k: usize, num_experts: usize },
    #[error("batch has {ids} id rows but {weights} weight rows")]
    RowCount { ids: usize, weights: usize },
    #[error("row {row}: {ids} expert ids but {weights} weights")]
    RowWidth { row: usize, ids: usize, weights: usize },
    #[error("row {row}: width {width} does not match top_k {top_k}")]
    TopK { row: usize, width: usize, top_k: usize },
    #[error("row {row}: expert id {expert} is outside 0..{num_experts}")]
    ExpertOutOfRange {
        row: usize,
        expert: i64,
        num_experts: usize,
    },
    #[error("row {row}: weight {col} is not finite")]
    NonFiniteWeight { row: usize, col: usize },
}

/// Outcome of one capture call. Callers on the hot path proceed whatever the variant.
#[derive(Debug)]
pub enum CaptureStatus {
    Written { records: usize },
    Disabled,
    Filtered,
    Degraded(CaptureError),
}

impl CaptureStatus {
    pub fn records_written(&self) -> usize {
        match self {
            Self::Written { records } => *records,
            _ => 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// Routing weights as they come off the router, in whatever float width it runs.
pub trait RoutingWeight: Copy {
    fn to_f64(self) -> f64;
}

impl RoutingWeight for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl RoutingWeight for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

impl RoutingWeight for f16 {
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

impl RoutingWeight for bf16 {
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }
}

/// What the engine knows at startup, written as the trace's meta record.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderInfo {
    pub model_id: String,
    pub top_k: usize,
    pub num_experts: usize,
    pub device: String,
    pub seed: Option<u64>,
    pub engine_version: String,
    pub runtime_version: String,
}

impl HeaderInfo {
    pub fn new(
        model_id: impl Into<String>,
        top_k: usize,
        num_experts: usize,
        device: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            top_k,
            num_experts,
            device: device.into(),
            seed: None,
            engine_version: ENGINE_VERSION.to_string(),
            runtime_version: "unknown".to_string(),
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    pub fn from_model_config(
        model_id: impl Into<String>,
        config: &ModelConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let shape = config.routing_shape()?;
        Ok(Self::new(
            model_id,
            shape.top_k,
            shape.num_experts,
            device_label(device),
        ))
    }
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

struct CaptureState<W: Write> {
    writer: Option<TraceWriter<W>>,
    request_counter: u64,
    shape: Option<RoutingShape>,
    token_offsets: HashMap<String, u64>,
}

pub struct RoutingCapture<W: Write = File> {
    logged_layer: usize,
    enabled: AtomicBool,
    state: Mutex<CaptureState<W>>,
}

impl RoutingCapture<File> {
    /// Opens the configured trace file for truncating writes.
    ///
    /// Never fails: without an output path, or when the file cannot be created, the
    /// returned sink is disabled and every call on it is a no-op.
    pub fn open(config: &CaptureConfig) -> Self {
        let Some(path) = config.output.as_deref() else {
            debug!("MoE routing capture disabled: no output path configured");
            return Self::disabled(config.logged_layer);
        };

        match create_trace_file(path) {
            Ok(file) => {
                info!(
                    "MoE routing capture enabled. Writing to {}, logging layer {}",
                    path.display(),
                    config.logged_layer
                );
                Self::from_writer(file, config.logged_layer)
            }
            Err(e) => {
                error!(
                    "Failed to open MoE routing trace {}: {}. Capture disabled.",
                    path.display(),
                    e
                );
                Self::disabled(config.logged_layer)
            }
        }
    }

    pub fn from_env() -> Self {
        Self::open(&CaptureConfig::from_env())
    }

    pub fn disabled(logged_layer: usize) -> Self {
        Self::with_writer(None, logged_layer)
    }
}

fn create_trace_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

impl<W: Write> RoutingCapture<W> {
    pub fn from_writer(writer: W, logged_layer: usize) -> Self {
        Self::with_writer(Some(TraceWriter::new(writer)), logged_layer)
    }

    fn with_writer(writer: Option<TraceWriter<W>>, logged_layer: usize) -> Self {
        Self {
            logged_layer,
            enabled: AtomicBool::new(writer.is_some()),
            state: Mutex::new(CaptureState {
                writer,
                request_counter: 0,
                shape: None,
                token_offsets: HashMap::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn logged_layer(&self) -> usize {
        self.logged_layer
    }

    pub fn requests_minted(&self) -> u64 {
        self.lock_state().request_counter
    }

    fn lock_state(&self) -> MutexGuard<'_, CaptureState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the meta record. Call exactly once, before the first batch.
    pub fn write_header(&self, info: &HeaderInfo) -> CaptureStatus {
        if !self.is_enabled() {
            return CaptureStatus::Disabled;
        }
        if info.top_k == 0 || info.top_k > info.num_experts {
            return degraded(
                "meta header",
                CaptureError::InvalidHeader {
                    top_k: info.top_k,
                    num_experts: info.num_experts,
                },
            );
        }

        let mut state = self.lock_state();
        if state.shape.is_some() {
            warn!("MoE routing trace header written more than once; the trace will not parse");
        }
        let Some(writer) = state.writer.as_mut() else {
            return CaptureStatus::Disabled;
        };

        let meta = MetaRecord {
            model_id: info.model_id.clone(),
            engine_version: info.engine_version.clone(),
            runtime_version: info.runtime_version.clone(),
            device: info.device.clone(),
            seed: info.seed,
            layers_logged: vec![self.logged_layer],
            top_k: info.top_k,
            num_experts: info.num_experts,
        };
        match writer.write_record(&TraceRecord::Meta(meta)) {
            Ok(()) => {
                state.shape = Some(RoutingShape {
                    top_k: info.top_k,
                    num_experts: info.num_experts,
                });
                CaptureStatus::Written { records: 1 }
            }
            Err(e) => degraded("meta header", e),
        }
    }

    /// Records one MoE layer invocation: one route record per row of `topk_ids`.
    ///
    /// All rows share one request id. Without `req_id` a fresh `r{n}` id is minted for
    /// the batch; a caller-supplied id continues its token count across calls until
    /// [`finish_request`](Self::finish_request).
    pub fn record_batch<I, R, T>(
        &self,
        layer_idx: usize,
        topk_ids: &[I],
        topk_weights: &[R],
        req_id: Option<&str>,
    ) -> CaptureStatus
    where
        I: AsRef<[u32]>,
        R: AsRef<[T]>,
        T: RoutingWeight,
    {
        if !self.is_enabled() {
            return CaptureStatus::Disabled;
        }
        if layer_idx != self.logged_layer {
            return CaptureStatus::Filtered;
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.writer.is_none() {
            return CaptureStatus::Disabled;
        }
        if let Err(e) = validate_batch(topk_ids, topk_weights, state.shape) {
            return degraded("routing batch", e);
        }

        // an unattributed call owns a fresh request id even when it carries no rows
        let (req_id, first_token, supplied) = match req_id {
            Some(id) => (
                id.to_string(),
                state.token_offsets.get(id).copied().unwrap_or(0),
                true,
            ),
            None => {
                let id = format!("r{}", state.request_counter);
                state.request_counter += 1;
                (id, 0, false)
            }
        };
        if topk_ids.is_empty() {
            return CaptureStatus::Written { records: 0 };
        }

        let records: Vec<TraceRecord> = topk_ids
            .iter()
            .zip(topk_weights)
            .enumerate()
            .map(|(row, (ids, weights))| {
                TraceRecord::Route(RouteRecord {
                    req_id: req_id.clone(),
                    token_idx: first_token + row as u64,
                    layer: layer_idx,
                    topk_ids: ids.as_ref().to_vec(),
                    topk_weights: weights
                        .as_ref()
                        .iter()
                        .map(|w| round_weight(w.to_f64()))
                        .collect(),
                })
            })
            .collect();

        let Some(writer) = state.writer.as_mut() else {
            return CaptureStatus::Disabled;
        };
        match writer.write_batch(&records) {
            Ok(written) => {
                if supplied {
                    state
                        .token_offsets
                        .insert(req_id, first_token + written as u64);
                }
                CaptureStatus::Written { records: written }
            }
            Err(e) => degraded("routing batch", e),
        }
    }

    /// Same as [`record_batch`](Self::record_batch) for router outputs still held as tensors.
    ///
    /// `topk_ids` may use any integer dtype and `topk_weights` any float dtype; both must
    /// be `[tokens, top_k]`. Tensors on an accelerator are copied to host first.
    pub fn record_tensors(
        &self,
        layer_idx: usize,
        topk_ids: &Tensor,
        topk_weights: &Tensor,
        req_id: Option<&str>,
    ) -> CaptureStatus {
        if !self.is_enabled() {
            return CaptureStatus::Disabled;
        }
        if layer_idx != self.logged_layer {
            return CaptureStatus::Filtered;
        }
        match tensors_to_rows(topk_ids, topk_weights) {
            Ok((ids, weights)) => self.record_batch(layer_idx, &ids, &weights, req_id),
            Err(e) => degraded("routing tensors", e),
        }
    }

    /// Drops the token offset kept for a caller-supplied request id.
    pub fn finish_request(&self, req_id: &str) {
        self.lock_state().token_offsets.remove(req_id);
    }

    /// Flushes and releases the trace. Safe to call repeatedly.
    pub fn close(&self) {
        self.enabled.store(false, Ordering::Release);
        let mut state = self.lock_state();
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.flush() {
                error!("Failed to flush MoE routing trace on close: {}", e);
            }
            debug!(
                "MoE routing trace closed after {} lines",
                writer.lines_written()
            );
        }
        state.token_offsets.clear();
    }

    /// Closes the sink and hands back the underlying stream, if it was still open.
    pub fn into_inner(self) -> Option<W> {
        self.enabled.store(false, Ordering::Release);
        let writer = self.lock_state().writer.take()?;
        match writer.into_inner() {
            Ok(inner) => Some(inner),
            Err(e) => {
                error!("Failed to flush MoE routing trace: {}", e);
                None
            }
        }
    }
}

impl<W: Write> Drop for RoutingCapture<W> {
    fn drop(&mut self) {
        self.close();
    }
}

fn degraded(what: &str, err: CaptureError) -> CaptureStatus {
    warn!("Failed to log MoE {}: {}", what, err);
    CaptureStatus::Degraded(err)
}

fn validate_batch<I, R, T>(
    topk_ids: &[I],
    topk_weights: &[R],
    shape: Option<RoutingShape>,
) -> Result<(), CaptureError>
where
    I: AsRef<[u32]>,
    R: AsRef<[T]>,
    T: RoutingWeight,
{
    if topk_ids.len() != topk_weights.len() {
        return Err(CaptureError::RowCount {
            ids: topk_ids.len(),
            weights: topk_weights.len(),
        });
    }

    let mut expected_width = shape.map(|s| s.top_k);
    for (row, (ids, weights)) in topk_ids.iter().zip(topk_weights).enumerate() {
        let (ids, weights) = (ids.as_ref(), weights.as_ref());
        if ids.len() != weights.len() {
            return Err(CaptureError::RowWidth {
                row,
                ids: ids.len(),
                weights: weights.len(),
            });
        }
        match expected_width {
            Some(top_k) if ids.len() != top_k => {
                return Err(CaptureError::TopK {
                    row,
                    width: ids.len(),
                    top_k,
                });
            }
            Some(_) => {}
            None => expected_width = Some(ids.len()),
        }
        if let Some(num_experts) = shape.map(|s| s.num_experts) {
            if let Some(&expert) = ids.iter().find(|&&id| id as usize >= num_experts) {
                return Err(CaptureError::ExpertOutOfRange {
                    row,
                    expert: expert as i64,
                    num_experts,
                });
            }
        }
        if let Some(col) = weights.iter().position(|w| !w.to_f64().is_finite()) {
            return Err(CaptureError::NonFiniteWeight { row, col });
        }
    }
    Ok(())
}

fn tensors_to_rows(
    topk_ids: &Tensor,
    topk_weights: &Tensor,
) -> Result<(Vec<Vec<u32>>, Vec<Vec<f32>>), CaptureError> {
    for t in [topk_ids, topk_weights] {
        if t.rank() != 2 {
            return Err(CaptureError::TensorRank(t.dims().to_vec()));
        }
    }

    let raw_ids = topk_ids
        .to_device(&Device::Cpu)?
        .to_dtype(DType::I64)?
        .to_vec2::<i64>()?;
    let mut ids = Vec::with_capacity(raw_ids.len());
    for (row, raw) in raw_ids.into_iter().enumerate() {
        let converted = raw
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| CaptureError::ExpertOutOfRange {
                    row,
                    expert: id,
                    num_experts: u32::MAX as usize,
                })
            })
            .collect::<Result<Vec<u32>, _>>()?;
        ids.push(converted);
    }

    let weights = topk_weights
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;
    Ok((ids, weights))
}
