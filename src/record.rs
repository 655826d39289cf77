// file: src/record.rs
// description: JSON-lines record shapes for the routing trace (meta header and per-token route records).
// author: cipher-rc5

use serde::{Deserialize, Serialize};

/// Decimal places kept for routing weights in the trace.
pub const WEIGHT_DECIMALS: i32 = 6;

/// One line of a routing trace, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceRecord {
    Meta(MetaRecord),
    Route(RouteRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub model_id: String,
    #[serde(alias = "vllm_version")]
    pub engine_version: String,
    #[serde(alias = "torch_version")]
    pub runtime_version: String,
    pub device: String,
    pub seed: Option<u64>,
    pub layers_logged: Vec<usize>,
    pub top_k: usize,
    pub num_experts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub req_id: String,
    pub token_idx: u64,
    pub layer: usize,
    pub topk_ids: Vec<u32>,
    pub topk_weights: Vec<f64>,
}

impl RouteRecord {
    pub fn width(&self) -> usize {
        self.topk_ids.len()
    }
}

pub fn round_weight(w: f64) -> f64 {
    let scale = 10f64.powi(WEIGHT_DECIMALS);
    (w * scale).round() / scale
}
