// file: src/config.rs
// description: Capture settings resolved from the environment and MoE routing shape read from config.json.
// author: cipher-rc5

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const LOG_PATH_ENV: &str = "MOE_ROUTE_LOG";
pub const LOG_LAYER_ENV: &str = "MOE_ROUTE_LOG_LAYER";

/// Where routing capture goes and which MoE layer it watches.
///
/// Capture is enabled exactly when an output path is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConfig {
    pub output: Option<PathBuf>,
    pub logged_layer: usize,
}

impl CaptureConfig {
    pub fn new(output: impl Into<PathBuf>, logged_layer: usize) -> Self {
        Self {
            output: Some(output.into()),
            logged_layer,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the settings through `lookup` so callers can inject their own source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let output = lookup(LOG_PATH_ENV)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let logged_layer = match lookup(LOG_LAYER_ENV) {
            None => 0,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(layer) => layer,
                Err(_) => {
                    tracing::warn!(
                        "Invalid {} value: {:?}. Using default layer 0.",
                        LOG_LAYER_ENV,
                        raw
                    );
                    0
                }
            },
        };

        Self {
            output,
            logged_layer,
        }
    }

    pub fn enabled(&self) -> bool {
        self.output.is_some()
    }
}

/// The subset of a checkpoint's config.json that describes expert routing.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(alias = "num_local_experts")]
    pub num_experts: Option<usize>,
    #[serde(alias = "num_experts_per_tok", alias = "moe_top_k")]
    pub experts_per_token: Option<usize>,
}

/// Top-k width and expert count of a MoE model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingShape {
    pub top_k: usize,
    pub num_experts: usize,
}

impl ModelConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join("config.json")
        } else {
            path.to_path_buf()
        };
        let file = File::open(&config_path)
            .with_context(|| format!("Failed to open config.json at {:?}", config_path))?;
        let config: ModelConfig = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse config.json at {:?}", config_path))?;
        Ok(config)
    }

    pub fn supports_moe(&self) -> bool {
        self.num_experts.is_some_and(|n| n > 0)
    }

    pub fn routing_shape(&self) -> Result<RoutingShape> {
        let num_experts = self
            .num_experts
            .filter(|&n| n > 0)
            .ok_or_else(|| anyhow::anyhow!("model config does not declare any experts"))?;
        let top_k = self.experts_per_token.unwrap_or(2);
        anyhow::ensure!(
            top_k > 0 && top_k <= num_experts,
            "experts_per_token {} is not within 1..={}",
            top_k,
            num_experts
        );
        Ok(RoutingShape { top_k, num_experts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn no_path_means_disabled() {
        let cfg = CaptureConfig::from_lookup(lookup(&[(LOG_LAYER_ENV, "3")]));
        assert!(!cfg.enabled());
        assert_eq!(cfg.logged_layer, 3);

        let blank = CaptureConfig::from_lookup(lookup(&[(LOG_PATH_ENV, "  ")]));
        assert!(!blank.enabled());
    }

    #[test]
    fn invalid_layer_falls_back_to_zero() {
        for raw in ["abc", "-1", "1.5", ""] {
            let cfg = CaptureConfig::from_lookup(lookup(&[
                (LOG_PATH_ENV, "/tmp/routes.jsonl"),
                (LOG_LAYER_ENV, raw),
            ]));
            assert!(cfg.enabled());
            assert_eq!(cfg.logged_layer, 0, "raw={raw:?}");
        }
    }

    #[test]
    fn hf_aliases_resolve_routing_shape() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"_name_or_path":"Qwen/Qwen1.5-MoE-A2.7B-Chat","num_hidden_layers":24,
                "num_experts":60,"num_experts_per_tok":4}"#,
        )
        .unwrap();
        let shape = cfg.routing_shape().unwrap();
        assert_eq!(shape, RoutingShape { top_k: 4, num_experts: 60 });

        let mixtral: ModelConfig = serde_json::from_str(r#"{"num_local_experts":8}"#).unwrap();
        assert_eq!(
            mixtral.routing_shape().unwrap(),
            RoutingShape { top_k: 2, num_experts: 8 }
        );

        let too_wide: ModelConfig =
            serde_json::from_str(r#"{"num_experts":4,"num_experts_per_tok":5}"#).unwrap();
        assert!(too_wide.routing_shape().is_err());
    }

    #[test]
    fn dense_model_has_no_routing_shape() {
        let cfg: ModelConfig = serde_json::from_str(r#"{"n_layer":12}"#).unwrap();
        assert!(!cfg.supports_moe());
        assert!(cfg.routing_shape().is_err());
    }
}
