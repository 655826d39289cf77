// file: src/trace.rs
// description: Parses a routing trace back into its meta header and route records, and builds the expert histogram.
// author: cipher-rc5

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::record::{MetaRecord, RouteRecord, TraceRecord};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read routing trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: malformed routing record: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("routing trace has no meta header")]
    MissingHeader,
    #[error("line {line}: second meta header in routing trace")]
    DuplicateHeader { line: usize },
    #[error("route record {record}: {reason}")]
    Inconsistent { record: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteTrace {
    pub meta: MetaRecord,
    pub routes: Vec<RouteRecord>,
}

impl RouteTrace {
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        Self::parse(BufReader::new(file))
    }

    /// Reads one record per line. The header may sit anywhere but must appear once.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, TraceError> {
        let mut meta = None;
        let mut routes = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = idx + 1;
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let record: TraceRecord = serde_json::from_str(text)
                .map_err(|source| TraceError::Malformed {
                    line: line_no,
                    source,
                })?;
            match record {
                TraceRecord::Meta(m) => {
                    if meta.is_some() {
                        return Err(TraceError::DuplicateHeader { line: line_no });
                    }
                    meta = Some(m);
                }
                TraceRecord::Route(r) => routes.push(r),
            }
        }

        let meta = meta.ok_or(TraceError::MissingHeader)?;
        debug!(
            "Parsed routing trace for {} with {} route records",
            meta.model_id,
            routes.len()
        );
        Ok(Self { meta, routes })
    }

    /// Checks every route against the header's top-k width, expert count and logged layers.
    pub fn verify(&self) -> Result<(), TraceError> {
        let top_k = self.meta.top_k;
        for (record, route) in self.routes.iter().enumerate() {
            if route.topk_ids.len() != route.topk_weights.len() {
                return Err(TraceError::Inconsistent {
                    record,
                    reason: format!(
                        "{} expert ids but {} weights",
                        route.topk_ids.len(),
                        route.topk_weights.len()
                    ),
                });
            }
            if route.width() != top_k {
                return Err(TraceError::Inconsistent {
                    record,
                    reason: format!("width {} does not match top_k {}", route.width(), top_k),
                });
            }
            if let Some(&expert) = route
                .topk_ids
                .iter()
                .find(|&&id| id as usize >= self.meta.num_experts)
            {
                return Err(TraceError::Inconsistent {
                    record,
                    reason: format!(
                        "expert id {} is outside 0..{}",
                        expert, self.meta.num_experts
                    ),
                });
            }
            if !self.meta.layers_logged.contains(&route.layer) {
                return Err(TraceError::Inconsistent {
                    record,
                    reason: format!(
                        "layer {} is not in layers_logged {:?}",
                        route.layer, self.meta.layers_logged
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn tokens(&self) -> usize {
        self.routes.len()
    }

    pub fn request_count(&self) -> usize {
        self.routes
            .iter()
            .map(|r| r.req_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn histogram(&self) -> ExpertHistogram {
        ExpertHistogram::build(&self.routes)
    }
}

/// Selection count per expert id, dense from 0 up to the highest id observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpertHistogram {
    counts: Vec<u64>,
}

impl ExpertHistogram {
    pub fn build(routes: &[RouteRecord]) -> Self {
        let mut counts: Vec<u64> = Vec::new();
        for id in routes.iter().flat_map(|r| r.topk_ids.iter()) {
            let id = *id as usize;
            if id >= counts.len() {
                counts.resize(id + 1, 0);
            }
            counts[id] += 1;
        }
        Self { counts }
    }

    pub fn from_counts(counts: Vec<u64>) -> Self {
        Self { counts }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn num_experts(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
