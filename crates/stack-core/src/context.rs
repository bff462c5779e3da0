//! Execution Context: state shared by every stage of one workspace
use serde::{Deserialize, Serialize};

use crate::metrics::MetricSink;
use crate::weights::WeightVector;

/// Running statistics updated by `update_stats` callbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedStats {
    pub examples: u64,
    pub weighted_examples: f64,
    pub weighted_labeled: f64,
    pub sum_loss: f64,
    pub passes_complete: u32,
}

impl SharedStats {
    pub fn average_loss(&self) -> f64 {
        if self.weighted_labeled > 0.0 {
            self.sum_loss / self.weighted_labeled
        } else {
            0.0
        }
    }

    pub fn persist(&self, sink: &mut MetricSink) {
        sink.set_int("examples", self.examples as i64);
        sink.set_float("weighted_examples", self.weighted_examples);
        sink.set_float("average_loss", self.average_loss());
        sink.set_int("passes_complete", self.passes_complete as i64);
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub trace_id: String,
    pub weights: WeightVector,
    pub stats: SharedStats,
    /// Lines written by `output_prediction` callbacks
    pub predictions: Vec<String>,
    pub quiet: bool,
}

impl ExecutionContext {
    pub fn new(weights: WeightVector) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            weights,
            stats: SharedStats::default(),
            predictions: Vec::new(),
            quiet: false,
        }
    }
}
