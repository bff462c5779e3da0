//! Named metrics contributed by stages.
//!
//! The core only collects values; serialization belongs to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricSink {
    pub values: BTreeMap<String, MetricValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), MetricValue::Int(value));
    }

    pub fn set_float(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), MetricValue::Float(value));
    }

    pub fn set_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), MetricValue::Str(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(MetricValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn stamp(&mut self) {
        self.recorded_at = Some(Utc::now());
    }
}
