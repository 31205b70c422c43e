use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Type tag carried alongside every metric value.
///
/// The single-letter encoding is what the broker expects on the wire:
/// signed/unsigned 32/64-bit integers, double, or text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "i")]
    Int32,
    #[serde(rename = "I")]
    Uint32,
    #[serde(rename = "l")]
    Int64,
    #[serde(rename = "L")]
    Uint64,
    #[serde(rename = "n")]
    Double,
    #[serde(rename = "s")]
    Text,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Int32 => write!(f, "i"),
            MetricKind::Uint32 => write!(f, "I"),
            MetricKind::Int64 => write!(f, "l"),
            MetricKind::Uint64 => write!(f, "L"),
            MetricKind::Double => write!(f, "n"),
            MetricKind::Text => write!(f, "s"),
        }
    }
}

/// One typed metric value as it appears in the snapshot document:
/// `{"_type": "n", "_value": 12.5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "_type")]
    pub kind: MetricKind,
    #[serde(rename = "_value")]
    pub value: serde_json::Value,
}

impl Metric {
    pub fn int32(value: i32) -> Self {
        Self {
            kind: MetricKind::Int32,
            value: value.into(),
        }
    }

    pub fn uint32(value: u32) -> Self {
        Self {
            kind: MetricKind::Uint32,
            value: value.into(),
        }
    }

    pub fn int64(value: i64) -> Self {
        Self {
            kind: MetricKind::Int64,
            value: value.into(),
        }
    }

    pub fn uint64(value: u64) -> Self {
        Self {
            kind: MetricKind::Uint64,
            value: value.into(),
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            kind: MetricKind::Double,
            value: serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: MetricKind::Text,
            value: serde_json::Value::String(value.into()),
        }
    }
}

/// The snapshot document: metric name to typed value, flat.
pub type Metrics = HashMap<String, Metric>;
