//! Core data model: variable identifiers, values, and samples.
//!
//! The gateway is protocol-agnostic: adapters decode device payloads into
//! [`Value`]s and everything downstream (cache, subscriptions, TCP API)
//! works on [`Sample`]s keyed by [`VarId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::quality::Quality;

/// Stable variable identifier: strictly positive, unique across the whole
/// configuration, preserved across restarts once assigned.
pub type VarId = i64;

/// A protocol-agnostic value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Floating-point number (analog readings).
    Float(f64),

    /// Integer value (counters, raw registers).
    Integer(i64),

    /// Boolean value (coils, digital inputs).
    Bool(bool),

    /// String value (device labels, firmware strings).
    String(String),

    /// Absent value; used when quality is not `Good`.
    #[default]
    Null,
}

impl Value {
    /// Try to get the value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get the value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to get the value as string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Check if this is the null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert into a `serde_json::Value` for wire payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Float(v) => serde_json::json!(v),
            Self::Integer(v) => serde_json::json!(v),
            Self::Bool(v) => serde_json::json!(v),
            Self::String(s) => serde_json::json!(s),
            Self::Null => serde_json::Value::Null,
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Declared type of a configured variable.
///
/// Drives the adapter's register/coil dispatch; the tags match the config
/// file's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    /// Two holding registers, IEEE-754 single precision.
    #[serde(rename = "float32")]
    Float32,

    /// One holding register, unsigned.
    #[serde(rename = "uint16")]
    Uint16,

    /// One coil.
    #[serde(rename = "bool")]
    Bool,

    /// Contiguous holding registers, ASCII, NUL-trimmed.
    #[serde(rename = "string")]
    String,
}

impl VarType {
    /// Wire/config representation of the type tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Uint16 => "uint16",
            Self::Bool => "bool",
            Self::String => "string",
        }
    }
}

/// One observation of a variable.
///
/// Samples are immutable once appended to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The observed value; `Value::Null` when quality is not `Good`.
    pub value: Value,

    /// Wall-clock time at capture.
    pub timestamp: DateTime<Utc>,

    /// Data quality indicator.
    pub quality: Quality,
}

impl Sample {
    /// Create a sample stamped with the current wall-clock time.
    pub fn now(value: Value, quality: Quality) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            quality,
        }
    }

    /// Compact wire form `{v, t, q}` with `t` as epoch milliseconds, used
    /// by history replies.
    pub fn compact(&self) -> serde_json::Value {
        serde_json::json!({
            "v": self.value.to_json(),
            "t": self.timestamp.timestamp_millis(),
            "q": self.quality.as_str(),
        })
    }
}
