//! Result envelope returned for every session that was spawned
//!
//! The envelope must survive strict JSON, which has no encoding for NaN or the
//! infinities. Non-finite floats therefore travel as a one-key object,
//! `{"$nonfinite": "NaN"}`, both from the harness and from [`DataValue`]'s own
//! serializer.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Key of the single-entry object used for non-finite floats.
pub const NON_FINITE_KEY: &str = "$nonfinite";

/// A single cell or scalar produced by a script.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl DataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Str(value.to_string())
    }
}

fn non_finite_label(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn parse_non_finite(label: &str) -> Option<f64> {
    match label {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataValue::Null => serializer.serialize_unit(),
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Int(i) => serializer.serialize_i64(*i),
            DataValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            DataValue::Float(f) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NON_FINITE_KEY, non_finite_label(*f))?;
                map.end()
            }
            DataValue::Str(s) => serializer.serialize_str(s),
        }
    }
}

struct DataValueVisitor;

impl<'de> Visitor<'de> for DataValueVisitor {
    type Value = DataValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, a boolean, a number, a string or a non-finite sentinel")
    }

    fn visit_unit<E: de::Error>(self) -> Result<DataValue, E> {
        Ok(DataValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<DataValue, E> {
        Ok(DataValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<DataValue, D::Error> {
        deserializer.deserialize_any(DataValueVisitor)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<DataValue, E> {
        Ok(DataValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<DataValue, E> {
        Ok(DataValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<DataValue, E> {
        Ok(i64::try_from(v)
            .map(DataValue::Int)
            .unwrap_or(DataValue::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<DataValue, E> {
        Ok(DataValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<DataValue, E> {
        Ok(DataValue::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<DataValue, E> {
        Ok(DataValue::Str(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<DataValue, A::Error> {
        let key: String = map
            .next_key()?
            .ok_or_else(|| de::Error::custom("empty object is not a data value"))?;
        if key != NON_FINITE_KEY {
            return Err(de::Error::unknown_field(&key, &[NON_FINITE_KEY]));
        }
        let label: String = map.next_value()?;
        let value = parse_non_finite(&label)
            .ok_or_else(|| de::Error::custom(format!("unknown non-finite label '{}'", label)))?;
        if map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom("non-finite sentinel must have exactly one key"));
        }
        Ok(DataValue::Float(value))
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DataValueVisitor)
    }
}

/// Base64 transport for image payloads inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One captured value. Every variant has already been capped by the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedValue {
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<DataValue>>,
        /// Row count before the row cap was applied
        total_rows: u64,
        /// Column count before the column cap was applied
        total_columns: u64,
        #[serde(default)]
        truncated: bool,
    },
    Scalar {
        value: DataValue,
    },
    Text {
        value: String,
        #[serde(default)]
        truncated: bool,
    },
    Image {
        #[serde(with = "base64_bytes")]
        encoded_bytes: Vec<u8>,
        mime: String,
    },
}

impl TypedValue {
    pub fn scalar(value: impl Into<DataValue>) -> Self {
        TypedValue::Scalar {
            value: value.into(),
        }
    }
}

/// A captured value together with the name it was captured under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub value: TypedValue,
}

/// Which ceiling a forcibly terminated session ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Timeout,
    Memory,
    Cpu,
    OutputSize,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Timeout => "timeout",
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::OutputSize => "output_size",
        };
        f.write_str(label)
    }
}

/// The envelope: exactly one variant per executed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        outputs: Vec<Output>,
        stdout_text: String,
        #[serde(default)]
        stdout_truncated: bool,
    },
    RuntimeFailure {
        error_kind: String,
        message: String,
        trace: String,
    },
    ResourceExceeded {
        kind: ResourceKind,
    },
    InfrastructureFailure {
        reason: String,
    },
}

impl ExecutionResult {
    /// Short label used in logs and metrics-free summaries.
    pub fn variant_name(&self) -> &'static str {
        match self {
            ExecutionResult::Success { .. } => "success",
            ExecutionResult::RuntimeFailure { .. } => "runtime_failure",
            ExecutionResult::ResourceExceeded { .. } => "resource_exceeded",
            ExecutionResult::InfrastructureFailure { .. } => "infrastructure_failure",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn outputs(&self) -> &[Output] {
        match self {
            ExecutionResult::Success { outputs, .. } => outputs,
            _ => &[],
        }
    }
}
