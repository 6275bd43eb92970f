// SPDX-License-Identifier: Apache-2.0

//! Declarative record binding.
//!
//! A form maps one matched block plus its processing context onto a typed,
//! possibly nested record. Field kinds:
//!
//! - `capture`: a named group from the block's boundary/binding pattern
//! - `context`: a processing-context value (path, offsets, source, channel),
//!   optionally refined by a secondary extraction regex
//! - `constant`: a fixed value
//! - `computed`: a named pure function over already-resolved fields
//! - `formatted`: a `{field}` template over already-resolved fields
//! - `record`: a nested sub-form, bound recursively
//!
//! Evaluation is two passes: captures/context/constants/sub-records first,
//! then computed/formatted fields in dependency order. The order is fixed and
//! cycle-checked when the form is compiled, not at first use.

mod binder;

pub use binder::{BindContext, BindSource, CompiledForm};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Deserialize;

use crate::error::{Error, Result};

/// A bound field value. `Absent` is a sentinel, not an error: computed fields
/// propagate it, defaults replace it, and only a missing required field
/// escalates to a binding error.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Datetime(DateTime<FixedOffset>),
    Record(BTreeMap<String, Value>),
    Absent,
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// JSON rendering used by sinks that serialize records.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::json!(f),
            Value::Datetime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Record(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Absent => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Datetime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Record(_) => write!(f, "{}", self.to_json()),
            Value::Absent => write!(f, ""),
        }
    }
}

/// Declared type of a field.
#[derive(Debug, Clone)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Datetime { format: String },
}

impl FieldType {
    /// Parse a raw captured/extracted string into this type.
    pub fn parse(&self, field: &str, raw: &str) -> Result<Value> {
        match self {
            FieldType::String => Ok(Value::Str(raw.to_string())),
            FieldType::Integer => raw.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                Error::Binding(format!("field \"{field}\": {raw:?} is not an integer"))
            }),
            FieldType::Float => raw.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                Error::Binding(format!("field \"{field}\": {raw:?} is not a float"))
            }),
            FieldType::Datetime { format } => parse_datetime(raw, format).ok_or_else(|| {
                Error::Binding(format!(
                    "field \"{field}\": {raw:?} does not match datetime format {format:?}"
                ))
            }),
        }
    }
}

/// Try the configured format with a timezone first, then as a naive datetime
/// assumed UTC.
fn parse_datetime(raw: &str, format: &str) -> Option<Value> {
    if let Ok(dt) = DateTime::parse_from_str(raw, format) {
        return Some(Value::Datetime(dt));
    }
    NaiveDateTime::parse_from_str(raw, format)
        .ok()
        .map(|naive| Value::Datetime(naive.and_utc().fixed_offset()))
}

/// Context string a `context` field reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKey {
    Path,
    Begin,
    End,
    Source,
    Channel,
}

/// One field in a declarative form, as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKindSpec,
    #[serde(rename = "type")]
    pub ty: Option<String>,
    pub format: Option<String>,
    pub default: Option<toml::Value>,
    #[serde(default)]
    pub optional: bool,
    pub min: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKindSpec {
    Capture {
        group: Option<String>,
    },
    Context {
        from: ContextKey,
        pattern: Option<String>,
    },
    Constant {
        value: toml::Value,
    },
    Computed {
        function: String,
        depends: Vec<String>,
    },
    Formatted {
        template: String,
    },
    Record {
        fields: BTreeMap<String, FieldSpec>,
    },
}

/// A whole form: named fields, unordered as written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormSpec {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// Signature of a computed-field function: resolved dependencies in, value
/// out. Returning `Absent` is how missing inputs propagate; functions never
/// error.
pub type ComputeFn = dyn Fn(&BTreeMap<String, Value>) -> Value + Send + Sync;

/// Named pure functions available to `computed` fields. Populated explicitly;
/// there is no reflective lookup.
#[derive(Clone, Default)]
pub struct FnRegistry {
    map: HashMap<String, Arc<ComputeFn>>,
}

impl FnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin derivations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("severity_from_status", |deps| {
            let status = deps.values().find_map(|v| v.as_int());
            match status {
                Some(code) if code >= 500 => Value::Str("error".to_string()),
                Some(_) => Value::Str("info".to_string()),
                None => Value::Absent,
            }
        });
        // Access logs use "-" for a missing value; map it to the sentinel.
        registry.register("dash_is_absent", |deps| match deps.values().next() {
            Some(Value::Str(s)) if s == "-" => Value::Absent,
            Some(v) => v.clone(),
            None => Value::Absent,
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&BTreeMap<String, Value>) -> Value + Send + Sync + 'static,
    {
        self.map.insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ComputeFn>> {
        self.map.get(name).cloned()
    }
}

impl fmt::Debug for FnRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRegistry")
            .field("functions", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_integer_and_float() {
        assert_eq!(
            FieldType::Integer.parse("n", "42").unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            FieldType::Float.parse("x", "1.5").unwrap(),
            Value::Float(1.5)
        );
        assert!(FieldType::Integer.parse("n", "nope").is_err());
    }

    #[test]
    fn parse_datetime_with_and_without_zone() {
        let ty = FieldType::Datetime {
            format: "%Y/%m/%d %H:%M:%S".to_string(),
        };
        let v = ty.parse("ts", "2019/02/13 20:58:22").unwrap();
        match v {
            Value::Datetime(dt) => assert_eq!(dt.timestamp(), 1_550_091_502),
            other => panic!("expected datetime, got {other:?}"),
        }

        let zoned = FieldType::Datetime {
            format: "%d/%b/%Y:%H:%M:%S %z".to_string(),
        };
        assert!(zoned.parse("ts", "13/Feb/2019:20:58:22 +0000").is_ok());
        assert!(zoned.parse("ts", "not a date").is_err());
    }

    #[test]
    fn builtin_severity_from_status() {
        let registry = FnRegistry::builtin();
        let f = registry.get("severity_from_status").unwrap();

        let mut deps = BTreeMap::new();
        deps.insert("status".to_string(), Value::Int(502));
        assert_eq!(f(&deps), Value::Str("error".to_string()));

        deps.insert("status".to_string(), Value::Int(200));
        assert_eq!(f(&deps), Value::Str("info".to_string()));

        deps.insert("status".to_string(), Value::Absent);
        assert_eq!(f(&deps), Value::Absent);
    }

    #[test]
    fn field_spec_deserializes_from_toml() {
        let spec: FieldSpec = toml::from_str(
            r#"
            kind = "capture"
            group = "status"
            type = "integer"
            min = 100
            "#,
        )
        .unwrap();
        assert!(matches!(
            spec.kind,
            FieldKindSpec::Capture { ref group } if group.as_deref() == Some("status")
        ));
        assert_eq!(spec.min, Some(100.0));
    }
}
