// SPDX-License-Identifier: Apache-2.0

//! Channel filter predicates.
//!
//! Filters are small comparison expressions over the bound record, parsed at
//! load time. The surface is deliberately tiny: `has <field>`, or
//! `<field> <op> <literal>` with `== != < <= > >=`. Anything richer belongs
//! in a computed field.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::form::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Operand {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Has(String),
    Compare {
        field: String,
        op: Op,
        operand: Operand,
    },
}

/// A compiled filter predicate: record in, keep/drop out.
#[derive(Debug, Clone)]
pub struct Filter {
    kind: Kind,
}

impl Filter {
    pub fn parse(expr: &str) -> Result<Self> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        let kind = match tokens.as_slice() {
            ["has", field] => Kind::Has((*field).to_string()),
            [field, op, rest @ ..] if !rest.is_empty() => {
                let op = match *op {
                    "==" => Op::Eq,
                    "!=" => Op::Ne,
                    "<" => Op::Lt,
                    "<=" => Op::Le,
                    ">" => Op::Gt,
                    ">=" => Op::Ge,
                    other => {
                        return Err(Error::Config(format!(
                            "filter {expr:?}: unknown operator {other:?}"
                        )))
                    }
                };
                let raw = rest.join(" ");
                let raw = raw
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .unwrap_or(&raw)
                    .to_string();
                let operand = match raw.parse::<f64>() {
                    Ok(n) => Operand::Number(n),
                    Err(_) => Operand::Text(raw),
                };
                Kind::Compare {
                    field: (*field).to_string(),
                    op,
                    operand,
                }
            }
            _ => {
                return Err(Error::Config(format!(
                    "filter {expr:?}: expected \"has <field>\" or \"<field> <op> <value>\""
                )))
            }
        };
        Ok(Filter { kind })
    }

    /// Evaluate against a bound record. A missing or absent field keeps the
    /// record only under `!=` (it genuinely differs from any literal).
    pub fn keep(&self, record: &BTreeMap<String, Value>) -> bool {
        match &self.kind {
            Kind::Has(field) => record.get(field).is_some_and(|v| !v.is_absent()),
            Kind::Compare { field, op, operand } => {
                let value = match record.get(field) {
                    Some(v) if !v.is_absent() => v,
                    _ => return *op == Op::Ne,
                };
                match (value.as_float(), operand) {
                    (Some(actual), Operand::Number(expected)) => compare(*op, actual, *expected),
                    _ => {
                        let actual = value.to_string();
                        let expected = match operand {
                            Operand::Number(n) => n.to_string(),
                            Operand::Text(s) => s.clone(),
                        };
                        compare(*op, actual.as_str(), expected.as_str())
                    }
                }
            }
        }
    }
}

fn compare<T: PartialOrd + PartialEq>(op: Op, actual: T, expected: T) -> bool {
    match op {
        Op::Eq => actual == expected,
        Op::Ne => actual != expected,
        Op::Lt => actual < expected,
        Op::Le => actual <= expected,
        Op::Gt => actual > expected,
        Op::Ge => actual >= expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn numeric_comparisons() {
        let f = Filter::parse("status >= 500").unwrap();
        assert!(f.keep(&record(&[("status", Value::Int(502))])));
        assert!(!f.keep(&record(&[("status", Value::Int(200))])));
    }

    #[test]
    fn string_equality() {
        let f = Filter::parse("severity != debug").unwrap();
        assert!(f.keep(&record(&[("severity", Value::Str("error".into()))])));
        assert!(!f.keep(&record(&[("severity", Value::Str("debug".into()))])));
    }

    #[test]
    fn quoted_operand_with_spaces() {
        let f = Filter::parse(r#"agent == "curl client""#).unwrap();
        assert!(f.keep(&record(&[("agent", Value::Str("curl client".into()))])));
    }

    #[test]
    fn has_checks_presence() {
        let f = Filter::parse("has user").unwrap();
        assert!(f.keep(&record(&[("user", Value::Str("root".into()))])));
        assert!(!f.keep(&record(&[("user", Value::Absent)])));
        assert!(!f.keep(&record(&[])));
    }

    #[test]
    fn missing_field_only_satisfies_ne() {
        let eq = Filter::parse("severity == error").unwrap();
        let ne = Filter::parse("severity != error").unwrap();
        let empty = record(&[]);
        assert!(!eq.keep(&empty));
        assert!(ne.keep(&empty));
    }

    #[test]
    fn malformed_expressions_fail_at_parse() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("status").is_err());
        assert!(Filter::parse("status ~= 5").is_err());
    }
}
