// SPDX-License-Identifier: Apache-2.0

//! Form compilation and two-pass evaluation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use super::{ComputeFn, ContextKey, FieldKindSpec, FieldSpec, FieldType, FnRegistry, FormSpec, Value};
use crate::error::{Error, Result};

/// Processing context a block was extracted under.
#[derive(Debug, Clone, Copy)]
pub struct BindContext<'a> {
    pub path: &'a str,
    pub begin: u64,
    pub end: u64,
    pub source: &'a str,
    pub channel: &'a str,
}

/// Where capture fields resolve from: the block's regex captures (source
/// forms) or an already-bound record (channel forms re-binding the source
/// record).
pub enum BindSource<'a, 'c> {
    Captures(&'a regex::bytes::Captures<'c>),
    Record(&'a BTreeMap<String, Value>),
}

enum CompiledKind {
    Capture {
        group: String,
    },
    Context {
        from: ContextKey,
        pattern: Option<Regex>,
    },
    Constant {
        value: Value,
    },
    Computed {
        function: Arc<ComputeFn>,
        depends: Vec<String>,
    },
    Formatted {
        segments: Vec<Segment>,
        depends: Vec<String>,
    },
    Record {
        form: CompiledForm,
    },
}

enum Segment {
    Literal(String),
    Field(String),
}

struct CompiledField {
    name: String,
    kind: CompiledKind,
    ty: FieldType,
    default: Option<Value>,
    optional: bool,
    min: Option<f64>,
    exclude: bool,
}

/// A form with its evaluation order fixed: pass-one fields as written, then
/// computed/formatted fields in dependency order. Cycles and unresolved
/// references were rejected at compile time.
pub struct CompiledForm {
    fields: Vec<CompiledField>,
}

impl std::fmt::Debug for CompiledForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledForm")
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl CompiledForm {
    /// A form with no fields; callers fall back to raw capture binding.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn compile(spec: &FormSpec, registry: &FnRegistry) -> Result<Self> {
        let names: HashSet<&str> = spec.fields.keys().map(|s| s.as_str()).collect();

        let mut pass_one = Vec::new();
        let mut pass_two = Vec::new();
        for (name, field) in &spec.fields {
            let compiled = compile_field(name, field, registry, &names)?;
            match compiled.kind {
                CompiledKind::Computed { .. } | CompiledKind::Formatted { .. } => {
                    pass_two.push(compiled)
                }
                _ => pass_one.push(compiled),
            }
        }

        let pass_two = order_by_dependencies(pass_two)?;
        pass_one.extend(pass_two);
        Ok(Self { fields: pass_one })
    }

    /// Evaluate the form against a block's captures (or a prior record) and
    /// its processing context. Returns the bound record with excluded fields
    /// removed.
    pub fn bind(&self, src: &BindSource<'_, '_>, ctx: &BindContext<'_>) -> Result<BTreeMap<String, Value>> {
        let mut resolved: BTreeMap<String, Value> = BTreeMap::new();
        let mut excluded: Vec<&str> = Vec::new();

        for field in &self.fields {
            let mut value = self.evaluate(field, src, ctx, &resolved)?;
            if value.is_absent() {
                if let Some(default) = &field.default {
                    value = default.clone();
                }
            }
            if value.is_absent() && !field.optional {
                return Err(Error::Binding(format!(
                    "missing required field \"{}\"",
                    field.name
                )));
            }
            if let (Some(min), Some(actual)) = (field.min, value.as_float()) {
                if actual < min {
                    return Err(Error::Binding(format!(
                        "field \"{}\": {} is below minimum {}",
                        field.name, actual, min
                    )));
                }
            }
            if field.exclude {
                excluded.push(&field.name);
            }
            resolved.insert(field.name.clone(), value);
        }

        for name in excluded {
            resolved.remove(name);
        }
        Ok(resolved)
    }

    fn evaluate(
        &self,
        field: &CompiledField,
        src: &BindSource<'_, '_>,
        ctx: &BindContext<'_>,
        resolved: &BTreeMap<String, Value>,
    ) -> Result<Value> {
        match &field.kind {
            CompiledKind::Capture { group } => match src {
                BindSource::Captures(captures) => match captures.name(group) {
                    Some(m) => {
                        let raw = String::from_utf8_lossy(m.as_bytes());
                        field.ty.parse(&field.name, &raw)
                    }
                    None => Ok(Value::Absent),
                },
                BindSource::Record(record) => match record.get(group) {
                    Some(Value::Str(s)) => field.ty.parse(&field.name, s),
                    Some(v) => Ok(v.clone()),
                    None => Ok(Value::Absent),
                },
            },
            CompiledKind::Context { from, pattern } => {
                let raw = match from {
                    ContextKey::Path => ctx.path.to_string(),
                    ContextKey::Begin => ctx.begin.to_string(),
                    ContextKey::End => ctx.end.to_string(),
                    ContextKey::Source => ctx.source.to_string(),
                    ContextKey::Channel => ctx.channel.to_string(),
                };
                let extracted = match pattern {
                    None => Some(raw),
                    Some(re) => re.captures(&raw).and_then(|c| {
                        c.get(1)
                            .or_else(|| c.get(0))
                            .map(|m| m.as_str().to_string())
                    }),
                };
                match extracted {
                    Some(s) => field.ty.parse(&field.name, &s),
                    None => Ok(Value::Absent),
                }
            }
            CompiledKind::Constant { value } => Ok(value.clone()),
            CompiledKind::Computed { function, depends } => {
                let mut deps = BTreeMap::new();
                for dep in depends {
                    deps.insert(
                        dep.clone(),
                        resolved.get(dep).cloned().unwrap_or(Value::Absent),
                    );
                }
                Ok(function(&deps))
            }
            CompiledKind::Formatted { segments, depends } => {
                if depends
                    .iter()
                    .any(|d| resolved.get(d).is_none_or(Value::is_absent))
                {
                    return Ok(Value::Absent);
                }
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(s) => out.push_str(s),
                        Segment::Field(name) => {
                            out.push_str(&resolved[name].to_string());
                        }
                    }
                }
                Ok(Value::Str(out))
            }
            CompiledKind::Record { form } => Ok(Value::Record(form.bind(src, ctx)?)),
        }
    }
}

fn compile_field(
    name: &str,
    spec: &FieldSpec,
    registry: &FnRegistry,
    sibling_names: &HashSet<&str>,
) -> Result<CompiledField> {
    let ty = compile_type(name, spec)?;
    let kind = match &spec.kind {
        FieldKindSpec::Capture { group } => CompiledKind::Capture {
            group: group.clone().unwrap_or_else(|| name.to_string()),
        },
        FieldKindSpec::Context { from, pattern } => {
            let pattern = match pattern {
                None => None,
                Some(p) => Some(Regex::new(p).map_err(|e| {
                    Error::Config(format!("field \"{name}\": bad context pattern: {e}"))
                })?),
            };
            CompiledKind::Context {
                from: *from,
                pattern,
            }
        }
        FieldKindSpec::Constant { value } => CompiledKind::Constant {
            value: toml_to_value(name, &ty, value)?,
        },
        FieldKindSpec::Computed { function, depends } => {
            let f = registry.get(function).ok_or_else(|| {
                Error::Config(format!(
                    "field \"{name}\": unknown computed function \"{function}\""
                ))
            })?;
            check_references(name, depends, sibling_names)?;
            CompiledKind::Computed {
                function: f,
                depends: depends.clone(),
            }
        }
        FieldKindSpec::Formatted { template } => {
            let segments = parse_template(name, template)?;
            let depends: Vec<String> = segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Field(f) => Some(f.clone()),
                    Segment::Literal(_) => None,
                })
                .collect();
            check_references(name, &depends, sibling_names)?;
            CompiledKind::Formatted { segments, depends }
        }
        FieldKindSpec::Record { fields } => {
            let sub = FormSpec {
                fields: fields.clone(),
            };
            CompiledKind::Record {
                form: CompiledForm::compile(&sub, registry)?,
            }
        }
    };

    let default = match &spec.default {
        None => None,
        Some(raw) => Some(toml_to_value(name, &ty, raw)?),
    };

    Ok(CompiledField {
        name: name.to_string(),
        kind,
        ty,
        default,
        optional: spec.optional,
        min: spec.min,
        exclude: spec.tags.iter().any(|t| t == "exclude"),
    })
}

fn compile_type(name: &str, spec: &FieldSpec) -> Result<FieldType> {
    match spec.ty.as_deref() {
        None | Some("string") => Ok(FieldType::String),
        Some("integer") => Ok(FieldType::Integer),
        Some("float") => Ok(FieldType::Float),
        Some("datetime") => {
            let format = spec.format.clone().ok_or_else(|| {
                Error::Config(format!("field \"{name}\": datetime requires a format"))
            })?;
            Ok(FieldType::Datetime { format })
        }
        Some(other) => Err(Error::Config(format!(
            "field \"{name}\": unknown type \"{other}\""
        ))),
    }
}

fn toml_to_value(name: &str, ty: &FieldType, raw: &toml::Value) -> Result<Value> {
    match raw {
        toml::Value::String(s) => ty.parse(name, s),
        toml::Value::Integer(n) => match ty {
            FieldType::Float => Ok(Value::Float(*n as f64)),
            _ => Ok(Value::Int(*n)),
        },
        toml::Value::Float(f) => Ok(Value::Float(*f)),
        other => Err(Error::Config(format!(
            "field \"{name}\": unsupported literal {other}"
        ))),
    }
}

fn check_references(name: &str, depends: &[String], sibling_names: &HashSet<&str>) -> Result<()> {
    for dep in depends {
        if !sibling_names.contains(dep.as_str()) {
            return Err(Error::Config(format!(
                "field \"{name}\" references unknown field \"{dep}\""
            )));
        }
    }
    Ok(())
}

fn parse_template(name: &str, template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            literal.push(c);
            continue;
        }
        let mut field = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => field.push(c),
                None => {
                    return Err(Error::Config(format!(
                        "field \"{name}\": unterminated reference in template {template:?}"
                    )))
                }
            }
        }
        if field.is_empty() {
            return Err(Error::Config(format!(
                "field \"{name}\": empty reference in template {template:?}"
            )));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Field(field));
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Order computed/formatted fields so every dependency on another pass-two
/// field resolves first. Dependencies on pass-one fields are always
/// satisfied. A cycle is a configuration error.
fn order_by_dependencies(fields: Vec<CompiledField>) -> Result<Vec<CompiledField>> {
    let names: HashSet<String> = fields.iter().map(|f| f.name.clone()).collect();
    let mut remaining: HashMap<String, CompiledField> =
        fields.into_iter().map(|f| (f.name.clone(), f)).collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .values()
            .filter(|f| {
                field_depends(f)
                    .iter()
                    .all(|d| !names.contains(*d) || ordered.iter().any(|o: &CompiledField| o.name == **d))
            })
            .map(|f| f.name.clone())
            .collect();
        if ready.is_empty() {
            let mut stuck: Vec<&String> = remaining.keys().collect();
            stuck.sort();
            return Err(Error::Config(format!(
                "dependency cycle among computed fields: {}",
                stuck
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        for name in ready {
            if let Some(field) = remaining.remove(&name) {
                ordered.push(field);
            }
        }
    }
    Ok(ordered)
}

fn field_depends(field: &CompiledField) -> Vec<&String> {
    match &field.kind {
        CompiledKind::Computed { depends, .. } => depends.iter().collect(),
        CompiledKind::Formatted { depends, .. } => depends.iter().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex as BytesRegex;

    fn ctx<'a>() -> BindContext<'a> {
        BindContext {
            path: "/var/hosts/web1/logs/app-access.log",
            begin: 0,
            end: 120,
            source: "access",
            channel: "http",
        }
    }

    fn compile(toml_src: &str) -> Result<CompiledForm> {
        let spec: FormSpec = toml::from_str(toml_src).unwrap();
        CompiledForm::compile(&spec, &FnRegistry::builtin())
    }

    fn bind_line(form: &CompiledForm, pattern: &str, line: &[u8]) -> Result<BTreeMap<String, Value>> {
        let re = BytesRegex::new(pattern).unwrap();
        let captures = re.captures(line).expect("pattern must match fixture");
        form.bind(&BindSource::Captures(&captures), &ctx())
    }

    #[test]
    fn direct_captures_with_types() {
        let form = compile(
            r#"
            [fields.method]
            kind = "capture"
            [fields.status]
            kind = "capture"
            type = "integer"
            "#,
        )
        .unwrap();
        let record = bind_line(
            &form,
            r"(?P<method>\w+) (?P<status>\d+)",
            b"GET 200",
        )
        .unwrap();
        assert_eq!(record["method"], Value::Str("GET".to_string()));
        assert_eq!(record["status"], Value::Int(200));
    }

    #[test]
    fn context_capture_with_secondary_extraction() {
        let form = compile(
            r#"
            [fields.host]
            kind = "context"
            from = "path"
            pattern = '/hosts/([^/]+)/'
            [fields.source]
            kind = "context"
            from = "source"
            "#,
        )
        .unwrap();
        let record = bind_line(&form, r"(?P<all>.*)", b"anything").unwrap();
        assert_eq!(record["host"], Value::Str("web1".to_string()));
        assert_eq!(record["source"], Value::Str("access".to_string()));
    }

    #[test]
    fn computed_fields_resolve_in_dependency_order() {
        // "severity" depends on "status"; declaration order in the map is
        // alphabetical, so this exercises the pass split, and "routed"
        // depends on another computed field to exercise the topo sort.
        let mut registry = FnRegistry::builtin();
        registry.register("route_by_severity", |deps| match deps.get("severity") {
            Some(Value::Str(s)) if s == "error" => Value::Str("alerts".to_string()),
            Some(Value::Str(_)) => Value::Str("archive".to_string()),
            _ => Value::Absent,
        });
        let spec: FormSpec = toml::from_str(
            r#"
            [fields.routed]
            kind = "computed"
            function = "route_by_severity"
            depends = ["severity"]
            [fields.severity]
            kind = "computed"
            function = "severity_from_status"
            depends = ["status"]
            [fields.status]
            kind = "capture"
            type = "integer"
            "#,
        )
        .unwrap();
        let form = CompiledForm::compile(&spec, &registry).unwrap();
        let record = bind_line(&form, r"(?P<status>\d+)", b"503").unwrap();
        assert_eq!(record["severity"], Value::Str("error".to_string()));
        assert_eq!(record["routed"], Value::Str("alerts".to_string()));
    }

    #[test]
    fn computed_with_absent_input_yields_absent_not_error() {
        let form = compile(
            r#"
            [fields.severity]
            kind = "computed"
            function = "severity_from_status"
            depends = ["status"]
            optional = true
            [fields.status]
            kind = "capture"
            type = "integer"
            optional = true
            "#,
        )
        .unwrap();
        // The status group is optional in the pattern and not present here.
        let record = bind_line(&form, r"(?P<msg>\w+)(?: (?P<status>\d+))?", b"hello").unwrap();
        assert_eq!(record["severity"], Value::Absent);
    }

    #[test]
    fn formatted_field_builds_composite() {
        let form = compile(
            r#"
            [fields.index]
            kind = "formatted"
            template = "logs-{source}-{host}"
            [fields.source]
            kind = "context"
            from = "source"
            [fields.host]
            kind = "context"
            from = "path"
            pattern = '/hosts/([^/]+)/'
            "#,
        )
        .unwrap();
        let record = bind_line(&form, r"(?P<all>.*)", b"x").unwrap();
        assert_eq!(record["index"], Value::Str("logs-access-web1".to_string()));
    }

    #[test]
    fn sub_record_binds_recursively() {
        let form = compile(
            r#"
            [fields.message]
            kind = "capture"
            [fields.payload]
            kind = "record"
            [fields.payload.fields.ip]
            kind = "capture"
            [fields.payload.fields.status]
            kind = "capture"
            type = "integer"
            "#,
        )
        .unwrap();
        let record = bind_line(
            &form,
            r"(?P<ip>\S+) (?P<status>\d+) (?P<message>.*)",
            b"10.0.0.1 200 ok",
        )
        .unwrap();
        match &record["payload"] {
            Value::Record(payload) => {
                assert_eq!(payload["ip"], Value::Str("10.0.0.1".to_string()));
                assert_eq!(payload["status"], Value::Int(200));
            }
            other => panic!("expected sub-record, got {other:?}"),
        }
    }

    #[test]
    fn default_fills_absent() {
        let form = compile(
            r#"
            [fields.user]
            kind = "capture"
            default = "anonymous"
            "#,
        )
        .unwrap();
        let record = bind_line(&form, r"(?:(?P<user>[a-z]+) )?-", b"-").unwrap();
        assert_eq!(record["user"], Value::Str("anonymous".to_string()));
    }

    #[test]
    fn missing_required_field_is_a_binding_error() {
        let form = compile(
            r#"
            [fields.user]
            kind = "capture"
            "#,
        )
        .unwrap();
        let err = bind_line(&form, r"(?:(?P<user>[a-z]+) )?-", b"-").unwrap_err();
        assert!(matches!(err, Error::Binding(_)), "got {err:?}");
    }

    #[test]
    fn minimum_validation_failure_is_a_binding_error() {
        let form = compile(
            r#"
            [fields.bytes]
            kind = "capture"
            type = "integer"
            min = 0
            "#,
        )
        .unwrap();
        let err = bind_line(&form, r"(?P<bytes>-?\d+)", b"-5").unwrap_err();
        assert!(matches!(err, Error::Binding(_)), "got {err:?}");
    }

    #[test]
    fn excluded_fields_feed_dependents_but_are_dropped() {
        let form = compile(
            r#"
            [fields.status]
            kind = "capture"
            type = "integer"
            tags = ["exclude"]
            [fields.severity]
            kind = "computed"
            function = "severity_from_status"
            depends = ["status"]
            "#,
        )
        .unwrap();
        let record = bind_line(&form, r"(?P<status>\d+)", b"500").unwrap();
        assert_eq!(record["severity"], Value::Str("error".to_string()));
        assert!(!record.contains_key("status"));
    }

    #[test]
    fn dependency_cycle_is_a_load_time_error() {
        let mut registry = FnRegistry::builtin();
        registry.register("id", |deps| {
            deps.values().next().cloned().unwrap_or(Value::Absent)
        });
        let spec: FormSpec = toml::from_str(
            r#"
            [fields.a]
            kind = "computed"
            function = "id"
            depends = ["b"]
            [fields.b]
            kind = "computed"
            function = "id"
            depends = ["a"]
            "#,
        )
        .unwrap();
        let err = CompiledForm::compile(&spec, &registry).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn unknown_function_and_reference_are_load_time_errors() {
        assert!(matches!(
            compile(
                r#"
                [fields.a]
                kind = "computed"
                function = "no_such_function"
                depends = []
                "#,
            )
            .unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            compile(
                r#"
                [fields.a]
                kind = "formatted"
                template = "{missing}"
                "#,
            )
            .unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn channel_form_rebinds_a_source_record() {
        let form = compile(
            r#"
            [fields.index]
            kind = "formatted"
            template = "logs-{severity}"
            [fields.severity]
            kind = "capture"
            "#,
        )
        .unwrap();
        let mut source_record = BTreeMap::new();
        source_record.insert("severity".to_string(), Value::Str("error".to_string()));
        source_record.insert("message".to_string(), Value::Str("boom".to_string()));

        let record = form
            .bind(&BindSource::Record(&source_record), &ctx())
            .unwrap();
        assert_eq!(record["index"], Value::Str("logs-error".to_string()));
    }
}
