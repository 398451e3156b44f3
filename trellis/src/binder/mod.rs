//! Binds path, query, header and body inputs onto typed request values.
//!
//! Each bindable type carries a table of [`FieldSpec`]s describing where every
//! field comes from and how it decodes; the table is normally generated by
//! `#[derive(Bind)]`. On first use the table is compiled into a [`Descriptor`]
//! and memoized process-wide, keyed by the type's identity. Binding walks the
//! descriptor, accumulates every decode failure into a
//! [`FieldError`](crate::handler::FieldError) list, and either fails with a
//! single `validation_failed` error carrying all of them or produces the
//! populated value.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hyper::Body;
use log::trace;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::handler::{FieldError, HandlerError};
use crate::helpers::http::request::query_string::{self, QueryMap};
use crate::state::State;

#[cfg(feature = "derive")]
pub use trellis_derive::Bind;

/// Where a field's value is read from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldSource {
    /// A captured path parameter.
    Path,
    /// A query-string parameter.
    Query,
    /// A request header.
    Header,
    /// A member of the JSON request body object.
    Body,
}

/// The width of an integer field, used for decode-time bounds checking.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

/// The decoded shape of a field.
#[derive(Clone, PartialEq, Debug)]
pub enum FieldKind {
    /// `true | false | 1 | 0`.
    Bool,
    /// Signed decimal integer, bounds-checked per width.
    Int(IntWidth),
    /// Unsigned decimal integer, bounds-checked per width.
    Uint(IntWidth),
    /// Standard decimal floating point.
    Float,
    /// Passed through as-is.
    String,
    /// An RFC3339 timestamp; pair the field with
    /// `#[serde(with = "time::serde::rfc3339")]`.
    Instant,
    /// The field is optional; absent values bind as `None`.
    Optional(Box<FieldKind>),
    /// A comma-separated or repeated sequence of the inner kind.
    Sequence(Box<FieldKind>),
    /// An arbitrary JSON value, only meaningful for body fields.
    Json,
}

impl FieldKind {
    fn is_optional(&self) -> bool {
        matches!(self, FieldKind::Optional(_))
    }

    /// The kind to decode values against, unwrapping an optional marker.
    fn value_kind(&self) -> &FieldKind {
        match self {
            FieldKind::Optional(inner) => inner,
            other => other,
        }
    }
}

/// Describes one field of a bindable request type.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// The Rust field name, used as the key when materializing the value.
    pub field: &'static str,
    /// The external name looked up in the field's source.
    pub external: &'static str,
    /// Where the value is read from.
    pub source: FieldSource,
    /// How the value decodes.
    pub kind: FieldKind,
    /// Whether a missing value is a validation failure.
    pub required: bool,
}

impl FieldSpec {
    /// Creates a spec; `required` is derived from the kind's optionality.
    pub fn new(
        field: &'static str,
        external: &'static str,
        source: FieldSource,
        kind: FieldKind,
    ) -> Self {
        let required = !kind.is_optional();
        FieldSpec {
            field,
            external,
            source,
            kind,
            required,
        }
    }
}

/// A compiled, immutable summary of a bindable type, memoized per type
/// identity.
#[derive(Debug)]
pub struct Descriptor {
    /// The request type's name, surfaced to registration observers.
    pub type_name: &'static str,
    /// The field table.
    pub fields: Vec<FieldSpec>,
    has_body: bool,
}

impl Descriptor {
    fn build<T: Bind>() -> Descriptor {
        let fields = T::field_specs();
        let has_body = fields.iter().any(|f| f.source == FieldSource::Body);
        Descriptor {
            type_name: T::type_name(),
            fields,
            has_body,
        }
    }
}

/// A request type that can be populated from a request by the binder.
///
/// Implemented via `#[derive(Bind)]`, which reads `#[bind(...)]` field
/// attributes. The type must also be deserializable, since the binder
/// materializes values through an intermediate JSON object.
pub trait Bind: DeserializeOwned + Send + 'static {
    /// The type's display name.
    fn type_name() -> &'static str;

    /// The binding table for the type's fields.
    fn field_specs() -> Vec<FieldSpec>;
}

static DESCRIPTORS: Lazy<RwLock<HashMap<TypeId, Arc<Descriptor>>>> =
    Lazy::new(Default::default);

/// Returns the cached descriptor for `T`, building it on first use.
///
/// Descriptors are written at most once per type; concurrent first uses are
/// serialized by the write lock after an optimistic read.
pub fn descriptor_of<T: Bind>() -> Arc<Descriptor> {
    let id = TypeId::of::<T>();

    if let Some(descriptor) = DESCRIPTORS.read().expect("descriptor cache poisoned").get(&id) {
        return descriptor.clone();
    }

    let mut cache = DESCRIPTORS.write().expect("descriptor cache poisoned");
    cache
        .entry(id)
        .or_insert_with(|| {
            trace!(" compiled descriptor for {}", T::type_name());
            Arc::new(Descriptor::build::<T>())
        })
        .clone()
}

/// Binds a value of `T` from the current request.
///
/// Reads captured path parameters, the query string, headers, and (when any
/// field is sourced from it) the JSON request body. All field failures are
/// accumulated; the result is either the fully-populated value or a single
/// validation error listing every offending field.
pub async fn bind<T: Bind>(state: &mut State) -> Result<T, HandlerError> {
    let descriptor = descriptor_of::<T>();

    let body_object = if descriptor.has_body {
        Some(read_body_object(state).await?)
    } else {
        None
    };

    let query = query_string::parse(state.uri().query());

    let mut object = Map::new();
    let mut errors = Vec::new();

    for spec in &descriptor.fields {
        let decoded = match spec.source {
            FieldSource::Path => decode_single(spec, state.params().get(spec.external)),
            FieldSource::Query => decode_query(spec, &query),
            FieldSource::Header => {
                let raw = state
                    .headers()
                    .get(spec.external)
                    .and_then(|v| v.to_str().ok());
                decode_single(spec, raw)
            }
            FieldSource::Body => {
                let body = body_object.as_ref().expect("body read when descriptor requires it");
                decode_body(spec, body.get(spec.external))
            }
        };

        match decoded {
            Ok(Some(value)) => {
                object.insert(spec.field.to_string(), value);
            }
            Ok(None) => {
                // Absent optional; bind as null so `Option` fields see None.
                object.insert(spec.field.to_string(), Value::Null);
            }
            Err(field_error) => errors.push(field_error),
        }
    }

    if !errors.is_empty() {
        return Err(HandlerError::validation(errors));
    }

    serde_json::from_value(Value::Object(object)).map_err(|e| {
        // Per-field validation passed but the target type refused the shape;
        // this means the descriptor and the type disagree.
        HandlerError::internal("internal server error")
            .with_source(anyhow::Error::new(e).context(descriptor.type_name))
    })
}

async fn read_body_object(state: &mut State) -> Result<Map<String, Value>, HandlerError> {
    let body = state.take_body().unwrap_or_else(Body::empty);
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|e| HandlerError::bad_request("unable to read request body").with_source(e.into()))?;

    if bytes.is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(HandlerError::bad_request("request body must be a JSON object")),
        Err(e) => {
            Err(HandlerError::bad_request("request body is not valid JSON").with_source(e.into()))
        }
    }
}

/// Decodes a field backed by at most one raw string value.
fn decode_single(spec: &FieldSpec, raw: Option<&str>) -> Result<Option<Value>, FieldError> {
    match raw {
        Some(raw) => match spec.kind.value_kind() {
            FieldKind::Sequence(inner) => decode_sequence(spec, inner, &[raw]).map(Some),
            kind => decode_scalar(kind, raw)
                .map(Some)
                .map_err(|reason| FieldError::new(spec.external, raw, reason)),
        },
        None => missing(spec),
    }
}

/// Decodes a query-sourced field, which may carry repeated values.
fn decode_query(spec: &FieldSpec, query: &QueryMap) -> Result<Option<Value>, FieldError> {
    let values = match query.get(spec.external) {
        Some(values) if !values.is_empty() => values,
        _ => return missing(spec),
    };

    match spec.kind.value_kind() {
        FieldKind::Sequence(inner) => {
            let raw: Vec<&str> = values.iter().map(String::as_str).collect();
            decode_sequence(spec, inner, &raw).map(Some)
        }
        kind => {
            let raw = values[0].as_str();
            decode_scalar(kind, raw)
                .map(Some)
                .map_err(|reason| FieldError::new(spec.external, raw, reason))
        }
    }
}

/// Decodes the ordered values of a sequence field. A single value containing
/// commas is treated as a comma-separated list.
fn decode_sequence(
    spec: &FieldSpec,
    inner: &FieldKind,
    raw: &[&str],
) -> Result<Value, FieldError> {
    let parts: Vec<&str> = if raw.len() == 1 && raw[0].contains(',') {
        raw[0].split(',').collect()
    } else {
        raw.to_vec()
    };

    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let value = decode_scalar(inner, part)
            .map_err(|reason| FieldError::new(spec.external, part, reason))?;
        out.push(value);
    }
    Ok(Value::Array(out))
}

fn decode_scalar(kind: &FieldKind, raw: &str) -> Result<Value, String> {
    match kind {
        FieldKind::Bool => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err("not a boolean".to_string()),
        },
        FieldKind::Int(width) => {
            let n: i128 = raw.parse().map_err(|_| "not an integer".to_string())?;
            let (min, max) = int_bounds(*width);
            if n < min || n > max {
                return Err("out of range".to_string());
            }
            Ok(Value::from(n as i64))
        }
        FieldKind::Uint(width) => {
            let n: i128 = raw.parse().map_err(|_| "not an integer".to_string())?;
            if n < 0 || n > uint_max(*width) {
                return Err("out of range".to_string());
            }
            Ok(Value::from(n as u64))
        }
        FieldKind::Float => {
            let f: f64 = raw.parse().map_err(|_| "not a number".to_string())?;
            if !f.is_finite() {
                return Err("not a number".to_string());
            }
            Ok(Value::from(f))
        }
        FieldKind::String | FieldKind::Json => Ok(Value::String(raw.to_string())),
        FieldKind::Instant => {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|_| "not a valid RFC3339 timestamp".to_string())?;
            Ok(Value::String(raw.to_string()))
        }
        FieldKind::Optional(inner) => decode_scalar(inner, raw),
        FieldKind::Sequence(_) => Err("nested sequences are not supported".to_string()),
    }
}

/// Validates a body-sourced JSON value against the field's kind, passing the
/// value through unchanged on success.
fn decode_body(spec: &FieldSpec, value: Option<&Value>) -> Result<Option<Value>, FieldError> {
    match value {
        None | Some(Value::Null) => missing(spec),
        Some(value) => check_json(spec.kind.value_kind(), value)
            .map(|()| Some(value.clone()))
            .map_err(|reason| FieldError::new(spec.external, render(value), reason)),
    }
}

fn check_json(kind: &FieldKind, value: &Value) -> Result<(), String> {
    match kind {
        FieldKind::Bool => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| "not a boolean".to_string()),
        FieldKind::Int(width) => {
            let n = value
                .as_i64()
                .map(i128::from)
                .or_else(|| value.as_u64().map(i128::from))
                .ok_or_else(|| "not an integer".to_string())?;
            let (min, max) = int_bounds(*width);
            if n < min || n > max {
                return Err("out of range".to_string());
            }
            Ok(())
        }
        FieldKind::Uint(width) => {
            let n = value
                .as_u64()
                .map(i128::from)
                .ok_or_else(|| "not an integer".to_string())?;
            if n > uint_max(*width) {
                return Err("out of range".to_string());
            }
            Ok(())
        }
        FieldKind::Float => value
            .as_f64()
            .map(|_| ())
            .ok_or_else(|| "not a number".to_string()),
        FieldKind::String => value
            .as_str()
            .map(|_| ())
            .ok_or_else(|| "not a string".to_string()),
        FieldKind::Instant => {
            let raw = value.as_str().ok_or_else(|| "not a string".to_string())?;
            OffsetDateTime::parse(raw, &Rfc3339)
                .map(|_| ())
                .map_err(|_| "not a valid RFC3339 timestamp".to_string())
        }
        FieldKind::Sequence(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| "not a sequence".to_string())?;
            for item in items {
                check_json(inner, item)?;
            }
            Ok(())
        }
        FieldKind::Optional(inner) => check_json(inner, value),
        FieldKind::Json => Ok(()),
    }
}

fn missing(spec: &FieldSpec) -> Result<Option<Value>, FieldError> {
    if spec.required {
        Err(FieldError::new(spec.external, "", "missing"))
    } else {
        Ok(None)
    }
}

fn int_bounds(width: IntWidth) -> (i128, i128) {
    match width {
        IntWidth::W8 => (i128::from(i8::MIN), i128::from(i8::MAX)),
        IntWidth::W16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
        IntWidth::W32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
        IntWidth::W64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
    }
}

fn uint_max(width: IntWidth) -> i128 {
    match width {
        IntWidth::W8 => i128::from(u8::MAX),
        IntWidth::W16 => i128::from(u16::MAX),
        IntWidth::W32 => i128::from(u32::MAX),
        IntWidth::W64 => i128::from(u64::MAX),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
