//! Argument values carried by events and calls.
//!
//! [`Value`] covers plain JSON plus the kinds that JSON cannot express on its
//! own (dates, regular expressions, binary blobs, function source, typed
//! errors and non-finite numbers). Its `Serialize` impl is the plain JSON
//! projection; the codec decides which values need typeinfo so that the
//! projection can be reversed on the other side.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

/// Largest integer a peer using IEEE-754 doubles can represent exactly.
pub const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A single event or call argument.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    /// `None` is an invalid date; it travels as `null`.
    Date(Option<DateTime<Utc>>),
    RegExp(RegExp),
    Binary(Vec<u8>),
    Function(FunctionSource),
    Error(ErrorValue),
    /// Pre-rendered JSON, emitted verbatim and never tagged.
    Raw(Box<RawValue>),
}

/// Regular expression as source text plus flags and the match cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegExp {
    pub source: String,
    pub flags: String,
    pub last_index: u64,
}

impl RegExp {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
            last_index: 0,
        }
    }

    pub fn with_last_index(mut self, last_index: u64) -> Self {
        self.last_index = last_index;
        self
    }
}

/// Function carried as inert source text.
///
/// Nothing in this crate compiles or runs it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionSource {
    pub params: Vec<String>,
    pub body: String,
}

impl FunctionSource {
    pub fn new(params: Vec<String>, body: impl Into<String>) -> Self {
        Self {
            params,
            body: body.into(),
        }
    }

    /// Split a textual function into parameter names and body.
    ///
    /// Parameters are read between the first `(` and the first `)`; the body
    /// is everything between the first `{` and the last `}`.
    pub fn parse(text: &str) -> Self {
        let params = match (text.find('('), text.find(')')) {
            (Some(open), Some(close)) if open < close => text[open + 1..close]
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };
        let body = match (text.find('{'), text.rfind('}')) {
            (Some(open), Some(close)) if open < close => text[open + 1..close].to_string(),
            _ => String::new(),
        };
        Self { params, body }
    }

    /// Wire form: `[params, body]`, or the bare body when there are no params.
    pub fn to_wire(&self) -> Value {
        if self.params.is_empty() {
            Value::String(self.body.clone())
        } else {
            Value::Array(vec![
                Value::Array(self.params.iter().cloned().map(Value::String).collect()),
                Value::String(self.body.clone()),
            ])
        }
    }

    pub fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::String(body) => Some(Self::new(Vec::new(), body.clone())),
            Value::Array(pair) if pair.len() == 2 => {
                let (Value::Array(names), Value::String(body)) = (&pair[0], &pair[1]) else {
                    return None;
                };
                let params = names
                    .iter()
                    .map(|name| name.as_str().map(String::from))
                    .collect::<Option<Vec<_>>>()?;
                Some(Self::new(params, body.clone()))
            }
            _ => None,
        }
    }
}

/// Standard error subtypes that survive the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    Error,
    TypeError,
    RangeError,
    SyntaxError,
    EvalError,
    ReferenceError,
    UriError,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::SyntaxError => "SyntaxError",
            Self::EvalError => "EvalError",
            Self::ReferenceError => "ReferenceError",
            Self::UriError => "URIError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed error value: message, optional stack and any extra properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub properties: BTreeMap<String, Value>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Plain object copy: `stack`, `message` and every extra property.
    pub fn into_object(self) -> Value {
        let mut map = self.properties;
        if let Some(stack) = self.stack {
            map.insert("stack".to_string(), Value::String(stack));
        }
        map.insert("message".to_string(), Value::String(self.message));
        Value::Object(map)
    }

    /// Inverse of [`ErrorValue::into_object`].
    pub fn from_object(kind: ErrorKind, mut map: BTreeMap<String, Value>) -> Self {
        let message = match map.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_json_string(),
            None => String::new(),
        };
        let stack = match map.remove("stack") {
            Some(Value::String(stack)) => Some(stack),
            _ => None,
        };
        Self {
            kind,
            message,
            stack,
            properties: map,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= MAX_SAFE_INTEGER => {
                Some(*n as u64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Date(_) => "date",
            Value::RegExp(_) => "regexp",
            Value::Binary(_) => "binary",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
            Value::Raw(_) => "raw",
        }
    }

    /// Plain JSON text of this value.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Build an object from key/value pairs.
    pub fn object<K, V, I>(entries: I) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2013-11-01T02:43:45.730Z`.
///
/// Years outside `0..=9999` use the signed six-digit form, e.g.
/// `+010000-01-01T00:00:00.000Z` or `-000001-01-01T00:00:00.000Z`.
pub fn format_date(date: &DateTime<Utc>) -> String {
    let year = date.year();
    if (0..=9999).contains(&year) {
        return date.to_rfc3339_opts(SecondsFormat::Millis, true);
    }
    let sign = if year < 0 { '-' } else { '+' };
    format!(
        "{}{:06}-{}",
        sign,
        year.unsigned_abs(),
        date.format("%m-%dT%H:%M:%S%.3fZ")
    )
}

/// Parse an RFC 3339 timestamp, or a UTC timestamp with a signed
/// extended year.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, EXTENDED_YEAR_FORMAT)
        .ok()
        .map(|date| date.and_utc())
}

const EXTENDED_YEAR_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

fn serialize_number<S: Serializer>(n: f64, serializer: S) -> Result<S::Ok, S::Error> {
    if !n.is_finite() {
        serializer.serialize_unit()
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        serializer.serialize_i64(n as i64)
    } else {
        serializer.serialize_f64(n)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null | Value::Function(_) | Value::Date(None) => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serialize_number(*n, serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Date(Some(date)) => serializer.serialize_str(&format_date(date)),
            Value::RegExp(_) => serializer.serialize_map(Some(0))?.end(),
            Value::Binary(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            Value::Error(err) => {
                let mut out = serializer.serialize_map(None)?;
                if let Some(stack) = &err.stack {
                    out.serialize_entry("stack", stack)?;
                }
                out.serialize_entry("message", &err.message)?;
                for (key, value) in &err.properties {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            Value::Raw(raw) => raw.serialize(serializer),
        }
    }
}

/// Structural equality. `NaN` equals `NaN` so decoded arguments can be
/// compared with their originals.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Raw(a), Value::Raw(b)) => a.get() == b.get(),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(Some(date))
    }
}

impl From<RegExp> for Value {
    fn from(re: RegExp) -> Self {
        Value::RegExp(re)
    }
}

impl From<FunctionSource> for Value {
    fn from(source: FunctionSource) -> Self {
        Value::Function(source)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::Error(err)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_plain_projection() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::from(2.5),
            Value::from("x"),
            Value::Bool(true),
            Value::Null,
        ]);
        assert_eq!(value.to_json_string(), r#"[1,2.5,"x",true,null]"#);
    }

    #[test]
    fn test_non_finite_numbers_project_to_null() {
        let value = Value::Array(vec![
            Value::Number(f64::NAN),
            Value::Number(f64::INFINITY),
            Value::Number(f64::NEG_INFINITY),
        ]);
        assert_eq!(value.to_json_string(), "[null,null,null]");
    }

    #[test]
    fn test_date_projection_has_millis() {
        let date = Utc.timestamp_millis_opt(1_383_273_825_730).unwrap();
        assert_eq!(
            Value::from(date).to_json_string(),
            r#""2013-11-01T02:43:45.730Z""#
        );
        assert_eq!(Value::Date(None).to_json_string(), "null");
    }

    #[test]
    fn test_parse_date_extended_years() {
        let expected = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_date("+010000-01-01T00:00:00.000Z"), Some(expected));
        assert_eq!(parse_date("+10000-01-01T00:00:00.000Z"), Some(expected));
        let before_zero =
            Utc.with_ymd_and_hms(-1, 6, 15, 12, 30, 0).unwrap() + chrono::Duration::milliseconds(250);
        assert_eq!(parse_date("-000001-06-15T12:30:00.250Z"), Some(before_zero));
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn test_binary_projects_to_base64() {
        assert_eq!(
            Value::Binary(b"hi!".to_vec()).to_json_string(),
            r#""aGkh""#
        );
    }

    #[test]
    fn test_raw_is_verbatim() {
        let raw = RawValue::from_string(r#"{"custom":[1,2]}"#.to_string()).unwrap();
        assert_eq!(Value::Raw(raw).to_json_string(), r#"{"custom":[1,2]}"#);
    }

    #[test]
    fn test_function_parse_with_params() {
        let source = FunctionSource::parse("function foo(a, b) { console.log('Hello World!'); }");
        assert_eq!(source.params, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(source.body, " console.log('Hello World!'); ");
    }

    #[test]
    fn test_function_parse_without_params() {
        let source = FunctionSource::parse("function foo() { return 1; }");
        assert!(source.params.is_empty());
        assert_eq!(source.to_wire(), Value::from(" return 1; "));
    }

    #[test]
    fn test_function_wire_roundtrip() {
        let source = FunctionSource::new(vec!["n".into()], " return n * 2; ");
        assert_eq!(FunctionSource::from_wire(&source.to_wire()), Some(source));
    }

    #[test]
    fn test_error_object_copy() {
        let err = ErrorValue::new(ErrorKind::RangeError, "too big")
            .with_stack("at foo")
            .with_property("code", 7);
        let object = err.clone().into_object();
        let Value::Object(map) = object else {
            panic!("expected object");
        };
        assert_eq!(map.get("message"), Some(&Value::from("too big")));
        assert_eq!(map.get("stack"), Some(&Value::from("at foo")));
        assert_eq!(map.get("code"), Some(&Value::from(7)));

        let back = ErrorValue::from_object(ErrorKind::RangeError, map);
        assert_eq!(back, err);
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::Number(1.0), Value::from("1"));
    }

    #[test]
    fn test_from_json_value() {
        let json = serde_json::json!({"a": [1, "b", null], "c": false});
        let value = Value::from(json);
        let map = value.as_object().unwrap();
        assert_eq!(
            map.get("a"),
            Some(&Value::Array(vec![
                Value::from(1),
                Value::from("b"),
                Value::Null
            ]))
        );
        assert_eq!(map.get("c"), Some(&Value::Bool(false)));
    }
}
