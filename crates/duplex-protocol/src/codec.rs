//! Type-preserving value codec.
//!
//! `serialize` rewrites an argument list in place into JSON-safe values and
//! returns the typeinfo needed to undo it. `deserialize` replays that typeinfo
//! in list order. Composite values (objects and arrays) hold their own
//! `[typeinfo, payload]` pair and are only tagged when something inside them
//! needed encoding.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CodecError;
use crate::typeinfo::{tags_from_value, tags_to_value, Tag, TypeKind};
use crate::value::{format_date, parse_date, ErrorValue, FunctionSource, RegExp, Value};

/// What to do with function-valued arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionPolicy {
    /// Refuse to encode functions; leave inbound function tags undecoded.
    #[default]
    Reject,
    /// Carry function source as inert data in both directions.
    Opaque,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    function_policy: FunctionPolicy,
}

impl Codec {
    pub fn new(function_policy: FunctionPolicy) -> Self {
        Self { function_policy }
    }

    pub fn function_policy(&self) -> FunctionPolicy {
        self.function_policy
    }

    /// Encode `args` in place, returning one tag per rewritten position.
    pub fn serialize(&self, args: &mut [Value]) -> Result<Vec<Tag>, CodecError> {
        let mut typeinfo = Vec::new();
        for (index, value) in args.iter_mut().enumerate() {
            if let Some(kind) = self.encode_value(value)? {
                typeinfo.push(Tag::new(index, kind));
            }
        }
        Ok(typeinfo)
    }

    fn encode_value(&self, value: &mut Value) -> Result<Option<TypeKind>, CodecError> {
        let kind = match value {
            Value::Date(date) => {
                let encoded = date
                    .as_ref()
                    .map_or(Value::Null, |date| Value::String(format_date(date)));
                *value = encoded;
                TypeKind::Date
            }
            Value::RegExp(re) => {
                let mut tuple = vec![Value::String(std::mem::take(&mut re.source))];
                if !re.flags.is_empty() {
                    tuple.push(Value::String(std::mem::take(&mut re.flags)));
                }
                tuple.push(Value::Number(re.last_index as f64));
                *value = Value::Array(tuple);
                TypeKind::RegExp
            }
            // The JSON projection already base64-encodes the bytes.
            Value::Binary(_) => TypeKind::Binary,
            Value::Number(n) if *n == f64::INFINITY => TypeKind::PosInfinity,
            Value::Number(n) if *n == f64::NEG_INFINITY => TypeKind::NegInfinity,
            Value::Number(n) if n.is_nan() => TypeKind::NaN,
            Value::Function(source) => match self.function_policy {
                FunctionPolicy::Reject => return Err(CodecError::FunctionRejected),
                FunctionPolicy::Opaque => {
                    let encoded = source.to_wire();
                    *value = encoded;
                    TypeKind::Function
                }
            },
            Value::Error(err) => {
                let kind = TypeKind::Error(err.kind);
                let encoded = std::mem::take(err).into_object();
                *value = encoded;
                kind
            }
            Value::Array(items) => {
                let nested = self.serialize(items)?;
                if nested.is_empty() {
                    return Ok(None);
                }
                let payload = std::mem::take(items);
                *value = Value::Array(vec![tags_to_value(&nested), Value::Array(payload)]);
                TypeKind::Array
            }
            Value::Object(map) => {
                let mut flat = Vec::with_capacity(map.len() * 2);
                for (key, item) in std::mem::take(map) {
                    flat.push(Value::String(key));
                    flat.push(item);
                }
                let nested = self.serialize(&mut flat)?;
                if nested.is_empty() {
                    *map = unflatten(flat);
                    return Ok(None);
                }
                *value = Value::Array(vec![tags_to_value(&nested), Value::Array(flat)]);
                TypeKind::Object
            }
            _ => return Ok(None),
        };
        Ok(Some(kind))
    }

    /// Undo [`Codec::serialize`]. Tags that do not fit their argument leave
    /// it as decoded JSON.
    pub fn deserialize(&self, typeinfo: &[Tag], args: &mut [Value]) {
        for tag in typeinfo {
            if let Some(value) = args.get_mut(tag.index) {
                self.decode_value(tag.kind, value);
            }
        }
    }

    fn decode_value(&self, kind: TypeKind, value: &mut Value) {
        match kind {
            TypeKind::Object => {
                if let Some((nested, mut payload)) = take_nested(value) {
                    self.deserialize(&nested, &mut payload);
                    *value = Value::Object(unflatten(payload));
                }
            }
            TypeKind::Array => {
                if let Some((nested, mut payload)) = take_nested(value) {
                    self.deserialize(&nested, &mut payload);
                    *value = Value::Array(payload);
                }
            }
            TypeKind::Date => *value = Value::Date(decode_date(value)),
            TypeKind::RegExp => {
                if let Some(re) = decode_regexp(value) {
                    *value = Value::RegExp(re);
                }
            }
            TypeKind::Binary => {
                if let Some(bytes) = decode_binary(value) {
                    *value = Value::Binary(bytes);
                }
            }
            TypeKind::NaN => *value = Value::Number(f64::NAN),
            TypeKind::PosInfinity => *value = Value::Number(f64::INFINITY),
            TypeKind::NegInfinity => *value = Value::Number(f64::NEG_INFINITY),
            TypeKind::Function => match self.function_policy {
                FunctionPolicy::Reject => {
                    warn!("Ignoring function-valued argument, function policy is reject");
                }
                FunctionPolicy::Opaque => {
                    if let Some(source) = FunctionSource::from_wire(value) {
                        *value = Value::Function(source);
                    }
                }
            },
            TypeKind::Error(error_kind) => {
                if let Value::Object(map) = value {
                    let map = std::mem::take(map);
                    *value = Value::Error(ErrorValue::from_object(error_kind, map));
                }
            }
        }
    }
}

/// Split a `[typeinfo, payload]` pair out of `value` if it has that shape.
fn take_nested(value: &mut Value) -> Option<(Vec<Tag>, Vec<Value>)> {
    let Value::Array(pair) = value else {
        return None;
    };
    if pair.len() != 2 || !matches!(pair[1], Value::Array(_)) {
        return None;
    }
    let nested = tags_from_value(&pair[0])?;
    match pair.pop() {
        Some(Value::Array(payload)) => Some((nested, payload)),
        _ => None,
    }
}

/// Rebuild an object from an interleaved key/value list.
fn unflatten(flat: Vec<Value>) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    let mut items = flat.into_iter();
    while let Some(key) = items.next() {
        let key = match key {
            Value::String(key) => key,
            other => other.to_json_string(),
        };
        map.insert(key, items.next().unwrap_or(Value::Null));
    }
    map
}

fn decode_date(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match value {
        Value::String(text) => parse_date(text),
        Value::Number(millis) if millis.is_finite() => DateTime::from_timestamp_millis(*millis as i64),
        Value::Date(date) => *date,
        _ => None,
    }
}

fn decode_regexp(value: &Value) -> Option<RegExp> {
    let parts = value.as_array()?;
    let (source, flags, last_index) = match parts.as_slice() {
        [source, last_index] => (source.as_str()?, "", last_index),
        [source, flags, last_index] => (source.as_str()?, flags.as_str()?, last_index),
        _ => return None,
    };
    Some(RegExp::new(source, flags).with_last_index(last_index.as_u64().unwrap_or(0)))
}

fn decode_binary(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(encoded) => STANDARD.decode(encoded).ok(),
        Value::Array(items) => bytes_from_list(items),
        // `{"type": "Buffer", "data": [..]}` as produced by some peers.
        Value::Object(map) => match (map.get("type"), map.get("data")) {
            (Some(Value::String(tag)), Some(Value::Array(items))) if tag == "Buffer" => {
                bytes_from_list(items)
            }
            _ => None,
        },
        Value::Binary(bytes) => Some(bytes.clone()),
        _ => None,
    }
}

fn bytes_from_list(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorKind;
    use chrono::{TimeZone, Utc};

    fn wire_roundtrip(codec: &Codec, args: &[Value]) -> (Vec<Tag>, Vec<Value>) {
        let mut encoded = args.to_vec();
        let typeinfo = codec.serialize(&mut encoded).unwrap();
        let json = serde_json::to_string(&encoded).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let mut decoded: Vec<Value> = match Value::from(parsed) {
            Value::Array(items) => items,
            other => panic!("expected array, got {:?}", other),
        };
        codec.deserialize(&typeinfo, &mut decoded);
        (typeinfo, decoded)
    }

    #[test]
    fn test_json_compatible_types_are_untouched() {
        let mut args = vec![
            Value::from(1),
            Value::from("string"),
            Value::Bool(true),
            Value::Null,
        ];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert!(typeinfo.is_empty());
        assert_eq!(
            serde_json::to_string(&args).unwrap(),
            r#"[1,"string",true,null]"#
        );
    }

    #[test]
    fn test_plain_nested_structures_are_untouched() {
        let nested = Value::object([
            ("a", Value::Array(vec![Value::from(1), Value::from("x")])),
            ("b", Value::object([("c", Value::Null)])),
        ]);
        let mut args = vec![nested.clone()];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert!(typeinfo.is_empty());
        assert_eq!(args, vec![nested]);
    }

    #[test]
    fn test_date_encoding() {
        let date = Utc.timestamp_millis_opt(1_383_273_825_730).unwrap();
        let mut args = vec![Value::from(date)];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert_eq!(typeinfo, vec![Tag::new(0, TypeKind::Date)]);
        assert_eq!(args, vec![Value::from("2013-11-01T02:43:45.730Z")]);
    }

    #[test]
    fn test_dates_outside_four_digit_years_survive() {
        let codec = Codec::default();
        let far_future = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let before_zero = Utc.with_ymd_and_hms(-1, 1, 1, 0, 0, 0).unwrap();

        let mut args = vec![Value::from(far_future), Value::from(before_zero)];
        codec.serialize(&mut args).unwrap();
        assert_eq!(
            args,
            vec![
                Value::from("+010000-01-01T00:00:00.000Z"),
                Value::from("-000001-01-01T00:00:00.000Z"),
            ]
        );

        let original = vec![Value::from(far_future), Value::from(before_zero)];
        let (_, decoded) = wire_roundtrip(&codec, &original);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_invalid_date_encodes_as_null() {
        let mut args = vec![Value::Date(None)];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert_eq!(typeinfo, vec![Tag::new(0, TypeKind::Date)]);
        assert_eq!(args, vec![Value::Null]);
    }

    #[test]
    fn test_regexp_with_and_without_flags() {
        let mut args = vec![
            Value::from(RegExp::new("^Hello World$", "gi")),
            Value::from(RegExp::new("^Hello World$", "")),
        ];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert_eq!(
            typeinfo,
            vec![Tag::new(0, TypeKind::RegExp), Tag::new(1, TypeKind::RegExp)]
        );
        assert_eq!(
            serde_json::to_string(&args).unwrap(),
            r#"[["^Hello World$","gi",0],["^Hello World$",0]]"#
        );
    }

    #[test]
    fn test_function_rejected_by_default() {
        let mut args = vec![Value::from(FunctionSource::parse("function () {}"))];
        assert_eq!(
            Codec::default().serialize(&mut args),
            Err(CodecError::FunctionRejected)
        );
    }

    #[test]
    fn test_function_opaque_encoding() {
        let codec = Codec::new(FunctionPolicy::Opaque);
        let mut args = vec![Value::from(FunctionSource::parse(
            "function foo(a, b) { console.log('Hello World!'); }",
        ))];
        let typeinfo = codec.serialize(&mut args).unwrap();
        assert_eq!(typeinfo, vec![Tag::new(0, TypeKind::Function)]);
        assert_eq!(
            serde_json::to_string(&args).unwrap(),
            r#"[[["a","b"]," console.log('Hello World!'); "]]"#
        );
    }

    #[test]
    fn test_inbound_function_left_raw_when_rejected() {
        let mut args = vec![Value::from(" return 1; ")];
        Codec::default().deserialize(&[Tag::new(0, TypeKind::Function)], &mut args);
        assert_eq!(args, vec![Value::from(" return 1; ")]);
    }

    #[test]
    fn test_non_finite_numbers_tag_only() {
        let mut args = vec![
            Value::Number(f64::NAN),
            Value::Number(f64::INFINITY),
            Value::Number(f64::NEG_INFINITY),
            Value::Number(1.5),
        ];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert_eq!(
            typeinfo,
            vec![
                Tag::new(0, TypeKind::NaN),
                Tag::new(1, TypeKind::PosInfinity),
                Tag::new(2, TypeKind::NegInfinity),
            ]
        );
        assert_eq!(serde_json::to_string(&args).unwrap(), "[null,null,null,1.5]");
    }

    #[test]
    fn test_nested_object_typeinfo() {
        let date = Utc.timestamp_millis_opt(0).unwrap();
        let mut args = vec![
            Value::from("plain"),
            Value::object([("when", Value::from(date)), ("n", Value::from(1))]),
        ];
        let typeinfo = Codec::default().serialize(&mut args).unwrap();
        assert_eq!(typeinfo, vec![Tag::new(1, TypeKind::Object)]);
        // Keys and values are interleaved: ["n", 1, "when", <date>].
        assert_eq!(
            serde_json::to_string(&args[1]).unwrap(),
            r#"[[3.2],["n",1,"when","1970-01-01T00:00:00.000Z"]]"#
        );
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let codec = Codec::new(FunctionPolicy::Opaque);
        let date = Utc.timestamp_millis_opt(1_383_273_825_730).unwrap();
        let args = vec![
            Value::from(date),
            Value::from(RegExp::new("a+b", "g").with_last_index(3)),
            Value::Binary(vec![0, 1, 2, 254, 255]),
            Value::from(FunctionSource::new(vec!["n".into()], " return n * 2; ")),
            Value::Number(f64::NAN),
            Value::Number(f64::INFINITY),
            Value::Number(f64::NEG_INFINITY),
            Value::from(ErrorValue::new(ErrorKind::Error, "boom").with_property("code", 42)),
            Value::from(ErrorValue::new(ErrorKind::TypeError, "bad type")),
            Value::from(ErrorValue::new(ErrorKind::UriError, "bad uri").with_stack("at x")),
            Value::from("tail"),
        ];
        let (typeinfo, decoded) = wire_roundtrip(&codec, &args);
        assert_eq!(typeinfo.len(), 10);
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_roundtrip_deeply_nested() {
        let codec = Codec::default();
        let date = Utc.timestamp_millis_opt(86_400_000).unwrap();
        let inner = Value::Array(vec![
            Value::from(date),
            Value::object([("inf", Value::Number(f64::INFINITY))]),
            Value::from(3),
        ]);
        let args = vec![Value::object([
            ("list", inner),
            ("bytes", Value::Binary(b"xyz".to_vec())),
            ("re", Value::from(RegExp::new("x", "i"))),
            ("plain", Value::from("kept")),
        ])];
        let (typeinfo, decoded) = wire_roundtrip(&codec, &args);
        assert_eq!(typeinfo, vec![Tag::new(0, TypeKind::Object)]);
        assert_eq!(decoded, args);
    }

    #[test]
    fn test_unknown_tags_are_ignored() {
        let mut args = vec![Value::from("2013-11-01T02:43:45.730Z")];
        let typeinfo: Vec<Tag> = [0.33].into_iter().filter_map(Tag::unpack).collect();
        Codec::default().deserialize(&typeinfo, &mut args);
        assert_eq!(args, vec![Value::from("2013-11-01T02:43:45.730Z")]);
    }

    #[test]
    fn test_out_of_range_tag_is_ignored() {
        let mut args = vec![Value::from(1)];
        Codec::default().deserialize(&[Tag::new(5, TypeKind::Date)], &mut args);
        assert_eq!(args, vec![Value::from(1)]);
    }

    #[test]
    fn test_binary_accepts_buffer_object_form() {
        let mut args = vec![Value::from(serde_json::json!({
            "type": "Buffer",
            "data": [104, 105]
        }))];
        Codec::default().deserialize(&[Tag::new(0, TypeKind::Binary)], &mut args);
        assert_eq!(args, vec![Value::Binary(b"hi".to_vec())]);
    }

    #[test]
    fn test_regexp_two_element_form() {
        let mut args = vec![Value::from(serde_json::json!(["^abc$", 4]))];
        Codec::default().deserialize(&[Tag::new(0, TypeKind::RegExp)], &mut args);
        assert_eq!(
            args,
            vec![Value::from(RegExp::new("^abc$", "").with_last_index(4))]
        );
    }
}
