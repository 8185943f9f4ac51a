//! Typeinfo tags.
//!
//! A tag names one argument position and the kind of value that was encoded
//! there. On the wire it is a single number: the integer part is the index,
//! the fractional part (two decimals) the kind.

use serde::{Serialize, Serializer};

use crate::value::{ErrorKind, Value};

/// Original kind of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Object,
    Array,
    Date,
    Binary,
    Function,
    RegExp,
    NaN,
    PosInfinity,
    NegInfinity,
    Error(ErrorKind),
}

impl TypeKind {
    /// Kind code in hundredths (`0.91` -> `91`).
    pub fn code(self) -> u32 {
        match self {
            Self::Object => 0,
            Self::Array => 10,
            Self::Date => 20,
            Self::Binary => 30,
            Self::Function => 40,
            Self::RegExp => 50,
            Self::NaN => 60,
            Self::PosInfinity => 70,
            Self::NegInfinity => 80,
            Self::Error(ErrorKind::Error) => 90,
            Self::Error(ErrorKind::TypeError) => 91,
            Self::Error(ErrorKind::RangeError) => 92,
            Self::Error(ErrorKind::SyntaxError) => 93,
            Self::Error(ErrorKind::EvalError) => 94,
            Self::Error(ErrorKind::ReferenceError) => 95,
            Self::Error(ErrorKind::UriError) => 96,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let kind = match code {
            0 => Self::Object,
            10 => Self::Array,
            20 => Self::Date,
            30 => Self::Binary,
            40 => Self::Function,
            50 => Self::RegExp,
            60 => Self::NaN,
            70 => Self::PosInfinity,
            80 => Self::NegInfinity,
            90 => Self::Error(ErrorKind::Error),
            91 => Self::Error(ErrorKind::TypeError),
            92 => Self::Error(ErrorKind::RangeError),
            93 => Self::Error(ErrorKind::SyntaxError),
            94 => Self::Error(ErrorKind::EvalError),
            95 => Self::Error(ErrorKind::ReferenceError),
            96 => Self::Error(ErrorKind::UriError),
            _ => return None,
        };
        Some(kind)
    }

    pub fn fraction(self) -> f64 {
        f64::from(self.code()) / 100.0
    }
}

/// One typeinfo entry: which argument, and what it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub index: usize,
    pub kind: TypeKind,
}

impl Tag {
    pub fn new(index: usize, kind: TypeKind) -> Self {
        Self { index, kind }
    }

    /// Packed wire number, `index + fraction`.
    pub fn pack(self) -> f64 {
        (self.index as f64 * 100.0 + f64::from(self.kind.code())) / 100.0
    }

    /// Unpack a wire number. Unknown kinds and nonsense numbers yield `None`.
    pub fn unpack(packed: f64) -> Option<Self> {
        if !packed.is_finite() || packed < 0.0 {
            return None;
        }
        let index = packed.trunc();
        let code = ((packed - index) * 100.0).round();
        TypeKind::from_code(code as u32).map(|kind| Self::new(index as usize, kind))
    }

    /// Tag as an argument value, used for nested typeinfo lists.
    pub fn to_value(self) -> Value {
        Value::Number(self.pack())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.kind {
            TypeKind::Object => serializer.serialize_u64(self.index as u64),
            _ => serializer.serialize_f64(self.pack()),
        }
    }
}

/// Nested typeinfo as a value list.
pub fn tags_to_value(tags: &[Tag]) -> Value {
    Value::Array(tags.iter().map(|tag| tag.to_value()).collect())
}

/// Read a typeinfo list, skipping entries that are not recognisable tags.
///
/// Returns `None` when `value` is not a list at all.
pub fn tags_from_value(value: &Value) -> Option<Vec<Tag>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_f64)
            .filter_map(Tag::unpack)
            .collect(),
    )
}
