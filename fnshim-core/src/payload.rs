//! Handler return values
//!
//! `serde_json::Value` has no way to hold an exact decimal, so handlers
//! return a [`Payload`] instead. It mirrors the JSON data model and adds a
//! `Decimal` variant that is written out as an integer when it holds an
//! integral value and as the nearest float otherwise.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// A JSON-shaped value with exact decimals
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    Decimal(Decimal),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Build an object payload from key/value pairs
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Payload>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Serialize to a compact JSON document
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Lossy conversion into a plain JSON value
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Decimal(d) => Value::Number(decimal_number(d)),
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            Self::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

/// JSON number for an exact decimal.
///
/// The decimal goes through `f64` first; an integral result that fits in
/// `i64` becomes an integer, anything else stays a float. Serialization
/// writes larger integral values as digits via [`integral_decimal`], which
/// a plain [`Number`] cannot hold.
#[allow(clippy::float_cmp, clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn decimal_number(value: &Decimal) -> Number {
    let float = value.to_f64().unwrap_or_default();
    if float.trunc() == float && float >= i64::MIN as f64 && float < i64::MAX as f64 {
        return Number::from(float as i64);
    }
    Number::from_f64(float).unwrap_or_else(|| Number::from(0))
}

/// The integer an exact decimal is written as, when its `f64` value is
/// integral. Every decimal is within `i128` range.
#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
pub fn integral_decimal(value: &Decimal) -> Option<i128> {
    let float = value.to_f64()?;
    (float.is_finite() && float.trunc() == float).then(|| float as i128)
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::Decimal(d) => match integral_decimal(d) {
                Some(whole) => serializer.serialize_i128(whole),
                None => decimal_number(d).serialize(serializer),
            },
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => {
                Self::Object(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<Decimal> for Payload {
    fn from(value: Decimal) -> Self {
        Self::Decimal(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for Payload {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<()> for Payload {
    fn from((): ()) -> Self {
        Self::Null
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(value: Vec<T>) -> Self {
        Self::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Payload>> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::object(iter)
    }
}
