//! Values that flow through the case transformer.
//!
//! # Design
//! `Payload` is a closed set of variants. Dates and binary blobs get their own
//! variants instead of hiding inside records, so the transformer can never
//! mistake them for plain objects and rename their internals. JSON coming off
//! the wire only ever produces the primitive, array and record variants;
//! `Date` and `Binary` are introduced by callers building outbound bodies.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::ApiError;

/// An opaque file-like value: bytes plus the metadata a multipart part needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub bytes: Bytes,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl Binary {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: None,
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A request or response body value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Payload>),
    /// A plain key/value object. The only variant whose keys get renamed.
    Record(BTreeMap<String, Payload>),
    Date(DateTime<Utc>),
    Binary(Binary),
}

impl Payload {
    /// Build a record from key/value pairs.
    pub fn record<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Payload::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert any serializable value. Nested structs become records; dates
    /// inside typed structs arrive as strings.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, ApiError> {
        serde_json::to_value(value)
            .map(Payload::from)
            .map_err(|e| ApiError::Serialization(e.to_string()))
    }

    /// Decode into a typed value. Keys are matched as they currently are, so
    /// call this on local-cased data with `rename_all = "camelCase"` types.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let json =
            serde_json::to_value(self).map_err(|e| ApiError::Deserialization(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| ApiError::Deserialization(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Record(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    /// Remove `key` from a record, returning `None` for other variants.
    pub fn take(&mut self, key: &str) -> Option<Payload> {
        match self {
            Payload::Record(map) => map.remove(key),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Record(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Number(value.into())
    }
}

impl From<DateTime<Utc>> for Payload {
    fn from(value: DateTime<Utc>) -> Self {
        Payload::Date(value)
    }
}

impl From<Binary> for Payload {
    fn from(value: Binary) -> Self {
        Payload::Binary(value)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(items: Vec<T>) -> Self {
        Payload::Array(items.into_iter().map(Into::into).collect())
    }
}

/// JSON encoding. Dates are written as RFC 3339 with millisecond precision;
/// binary values cannot be JSON-encoded and must go through multipart.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Null => serializer.serialize_unit(),
            Payload::Bool(b) => serializer.serialize_bool(*b),
            Payload::Number(n) => n.serialize(serializer),
            Payload::String(s) => serializer.serialize_str(s),
            Payload::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Payload::Record(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Payload::Date(dt) => {
                serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Payload::Binary(_) => Err(S::Error::custom(
                "binary values cannot be sent in a JSON body; use a multipart upload",
            )),
        }
    }
}
