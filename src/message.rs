//! The QMP message unit.

use std::{fmt, sync::OnceLock};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One QMP protocol unit: a command, a reply or an event.
///
/// A `Message` holds up to two representations of the same JSON object: the
/// raw bytes and the decoded key/value map. Whichever one the message was
/// built from is authoritative; the other is derived on first use. Mutating
/// the map drops the cached bytes, and the next byte access reserializes the
/// current map in compact form.
///
/// Messages built with [`Message::from_bytes`] and `eager == false` are only
/// validated when first inspected. For such a message the mapping accessors
/// ([`get`](Self::get), [`len`](Self::len), ...) behave as if the object were
/// empty when the bytes turn out to be invalid; use [`object`](Self::object)
/// to observe the error.
#[derive(Clone, Default)]
pub struct Message {
    data: OnceLock<Vec<u8>>,
    obj: OnceLock<Map<String, Value>>,
}

impl Message {
    /// An empty JSON object.
    #[must_use]
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// Wrap raw bytes received from (or destined for) the wire.
    ///
    /// With `eager` set, the bytes are decoded immediately and a malformed
    /// payload is reported here; otherwise decoding is deferred.
    pub fn from_bytes(data: impl Into<Vec<u8>>, eager: bool) -> Result<Self> {
        let msg = Self {
            data: OnceLock::from(data.into()),
            obj: OnceLock::new(),
        };
        if eager {
            msg.object()?;
        }
        Ok(msg)
    }

    /// Wrap an already decoded JSON object.
    #[must_use]
    pub fn from_map(obj: Map<String, Value>) -> Self {
        Self {
            data: OnceLock::new(),
            obj: OnceLock::from(obj),
        }
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(obj) => Ok(Self::from_map(obj)),
            other => Err(Error::UnexpectedType {
                found: json_type_name(&other),
            }),
        }
    }

    /// The decoded key/value view, decoding the bytes if needed.
    pub fn object(&self) -> Result<&Map<String, Value>> {
        if let Some(obj) = self.obj.get() {
            return Ok(obj);
        }

        let data = self.data.get().map_or(&b"{}"[..], Vec::as_slice);
        let obj = decode(data)?;
        Ok(self.obj.get_or_init(|| obj))
    }

    /// Compact wire serialization of this message (without the trailing
    /// newline).
    pub fn to_bytes(&self) -> Result<&[u8]> {
        if let Some(data) = self.data.get() {
            return Ok(data);
        }

        let data = match self.obj.get() {
            Some(obj) => serde_json::to_vec(obj)?,
            None => b"{}".to_vec(),
        };
        Ok(self.data.get_or_init(|| data))
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.object().ok().and_then(|obj| obj.get(key))
    }

    /// String stored under `key`, if the value is a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of top-level keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.object().map(Map::len).unwrap_or(0)
    }

    /// Whether the object has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over top-level entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.object().ok().into_iter().flat_map(|obj| obj.iter())
    }

    /// Iterate over top-level keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.iter().map(|(k, _)| k)
    }

    /// Set `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        Ok(self.object_mut()?.insert(key.into(), value.into()))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        Ok(self.object_mut()?.remove(key))
    }

    /// Consume the message, returning the JSON object as a [`Value`].
    pub fn into_value(self) -> Result<Value> {
        self.into_map().map(Value::Object)
    }

    /// Consume the message, returning the JSON object.
    pub fn into_map(mut self) -> Result<Map<String, Value>> {
        self.object()?;
        Ok(self.obj.take().unwrap_or_default())
    }

    /// Indented rendering for logs and display. Not the wire format.
    #[must_use]
    pub fn pretty(&self) -> String {
        match self.object() {
            Ok(obj) => serde_json::to_string_pretty(obj)
                .unwrap_or_else(|_| String::from_utf8_lossy(self.raw()).into_owned()),
            Err(_) => String::from_utf8_lossy(self.raw()).into_owned(),
        }
    }

    /// Name of the event, when this message is an event.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        self.get_str("event")
    }

    fn object_mut(&mut self) -> Result<&mut Map<String, Value>> {
        self.object()?;
        self.data.take();
        self.obj
            .get_mut()
            .ok_or_else(|| Error::protocol("message object vanished during mutation"))
    }

    fn raw(&self) -> &[u8] {
        self.data.get().map(Vec::as_slice).unwrap_or_default()
    }
}

fn decode(data: &[u8]) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_slice(data).map_err(|e| Error::Deserialization {
        raw: String::from_utf8_lossy(data).into_owned(),
        source: std::sync::Arc::new(e),
    })?;

    match value {
        Value::Object(obj) => Ok(obj),
        other => Err(Error::UnexpectedType {
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        match (self.object(), other.object()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.raw() == other.raw(),
        }
    }
}

impl From<Map<String, Value>> for Message {
    fn from(obj: Map<String, Value>) -> Self {
        Self::from_map(obj)
    }
}

impl TryFrom<Value> for Message {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.object()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(data) => write!(f, "Message({})", String::from_utf8_lossy(data)),
            Err(_) => write!(f, "Message(<unserializable>)"),
        }
    }
}
