//! Credential codec.
//!
//! An ordered `string -> value` mapping, wire-encoded as JSON with two
//! extensions: `bigint` values carry an `||n` string suffix, and maps are
//! tagged with a reserved `_map: true` discriminator so round-tripping
//! through `serde_json::Value` (which erases the map/object distinction
//! Tempo needs) stays lossless.

use serde_json::{Map, Value};

use crate::status::{StatusCode, TempoError};

/// A credential value, matching the set in §3: string, number, boolean,
/// bigint, nested map, or list of the above.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialValue {
    String(String),
    Number(f64),
    Bool(bool),
    BigInt(i128),
    Map(Credential),
    List(Vec<CredentialValue>),
}

/// An ordered string -> value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    entries: Vec<(String, CredentialValue)>,
}

impl Credential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: CredentialValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&CredentialValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CredentialValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const MAP_DISCRIMINATOR: &str = "_map";

fn value_to_json(value: &CredentialValue) -> Value {
    match value {
        CredentialValue::String(s) => Value::String(s.clone()),
        CredentialValue::Number(n) => {
            serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)
        }
        CredentialValue::Bool(b) => Value::Bool(*b),
        CredentialValue::BigInt(i) => Value::String(format!("{i}||n")),
        CredentialValue::Map(map) => credential_to_json(map),
        CredentialValue::List(items) => Value::Array(items.iter().map(value_to_json).collect()),
    }
}

fn credential_to_json(cred: &Credential) -> Value {
    let mut obj = Map::new();
    obj.insert(MAP_DISCRIMINATOR.to_string(), Value::Bool(true));
    for (key, value) in cred.iter() {
        obj.insert(key.to_string(), value_to_json(value));
    }
    Value::Object(obj)
}

fn json_to_value(json: &Value) -> Result<CredentialValue, TempoError> {
    match json {
        Value::String(s) => {
            if let Some(digits) = s.strip_suffix("||n") {
                digits
                    .parse::<i128>()
                    .map(CredentialValue::BigInt)
                    .map_err(|_| {
                        TempoError::new(
                            StatusCode::InvalidArgument,
                            format!("invalid bigint literal: {s:?}"),
                        )
                    })
            } else {
                Ok(CredentialValue::String(s.clone()))
            }
        }
        Value::Number(n) => Ok(CredentialValue::Number(n.as_f64().unwrap_or_default())),
        Value::Bool(b) => Ok(CredentialValue::Bool(*b)),
        Value::Array(items) => items
            .iter()
            .map(json_to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(CredentialValue::List),
        Value::Object(obj) => Ok(CredentialValue::Map(json_object_to_credential(obj)?)),
        Value::Null => Ok(CredentialValue::String(String::new())),
    }
}

fn json_object_to_credential(obj: &Map<String, Value>) -> Result<Credential, TempoError> {
    let mut cred = Credential::new();
    for (key, value) in obj {
        if key == MAP_DISCRIMINATOR {
            continue;
        }
        cred.insert(key.clone(), json_to_value(value)?);
    }
    Ok(cred)
}

/// Escape every code point at or above 0x7F as `\uXXXX` (§3, §6).
fn escape_non_ascii(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if (c as u32) >= 0x7F {
            for unit in c.encode_utf16(&mut [0u16; 2]) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Serialize a credential to its wire JSON form.
pub fn stringify_credential(cred: &Credential) -> String {
    let json = credential_to_json(cred);
    escape_non_ascii(&json.to_string())
}

/// Parse wire JSON back into a credential. Rejects a top-level value that
/// is not an object (§4.3).
pub fn parse_credential(wire: &str) -> Result<Credential, TempoError> {
    let json: Value = serde_json::from_str(wire)
        .map_err(|e| TempoError::new(StatusCode::InvalidArgument, e.to_string()))?;
    match &json {
        Value::Object(obj) => json_object_to_credential(obj),
        _ => Err(TempoError::new(
            StatusCode::InvalidArgument,
            "credential wire form must be a top-level JSON object",
        )),
    }
}
