//! Custom metadata codec.
//!
//! An ordered mapping from lower-cased ASCII key to an ordered sequence of
//! values, with a frozen bit asserted once the call commits to a response.

use base64::Engine;

use crate::status::{StatusCode, TempoError};

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_binary_key(key: &str) -> bool {
    key.ends_with("-bin")
}

fn is_printable_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// An ordered `key -> [values]` mapping with a one-way frozen bit.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, Vec<String>)>,
    frozen: bool,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Assert the frozen bit. Called once the response commits (§4.8).
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn guard_mutable(&self) -> Result<(), TempoError> {
        if self.frozen {
            Err(TempoError::new(
                StatusCode::Internal,
                "metadata is frozen and cannot be mutated",
            ))
        } else {
            Ok(())
        }
    }

    fn validate(key: &str, value: &str, is_binary: bool) -> Result<(), TempoError> {
        let lower = key.to_ascii_lowercase();
        if !is_valid_key(&lower) {
            return Err(TempoError::new(
                StatusCode::InvalidArgument,
                format!("metadata key {key:?} must match [A-Za-z0-9._-]+"),
            ));
        }
        if !is_binary && !is_printable_ascii(value) {
            return Err(TempoError::new(
                StatusCode::InvalidArgument,
                format!("metadata value for {key:?} must be printable ASCII 0x20-0x7E"),
            ));
        }
        Ok(())
    }

    /// Append a text value under `key`. `key` is lower-cased on entry.
    pub fn append(&mut self, key: &str, value: impl Into<String>) -> Result<(), TempoError> {
        self.guard_mutable()?;
        let lower = key.to_ascii_lowercase();
        let is_bin = is_binary_key(&lower);
        let value = value.into();
        Self::validate(&lower, &value, is_bin)?;
        match self.entries.iter_mut().find(|(k, _)| *k == lower) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((lower, vec![value])),
        }
        Ok(())
    }

    /// Append binary bytes under a `-bin`-suffixed key.
    pub fn append_binary(&mut self, key: &str, value: &[u8]) -> Result<(), TempoError> {
        let lower = key.to_ascii_lowercase();
        if !is_binary_key(&lower) {
            return Err(TempoError::new(
                StatusCode::InvalidArgument,
                format!("binary metadata key {key:?} must end with -bin"),
            ));
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        self.append(&lower, encoded)
    }

    /// Replace all values under `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), TempoError> {
        self.guard_mutable()?;
        let lower = key.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != lower);
        self.append(&lower, value)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        let lower = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    /// Decode a `-bin` value back to bytes.
    pub fn get_binary(&self, key: &str) -> Result<Vec<Vec<u8>>, TempoError> {
        let lower = key.to_ascii_lowercase();
        if !is_binary_key(&lower) {
            return Err(TempoError::new(
                StatusCode::InvalidArgument,
                format!("key {key:?} is not a -bin key"),
            ));
        }
        let Some(values) = self.get(&lower) else {
            return Ok(Vec::new());
        };
        values
            .iter()
            .map(|v| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map_err(|e| TempoError::new(StatusCode::InvalidArgument, e.to_string()))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Append `other`'s values onto self (never replaces), per §4.3 `concat`.
    pub fn concat(&mut self, other: &Metadata) -> Result<(), TempoError> {
        self.guard_mutable()?;
        for (key, values) in other.iter() {
            for value in values {
                self.append(key, value.clone())?;
            }
        }
        Ok(())
    }

    /// `key:v1,v2|key2:v` — `|` inside values escaped as `\|` (§4.3, §6).
    pub fn to_http_header(&self) -> String {
        self.entries
            .iter()
            .map(|(key, values)| {
                let escaped_values: Vec<String> = values.iter().map(|v| escape_pipe(v)).collect();
                format!("{}:{}", key, escaped_values.join(","))
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Inverse of [`Metadata::to_http_header`]. Unknown keys survive the
    /// round trip (§4.3) — no key/value validation beyond grammar parsing.
    pub fn from_http_header(header: &str) -> Result<Metadata, TempoError> {
        let mut metadata = Metadata::new();
        if header.is_empty() {
            return Ok(metadata);
        }
        for entry in split_unescaped(header, '|') {
            let Some((key, values_str)) = entry.split_once(':') else {
                return Err(TempoError::new(
                    StatusCode::InvalidArgument,
                    format!("malformed metadata entry: {entry:?}"),
                ));
            };
            for raw_value in split_unescaped(values_str, ',') {
                let value = unescape_pipe(&raw_value);
                metadata.append(key, value)?;
            }
        }
        Ok(metadata)
    }
}

fn escape_pipe(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

fn unescape_pipe(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('|') => {
                    out.push('|');
                    chars.next();
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on `delim`, but not when the delimiter is preceded by an odd number
/// of backslashes (i.e. it was escaped).
fn split_unescaped(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
            continue;
        }
        if c == delim {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_text_values() {
        let mut m = Metadata::new();
        m.append("x-trace", "abc").unwrap();
        m.append("x-trace", "def").unwrap();
        m.append("x-other", "v").unwrap();
        let wire = m.to_http_header();
        let back = Metadata::from_http_header(&wire).unwrap();
        assert_eq!(back.get("x-trace").unwrap(), &["abc", "def"]);
        assert_eq!(back.get("x-other").unwrap(), &["v"]);
    }

    #[test]
    fn roundtrip_binary_values() {
        let mut m = Metadata::new();
        m.append_binary("payload-bin", &[0, 1, 2, 255]).unwrap();
        let wire = m.to_http_header();
        let back = Metadata::from_http_header(&wire).unwrap();
        let decoded = back.get_binary("payload-bin").unwrap();
        assert_eq!(decoded[0], vec![0, 1, 2, 255]);
    }

    #[test]
    fn pipe_in_value_is_escaped_and_restored() {
        let mut m = Metadata::new();
        m.append("k", "a|b").unwrap();
        let wire = m.to_http_header();
        assert!(wire.contains("\\|"));
        let back = Metadata::from_http_header(&wire).unwrap();
        assert_eq!(back.get("k").unwrap(), &["a|b"]);
    }

    #[test]
    fn rejects_invalid_key() {
        let mut m = Metadata::new();
        let err = m.append("bad key!", "v").unwrap_err();
        assert_eq!(err.status, StatusCode::InvalidArgument);
    }

    #[test]
    fn rejects_non_printable_value_on_text_key() {
        let mut m = Metadata::new();
        let err = m.append("k", "\u{0007}").unwrap_err();
        assert_eq!(err.status, StatusCode::InvalidArgument);
    }

    #[test]
    fn frozen_metadata_rejects_all_mutators() {
        let mut m = Metadata::new();
        m.append("k", "v").unwrap();
        m.freeze();
        assert_eq!(
            m.append("k", "v2").unwrap_err().status,
            StatusCode::Internal
        );
        assert_eq!(m.set("k", "v3").unwrap_err().status, StatusCode::Internal);
        let other = Metadata::new();
        assert_eq!(m.concat(&other).unwrap_err().status, StatusCode::Internal);
    }

    #[test]
    fn concat_appends_never_replaces() {
        let mut a = Metadata::new();
        a.append("k", "1").unwrap();
        let mut b = Metadata::new();
        b.append("k", "2").unwrap();
        a.concat(&b).unwrap();
        assert_eq!(a.get("k").unwrap(), &["1", "2"]);
    }

    #[test]
    fn keys_are_lower_cased() {
        let mut m = Metadata::new();
        m.append("X-Trace", "v").unwrap();
        assert_eq!(m.get("x-trace").unwrap(), &["v"]);
    }
}
