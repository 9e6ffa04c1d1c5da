// Query text with bound parameters, and the signature derived from both.
use crate::core::record::Value;
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    text: String,
    params: Vec<Value>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_params(mut self, params: impl IntoIterator<Item = Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn signature(&self) -> QuerySignature {
        QuerySignature::of(self)
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

/// Cache key covering the full identity of a query: its text and every
/// bound parameter, in order.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QuerySignature([u8; 32]);

impl QuerySignature {
    pub fn of(query: &Query) -> Self {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, b"q", query.text.as_bytes());
        for param in &query.params {
            match param {
                Value::Null => update_framed(&mut hasher, b"n", &[]),
                Value::Integer(value) => update_framed(&mut hasher, b"i", &value.to_le_bytes()),
                Value::Real(value) => update_framed(&mut hasher, b"r", &value.to_bits().to_le_bytes()),
                Value::Text(value) => update_framed(&mut hasher, b"t", value.as_bytes()),
                Value::Blob(value) => update_framed(&mut hasher, b"b", value),
            }
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Tag and length prefix keep ("ab", "c") and ("a", "bc") apart.
fn update_framed(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
