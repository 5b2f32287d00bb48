//! Bucket key generation and handling.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CooldownError, Result};

/// Prefix of the current bucket key encoding.
const KEY_ENCODING_V1: &str = "v1:";

/// A hashable argument value.
///
/// Serialized as a tagged value so that decoding reproduces the exact variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<ArgValue>),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "null"),
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Str(s) => write!(f, "{:?}", s),
            ArgValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int(value as i64)
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        ArgValue::Int(value as i64)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(values: Vec<T>) -> Self {
        ArgValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ArgValue::Null)
    }
}

/// The arguments of one guarded invocation.
///
/// Named values are kept sorted by name, so two calls passing the same
/// named values in a different order carry equal arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    positional: Vec<ArgValue>,
    named: BTreeMap<String, ArgValue>,
}

impl CallArgs {
    /// Create an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional value.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named value, replacing any previous value with the same name.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self) -> &[ArgValue] {
        &self.positional
    }

    pub fn named_values(&self) -> &BTreeMap<String, ArgValue> {
        &self.named
    }

    /// Look up a named value.
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.named.get(name)
    }
}

/// A key that uniquely identifies a bucket within one limiter.
///
/// Equality and hashing are structural: positional order matters,
/// named order does not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Positional values in call order
    #[serde(default)]
    pub positional: Vec<ArgValue>,
    /// Named values sorted by name
    #[serde(default)]
    pub named: BTreeMap<String, ArgValue>,
}

impl BucketKey {
    /// Create a key from positional and named values.
    pub fn new(positional: Vec<ArgValue>, named: BTreeMap<String, ArgValue>) -> Self {
        Self { positional, named }
    }

    /// Create a key holding a single positional value.
    pub fn single(value: impl Into<ArgValue>) -> Self {
        Self {
            positional: vec![value.into()],
            named: BTreeMap::new(),
        }
    }

    /// Encode this key into its portable string form.
    pub fn encode(&self) -> Result<String> {
        Ok(format!("{}{}", KEY_ENCODING_V1, serde_json::to_string(self)?))
    }

    /// Decode a key produced by [`BucketKey::encode`].
    pub fn decode(encoded: &str) -> Result<Self> {
        let body = encoded.strip_prefix(KEY_ENCODING_V1).ok_or_else(|| {
            CooldownError::State(format!("Unsupported bucket key encoding: {}", encoded))
        })?;
        Ok(serde_json::from_str(body)?)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for value in &self.positional {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
            first = false;
        }
        for (name, value) in &self.named {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
            first = false;
        }
        write!(f, ")")
    }
}
