//! Routing patterns and their canonical string form.
//!
//! A pattern is either a plain name (`"user.created"`) or a structured key
//! (`{ "resource": "user", "cmd": "created" }`). Both client and server reduce
//! a pattern to the same canonical string, which names the stream and routes
//! entries to handlers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Routing key for events and requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pattern {
    /// Plain string pattern, used verbatim.
    Name(String),
    /// Structured pattern. Keys are kept sorted.
    Keyed(BTreeMap<String, Value>),
}

impl Pattern {
    /// Build a structured pattern from key/value pairs in any order.
    pub fn keyed<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Pattern::Keyed(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Interpret an arbitrary JSON value as a pattern.
    ///
    /// Strings become `Name`, objects become `Keyed`; anything else is named by
    /// its JSON text.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Pattern::Name(s),
            Value::Object(map) => Pattern::Keyed(map.into_iter().collect()),
            other => Pattern::Name(other.to_string()),
        }
    }

    /// Canonical string form shared by client and server.
    ///
    /// Names are returned unchanged. Structured keys are encoded as compact
    /// JSON with lexicographically sorted top-level keys, so two keys with the
    /// same fields in a different order canonicalize identically.
    pub fn canonicalize(&self) -> String {
        match self {
            Pattern::Name(name) => name.clone(),
            Pattern::Keyed(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
            .to_string(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonicalize())
    }
}

impl From<&str> for Pattern {
    fn from(name: &str) -> Self {
        Pattern::Name(name.to_string())
    }
}

impl From<String> for Pattern {
    fn from(name: String) -> Self {
        Pattern::Name(name)
    }
}

impl From<&String> for Pattern {
    fn from(name: &String) -> Self {
        Pattern::Name(name.clone())
    }
}

impl From<BTreeMap<String, Value>> for Pattern {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Pattern::Keyed(fields)
    }
}

impl From<&Pattern> for Pattern {
    fn from(pattern: &Pattern) -> Self {
        pattern.clone()
    }
}

/// Canonicalize anything convertible into a [`Pattern`].
pub fn canonicalize(pattern: impl Into<Pattern>) -> String {
    pattern.into().canonicalize()
}
