//! Ordered key-value container for step data and tool arguments.
//!
//! `Vars` wraps a JSON object and preserves insertion order, so outputs
//! render in the order steps produced them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vars(Map<String, Value>);

#[allow(unused)]
impl Vars {
    /// create an empty set
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Set a key to any value convertible into JSON.
    pub fn set<V: Into<Value>>(
        &mut self,
        key: &str,
        value: V,
    ) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Insert a pre-built JSON value.
    pub fn insert(
        &mut self,
        key: String,
        value: Value,
    ) {
        self.0.insert(key, value);
    }

    /// Builder-style insert.
    pub fn with<V: Into<Value>>(
        mut self,
        key: &str,
        value: V,
    ) -> Self {
        self.set(key, value);
        self
    }

    /// Get a key, deserialized into the requested type.
    pub fn get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<T> {
        self.0.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Raw access to a key.
    pub fn value(
        &self,
        key: &str,
    ) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(
        &self,
        key: &str,
    ) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Vars> for Value {
    fn from(vars: Vars) -> Self {
        Value::Object(vars.0)
    }
}

impl From<Value> for Vars {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }
}
