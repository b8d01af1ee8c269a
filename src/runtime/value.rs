//! Workflow values and their persisted representation
//!
//! Variables, arguments, results and bookmark payloads are all
//! `preserves::IOValue`s. Snapshots carry them as preserves text so the same
//! record can go through either the packed preserves encoding or JSON.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A workflow value
pub type Value = preserves::IOValue;

/// The value bound to variables and out arguments that were never assigned
pub fn null() -> Value {
    Value::symbol("null")
}

/// Serde adapter: serialize a [`Value`] as preserves text
pub mod text_serde {
    use super::*;

    /// Serialize a value as preserves text
    pub fn serialize<S>(value: &Value, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = format!("{:?}", value);
        serializer.serialize_str(&text)
    }

    /// Parse a value from preserves text
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A value wrapped for inclusion in serialized records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedValue(#[serde(with = "text_serde")] pub Value);

impl PersistedValue {
    /// Unwrap into the runtime value
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for PersistedValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A named value, used for environments and workflow outputs in records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    /// Location name
    pub name: String,
    /// Bound value
    pub value: PersistedValue,
}
