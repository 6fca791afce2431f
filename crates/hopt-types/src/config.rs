//! Per-trial configuration snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

use crate::errors::{ConfigError, HoptResult};

/// A flat mapping of parameter name to value.
///
/// Used both as the base snapshot of every parsed argument and as the
/// complete, independent configuration handed to one trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialConfig {
    values: Map<String, Value>,
}

impl TrialConfig {
    pub fn new() -> Self {
        Self { values: Map::new() }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or override a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Override entries with the keys of a JSON object.
    pub fn overlay(&mut self, other: Map<String, Value>) {
        for (k, v) in other {
            self.values.insert(k, v);
        }
    }

    /// Override entries with the top-level keys of a JSON object file.
    pub fn overlay_json_file(&mut self, path: impl AsRef<Path>) -> HoptResult<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => {
                self.overlay(map);
                Ok(())
            }
            _ => Err(ConfigError::OverlayNotObject {
                path: path.display().to_string(),
            }
            .into()),
        }
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.values
    }
}

impl From<Map<String, Value>> for TrialConfig {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl fmt::Display for TrialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "-".repeat(100))?;
        writeln!(f, "Hyperparameters:")?;
        for (k, v) in &self.values {
            writeln!(f, "{k:20}: {v}")?;
        }
        Ok(())
    }
}
