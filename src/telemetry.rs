use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Source of live readings keyed by dotted path, e.g.
/// `electrical.batteries.0.voltage`.
pub trait TelemetryProvider: Send + Sync {
    /// Current value at `path`, or `None` when the source does not know it.
    fn read(&self, path: &str) -> Option<Value>;
}

impl<P: TelemetryProvider + ?Sized> TelemetryProvider for Arc<P> {
    fn read(&self, path: &str) -> Option<Value> {
        (**self).read(path)
    }
}

impl TelemetryProvider for HashMap<String, Value> {
    fn read(&self, path: &str) -> Option<Value> {
        self.get(path).cloned()
    }
}

/// One delta line: `{"path": "electrical.batteries.0.voltage", "value": 12.6}`.
/// A `null` value forgets the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub path: String,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum DeltaLine {
    One(TelemetryUpdate),
    Many(Vec<TelemetryUpdate>),
}

/// Latest-value snapshot shared between whoever feeds telemetry and the
/// sampler. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct SharedTelemetry {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<String>, value: impl Into<Value>) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(path.into(), value.into());
    }

    pub fn remove(&self, path: &str) -> Option<Value> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(path)
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply(&self, update: TelemetryUpdate) {
        match update.value {
            Some(value) => self.set(update.path, value),
            None => {
                self.remove(&update.path);
            }
        }
    }

    /// Applies one JSON line holding an update or an array of updates.
    /// Returns how many updates were applied.
    pub fn apply_line(&self, line: &str) -> Result<usize, serde_json::Error> {
        let updates = match serde_json::from_str::<DeltaLine>(line)? {
            DeltaLine::One(update) => vec![update],
            DeltaLine::Many(updates) => updates,
        };
        let count = updates.len();
        for update in updates {
            self.apply(update);
        }
        Ok(count)
    }

    /// Loads a nested full-model document such as
    /// `{"electrical": {"batteries": {"0": {"voltage": {"value": 12.6}}}}}`.
    /// Leaves are either scalars or objects carrying a `value` field.
    pub fn load_document(&self, document: &serde_json::Value) -> usize {
        let mut flat = Vec::new();
        flatten(document, String::new(), &mut flat);
        let count = flat.len();
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.extend(flat);
        count
    }
}

fn flatten(node: &serde_json::Value, prefix: String, out: &mut Vec<(String, Value)>) {
    match node {
        serde_json::Value::Object(map) => {
            if let Some(leaf) = map.get("value") {
                if let Some(value) = scalar(leaf) {
                    out.push((prefix, value));
                    return;
                }
            }
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(child, path, out);
            }
        }
        other => {
            if let Some(value) = scalar(other) {
                if !prefix.is_empty() {
                    out.push((prefix, value));
                }
            }
        }
    }
}

fn scalar(node: &serde_json::Value) -> Option<Value> {
    match node {
        serde_json::Value::Bool(b) => Some(Value::from(*b)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Number)),
        serde_json::Value::String(s) => Some(Value::Text(s.clone())),
        _ => None,
    }
}

impl TelemetryProvider for SharedTelemetry {
    fn read(&self, path: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }
}
