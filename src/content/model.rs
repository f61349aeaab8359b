use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

/// Fields written to the content store for one record. Blank values are
/// dropped when the request body is built, so a partial upstream response
/// never clears a stored field. Keys in `cleared` are the exception: they
/// are computed locally and an update erases them explicitly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPayload {
    pub title: Option<String>,
    pub meta: BTreeMap<String, Value>,
    pub cleared: BTreeSet<String>,
}

impl RecordPayload {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            meta: BTreeMap::new(),
            cleared: BTreeSet::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.cleared.remove(key);
        self.meta.insert(key.to_string(), value.into());
    }

    /// Set `key`, or erase the stored value when there is none.
    pub fn set_or_clear<T: Into<Value>>(&mut self, key: &str, value: Option<T>) {
        match value {
            Some(value) => self.set(key, value),
            None => {
                self.meta.remove(key);
                self.cleared.insert(key.to_string());
            }
        }
    }
}

pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PostRef {
    pub id: Value,
}

impl PostRef {
    /// WordPress returns numeric ids; other stores may use strings.
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}
