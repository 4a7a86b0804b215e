//! Per-URL scratch store threaded through one pass of node execution.
//!
//! Keys written by node executors are visible to dependent nodes and to the
//! result-collection step. Keys starting with `_` are internal control keys
//! seeded by the executor and are excluded from extracted records. Never
//! shared across URLs.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::UrlQueueItem;

pub const KEY_URL: &str = "_url";
pub const KEY_DEPTH: &str = "_depth";
pub const KEY_PHASE_ID: &str = "_phase_id";

#[derive(Clone, Default)]
pub struct ExecutionContext {
    data: Arc<DashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
        }
    }

    /// Context seeded for one item, as the executor hands it to nodes.
    pub fn for_item(item: &UrlQueueItem, phase_id: &str) -> Self {
        let ctx = Self::new();
        ctx.data.insert(KEY_URL.to_string(), Value::from(item.url.clone()));
        ctx.data.insert(KEY_DEPTH.to_string(), Value::from(item.depth));
        ctx.data
            .insert(KEY_PHASE_ID.to_string(), Value::from(phase_id.to_string()));
        ctx
    }

    pub fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    pub fn insert_value(&self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.get(key)?.value().clone();
        serde_json::from_value(value).ok()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// All non-internal keys as one JSON object; what an extraction phase
    /// persists for the item.
    pub fn extracted_record(&self) -> Value {
        let mut map = Map::new();
        for entry in self.data.iter() {
            if !entry.key().starts_with('_') {
                map.insert(entry.key().clone(), entry.value().clone());
            }
        }
        Value::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UrlQueueItem;

    #[test]
    fn seeds_control_keys() {
        let item = UrlQueueItem::seed("exec", "https://example.com", 100);
        let ctx = ExecutionContext::for_item(&item, "discover");
        assert_eq!(ctx.get::<String>(KEY_URL).unwrap(), "https://example.com");
        assert_eq!(ctx.get::<u32>(KEY_DEPTH).unwrap(), 0);
        assert_eq!(ctx.get::<String>(KEY_PHASE_ID).unwrap(), "discover");
    }

    #[test]
    fn extracted_record_skips_internal_keys() {
        let item = UrlQueueItem::seed("exec", "https://example.com", 100);
        let ctx = ExecutionContext::for_item(&item, "extract");
        ctx.insert("title", &"Widget").unwrap();
        ctx.insert("price", &9.99).unwrap();
        let record = ctx.extracted_record();
        let obj = record.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["title"], "Widget");
        assert!(!obj.contains_key(KEY_URL));
    }
}
