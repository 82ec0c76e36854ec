use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::schema::{DefaultRule, SchemaDefinition};

/// One stored row: field name to value. Identity is the record's id/unique
/// values, never the allocation.
pub type Record = serde_json::Map<String, Value>;

/// Whole-store snapshot shape used by export/import.
pub type StoreData = HashMap<String, Vec<Record>>;

/// Process-local state: one ordered record list per model (insertion order is
/// meaningful for default ordering and pagination) plus per-model/per-field
/// auto-increment counters.
#[derive(Debug, Clone, Default)]
pub struct StoreInner {
    collections: HashMap<String, Vec<Record>>,
    counters: HashMap<String, HashMap<String, i64>>,
}

impl StoreInner {
    fn empty_for(schema: &SchemaDefinition) -> Self {
        let mut collections = HashMap::new();
        let mut counters = HashMap::new();
        for model in &schema.models {
            collections.insert(model.name.clone(), Vec::new());
            let model_counters: HashMap<String, i64> = model
                .fields
                .iter()
                .filter(|f| f.default == Some(DefaultRule::Autoincrement))
                .map(|f| (f.name.clone(), 0))
                .collect();
            counters.insert(model.name.clone(), model_counters);
        }
        StoreInner { collections, counters }
    }

    pub fn records(&self, model: &str) -> &[Record] {
        self.collections.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn records_mut(&mut self, model: &str) -> &mut Vec<Record> {
        self.collections.entry(model.to_string()).or_default()
    }

    /// Current counter value; the next assigned value is `counter + 1`.
    pub fn counter(&self, model: &str, field: &str) -> i64 {
        self.counters
            .get(model)
            .and_then(|c| c.get(field))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_counter(&mut self, model: &str, field: &str, value: i64) {
        self.counters
            .entry(model.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    pub fn export(&self) -> StoreData {
        self.collections.clone()
    }
}

/// Shared handle over the mutable store. Every operation takes the lock once
/// and holds it for its whole read-then-mutate sequence, so calls never
/// observe another call's partially-applied mutation.
#[derive(Clone)]
pub struct Store {
    schema: Arc<SchemaDefinition>,
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    pub fn new(schema: Arc<SchemaDefinition>) -> Self {
        let inner = StoreInner::empty_for(&schema);
        Store {
            schema,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    pub fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Discard all collections and counters and rebuild them empty.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = StoreInner::empty_for(&self.schema);
    }

    /// Snapshot export: a deep copy of every collection.
    pub fn export(&self) -> StoreData {
        self.lock().export()
    }

    /// Snapshot import: full replace, not a diff. Auto-increment counters are
    /// re-derived from the maximum stored value of each auto-increment field
    /// so subsequent creates keep the strictly-increasing invariant.
    pub fn import(&self, data: StoreData) {
        let mut fresh = StoreInner::empty_for(&self.schema);
        for model in &self.schema.models {
            let records = data.get(&model.name).cloned().unwrap_or_default();
            for field in model.fields.iter().filter(|f| f.default == Some(DefaultRule::Autoincrement)) {
                let max = records
                    .iter()
                    .filter_map(|r| r.get(&field.name).and_then(Value::as_i64))
                    .max()
                    .unwrap_or(0);
                fresh
                    .counters
                    .entry(model.name.clone())
                    .or_default()
                    .insert(field.name.clone(), max);
            }
            fresh.collections.insert(model.name.clone(), records);
        }
        for key in data.keys() {
            if self.schema.model(key).is_none() {
                log::warn!("Ignoring imported data for unknown model '{key}'");
            }
        }
        *self.lock() = fresh;
    }
}
