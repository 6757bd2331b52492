//! MapReduce over the locally owned key space.
//!
//! A node runs the mapper (and combiner, when present) over its own entries
//! and hands back intermediate values per output key. The coordinating node
//! gathers those partials and runs the reducer.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::analyzer::matches_query;
use super::predicate::Predicate;
use crate::error::{Error, Result};
use crate::storage::{CacheEntry, LocalStore};

/// Intermediate output: output key → values
pub type Intermediate = BTreeMap<String, Vec<Value>>;

pub trait Mapper: Send + Sync {
    fn map(&self, entry: &CacheEntry, emit: &mut dyn FnMut(String, Value));
}

/// Local pre-aggregation of one output key's values
pub trait Combiner: Send + Sync {
    fn combine(&self, key: &str, values: Vec<Value>) -> Value;
}

pub trait Reducer: Send + Sync {
    fn reduce(&self, key: &str, values: Vec<Value>) -> Value;
}

/// Named mapper, optional combiner and reducer
#[derive(Clone)]
pub struct MapReduceTask {
    pub name: String,
    pub mapper: Arc<dyn Mapper>,
    pub combiner: Option<Arc<dyn Combiner>>,
    pub reducer: Arc<dyn Reducer>,
}

impl MapReduceTask {
    pub fn new(name: impl Into<String>, mapper: Arc<dyn Mapper>, reducer: Arc<dyn Reducer>) -> Self {
        Self {
            name: name.into(),
            mapper,
            combiner: None,
            reducer,
        }
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner>) -> Self {
        self.combiner = Some(combiner);
        self
    }
}

impl std::fmt::Debug for MapReduceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapReduceTask")
            .field("name", &self.name)
            .field("combiner", &self.combiner.is_some())
            .finish()
    }
}

/// Tasks runnable on this node, registered by name
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<MapReduceTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: MapReduceTask) -> Result<()> {
        match self.tasks.entry(task.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::InvalidState(format!(
                "task {} already registered",
                task.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(task = %task.name, "Registered MapReduce task");
                slot.insert(Arc::new(task));
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<MapReduceTask>> {
        self.tasks.remove(name).map(|(_, task)| task)
    }

    pub fn get(&self, name: &str) -> Result<Arc<MapReduceTask>> {
        self.tasks
            .get(name)
            .map(|task| task.value().clone())
            .ok_or_else(|| Error::TaskNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }
}

/// Which local entries feed the mapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InputFilter {
    All,
    Query { type_name: String, predicate: Predicate },
}

/// Pulls entries one at a time from a key snapshot.
///
/// Keys removed after the snapshot are skipped.
pub struct InputProvider<'a> {
    store: &'a LocalStore,
    keys: std::vec::IntoIter<Arc<str>>,
}

impl<'a> InputProvider<'a> {
    pub fn new(store: &'a LocalStore, filter: &InputFilter) -> Self {
        let keys = match filter {
            InputFilter::All => store.keys(),
            InputFilter::Query {
                type_name,
                predicate,
            } => store.keys_where(|entry| matches_query(entry, type_name, predicate)),
        };
        Self {
            store,
            keys: keys.into_iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

impl Iterator for InputProvider<'_> {
    type Item = CacheEntry;

    fn next(&mut self) -> Option<CacheEntry> {
        self.keys.by_ref().find_map(|key| self.store.peek(&key))
    }
}

/// Map (and combine) over local entries
pub fn run_local(task: &MapReduceTask, store: &LocalStore, filter: &InputFilter) -> Intermediate {
    let mut output = Intermediate::new();
    let mut mapped = 0usize;
    for entry in InputProvider::new(store, filter) {
        task.mapper.map(&entry, &mut |key, value| {
            output.entry(key).or_default().push(value);
        });
        mapped += 1;
    }

    if let Some(combiner) = &task.combiner {
        output = output
            .into_iter()
            .map(|(key, values)| {
                let combined = combiner.combine(&key, values);
                (key, vec![combined])
            })
            .collect();
    }
    debug!(task = %task.name, mapped, keys = output.len(), "Ran local map phase");
    output
}

/// Merge partial outputs and reduce each output key
pub fn reduce(task: &MapReduceTask, partials: Vec<Intermediate>) -> BTreeMap<String, Value> {
    let mut merged = Intermediate::new();
    for partial in partials {
        for (key, values) in partial {
            merged.entry(key).or_default().extend(values);
        }
    }
    merged
        .into_iter()
        .map(|(key, values)| {
            let reduced = task.reducer.reduce(&key, values);
            (key, reduced)
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{AttributeValue, CacheValue, ManualClock, QueryInfo};
    use chrono::Utc;
    use serde_json::json;

    /// Counts words of string values
    struct WordMapper;

    impl Mapper for WordMapper {
        fn map(&self, entry: &CacheEntry, emit: &mut dyn FnMut(String, Value)) {
            if let Some(text) = entry.value.downcast::<String>() {
                for word in text.split_whitespace() {
                    emit(word.to_string(), json!(1));
                }
            }
        }
    }

    struct Sum;

    impl Combiner for Sum {
        fn combine(&self, _key: &str, values: Vec<Value>) -> Value {
            json!(values.iter().filter_map(Value::as_i64).sum::<i64>())
        }
    }

    impl Reducer for Sum {
        fn reduce(&self, _key: &str, values: Vec<Value>) -> Value {
            json!(values.iter().filter_map(Value::as_i64).sum::<i64>())
        }
    }

    fn word_count() -> MapReduceTask {
        MapReduceTask::new("word-count", Arc::new(WordMapper), Arc::new(Sum))
    }

    fn store_with(docs: &[(&str, &str, bool)]) -> LocalStore {
        let store = LocalStore::new(
            "mr",
            &StorageConfig::default(),
            Arc::new(ManualClock::starting_now()),
        );
        for (key, text, published) in docs {
            let entry = CacheEntry::new(*key, CacheValue::object(text.to_string()), Utc::now())
                .with_query_info(
                    QueryInfo::new("Doc").with("published", AttributeValue::Bool(*published)),
                );
            store.add(entry).unwrap();
        }
        store
    }

    #[test]
    fn test_local_run_and_reduce() {
        let task = word_count();
        let first = store_with(&[("d1", "a b a", true)]);
        let second = store_with(&[("d2", "b c", false)]);

        let partials = vec![
            run_local(&task, &first, &InputFilter::All),
            run_local(&task, &second, &InputFilter::All),
        ];
        let result = reduce(&task, partials);
        assert_eq!(result.get("a"), Some(&json!(2)));
        assert_eq!(result.get("b"), Some(&json!(2)));
        assert_eq!(result.get("c"), Some(&json!(1)));
    }

    #[test]
    fn test_combiner_collapses_values() {
        let task = word_count().with_combiner(Arc::new(Sum));
        let store = store_with(&[("d1", "x x x", true), ("d2", "x", true)]);
        let partial = run_local(&task, &store, &InputFilter::All);
        assert_eq!(partial.get("x"), Some(&vec![json!(4)]));
    }

    #[test]
    fn test_query_filter_limits_input() {
        let store = store_with(&[("d1", "kept", true), ("d2", "dropped", false)]);
        let filter = InputFilter::Query {
            type_name: "Doc".into(),
            predicate: Predicate::eq("published", AttributeValue::Bool(true)),
        };
        let provider = InputProvider::new(&store, &filter);
        assert_eq!(provider.remaining(), 1);

        let result = reduce(&word_count(), vec![run_local(&word_count(), &store, &filter)]);
        assert!(result.contains_key("kept"));
        assert!(!result.contains_key("dropped"));
    }

    #[test]
    fn test_provider_skips_vanished_keys() {
        let store = store_with(&[("d1", "a", true), ("d2", "b", true)]);
        let mut provider = InputProvider::new(&store, &InputFilter::All);
        store.discard("d1");
        store.discard("d2");
        assert!(provider.next().is_none());
    }

    #[test]
    fn test_registry() {
        let registry = TaskRegistry::new();
        registry.register(word_count()).unwrap();
        assert!(registry.register(word_count()).is_err());
        assert_eq!(registry.names(), vec!["word-count".to_string()]);
        assert!(registry.get("word-count").is_ok());
        assert!(matches!(registry.get("nope"), Err(Error::TaskNotFound(_))));
        assert!(registry.unregister("word-count").is_some());
    }
}
