//! Active Query Analyzer
//!
//! Keeps per-type predicate lists, per-type evaluation indexes and the live
//! result set of every continuous query. Store mutations are fed in through
//! [`ActiveQueryAnalyzer::apply_change`]; each membership change of a result
//! set becomes one [`QueryChange`].
//!
//! Indexes are built when a query is bound to the store and are never
//! persisted. After state is imported from another node they are rebuilt with
//! [`ActiveQueryAnalyzer::reinitialize`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::predicate::Predicate;
use crate::error::{Error, Result};
use crate::storage::{CacheEntry, LocalStore, QueryInfo, StoreChange};

const CHANGE_CHANNEL_CAPACITY: usize = 1_024;

/// A continuous query bound to one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub id: String,
    pub type_name: String,
    pub predicate: Predicate,
    /// Node whose clients receive the notifications
    pub origin: String,
}

impl ContinuousQuery {
    pub fn new(type_name: impl Into<String>, predicate: Predicate, origin: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            type_name: type_name.into(),
            predicate,
            origin: origin.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryChangeKind {
    Added,
    Updated,
    Removed,
}

/// Membership change of a query's result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryChange {
    pub query_id: String,
    pub key: String,
    pub kind: QueryChangeKind,
}

/// Query state handed to a joining node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryStateTransfer {
    /// Only queries the receiver does not hold yet
    pub is_partial: bool,
    pub queries: Vec<ContinuousQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStateInfo {
    pub types: usize,
    pub queries: usize,
    pub indexed_keys: usize,
}

/// Attributes of every indexed item of one type
#[derive(Debug, Default)]
struct TypeIndex {
    attributes: BTreeSet<String>,
    items: HashMap<Arc<str>, QueryInfo>,
}

impl TypeIndex {
    fn project(&self, info: &QueryInfo) -> QueryInfo {
        QueryInfo {
            type_name: info.type_name.clone(),
            attributes: info
                .attributes
                .iter()
                .filter(|(name, _)| self.attributes.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct AnalyzerState {
    predicates: HashMap<String, Vec<ContinuousQuery>>,
    indexes: HashMap<String, TypeIndex>,
    results: HashMap<String, HashSet<Arc<str>>>,
}

impl AnalyzerState {
    fn query(&self, query_id: &str) -> Option<&ContinuousQuery> {
        self.predicates
            .values()
            .flatten()
            .find(|query| query.id == query_id)
    }

    fn add_query(&mut self, query: ContinuousQuery) {
        let index = self.indexes.entry(query.type_name.clone()).or_default();
        index.attributes.extend(query.predicate.attributes());
        self.results.entry(query.id.clone()).or_default();
        self.predicates
            .entry(query.type_name.clone())
            .or_default()
            .push(query);
    }

    /// Rebuild the type's index and every result set of the type from `store`
    fn bind_type(&mut self, type_name: &str, store: &LocalStore) {
        let Some(queries) = self.predicates.get(type_name) else {
            return;
        };
        let index = self.indexes.entry(type_name.to_string()).or_default();
        index.items.clear();
        for query in queries {
            self.results.insert(query.id.clone(), HashSet::new());
        }

        for entry in store.entries() {
            let Some(info) = entry.query_info.as_ref().filter(|i| i.type_name == type_name) else {
                continue;
            };
            let projected = index.project(info);
            for query in queries {
                if query.predicate.evaluate(&projected) {
                    if let Some(result) = self.results.get_mut(&query.id) {
                        result.insert(entry.key.clone());
                    }
                }
            }
            index.items.insert(entry.key.clone(), projected);
        }
    }
}

/// Continuous query state of one node
pub struct ActiveQueryAnalyzer {
    state: RwLock<AnalyzerState>,
    changes: broadcast::Sender<QueryChange>,
}

impl ActiveQueryAnalyzer {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(AnalyzerState::default()),
            changes,
        }
    }

    /// Register and bind a query, returning the keys that match now
    pub fn register(&self, query: ContinuousQuery, store: &LocalStore) -> Result<Vec<String>> {
        let mut state = self.state.write();
        if state.query(&query.id).is_some() {
            return Err(Error::InvalidState(format!(
                "continuous query {} already registered",
                query.id
            )));
        }
        let (query_id, type_name) = (query.id.clone(), query.type_name.clone());
        state.add_query(query);
        state.bind_type(&type_name, store);

        let keys = state
            .results
            .get(&query_id)
            .map(|keys| keys.iter().map(|k| k.to_string()).collect())
            .unwrap_or_default();
        info!(query_id = %query_id, type_name = %type_name, "Registered continuous query");
        Ok(keys)
    }

    pub fn unregister(&self, query_id: &str) -> Result<ContinuousQuery> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let type_name = state
            .query(query_id)
            .map(|q| q.type_name.clone())
            .ok_or_else(|| Error::QueryNotFound(query_id.to_string()))?;

        let mut removed = None;
        let emptied = match state.predicates.get_mut(&type_name) {
            Some(queries) => {
                if let Some(position) = queries.iter().position(|q| q.id == query_id) {
                    removed = Some(queries.remove(position));
                }
                queries.is_empty()
            }
            None => false,
        };
        state.results.remove(query_id);
        if emptied {
            state.predicates.remove(&type_name);
            state.indexes.remove(&type_name);
        } else if let Some(index) = state.indexes.get_mut(&type_name) {
            // Narrow the indexed attribute set to what remaining predicates read
            let attributes = state
                .predicates
                .get(&type_name)
                .map(|queries| {
                    queries
                        .iter()
                        .flat_map(|q| q.predicate.attributes())
                        .collect()
                })
                .unwrap_or_default();
            index.attributes = attributes;
        }

        removed.ok_or_else(|| Error::QueryNotFound(query_id.to_string()))
    }

    pub fn is_registered(&self, query_id: &str) -> bool {
        self.state.read().query(query_id).is_some()
    }

    pub fn query(&self, query_id: &str) -> Option<ContinuousQuery> {
        self.state.read().query(query_id).cloned()
    }

    pub fn queries(&self) -> Vec<ContinuousQuery> {
        self.state.read().predicates.values().flatten().cloned().collect()
    }

    /// Current result set of a query
    pub fn result_set(&self, query_id: &str) -> Result<Vec<String>> {
        self.state
            .read()
            .results
            .get(query_id)
            .map(|keys| {
                let mut keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
                keys.sort();
                keys
            })
            .ok_or_else(|| Error::QueryNotFound(query_id.to_string()))
    }

    /// One-off search over the store without registering
    pub fn search(type_name: &str, predicate: &Predicate, store: &LocalStore) -> Vec<String> {
        let mut keys: Vec<String> = store
            .keys_where(|entry| matches_query(entry, type_name, predicate))
            .iter()
            .map(|k| k.to_string())
            .collect();
        keys.sort();
        keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryChange> {
        self.changes.subscribe()
    }

    /// Deliver a change to local subscribers
    pub fn publish(&self, change: QueryChange) {
        // No subscriber is not an error
        let _ = self.changes.send(change);
    }

    /// Update indexes and result sets for a store mutation.
    ///
    /// Returns each resulting change with the origin node of its query.
    pub fn apply_change(&self, change: &StoreChange<'_>) -> Vec<(QueryChange, String)> {
        let mut emitted = Vec::new();
        match change {
            StoreChange::Added(entry) | StoreChange::Updated(entry) => {
                let mut state = self.state.write();
                let state = &mut *state;
                // An update may move a key out of a type it was indexed under
                for (type_name, index) in state.indexes.iter_mut() {
                    let still_typed = entry
                        .query_info
                        .as_ref()
                        .is_some_and(|info| &info.type_name == type_name);
                    if !still_typed && index.items.remove(&entry.key).is_some() {
                        leave_results(
                            state.predicates.get(type_name),
                            &mut state.results,
                            &entry.key,
                            &mut emitted,
                        );
                    }
                }

                let Some(info) = &entry.query_info else {
                    return emitted;
                };
                let (Some(queries), Some(index)) = (
                    state.predicates.get(&info.type_name),
                    state.indexes.get_mut(&info.type_name),
                ) else {
                    return emitted;
                };
                let projected = index.project(info);
                for query in queries {
                    let matched = query.predicate.evaluate(&projected);
                    let result = state.results.entry(query.id.clone()).or_default();
                    let was_member = result.contains(&entry.key);
                    let kind = match (was_member, matched) {
                        (false, true) => {
                            result.insert(entry.key.clone());
                            QueryChangeKind::Added
                        }
                        (true, true) => QueryChangeKind::Updated,
                        (true, false) => {
                            result.remove(&entry.key);
                            QueryChangeKind::Removed
                        }
                        (false, false) => continue,
                    };
                    emitted.push((
                        QueryChange {
                            query_id: query.id.clone(),
                            key: entry.key.to_string(),
                            kind,
                        },
                        query.origin.clone(),
                    ));
                }
                index.items.insert(entry.key.clone(), projected);
            }
            StoreChange::Removed { key, .. } => {
                let mut state = self.state.write();
                let state = &mut *state;
                for (type_name, index) in state.indexes.iter_mut() {
                    if index.items.remove(*key).is_some() {
                        leave_results(
                            state.predicates.get(type_name),
                            &mut state.results,
                            key,
                            &mut emitted,
                        );
                    }
                }
            }
        }
        emitted
    }

    // =========================================================================
    // State transfer
    // =========================================================================

    /// Query state for a node that already holds the `known` query ids
    pub fn export_state(&self, known: &HashSet<String>) -> QueryStateTransfer {
        let state = self.state.read();
        QueryStateTransfer {
            is_partial: !known.is_empty(),
            queries: state
                .predicates
                .values()
                .flatten()
                .filter(|q| !known.contains(&q.id))
                .cloned()
                .collect(),
        }
    }

    /// Install transferred query state, then rebind indexes against `store`
    pub fn import_state(&self, transfer: QueryStateTransfer, store: &LocalStore) {
        {
            let mut state = self.state.write();
            if !transfer.is_partial {
                *state = AnalyzerState::default();
            }
            for query in transfer.queries {
                if state.query(&query.id).is_none() {
                    state.add_query(query);
                }
            }
        }
        self.reinitialize(store);
    }

    /// Rebuild every evaluation index and result set from the store
    pub fn reinitialize(&self, store: &LocalStore) {
        let mut state = self.state.write();
        let types: Vec<String> = state.predicates.keys().cloned().collect();
        for type_name in &types {
            state.bind_type(type_name, store);
        }
        debug!(types = types.len(), "Reinitialized query indexes");
    }

    pub fn state_info(&self) -> QueryStateInfo {
        let state = self.state.read();
        QueryStateInfo {
            types: state.predicates.len(),
            queries: state.predicates.values().map(Vec::len).sum(),
            indexed_keys: state.indexes.values().map(|i| i.items.len()).sum(),
        }
    }
}

impl Default for ActiveQueryAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn matches_query(entry: &CacheEntry, type_name: &str, predicate: &Predicate) -> bool {
    entry
        .query_info
        .as_ref()
        .is_some_and(|info| info.type_name == type_name && predicate.evaluate(info))
}

fn leave_results(
    queries: Option<&Vec<ContinuousQuery>>,
    results: &mut HashMap<String, HashSet<Arc<str>>>,
    key: &str,
    emitted: &mut Vec<(QueryChange, String)>,
) {
    for query in queries.into_iter().flatten() {
        if results.get_mut(&query.id).is_some_and(|r| r.remove(key)) {
            emitted.push((
                QueryChange {
                    query_id: query.id.clone(),
                    key: key.to_string(),
                    kind: QueryChangeKind::Removed,
                },
                query.origin.clone(),
            ));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
