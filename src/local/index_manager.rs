use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::RemoteDocumentCache;
use crate::constants::GLOBAL_FIELD_INDEXES;
use crate::core::FieldFilter;
use crate::core::Operator;
use crate::core::Query;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::FieldPath;
use crate::model::ResourcePath;
use crate::model::Value;
use crate::storage::read_record;
use crate::storage::Keyspace;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::Result;

/// Single-field index over the documents of one collection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldIndex {
    pub collection: ResourcePath,
    pub field: FieldPath,
}

#[derive(Debug, Default)]
struct IndexEntries {
    by_value: BTreeMap<Value, BTreeSet<DocumentKey>>,
    by_key: BTreeMap<DocumentKey, Value>,
}

impl IndexEntries {
    fn remove(
        &mut self,
        key: &DocumentKey,
    ) {
        if let Some(value) = self.by_key.remove(key) {
            if let Some(keys) = self.by_value.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_value.remove(&value);
                }
            }
        }
    }

    fn insert(
        &mut self,
        key: &DocumentKey,
        value: Value,
    ) {
        self.by_value.entry(value.clone()).or_default().insert(key.clone());
        self.by_key.insert(key.clone(), value);
    }

    fn lookup(
        &self,
        filter: &FieldFilter,
    ) -> DocumentKeySet {
        let operand = &filter.value;
        let in_range = |lower: Bound<&Value>, upper: Bound<&Value>| -> DocumentKeySet {
            self.by_value
                .range((lower, upper))
                .filter(|(value, _)| value.same_type_order(operand))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect()
        };
        match filter.op {
            Operator::Equal => self.by_value.get(operand).cloned().unwrap_or_default(),
            Operator::In => operand
                .as_array()
                .unwrap_or_default()
                .iter()
                .filter_map(|value| self.by_value.get(value))
                .flat_map(|keys| keys.iter().cloned())
                .collect(),
            Operator::LessThan => in_range(Bound::Unbounded, Bound::Excluded(operand)),
            Operator::LessThanOrEqual => in_range(Bound::Unbounded, Bound::Included(operand)),
            Operator::GreaterThan => in_range(Bound::Excluded(operand), Bound::Unbounded),
            Operator::GreaterThanOrEqual => in_range(Bound::Included(operand), Bound::Unbounded),
            _ => DocumentKeySet::new(),
        }
    }
}

/// In-memory field indexes over the remote document cache.
///
/// Index definitions are persisted; their entries are rebuilt from the cache
/// on open and maintained as remote documents change.
#[derive(Debug, Default)]
pub(crate) struct IndexManager {
    indexes: BTreeMap<FieldIndex, IndexEntries>,
}

pub(crate) fn is_indexable(op: Operator) -> bool {
    matches!(
        op,
        Operator::Equal
            | Operator::In
            | Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual
    )
}

impl IndexManager {
    pub(crate) fn load(
        storage: &dyn LocalStorage,
        remote_documents: &RemoteDocumentCache,
    ) -> Result<Self> {
        let definitions: Vec<FieldIndex> =
            read_record(storage, Keyspace::Globals, GLOBAL_FIELD_INDEXES.as_bytes())?.unwrap_or_default();
        let mut manager = Self::default();
        for index in definitions {
            manager.populate(index, remote_documents);
        }
        debug!("[IndexManager] rebuilt {} field indexes", manager.indexes.len());
        Ok(manager)
    }

    /// Creates `index` and fills it from the cache. Existing indexes are
    /// left untouched.
    pub(crate) fn add_field_index(
        &mut self,
        index: FieldIndex,
        remote_documents: &RemoteDocumentCache,
        batch: &mut WriteBatch,
    ) -> Result<bool> {
        if self.indexes.contains_key(&index) {
            return Ok(false);
        }
        info!(
            "[IndexManager] creating index on {} for collection {}",
            index.field, index.collection
        );
        self.populate(index, remote_documents);
        batch.put_record(Keyspace::Globals, GLOBAL_FIELD_INDEXES, &self.field_indexes())?;
        Ok(true)
    }

    pub(crate) fn field_indexes(&self) -> Vec<FieldIndex> {
        self.indexes.keys().cloned().collect()
    }

    /// Re-indexes `doc` in every index of its collection.
    pub(crate) fn update_document(
        &mut self,
        doc: &Document,
    ) {
        let collection = doc.key().collection_path();
        for (index, entries) in self.indexes.iter_mut() {
            if index.collection != collection {
                continue;
            }
            entries.remove(doc.key());
            if doc.is_found_document() {
                if let Some(value) = doc.field(&index.field) {
                    entries.insert(doc.key(), value.clone());
                }
            }
        }
    }

    pub(crate) fn remove_document(
        &mut self,
        key: &DocumentKey,
    ) {
        for entries in self.indexes.values_mut() {
            entries.remove(key);
        }
    }

    /// Keys of remote documents matching the first indexed filter of
    /// `query`, or `None` when no index serves the query.
    pub(crate) fn matching_keys(
        &self,
        query: &Query,
    ) -> Option<DocumentKeySet> {
        query.filters().iter().filter(|f| is_indexable(f.op)).find_map(|filter| {
            let index = FieldIndex {
                collection: query.path().clone(),
                field: filter.field.clone(),
            };
            self.indexes.get(&index).map(|entries| entries.lookup(filter))
        })
    }

    /// Index that would serve `query`, if it does not exist yet.
    pub(crate) fn missing_index_for(
        &self,
        query: &Query,
    ) -> Option<FieldIndex> {
        if query.is_document_query() || self.matching_keys(query).is_some() {
            return None;
        }
        query
            .filters()
            .iter()
            .find(|f| is_indexable(f.op) && !f.field.is_key_field_path())
            .map(|filter| FieldIndex {
                collection: query.path().clone(),
                field: filter.field.clone(),
            })
    }

    fn populate(
        &mut self,
        index: FieldIndex,
        remote_documents: &RemoteDocumentCache,
    ) {
        let mut entries = IndexEntries::default();
        for (key, doc) in remote_documents.get_all_from_collection(&index.collection, None) {
            if !doc.is_found_document() {
                continue;
            }
            if let Some(value) = doc.field(&index.field) {
                entries.insert(&key, value.clone());
            }
        }
        self.indexes.insert(index, entries);
    }
}
