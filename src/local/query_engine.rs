use tracing::debug;
use tracing::trace;

use super::FieldIndex;
use super::IndexManager;
use super::LocalDocumentsView;
use crate::config::QueryEngineConfig;
use crate::core::LimitType;
use crate::core::Query;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::SnapshotVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueryStrategy {
    DocumentLookup,
    IndexLookup,
    PreviousResults,
    FullScan,
}

/// Documents matching a query, before ordering and limits are applied.
#[derive(Debug)]
pub(crate) struct QueryResult {
    pub(crate) documents: DocumentMap,
    pub(crate) documents_read: usize,
    pub(crate) strategy: QueryStrategy,
    /// Index the engine recommends creating for this query.
    pub(crate) index_suggestion: Option<FieldIndex>,
}

/// Chooses how to evaluate a query against the local cache.
///
/// Strategies, in order of preference: a field index, the target's previous
/// results plus documents changed since it was last limbo-free, and a full
/// collection scan. Every strategy produces the same documents.
pub(crate) struct QueryEngine {
    config: QueryEngineConfig,
}

impl QueryEngine {
    pub(crate) fn new(config: QueryEngineConfig) -> Self {
        Self { config }
    }

    pub(crate) fn get_documents_matching_query(
        &self,
        view: &mut LocalDocumentsView<'_>,
        index_manager: &IndexManager,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> QueryResult {
        if query.is_document_query() {
            return self.lookup_document(view, query);
        }

        if let Some(result) = self.perform_query_using_index(view, index_manager, query) {
            return result;
        }

        if let Some(result) =
            self.perform_query_using_remote_keys(view, query, last_limbo_free_snapshot_version, remote_keys)
        {
            return result;
        }

        self.full_collection_scan(view, index_manager, query)
    }

    fn lookup_document(
        &self,
        view: &mut LocalDocumentsView<'_>,
        query: &Query,
    ) -> QueryResult {
        let mut documents = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let doc = view.get_document(&key);
            if doc.is_found_document() {
                documents.insert(key, doc);
            }
        }
        QueryResult {
            documents_read: 1,
            documents,
            strategy: QueryStrategy::DocumentLookup,
            index_suggestion: None,
        }
    }

    fn perform_query_using_index(
        &self,
        view: &mut LocalDocumentsView<'_>,
        index_manager: &IndexManager,
        query: &Query,
    ) -> Option<QueryResult> {
        let keys = index_manager.matching_keys(query)?;
        let documents_read = keys.len();
        let mut candidates = view.get_documents(&keys);
        // Local writes are not indexed; they can make any document match.
        for (key, doc) in view.get_locally_mutated_in_collection(query.path()) {
            candidates.entry(key).or_insert(doc);
        }
        trace!("[QueryEngine] index lookup read {} documents", documents_read);
        Some(QueryResult {
            documents: apply_query(query, candidates),
            documents_read,
            strategy: QueryStrategy::IndexLookup,
            index_suggestion: None,
        })
    }

    fn perform_query_using_remote_keys(
        &self,
        view: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> Option<QueryResult> {
        if last_limbo_free_snapshot_version.is_min() || matches_all_documents(query) {
            return None;
        }

        let previous = apply_query(query, view.get_documents(remote_keys));
        if query.has_limit() && needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version) {
            debug!("[QueryEngine] previous results of a limit query need a refill, scanning");
            return None;
        }

        let changed = view.get_documents_matching_collection(query.path(), Some(last_limbo_free_snapshot_version));
        let documents_read = remote_keys.len() + changed.documents_read;
        let mut documents = previous;
        documents.extend(apply_query(query, changed.documents));
        Some(QueryResult {
            documents,
            documents_read,
            strategy: QueryStrategy::PreviousResults,
            index_suggestion: None,
        })
    }

    fn full_collection_scan(
        &self,
        view: &mut LocalDocumentsView<'_>,
        index_manager: &IndexManager,
        query: &Query,
    ) -> QueryResult {
        let scanned = view.get_documents_matching_collection(query.path(), None);
        let documents = apply_query(query, scanned.documents);
        let index_suggestion = self.index_suggestion(index_manager, query, scanned.documents_read, documents.len());
        QueryResult {
            documents,
            documents_read: scanned.documents_read,
            strategy: QueryStrategy::FullScan,
            index_suggestion,
        }
    }

    /// Suggests an index once a scan read enough documents and returned few
    /// enough of them for the index to pay off.
    fn index_suggestion(
        &self,
        index_manager: &IndexManager,
        query: &Query,
        documents_read: usize,
        result_size: usize,
    ) -> Option<FieldIndex> {
        if !self.config.index_auto_creation_enabled
            || documents_read < self.config.index_auto_creation_min_collection_size
        {
            return None;
        }
        let indexed_cost = self.config.relative_index_read_cost_per_document * result_size as f64;
        if (documents_read as f64) <= indexed_cost {
            return None;
        }
        index_manager.missing_index_for(query)
    }
}

fn matches_all_documents(query: &Query) -> bool {
    query.filters().is_empty() && query.limit().is_none() && query.explicit_order_by().is_empty()
}

fn apply_query(
    query: &Query,
    documents: DocumentMap,
) -> DocumentMap {
    documents.into_iter().filter(|(_, doc)| query.matches(doc)).collect()
}

/// Whether the previous results of a limit query may be missing documents
/// that now belong inside the limit.
fn needs_refill(
    query: &Query,
    previous: &DocumentMap,
    remote_keys: &DocumentKeySet,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != previous.len() {
        // A previous result no longer matches.
        return true;
    }
    let comparator = query.comparator();
    let mut sorted: Vec<&Document> = previous.values().collect();
    sorted.sort_by(|a, b| comparator.compare(a, b));
    let edge = match query.limit_type() {
        LimitType::First => sorted.last(),
        LimitType::Last => sorted.first(),
    };
    match edge {
        Some(doc) => doc.has_pending_writes() || doc.version() > last_limbo_free_snapshot_version,
        None => false,
    }
}
