use super::DocumentComparator;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentMap;

/// The documents of one view, keyed for lookup and kept in query order.
///
/// Views copy the set before applying changes, so a snapshot handed to a
/// listener never changes after it was raised.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: DocumentMap,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: DocumentMap::new(),
            sorted: Vec::new(),
        }
    }

    /// An empty set with the same ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(self.comparator.clone())
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(
        &self,
        key: &DocumentKey,
    ) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(
        &self,
        key: &DocumentKey,
    ) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(
        &self,
        key: &DocumentKey,
    ) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.search(doc).ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.sorted.iter()
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn insert(
        &mut self,
        doc: Document,
    ) {
        self.remove(doc.key());
        let position = match self.search(&doc) {
            Ok(i) | Err(i) => i,
        };
        self.by_key.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(position, doc);
    }

    pub fn remove(
        &mut self,
        key: &DocumentKey,
    ) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(i) = self.search(&existing) {
            self.sorted.remove(i);
        }
        Some(existing)
    }

    fn search(
        &self,
        doc: &Document,
    ) -> std::result::Result<usize, usize> {
        self.sorted.binary_search_by(|probe| self.comparator.compare(probe, doc))
    }
}

impl PartialEq for DocumentSet {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.sorted == other.sorted
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

