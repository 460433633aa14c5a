use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::KEY_FIELD_NAME;
use crate::ModelError;
use crate::Result;

/// Slash separated path of collections and documents.
///
/// Ordering is segment by segment, so `a/b` sorts before `a/b/c` and both
/// before `a/c`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `users/42/posts`. Leading and trailing slashes are ignored,
    /// empty segments in between are rejected.
    pub fn from_string(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(ModelError::InvalidPath(path.to_string()).into());
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(
        &self,
        segment: impl Into<String>,
    ) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn append(
        &self,
        other: &ResourcePath,
    ) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn is_prefix_of(
        &self,
        other: &ResourcePath,
    ) -> bool {
        other.segments.len() >= self.segments.len() && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn is_immediate_parent_of(
        &self,
        other: &ResourcePath,
    ) -> bool {
        other.segments.len() == self.segments.len() + 1 && self.is_prefix_of(other)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// Path of a single document: an even, non-zero number of segments.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> Result<Self> {
        if !Self::is_document_key(&path) {
            return Err(ModelError::InvalidDocumentKey {
                path: path.canonical_string(),
            }
            .into());
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> Result<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Collection holding this document.
    pub fn collection_path(&self) -> ResourcePath {
        self.path.parent().unwrap_or_default()
    }

    pub fn collection_group(&self) -> &str {
        let segments = self.path.segments();
        &segments[segments.len() - 2]
    }

    pub fn document_id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        self.path.fmt(f)
    }
}

/// Dotted path to a field inside a document, e.g. `address.city`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn from_dot_separated(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(ModelError::InvalidFieldPath(path.to_string()).into());
        }
        let mut segments = Vec::new();
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(ModelError::InvalidFieldPath(path.to_string()).into());
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(ModelError::InvalidFieldPath(segments.join(".")).into());
        }
        Ok(Self { segments })
    }

    /// The special path that addresses the document key.
    pub fn key_path() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    pub fn is_key_field_path(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first_segment(&self) -> &str {
        &self.segments[0]
    }

    pub fn last_segment(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn child(
        &self,
        segment: impl Into<String>,
    ) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn is_prefix_of(
        &self,
        other: &FieldPath,
    ) -> bool {
        other.segments.len() >= self.segments.len() && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}
