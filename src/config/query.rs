use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Query engine heuristics
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueryEngineConfig {
    /// Create field indexes when full scans turn out to be wasteful
    #[serde(default = "default_true")]
    pub index_auto_creation_enabled: bool,

    /// Scans reading fewer documents than this never trigger index creation
    ///
    /// Default: 100
    #[serde(default = "default_min_collection_size")]
    pub index_auto_creation_min_collection_size: usize,

    /// Cost of an indexed read relative to a scanned one
    ///
    /// An index is requested once
    /// `documents_read > relative_index_read_cost_per_document * documents_returned`.
    ///
    /// Default: 2.0
    #[serde(default = "default_relative_index_read_cost")]
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: default_min_collection_size(),
            relative_index_read_cost_per_document: default_relative_index_read_cost(),
        }
    }
}

impl QueryEngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.relative_index_read_cost_per_document.is_finite()
            || self.relative_index_read_cost_per_document <= 0.0
        {
            return Err(Error::Config(ConfigError::Message(
                "query.relative_index_read_cost_per_document must be a positive number".into(),
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_min_collection_size() -> usize {
    100
}
fn default_relative_index_read_cost() -> f64 {
    2.0
}
