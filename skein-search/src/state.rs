use std::collections::BTreeMap;
use std::time::Duration;

use skein_model::{PointFilter, ScoredPoint};

use crate::options::SearchOptions;

/// Structured constraints pulled out of a natural-language query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInterpretation {
    pub kinds: Vec<String>,
    pub sources: Vec<String>,
    pub after: Option<chrono::DateTime<chrono::Utc>>,
    pub before: Option<chrono::DateTime<chrono::Utc>>,
    /// The query with the recognised constraint tokens removed.
    pub cleaned_query: String,
}

/// Shared state the operations read and write. Accumulates artifacts as
/// the plan executes; `final_results` is whatever the last ranking
/// operation left behind.
#[derive(Debug, Default)]
pub struct SearchState {
    pub query: String,
    pub options: SearchOptions,

    pub interpretation: Option<QueryInterpretation>,
    /// Always starts with the original query once expansion has run.
    pub expanded_queries: Vec<String>,
    pub filter: Option<PointFilter>,
    pub dense_queries: Vec<Vec<f32>>,
    pub sparse_queries: Vec<BTreeMap<u32, f32>>,
    pub raw_results: Vec<ScoredPoint>,
    pub final_results: Vec<ScoredPoint>,
    pub completion: Option<String>,

    pub timings: BTreeMap<String, Duration>,
    /// Errors absorbed from optional operations, in execution order.
    pub errors: Vec<(String, String)>,
}

impl SearchState {
    pub fn new(query: impl Into<String>, options: SearchOptions) -> Self {
        Self {
            query: query.into(),
            options,
            ..Default::default()
        }
    }

    /// The phrasings to embed: expansions when present, else the query.
    pub fn queries_to_embed(&self) -> Vec<String> {
        if self.expanded_queries.is_empty() {
            vec![self.effective_query()]
        } else {
            self.expanded_queries.clone()
        }
    }

    /// The query after interpretation stripped any constraint tokens.
    pub fn effective_query(&self) -> String {
        self.interpretation
            .as_ref()
            .filter(|i| !i.cleaned_query.is_empty())
            .map(|i| i.cleaned_query.clone())
            .unwrap_or_else(|| self.query.clone())
    }

    pub fn record_error(&mut self, op: &str, message: impl std::fmt::Display) {
        self.errors.push((op.to_string(), message.to_string()));
    }
}
