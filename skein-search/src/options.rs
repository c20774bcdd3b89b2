use serde::{Deserialize, Serialize};
use skein_model::PointFilter;

use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Raw,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStrategy {
    None,
    Llm,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Neural,
    Keyword,
    #[default]
    Hybrid,
}

/// The options surface the search API accepts. Unknown fields are
/// rejected at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub response_type: ResponseType,
    pub expansion_strategy: ExpansionStrategy,
    pub search_method: SearchMethod,
    pub enable_reranking: bool,
    pub enable_query_interpretation: bool,
    /// 0.0 ranks purely by similarity, 1.0 purely by freshness.
    pub recency_bias: f32,
    pub score_threshold: Option<f32>,
    pub filter: Option<PointFilter>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            response_type: ResponseType::Raw,
            expansion_strategy: ExpansionStrategy::Auto,
            search_method: SearchMethod::Hybrid,
            enable_reranking: true,
            enable_query_interpretation: false,
            recency_bias: 0.0,
            score_threshold: None,
            filter: None,
        }
    }
}

impl SearchOptions {
    pub fn from_json(value: serde_json::Value) -> Result<Self, SearchError> {
        let options: Self = serde_json::from_value(value)
            .map_err(|err| SearchError::InvalidConfig(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.limit == 0 {
            return Err(SearchError::InvalidConfig(
                "limit must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.recency_bias) {
            return Err(SearchError::InvalidConfig(format!(
                "recency_bias {} outside [0, 1]",
                self.recency_bias
            )));
        }
        if let Some(threshold) = self.score_threshold {
            if !threshold.is_finite() {
                return Err(SearchError::InvalidConfig(
                    "score_threshold must be finite".to_string(),
                ));
            }
            // Fused hybrid scores are rank-based, not similarities; a
            // similarity cutoff only means something in single-mode search.
            if self.search_method == SearchMethod::Hybrid {
                return Err(SearchError::InvalidConfig(
                    "score_threshold conflicts with hybrid search; rank-fused scores are not \
                     on a similarity scale"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let err = SearchOptions::from_json(serde_json::json!({
            "limit": 5,
            "frobnicate": true,
        }))
        .unwrap_err();
        assert!(matches!(err, SearchError::InvalidConfig(_)));
    }

    #[test]
    fn recency_bias_is_range_checked() {
        let err = SearchOptions::from_json(serde_json::json!({ "recency_bias": 1.5 })).unwrap_err();
        assert!(matches!(err, SearchError::InvalidConfig(_)));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = SearchOptions::from_json(serde_json::json!({ "limit": 0 })).unwrap_err();
        assert!(matches!(err, SearchError::InvalidConfig(_)));
    }

    #[test]
    fn score_threshold_conflicts_with_hybrid_search() {
        let err = SearchOptions::from_json(serde_json::json!({
            "search_method": "hybrid",
            "score_threshold": 0.5,
        }))
        .unwrap_err();
        assert!(matches!(err, SearchError::InvalidConfig(_)));

        // Single-mode searches may keep a similarity cutoff.
        SearchOptions::from_json(serde_json::json!({
            "search_method": "neural",
            "score_threshold": 0.5,
        }))
        .unwrap();
    }

    #[test]
    fn enums_deserialize_from_snake_case() {
        let options = SearchOptions::from_json(serde_json::json!({
            "search_method": "keyword",
            "expansion_strategy": "none",
            "response_type": "completion",
        }))
        .unwrap();
        assert_eq!(options.search_method, SearchMethod::Keyword);
        assert_eq!(options.expansion_strategy, ExpansionStrategy::None);
        assert_eq!(options.response_type, ResponseType::Completion);
    }
}
