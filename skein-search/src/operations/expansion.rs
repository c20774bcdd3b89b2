use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::operations::clients::ChatClient;
use crate::options::ExpansionStrategy;
use crate::state::SearchState;

const EXPANSION_SYSTEM_PROMPT: &str = "You rewrite search queries. Given a query, produce up to \
    {n} alternative phrasings that could match relevant documents using different terminology. \
    Reply with one phrasing per line and nothing else.";

/// Expands the query into alternative phrasings to improve recall. The
/// result list always starts with the original query; `auto` degrades to
/// no expansion when no chat model is configured.
pub struct QueryExpansion {
    chat: Option<Arc<dyn ChatClient>>,
    max_expansions: usize,
}

impl QueryExpansion {
    pub const NAME: &'static str = "query_expansion";

    pub fn new(chat: Option<Arc<dyn ChatClient>>, max_expansions: usize) -> Self {
        Self {
            chat,
            max_expansions: max_expansions.max(1),
        }
    }

    fn parse_variants(response: &str) -> Vec<String> {
        response
            .lines()
            .map(|line| line.trim().trim_start_matches(['-', '*', ' ']).trim())
            .map(|line| {
                // Strip "1." style list numbering.
                line.split_once('.')
                    .filter(|(prefix, _)| prefix.chars().all(|c| c.is_ascii_digit()))
                    .map(|(_, rest)| rest.trim())
                    .unwrap_or(line)
                    .to_string()
            })
            .filter(|line| !line.is_empty())
            .collect()
    }
}

#[async_trait]
impl SearchOperation for QueryExpansion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> Vec<&'static str> {
        vec![super::QueryInterpretationOp::NAME]
    }

    fn optional(&self) -> bool {
        true
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        let original = state.effective_query();
        let strategy = state.options.expansion_strategy;

        let chat = match (strategy, &self.chat) {
            (ExpansionStrategy::None, _) | (ExpansionStrategy::Auto, None) => {
                state.expanded_queries = vec![original];
                return Ok(());
            }
            (_, Some(chat)) => chat.clone(),
            (ExpansionStrategy::Llm, None) => {
                state.expanded_queries = vec![original];
                return Err(SearchError::Malformed {
                    provider: "chat",
                    message: "llm expansion requested but no chat model configured".to_string(),
                });
            }
        };

        let system = EXPANSION_SYSTEM_PROMPT.replace("{n}", &self.max_expansions.to_string());
        let response = match chat.complete(&system, &original).await {
            Ok(response) => response,
            Err(err) => {
                // Degrade to the original query; the error is recorded by
                // the executor since this op is optional.
                state.expanded_queries = vec![original];
                return Err(err);
            }
        };

        let mut expanded = vec![original.clone()];
        for variant in Self::parse_variants(&response) {
            if expanded.len() > self.max_expansions {
                break;
            }
            if !expanded.iter().any(|existing| existing == &variant) {
                expanded.push(variant);
            }
        }
        debug!("Expanded query into {} phrasings", expanded.len());
        state.expanded_queries = expanded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SearchOptions;

    struct CannedChat(String);

    #[async_trait]
    impl ChatClient for CannedChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, SearchError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenChat;

    #[async_trait]
    impl ChatClient for BrokenChat {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, SearchError> {
            Err(SearchError::Malformed {
                provider: "chat",
                message: "down".to_string(),
            })
        }
    }

    fn state_with(strategy: ExpansionStrategy) -> SearchState {
        let mut options = SearchOptions::default();
        options.expansion_strategy = strategy;
        SearchState::new("customer payment issues", options)
    }

    #[tokio::test]
    async fn original_query_always_comes_first() {
        let chat = Arc::new(CannedChat(
            "billing problems\npayment failures\ncustomer payment issues".to_string(),
        ));
        let op = QueryExpansion::new(Some(chat), 4);
        let mut state = state_with(ExpansionStrategy::Llm);
        op.execute(&mut state).await.unwrap();

        assert_eq!(state.expanded_queries[0], "customer payment issues");
        // The duplicate of the original was dropped.
        assert_eq!(state.expanded_queries.len(), 3);
    }

    #[tokio::test]
    async fn numbered_lists_are_parsed() {
        let variants =
            QueryExpansion::parse_variants("1. billing problems\n2. payment failures\n");
        assert_eq!(variants, vec!["billing problems", "payment failures"]);
    }

    #[tokio::test]
    async fn auto_without_model_degrades_to_identity() {
        let op = QueryExpansion::new(None, 4);
        let mut state = state_with(ExpansionStrategy::Auto);
        op.execute(&mut state).await.unwrap();
        assert_eq!(state.expanded_queries, vec!["customer payment issues"]);
    }

    #[tokio::test]
    async fn provider_failure_still_leaves_the_original_query() {
        let op = QueryExpansion::new(Some(Arc::new(BrokenChat)), 4);
        let mut state = state_with(ExpansionStrategy::Llm);
        let result = op.execute(&mut state).await;
        assert!(result.is_err());
        assert_eq!(state.expanded_queries, vec!["customer payment issues"]);
    }
}
