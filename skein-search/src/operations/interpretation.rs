use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::state::{QueryInterpretation, SearchState};

/// Pulls structured constraints out of the query text. Recognises
/// `kind:`, `source:`, `after:` and `before:` tokens; everything else
/// stays in the cleaned query. Rule-based and deterministic.
pub struct QueryInterpretationOp;

impl QueryInterpretationOp {
    pub const NAME: &'static str = "query_interpretation";

    fn parse_date(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(instant) = value.parse::<DateTime<Utc>>() {
            return Some(instant);
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }
}

#[async_trait]
impl SearchOperation for QueryInterpretationOp {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn optional(&self) -> bool {
        true
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        let mut interpretation = QueryInterpretation::default();
        let mut remaining = Vec::new();

        for token in state.query.split_whitespace() {
            if let Some(kind) = token.strip_prefix("kind:") {
                interpretation.kinds.push(kind.to_string());
            } else if let Some(source) = token.strip_prefix("source:") {
                interpretation.sources.push(source.to_string());
            } else if let Some(after) = token.strip_prefix("after:") {
                match Self::parse_date(after) {
                    Some(instant) => interpretation.after = Some(instant),
                    None => remaining.push(token),
                }
            } else if let Some(before) = token.strip_prefix("before:") {
                match Self::parse_date(before) {
                    Some(instant) => interpretation.before = Some(instant),
                    None => remaining.push(token),
                }
            } else {
                remaining.push(token);
            }
        }

        interpretation.cleaned_query = remaining.join(" ");
        debug!(
            "Interpreted query: {} kind(s), {} source(s), after={:?}, before={:?}",
            interpretation.kinds.len(),
            interpretation.sources.len(),
            interpretation.after,
            interpretation.before,
        );
        state.interpretation = Some(interpretation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SearchOptions;

    async fn interpret(query: &str) -> SearchState {
        let mut state = SearchState::new(query, SearchOptions::default());
        QueryInterpretationOp.execute(&mut state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn constraint_tokens_are_extracted() {
        let state = interpret("kind:doc source:wiki payment issues after:2026-01-01").await;
        let interpretation = state.interpretation.unwrap();
        assert_eq!(interpretation.kinds, vec!["doc"]);
        assert_eq!(interpretation.sources, vec!["wiki"]);
        assert!(interpretation.after.is_some());
        assert_eq!(interpretation.cleaned_query, "payment issues");
    }

    #[tokio::test]
    async fn unparseable_dates_stay_in_the_query() {
        let state = interpret("report after:lastweek").await;
        let interpretation = state.interpretation.unwrap();
        assert!(interpretation.after.is_none());
        assert_eq!(interpretation.cleaned_query, "report after:lastweek");
    }
}
