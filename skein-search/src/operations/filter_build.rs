use async_trait::async_trait;
use skein_model::PointFilter;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::state::SearchState;

/// Assembles the destination filter from the caller-supplied filter and
/// whatever the interpretation stage extracted. Caller constraints win on
/// conflict.
pub struct FilterBuild;

impl FilterBuild {
    pub const NAME: &'static str = "filter_build";
}

#[async_trait]
impl SearchOperation for FilterBuild {
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
        let mut filter = state.options.filter.clone().unwrap_or_default();

        if let Some(interpretation) = &state.interpretation {
            if filter.kinds.is_empty() {
                filter.kinds = interpretation.kinds.clone();
            }
            if filter.sources.is_empty() {
                filter.sources = interpretation.sources.clone();
            }
            if filter.updated_after.is_none() {
                filter.updated_after = interpretation.after;
            }
            if filter.updated_before.is_none() {
                filter.updated_before = interpretation.before;
            }
        }

        state.filter = if filter == PointFilter::default() {
            None
        } else {
            Some(filter)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::QueryInterpretationOp;
    use crate::options::SearchOptions;

    #[tokio::test]
    async fn interpretation_constraints_reach_the_filter() {
        let mut state = SearchState::new("kind:doc payment issues", SearchOptions::default());
        QueryInterpretationOp.execute(&mut state).await.unwrap();
        FilterBuild.execute(&mut state).await.unwrap();

        let filter = state.filter.unwrap();
        assert_eq!(filter.kinds, vec!["doc"]);
    }

    #[tokio::test]
    async fn caller_filter_wins_over_interpretation() {
        let mut options = SearchOptions::default();
        options.filter = Some(PointFilter {
            kinds: vec!["report".to_string()],
            ..Default::default()
        });
        let mut state = SearchState::new("kind:doc payment issues", options);
        QueryInterpretationOp.execute(&mut state).await.unwrap();
        FilterBuild.execute(&mut state).await.unwrap();

        assert_eq!(state.filter.unwrap().kinds, vec!["report"]);
    }

    #[tokio::test]
    async fn no_constraints_means_no_filter() {
        let mut state = SearchState::new("payment issues", SearchOptions::default());
        FilterBuild.execute(&mut state).await.unwrap();
        assert!(state.filter.is_none());
    }
}
