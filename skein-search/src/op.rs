use async_trait::async_trait;

use crate::error::SearchError;
use crate::state::SearchState;

/// One step of the search plan. Operations declare the names they depend
/// on; the executor runs them in waves once their dependencies have
/// executed. A dependency that is not part of the plan counts as
/// satisfied, so optional stages can be dropped without rewiring the rest.
#[async_trait]
pub trait SearchOperation: Send + Sync {
    fn name(&self) -> &'static str;

    fn depends_on(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Optional operations record their failure and the plan continues;
    /// a required operation's failure aborts the search.
    fn optional(&self) -> bool {
        false
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError>;
}
