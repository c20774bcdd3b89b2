use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, warn};

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::state::SearchState;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSummary {
    pub timings: BTreeMap<String, Duration>,
    pub errors: Vec<(String, String)>,
}

/// Runs a search plan in dependency order. Stateless; one executor can be
/// shared across requests.
pub struct SearchExecutor {
    operations: Vec<Arc<dyn SearchOperation>>,
}

impl SearchExecutor {
    pub fn new(operations: Vec<Arc<dyn SearchOperation>>) -> Self {
        Self { operations }
    }

    pub async fn execute(&self, state: &mut SearchState) -> Result<ExecutionSummary, SearchError> {
        let in_plan: HashSet<&str> = self.operations.iter().map(|op| op.name()).collect();
        let mut executed: HashSet<&str> = HashSet::new();

        while executed.len() < self.operations.len() {
            // A dependency outside the plan is treated as satisfied.
            let ready = self
                .operations
                .iter()
                .filter(|op| !executed.contains(op.name()))
                .filter(|op| {
                    op.depends_on()
                        .iter()
                        .all(|dep| executed.contains(dep) || !in_plan.contains(dep))
                })
                .cloned()
                .collect_vec();

            if ready.is_empty() {
                let remaining = self
                    .operations
                    .iter()
                    .map(|op| op.name())
                    .filter(|name| !executed.contains(name))
                    .join(", ");
                return Err(SearchError::StalledPlan(remaining));
            }

            for op in ready {
                let started = Instant::now();
                let result = op.execute(state).await;
                let elapsed = started.elapsed();
                state.timings.insert(op.name().to_string(), elapsed);
                executed.insert(op.name());

                match result {
                    Ok(()) => {
                        debug!("Search op {} finished in {elapsed:?}", op.name());
                    }
                    Err(err) if op.optional() => {
                        warn!("Optional search op {} failed: {err}", op.name());
                        state.record_error(op.name(), err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(ExecutionSummary {
            timings: state.timings.clone(),
            errors: state.errors.clone(),
        })
    }
}
