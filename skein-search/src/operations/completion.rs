use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use log::debug;

use crate::error::SearchError;
use crate::op::SearchOperation;
use crate::operations::clients::ChatClient;
use crate::state::SearchState;

const COMPLETION_SYSTEM_PROMPT: &str = "Answer the user's question using only the provided \
    context documents. Cite the source names you drew from. If the context does not contain \
    the answer, say so.";

const SNIPPET_CHARS: usize = 1200;

/// Feeds the ranked results to a chat model to produce the final textual
/// answer for `response_type = completion`.
pub struct Completion {
    chat: Arc<dyn ChatClient>,
    max_context_docs: usize,
}

impl Completion {
    pub const NAME: &'static str = "completion";

    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self {
            chat,
            max_context_docs: 8,
        }
    }
}

#[async_trait]
impl SearchOperation for Completion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn depends_on(&self) -> Vec<&'static str> {
        vec![super::VectorSearch::NAME, super::Reranking::NAME]
    }

    fn optional(&self) -> bool {
        true
    }

    async fn execute(&self, state: &mut SearchState) -> Result<(), SearchError> {
        if state.final_results.is_empty() {
            state.completion = Some("No matching documents were found.".to_string());
            return Ok(());
        }

        let context = state
            .final_results
            .iter()
            .take(self.max_context_docs)
            .enumerate()
            .map(|(index, point)| {
                let source = point.payload.source_name.as_deref().unwrap_or("unknown");
                let mut snippet = point.payload.embeddable_text.clone();
                if snippet.len() > SNIPPET_CHARS {
                    let mut cut = SNIPPET_CHARS;
                    while !snippet.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    snippet.truncate(cut);
                }
                format!("[{}] ({source}) {snippet}", index + 1)
            })
            .join("\n\n");

        let user = format!("Question: {}\n\nContext:\n{context}", state.query);
        debug!(
            "Requesting completion over {} context document(s)",
            self.max_context_docs.min(state.final_results.len())
        );
        let answer = self.chat.complete(COMPLETION_SYSTEM_PROMPT, &user).await?;
        state.completion = Some(answer);
        Ok(())
    }
}
