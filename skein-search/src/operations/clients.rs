use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::SearchError;

/// A chat-completion model; used by query expansion and by the final
/// answer stage.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, SearchError>;
}

/// OpenAI-compatible `/v1/chat/completions` client.
pub struct HttpChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpChatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, SearchError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response: ChatResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| SearchError::Provider {
                provider: "chat",
                source,
            })?
            .json()
            .await
            .map_err(|source| SearchError::Provider {
                provider: "chat",
                source,
            })?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(SearchError::Malformed {
                provider: "chat",
                message: "no choices in response".to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankedDoc {
    pub index: usize,
    pub relevance: f32,
}

/// An external reranking model scoring documents against a query.
#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankedDoc>, SearchError>;
}

/// Cohere-style `/v1/rerank` client.
pub struct HttpRerankClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankRow>,
}

#[derive(Deserialize)]
struct RerankRow {
    index: usize,
    relevance_score: f32,
}

impl HttpRerankClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl RerankClient for HttpRerankClient {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankedDoc>, SearchError> {
        let url = format!("{}/v1/rerank", self.base_url.trim_end_matches('/'));
        let response: RerankResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": documents,
                "top_n": top_n,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| SearchError::Provider {
                provider: "rerank",
                source,
            })?
            .json()
            .await
            .map_err(|source| SearchError::Provider {
                provider: "rerank",
                source,
            })?;

        let mut ranked = Vec::with_capacity(response.results.len());
        for row in response.results {
            if row.index >= documents.len() {
                return Err(SearchError::Malformed {
                    provider: "rerank",
                    message: format!("index {} out of range", row.index),
                });
            }
            ranked.push(RerankedDoc {
                index: row.index,
                relevance: row.relevance_score,
            });
        }
        Ok(ranked)
    }
}
