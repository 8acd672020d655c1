//! Embedding generation behind the [`EmbeddingService`] seam.
//!
//! [`OpenAiEmbedder`] talks to any OpenAI-compatible `/embeddings` endpoint.
//! Failures are isolated per text: a rejected batch is retried one text at a
//! time so one bad input does not sink its neighbours.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use docharvest_shared::{AppConfig, EmbeddingsConfig, HarvestError, Result, embeddings_api_key};

/// Outcome for one input text: its vector or why it failed.
pub type EmbeddingOutcome = std::result::Result<Vec<f32>, String>;

/// Produces embedding vectors for text.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// One outcome per input text, in input order.
    ///
    /// `Err` is reserved for failures that leave no per-text answer at all.
    async fn create_embeddings_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutcome>>;
}

/// Async embeddings client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: u32,
    batch_size: usize,
    retry_backoff: Duration,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, config: &EmbeddingsConfig) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(HarvestError::config("missing embeddings API key"));
        }
        if config.model.trim().is_empty() {
            return Err(HarvestError::config("missing embeddings model name"));
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|e| HarvestError::config(format!("invalid embeddings API key: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| HarvestError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimensions: config.dimensions,
            max_retries: config.max_retries,
            batch_size: config.batch_size.max(1),
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// Build from app config, reading the key from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = embeddings_api_key(config)?;
        Self::new(&api_key, &config.embeddings)
    }

    /// Override the base retry backoff (doubled per retry).
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// POST one request, retrying 429, 5xx and transport failures.
    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };

        let mut attempt = 0u32;
        loop {
            let failure = match self.client.post(&self.endpoint).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let mut parsed: EmbeddingResponse = resp.json().await.map_err(|e| {
                        HarvestError::Embedding(format!("invalid embeddings response: {e}"))
                    })?;
                    parsed.data.sort_by_key(|entry| entry.index);
                    if parsed.data.len() != inputs.len() {
                        return Err(HarvestError::Embedding(format!(
                            "endpoint returned {} embeddings for {} inputs",
                            parsed.data.len(),
                            inputs.len()
                        )));
                    }
                    return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    let message = format!("embeddings request failed ({status}): {text}");
                    if !should_retry(status) {
                        return Err(HarvestError::Embedding(message));
                    }
                    message
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    format!("embeddings request failed: {e}")
                }
                Err(e) => return Err(HarvestError::Embedding(e.to_string())),
            };

            if attempt >= self.max_retries {
                return Err(HarvestError::Embedding(failure));
            }
            attempt += 1;
            let backoff = self.retry_backoff.saturating_mul(1 << attempt.min(5));
            debug!(attempt, ?backoff, error = %failure, "retrying embeddings request");
            tokio::time::sleep(backoff).await;
        }
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedder {
    async fn create_embeddings_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutcome>> {
        let mut outcomes = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            match self.request(batch).await {
                Ok(vectors) => outcomes.extend(vectors.into_iter().map(Ok)),
                Err(e) if batch.len() == 1 => outcomes.push(Err(e.to_string())),
                Err(e) => {
                    warn!(size = batch.len(), error = %e, "embedding batch failed, retrying per text");
                    for text in batch {
                        let outcome = self
                            .request(std::slice::from_ref(text))
                            .await
                            .and_then(|mut v| {
                                v.pop().ok_or_else(|| {
                                    HarvestError::Embedding("empty embeddings response".into())
                                })
                            })
                            .map_err(|e| e.to_string());
                        outcomes.push(outcome);
                    }
                }
            }
        }

        Ok(outcomes)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, batch_size: usize) -> EmbeddingsConfig {
        EmbeddingsConfig {
            base_url: format!("{}/v1", server.uri()),
            batch_size,
            max_retries: 1,
            ..EmbeddingsConfig::default()
        }
    }

    fn embedder(server: &MockServer, batch_size: usize) -> OpenAiEmbedder {
        OpenAiEmbedder::new("sk-test", &config(server, batch_size))
            .unwrap()
            .with_retry_backoff(Duration::from_millis(1))
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn embeds_in_batches_and_keeps_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [2.0]},
                    {"index": 0, "embedding": [1.0]}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let outcomes = embedder(&server, 2)
            .create_embeddings_batch(&texts(&["a", "b", "c", "d"]))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0], Ok(vec![1.0]));
        assert_eq!(outcomes[1], Ok(vec![2.0]));
    }

    #[tokio::test]
    async fn failed_batch_falls_back_to_single_texts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["good", "bad"]})))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["good"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.5, 0.5]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["bad"]})))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .mount(&server)
            .await;

        let outcomes = embedder(&server, 8)
            .create_embeddings_batch(&texts(&["good", "bad"]))
            .await
            .unwrap();

        assert_eq!(outcomes[0], Ok(vec![0.5, 0.5]));
        assert!(outcomes[1].as_ref().unwrap_err().contains("400"));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [3.0]}]
            })))
            .mount(&server)
            .await;

        let outcomes = embedder(&server, 8)
            .create_embeddings_batch(&texts(&["x"]))
            .await
            .unwrap();
        assert_eq!(outcomes, vec![Ok(vec![3.0])]);
    }

    #[test]
    fn rejects_blank_key() {
        assert!(OpenAiEmbedder::new("  ", &EmbeddingsConfig::default()).is_err());
    }
}
