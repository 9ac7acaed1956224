//! Embedding provider boundary and the Gemini HTTP provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::EmbeddingConfig;

use super::error::EmbeddingError;

/// Connection timeout for HTTP requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall request timeout for HTTP requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Turns text into a vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot produce a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

fn should_retry(status_code: u16, attempt: u32) -> bool {
    attempt < MAX_RETRIES && (500..600).contains(&status_code)
}

fn calculate_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

/// Gemini `embedContent` provider.
#[derive(Debug, Clone)]
pub struct GeminiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiEmbedder {
    /// Create a new Gemini embedder.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    /// Create an embedder from config, reading the API key from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::MissingApiKey`] if the key variable is unset or empty.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| EmbeddingError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config.base_url.clone(), api_key, config.model.clone())
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:embedContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = self.endpoint();
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "content": {
                "parts": [{ "text": text }]
            }
        });

        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        EmbeddingError::Timeout
                    } else {
                        EmbeddingError::RequestFailed(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                let json: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::ParseError(e.to_string()))?;
                return parse_embedding(&json);
            }

            if should_retry(status.as_u16(), attempt) {
                let backoff = calculate_backoff(attempt);
                tracing::warn!(status = %status, attempt, "Embedding request failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::RequestFailed(format!("HTTP {status}: {text}")));
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_embedding(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = json["embedding"]["values"]
        .as_array()
        .ok_or_else(|| EmbeddingError::ParseError("No embedding in response".to_string()))?;
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::ParseError(format!("Non-numeric value: {v}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        assert!(should_retry(500, 0));
        assert!(should_retry(503, 2));
        assert!(!should_retry(500, MAX_RETRIES));
        assert!(!should_retry(429, 0));
        assert!(!should_retry(400, 0));
    }

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_endpoint() {
        let embedder = GeminiEmbedder::new(
            "https://example.test/v1beta/".to_string(),
            "key".to_string(),
            "embedding-001".to_string(),
        )
        .unwrap();
        assert_eq!(
            embedder.endpoint(),
            "https://example.test/v1beta/models/embedding-001:embedContent"
        );
    }

    #[test]
    fn test_parse_embedding() {
        let json = serde_json::json!({"embedding": {"values": [0.5, -1.0, 2]}});
        assert_eq!(parse_embedding(&json).unwrap(), vec![0.5, -1.0, 2.0]);

        let err = parse_embedding(&serde_json::json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, EmbeddingError::ParseError(_)));
    }

    #[test]
    fn test_from_config_missing_key() {
        let config = EmbeddingConfig {
            api_key_env: "PHASEFLOW_TEST_UNSET_KEY_VAR".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = GeminiEmbedder::from_config(&config).unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::MissingApiKey("PHASEFLOW_TEST_UNSET_KEY_VAR".to_string())
        );
    }
}
