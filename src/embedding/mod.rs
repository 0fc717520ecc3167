//! Embedding client
//!
//! Consumes a remote embeddings endpoint: POST `{model, prompt}` to the
//! upstream base URL and read back `{embedding: [...]}`. The returned
//! vector length must equal the configured collection dimension. Transient
//! failures retry with jittered backoff; when configured, a failing call
//! also unloads the main chat model once and retries, which frees VRAM on
//! hosts running both models on one GPU.

use crate::config::{EmbeddingConfig, UpstreamConfig};
use crate::error::{EmbeddingError, Result};
use crate::tokenize::sha512_hex;
use moka::future::Cache;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct EmbeddingClient {
    config: EmbeddingConfig,
    upstream: UpstreamConfig,
    vector_size: usize,
    http: Client,
    cache: Option<Cache<String, Vec<f32>>>,
}

impl EmbeddingClient {
    pub fn new(
        config: EmbeddingConfig,
        upstream: UpstreamConfig,
        vector_size: usize,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(EmbeddingError::NetworkError)?;

        let cache = if config.cache_enabled {
            let mut builder = Cache::builder().max_capacity(config.cache_size as u64);
            if config.cache_ttl_secs > 0 {
                builder = builder.time_to_live(Duration::from_secs(config.cache_ttl_secs));
            }
            Some(builder.build())
        } else {
            None
        };

        info!(cache_enabled = config.cache_enabled, "initialized embedding client");
        Ok(Self {
            config,
            upstream,
            vector_size,
            http,
            cache,
        })
    }

    /// Embed one text, going through the cache when enabled.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".to_string()).into());
        }

        let key = sha512_hex(text);
        if let Some(cache) = &self.cache {
            if let Some(vector) = cache.get(&key).await {
                debug!("embedding cache hit");
                return Ok(vector);
            }
        }

        let vector = match self.request_with_retries(text).await {
            Ok(v) => v,
            Err(e) if self.upstream.unload_on_low_vram => {
                warn!(error = %e, "embedding failed, unloading main model and retrying");
                self.unload_main_model().await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.request_with_retries(text).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(cache) = &self.cache {
            cache.insert(key, vector.clone()).await;
        }
        Ok(vector)
    }

    /// Probe the endpoint once and check that embeddings come back roughly
    /// unit-normalized. Dimension mismatches are fatal; a bad norm only
    /// warns.
    pub async fn check_normalization(&self) -> Result<()> {
        const TEST_STR: &str = "embedding normalization test";
        let vector = self.embed(TEST_STR).await?;
        let norm: f64 = vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt();
        if (norm - 1.0).abs() > 0.01 {
            warn!(norm, "embedding vectors are not normalized");
        } else {
            info!(norm, "embedding vectors are normalized");
        }
        Ok(())
    }

    async fn request_with_retries(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < self.config.max_retries {
            attempts += 1;
            match self.try_request(text).await {
                Ok(vector) => {
                    debug!(attempts, "embedding request succeeded");
                    return Ok(vector);
                }
                Err(e) => {
                    warn!(attempts, error = %e, "embedding request failed");
                    last_error = Some(e);
                    if attempts < self.config.max_retries {
                        let base_delay = 100u64 * 2u64.pow(attempts - 1);
                        let delay = base_delay.min(30_000);
                        let jitter = (delay as f64 * 0.25 * (rand::random::<f64>() - 0.5)) as i64;
                        let final_delay =
                            Duration::from_millis((delay as i64 + jitter).max(0) as u64);
                        tokio::time::sleep(final_delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EmbeddingError::ApiError("no attempts made".to_string()).into()))
    }

    async fn try_request(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}{}", self.upstream.base_url, self.config.endpoint);
        let payload = serde_json::json!({
            "model": self.config.model,
            "prompt": text,
            "keep_alive": self.upstream.keep_alive,
        });

        let mut request = self.http.post(&url).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(EmbeddingError::NetworkError)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "embeddings endpoint returned an error");
            return Err(EmbeddingError::ApiError(format!("status {}: {}", status, body)).into());
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|_| EmbeddingError::InvalidFormat)?;

        if parsed.embedding.len() != self.vector_size {
            return Err(EmbeddingError::InvalidDimension {
                expected: self.vector_size,
                actual: parsed.embedding.len(),
            }
            .into());
        }
        Ok(parsed.embedding)
    }

    async fn unload_main_model(&self) {
        debug!(model = %self.upstream.main_model, "unloading main model");
        match tokio::process::Command::new("ollama")
            .args(["stop", &self.upstream.main_model])
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(status = %status, "model unload command exited nonzero"),
            Err(e) => warn!(error = %e, "failed to run model unload command"),
        }
    }
}
