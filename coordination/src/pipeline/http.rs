//! HTTP transport for remotely hosted pipelines.
//!
//! POSTs the request payload as JSON and expects
//! `{"score": f64, "confidence": f64, "detail": any}` back.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AnalysisPipeline, PipelineFault, PipelineOutput};

/// A pipeline served behind an HTTP endpoint
pub struct HttpPipeline {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPipeline {
    /// Build a client for `endpoint`. `connect_timeout` bounds connection setup
    /// only; the adapter's own timeout bounds the whole call.
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Result<Self, PipelineFault> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| PipelineFault::Request(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalysisPipeline for HttpPipeline {
    async fn analyze(&self, payload: &serde_json::Value) -> Result<PipelineOutput, PipelineFault> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| PipelineFault::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineFault::Status {
                status,
                body: truncate(&body, 256),
            });
        }

        let output: PipelineOutput = response
            .json()
            .await
            .map_err(|e| PipelineFault::MalformedResponse(e.to_string()))?;

        debug!(
            endpoint = %self.endpoint,
            score = output.score,
            confidence = output.confidence,
            "Remote pipeline responded"
        );

        Ok(output)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}
