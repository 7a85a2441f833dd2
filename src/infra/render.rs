//! HTTP adapter for the external rendering service.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::domain::types::{RenderJob, RenderOutcome};

/// Boundary trait for issuing one render request per job.
///
/// Implementations must not error: every transport or service failure is
/// folded into [`RenderOutcome::Failure`]. The trait is also the seam where a
/// retrying decorator could be installed without touching the batch runner.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    async fn render(&self, job: &RenderJob) -> RenderOutcome;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequestBody<'a> {
    subject_id: &'a str,
    width: u32,
    height: u32,
    app_id: &'a str,
    block_id: &'a str,
    suffix: &'a str,
    query: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RenderResponseBody {
    #[serde(default)]
    urls: Vec<String>,
}

/// Client for the rendering service. One network round trip per job.
#[derive(Debug, Clone)]
pub struct HttpRenderClient {
    http: reqwest::Client,
    endpoint: Url,
    app_id: String,
}

impl HttpRenderClient {
    pub fn new(http: reqwest::Client, endpoint: Url, app_id: impl Into<String>) -> Self {
        Self {
            http,
            endpoint,
            app_id: app_id.into(),
        }
    }

    async fn request(&self, job: &RenderJob) -> Result<String, String> {
        let body = RenderRequestBody {
            subject_id: &job.subject_id,
            width: job.width,
            height: job.height,
            app_id: &self.app_id,
            block_id: &job.block_id,
            suffix: &job.suffix,
            query: &job.query,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| format!("render request failed: {err}"))?
            .error_for_status()
            .map_err(|err| format!("render service rejected request: {err}"))?;

        let parsed: RenderResponseBody = response
            .json()
            .await
            .map_err(|err| format!("render response could not be decoded: {err}"))?;

        // The service returns an ordered artifact list; only element 0 is
        // consumed.
        parsed
            .urls
            .into_iter()
            .next()
            .ok_or_else(|| "render service returned no artifacts".to_string())
    }
}

#[async_trait]
impl RenderBackend for HttpRenderClient {
    async fn render(&self, job: &RenderJob) -> RenderOutcome {
        let started_at = Instant::now();
        match self.request(job).await {
            Ok(artifact_url) => {
                metrics::histogram!("stampa_render_ms")
                    .record(started_at.elapsed().as_millis() as f64);
                RenderOutcome::Success { artifact_url }
            }
            Err(reason) => {
                warn!(
                    target = "infra::render::HttpRenderClient",
                    block_id = %job.block_id,
                    ordinal = job.ordinal,
                    %reason,
                    "render request failed; job dropped"
                );
                metrics::counter!("stampa_render_failure_total").increment(1);
                RenderOutcome::Failure { reason }
            }
        }
    }
}
