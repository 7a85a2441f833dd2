//! Export session orchestration.
//!
//! The orchestrator validates the request, holds the per-subject re-entrancy
//! guard, enumerates render jobs, drives the batch runner while feeding the
//! progress estimator, and hands surviving artifact URLs to the aggregator.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::archive::ArchiveAggregator;
use crate::application::batch::BatchRunner;
use crate::application::error::ExportError;
use crate::application::progress::ProgressEstimator;
use crate::domain::types::{Deliverable, RenderJob};
use crate::infra::render::RenderBackend;

const INVITEE_QUERY_KEY: &str = "invitee";

/// A page selected for a chunked export session.
#[derive(Debug, Clone)]
pub struct PageSelection {
    pub block_id: String,
    pub query: BTreeMap<String, String>,
}

/// Chunked export of selected canvas regions.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub subject_id: String,
    /// Session label used for deterministic output naming.
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub suffix: String,
    pub pages: Vec<PageSelection>,
}

/// Serial per-invitee export of one canvas region.
#[derive(Debug, Clone)]
pub struct PersonalizedExportRequest {
    pub subject_id: String,
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub suffix: String,
    pub block_id: String,
    /// Personalization tokens, one job per invitee.
    pub invitees: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InFlightError {
    #[error("export already in progress for subject {subject_id}")]
    AlreadyRunning { subject_id: String },
}

/// Serializes export sessions. The progress estimator and its ticker are
/// shared across the whole service, so only one session may run at a time
/// regardless of subject; the guard records which subject holds the slot so a
/// rejection can name the session actually in flight.
#[derive(Default, Clone)]
pub struct InFlightExports {
    active: Arc<Mutex<Option<String>>>,
}

impl InFlightExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, subject_id: &str) -> Result<ExportGuard, InFlightError> {
        let mut active = self.lock_active();
        match active.as_ref() {
            Some(running) => Err(InFlightError::AlreadyRunning {
                subject_id: running.clone(),
            }),
            None => {
                *active = Some(subject_id.to_string());
                Ok(ExportGuard {
                    active: Arc::clone(&self.active),
                })
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ExportGuard {
    active: Arc<Mutex<Option<String>>>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = None;
    }
}

/// Drives one export session end to end.
pub struct ExportService {
    backend: Arc<dyn RenderBackend>,
    aggregator: ArchiveAggregator,
    progress: ProgressEstimator,
    in_flight: InFlightExports,
    concurrency: NonZeroUsize,
}

impl ExportService {
    pub fn new(
        backend: Arc<dyn RenderBackend>,
        aggregator: ArchiveAggregator,
        progress: ProgressEstimator,
        concurrency: NonZeroUsize,
    ) -> Self {
        Self {
            backend,
            aggregator,
            progress,
            in_flight: InFlightExports::new(),
            concurrency,
        }
    }

    /// Handle onto the session's progress tracks, for polling by the UI.
    pub fn progress(&self) -> ProgressEstimator {
        self.progress.clone()
    }

    /// Export the selected canvas regions as one deliverable, dispatching
    /// render requests in waves of the configured concurrency.
    pub async fn export_pages(&self, request: ExportRequest) -> Result<Deliverable, ExportError> {
        validate_common(&request.subject_id, request.width, request.height, &request.suffix)?;
        if request.pages.is_empty() {
            return Err(ExportError::invalid("no pages selected"));
        }

        let jobs = build_page_jobs(&request);
        self.run_session(
            &request.subject_id,
            &request.label,
            request.pages.len(),
            jobs,
            self.concurrency,
        )
        .await
    }

    /// Export one personalized variant per invitee, serially, so every
    /// settlement yields an exact progress signal.
    pub async fn export_invitations(
        &self,
        request: PersonalizedExportRequest,
    ) -> Result<Deliverable, ExportError> {
        validate_common(&request.subject_id, request.width, request.height, &request.suffix)?;
        if request.block_id.is_empty() {
            return Err(ExportError::invalid("block identifier is required"));
        }
        if request.invitees.is_empty() {
            return Err(ExportError::invalid("no invitees selected"));
        }

        let jobs = build_invitee_jobs(&request);
        self.run_session(
            &request.subject_id,
            &request.label,
            request.invitees.len(),
            jobs,
            NonZeroUsize::MIN,
        )
        .await
    }

    async fn run_session(
        &self,
        subject_id: &str,
        label: &str,
        requested: usize,
        jobs: Vec<RenderJob>,
        concurrency: NonZeroUsize,
    ) -> Result<Deliverable, ExportError> {
        let _guard = self.in_flight.acquire(subject_id).map_err(|err| {
            let InFlightError::AlreadyRunning { subject_id: active } = err;
            warn!(
                target = "application::export::ExportService",
                subject_id = %subject_id,
                active = %active,
                "an export session is already in flight; rejecting"
            );
            ExportError::AlreadyRunning { subject_id: active }
        })?;

        let session = Uuid::new_v4();
        let started_at = Instant::now();

        let expected = NonZeroUsize::new(requested)
            .ok_or_else(|| ExportError::invalid("nothing requested"))?;
        if !self.progress.start(expected) {
            return Err(ExportError::AlreadyRunning {
                subject_id: subject_id.to_string(),
            });
        }

        if jobs.is_empty() {
            self.progress.reset();
            return Err(ExportError::NothingToDeliver);
        }
        if jobs.len() < requested {
            if let Some(revised) = NonZeroUsize::new(jobs.len()) {
                self.progress.revise_expected(revised);
            }
        }

        let runner = BatchRunner::new(self.backend.as_ref(), concurrency);
        let progress = self.progress.clone();
        let artifacts = runner.run(&jobs, |_, _| progress.record_completion()).await;

        if artifacts.is_empty() {
            self.progress.reset();
            return Err(ExportError::NothingToDeliver);
        }

        let deliverable = match self.aggregator.collect(label, &artifacts).await {
            Ok(deliverable) => deliverable,
            Err(err) => {
                self.progress.reset();
                return Err(err);
            }
        };

        info!(
            target = "application::export::ExportService",
            session = %session,
            subject_id = %subject_id,
            jobs = jobs.len(),
            survivors = artifacts.len(),
            deliverable = %deliverable.filename(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "export session finished"
        );

        Ok(deliverable)
    }
}

fn validate_common(
    subject_id: &str,
    width: u32,
    height: u32,
    suffix: &str,
) -> Result<(), ExportError> {
    if subject_id.is_empty() {
        return Err(ExportError::invalid("subject identifier is required"));
    }
    if width == 0 || height == 0 {
        return Err(ExportError::invalid("page dimensions must be non-zero"));
    }
    if suffix.is_empty() {
        return Err(ExportError::invalid("image format suffix is required"));
    }
    Ok(())
}

fn build_page_jobs(request: &ExportRequest) -> Vec<RenderJob> {
    let mut jobs = Vec::with_capacity(request.pages.len());
    for (ordinal, page) in request.pages.iter().enumerate() {
        if page.block_id.is_empty() {
            warn!(
                target = "application::export::ExportService",
                ordinal,
                "page without block identifier skipped at enumeration"
            );
            continue;
        }
        jobs.push(RenderJob {
            subject_id: request.subject_id.clone(),
            block_id: page.block_id.clone(),
            ordinal,
            width: request.width,
            height: request.height,
            suffix: request.suffix.clone(),
            query: page.query.clone(),
            suggested_name: format!("{}-page-{:02}.{}", request.label, ordinal + 1, request.suffix),
        });
    }
    jobs
}

fn build_invitee_jobs(request: &PersonalizedExportRequest) -> Vec<RenderJob> {
    let mut jobs = Vec::with_capacity(request.invitees.len());
    for (ordinal, invitee) in request.invitees.iter().enumerate() {
        if invitee.is_empty() {
            warn!(
                target = "application::export::ExportService",
                ordinal,
                "invitee without token skipped at enumeration"
            );
            continue;
        }
        let mut query = BTreeMap::new();
        query.insert(INVITEE_QUERY_KEY.to_string(), invitee.clone());
        jobs.push(RenderJob {
            subject_id: request.subject_id.clone(),
            block_id: request.block_id.clone(),
            ordinal,
            width: request.width,
            height: request.height,
            suffix: request.suffix.clone(),
            query,
            suggested_name: format!("{}-{}.{}", request.label, invitee, request.suffix),
        });
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(block_id: &str) -> PageSelection {
        PageSelection {
            block_id: block_id.to_string(),
            query: BTreeMap::new(),
        }
    }

    fn page_request(pages: Vec<PageSelection>) -> ExportRequest {
        ExportRequest {
            subject_id: "doc-1".to_string(),
            label: "pages".to_string(),
            width: 1080,
            height: 1920,
            suffix: "png".to_string(),
            pages,
        }
    }

    #[test]
    fn guard_serializes_sessions_and_names_the_active_subject() {
        let in_flight = InFlightExports::new();
        let guard = in_flight.acquire("doc-1").expect("first acquisition");

        // One session at a time, whatever the subject; the rejection names
        // the session actually running.
        match in_flight.acquire("doc-2") {
            Err(InFlightError::AlreadyRunning { subject_id }) => {
                assert_eq!(subject_id, "doc-1");
            }
            Ok(_) => panic!("second session acquired while one is in flight"),
        }

        drop(guard);
        in_flight.acquire("doc-2").expect("released guard frees the slot");
    }

    #[test]
    fn page_jobs_keep_original_ordinals_and_skip_empty_blocks() {
        let request = page_request(vec![page("a"), page(""), page("c")]);
        let jobs = build_page_jobs(&request);

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].ordinal, 0);
        assert_eq!(jobs[1].ordinal, 2);
        assert_eq!(jobs[1].block_id, "c");
        assert_eq!(jobs[1].suggested_name, "pages-page-03.png");
    }

    #[test]
    fn invitee_jobs_carry_the_personalization_token() {
        let request = PersonalizedExportRequest {
            subject_id: "doc-1".to_string(),
            label: "invitations".to_string(),
            width: 800,
            height: 1200,
            suffix: "png".to_string(),
            block_id: "front".to_string(),
            invitees: vec!["alice".to_string(), "bob".to_string()],
        };
        let jobs = build_invitee_jobs(&request);

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].query.get(INVITEE_QUERY_KEY).map(String::as_str), Some("alice"));
        assert_eq!(jobs[1].suggested_name, "invitations-bob.png");
        assert_eq!(jobs[0].block_id, "front");
        assert_eq!(jobs[1].block_id, "front");
    }

    #[test]
    fn validation_rejects_missing_identifiers_and_zero_dimensions() {
        assert!(matches!(
            validate_common("", 10, 10, "png"),
            Err(ExportError::InvalidRequest { .. })
        ));
        assert!(matches!(
            validate_common("doc", 0, 10, "png"),
            Err(ExportError::InvalidRequest { .. })
        ));
        assert!(matches!(
            validate_common("doc", 10, 10, ""),
            Err(ExportError::InvalidRequest { .. })
        ));
        assert!(validate_common("doc", 10, 10, "png").is_ok());
    }
}
