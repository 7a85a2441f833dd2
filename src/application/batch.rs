//! Bounded-concurrency batch dispatch of render jobs.

use std::num::NonZeroUsize;

use futures::future;
use tracing::debug;

use crate::domain::types::{RenderJob, RenderOutcome, RenderedArtifact};
use crate::infra::render::RenderBackend;

/// Dispatches jobs in consecutive waves of up to `concurrency` requests.
///
/// A wave never starts before the previous wave has fully settled, which caps
/// peak in-flight requests at exactly `concurrency` at the cost of not
/// overlapping a fast job with a slow straggler from the previous wave. At
/// `concurrency == 1` this degenerates into the serial per-item variant used
/// for invitee exports.
pub struct BatchRunner<'a> {
    backend: &'a dyn RenderBackend,
    concurrency: NonZeroUsize,
}

impl<'a> BatchRunner<'a> {
    pub fn new(backend: &'a dyn RenderBackend, concurrency: NonZeroUsize) -> Self {
        Self {
            backend,
            concurrency,
        }
    }

    /// Run all jobs, invoking `on_settled` once per job as its wave settles,
    /// for successes and failures alike. Failed jobs are dropped; the
    /// returned survivors keep the relative order of the input list.
    pub async fn run<F>(&self, jobs: &[RenderJob], mut on_settled: F) -> Vec<RenderedArtifact>
    where
        F: FnMut(&RenderJob, &RenderOutcome),
    {
        let mut survivors = Vec::with_capacity(jobs.len());

        for wave in jobs.chunks(self.concurrency.get()) {
            let settled =
                future::join_all(wave.iter().map(|job| self.backend.render(job))).await;

            for (job, outcome) in wave.iter().zip(settled.iter()) {
                metrics::counter!("stampa_render_jobs_total").increment(1);
                on_settled(job, outcome);
                match outcome {
                    RenderOutcome::Success { artifact_url } => {
                        survivors.push(RenderedArtifact {
                            ordinal: job.ordinal,
                            artifact_url: artifact_url.clone(),
                            suggested_name: job.suggested_name.clone(),
                        });
                    }
                    RenderOutcome::Failure { reason } => {
                        debug!(
                            target = "application::batch::BatchRunner",
                            ordinal = job.ordinal,
                            %reason,
                            "job dropped from batch"
                        );
                    }
                }
            }
        }

        survivors
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    struct ScriptedBackend {
        failing_ordinals: HashSet<usize>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(failing_ordinals: impl IntoIterator<Item = usize>, delay: Duration) -> Self {
            Self {
                failing_ordinals: failing_ordinals.into_iter().collect(),
                delay,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        fn peak(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RenderBackend for ScriptedBackend {
        async fn render(&self, job: &RenderJob) -> RenderOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing_ordinals.contains(&job.ordinal) {
                RenderOutcome::Failure {
                    reason: "scripted failure".to_string(),
                }
            } else {
                RenderOutcome::Success {
                    artifact_url: format!("https://artifacts.test/{}.png", job.ordinal),
                }
            }
        }
    }

    fn job(ordinal: usize) -> RenderJob {
        RenderJob {
            subject_id: "subject".to_string(),
            block_id: format!("block-{ordinal}"),
            ordinal,
            width: 1080,
            height: 1920,
            suffix: "png".to_string(),
            query: BTreeMap::new(),
            suggested_name: format!("page-{:02}.png", ordinal + 1),
        }
    }

    fn jobs(count: usize) -> Vec<RenderJob> {
        (0..count).map(job).collect()
    }

    fn concurrency(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    #[tokio::test]
    async fn all_successes_preserve_length_and_order() {
        let backend = ScriptedBackend::new([], Duration::ZERO);
        let runner = BatchRunner::new(&backend, concurrency(2));

        let survivors = runner.run(&jobs(5), |_, _| {}).await;
        let ordinals: Vec<usize> = survivors.iter().map(|artifact| artifact.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failures_close_gaps_without_reordering_survivors() {
        let backend = ScriptedBackend::new([1, 3], Duration::ZERO);
        let runner = BatchRunner::new(&backend, concurrency(2));

        let survivors = runner.run(&jobs(5), |_, _| {}).await;
        let ordinals: Vec<usize> = survivors.iter().map(|artifact| artifact.ordinal).collect();
        assert_eq!(ordinals, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn callback_fires_once_per_settlement_including_failures() {
        let backend = ScriptedBackend::new([0, 2], Duration::ZERO);
        let runner = BatchRunner::new(&backend, concurrency(1));

        let mut settled_ordinals = Vec::new();
        let survivors = runner
            .run(&jobs(3), |job, _| settled_ordinals.push(job.ordinal))
            .await;

        assert_eq!(settled_ordinals, vec![0, 1, 2]);
        assert_eq!(survivors.len(), 1);
    }

    #[tokio::test]
    async fn peak_in_flight_never_exceeds_the_concurrency_bound() {
        let backend = ScriptedBackend::new([], Duration::from_millis(10));
        let runner = BatchRunner::new(&backend, concurrency(2));

        let survivors = runner.run(&jobs(6), |_, _| {}).await;
        assert_eq!(survivors.len(), 6);
        assert_eq!(backend.peak(), 2);
    }

    #[tokio::test]
    async fn serial_variant_runs_one_job_at_a_time() {
        let backend = ScriptedBackend::new([], Duration::from_millis(5));
        let runner = BatchRunner::new(&backend, concurrency(1));

        runner.run(&jobs(4), |_, _| {}).await;
        assert_eq!(backend.peak(), 1);
    }

    #[tokio::test]
    async fn empty_job_list_yields_an_empty_result() {
        let backend = ScriptedBackend::new([], Duration::ZERO);
        let runner = BatchRunner::new(&backend, concurrency(2));

        let survivors = runner.run(&[], |_, _| {}).await;
        assert!(survivors.is_empty());
    }

    #[tokio::test]
    async fn all_failures_yield_an_empty_result_without_aborting() {
        let backend = ScriptedBackend::new(0..5, Duration::ZERO);
        let runner = BatchRunner::new(&backend, concurrency(2));

        let mut settled = 0usize;
        let survivors = runner.run(&jobs(5), |_, _| settled += 1).await;
        assert!(survivors.is_empty());
        assert_eq!(settled, 5);
    }
}
