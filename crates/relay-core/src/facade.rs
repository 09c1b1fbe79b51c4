use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::client::ChatClient;
use crate::envelope::{build_review, JobEnvelope, ReviewPayload};
use crate::error::ApiError;
use crate::metrics::{AggressiveReport, MetricsSnapshot};
use crate::now_unix_ms;
use crate::queue::{
    AsyncQueueManager, CancelOutcome, JobStatusView, QueueConfig, QueueSnapshot, ResultLookup,
    SubmitAck, SubmitOptions,
};
use crate::replay::{self, DriftAlert, ReplayReport, ReplayRequest, ReplayStore};
use crate::state::{resolve_state, StateSummary};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub queue: QueueSnapshot,
    pub metrics: MetricsSnapshot,
    pub replay_drift_alerts: Vec<DriftAlert>,
}

// Composes the upstream client, the queue manager, and the replay store
// behind the operation set the HTTP surface exposes.
pub struct ControlPlane {
    client: Arc<dyn ChatClient>,
    queue: AsyncQueueManager,
    replay: ReplayStore,
}

impl ControlPlane {
    pub fn new(
        config: QueueConfig,
        client: Arc<dyn ChatClient>,
        reports_dir: Option<PathBuf>,
    ) -> io::Result<Self> {
        let queue = AsyncQueueManager::new(config, Arc::clone(&client));
        Ok(Self {
            client,
            queue,
            replay: ReplayStore::new(reports_dir)?,
        })
    }

    pub fn queue(&self) -> &AsyncQueueManager {
        &self.queue
    }

    pub fn submit(&self, payload: Value, options: SubmitOptions) -> Result<SubmitAck, ApiError> {
        self.queue.submit(payload, options)
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        self.queue.cancel(job_id)
    }

    pub fn status_view(&self, job_id: &str) -> Option<JobStatusView> {
        self.queue.status_view(job_id)
    }

    pub fn result_lookup(&self, job_id: &str) -> ResultLookup {
        self.queue.result_lookup(job_id)
    }

    pub fn envelope(&self, job_id: &str) -> Option<JobEnvelope> {
        self.queue.envelope(job_id)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub async fn run_inline(
        &self,
        payload: Value,
        options: SubmitOptions,
        timeout: Duration,
    ) -> Result<JobEnvelope, ApiError> {
        self.queue.run_inline(payload, options, timeout).await
    }

    // Connectivity is probed here so the resolver itself stays pure.
    pub async fn get_state(&self) -> StateSummary {
        let connectivity_ok = self.client.health().await.is_ok();
        let snapshot = self.queue.snapshot();
        resolve_state(
            now_unix_ms(),
            connectivity_ok,
            &snapshot.signals,
            snapshot.depth.total,
            self.queue.metrics().error_rate(),
        )
    }

    pub fn get_metrics(&self) -> MetricsResponse {
        MetricsResponse {
            queue: self.queue.snapshot(),
            metrics: self.queue.metrics().snapshot(),
            replay_drift_alerts: self.replay.drift_alerts(),
        }
    }

    pub fn aggressive_report(&self) -> AggressiveReport {
        self.queue.metrics().aggressive_report()
    }

    pub fn review_payload(&self, job_id: &str) -> Option<ReviewPayload> {
        self.queue
            .envelope(job_id)
            .map(|envelope| build_review(&envelope))
    }

    pub async fn run_replay(&self, request: ReplayRequest) -> Result<ReplayReport, ApiError> {
        replay::run_replay(&self.queue, &self.replay, request).await
    }

    pub fn replay_report(&self, replay_id: &str) -> Option<ReplayReport> {
        self.replay.report(replay_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::{codes, UpstreamError};
    use crate::state::OperationalState;

    struct FlakyClient {
        healthy: AtomicBool,
        chat_status: Option<u16>,
    }

    impl FlakyClient {
        fn new(healthy: bool, chat_status: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                chat_status,
            })
        }
    }

    #[async_trait]
    impl ChatClient for FlakyClient {
        async fn chat_completions(
            &self,
            payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamError> {
            match self.chat_status {
                Some(status) => Err(UpstreamError::from_status(status, "scripted failure")),
                None => Ok(json!({
                    "id": "chatcmpl-facade",
                    "model": payload["model"],
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "ok"},
                        "finish_reason": "stop",
                    }],
                })),
            }
        }

        async fn health(&self) -> Result<Value, UpstreamError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(json!({"status": "ok"}))
            } else {
                Err(UpstreamError::transport("connection refused"))
            }
        }
    }

    fn payload() -> Value {
        json!({"model": "gpt-5-high", "messages": [{"role": "user", "content": "hi"}]})
    }

    fn plane(client: Arc<dyn ChatClient>) -> ControlPlane {
        ControlPlane::new(QueueConfig::default(), client, None).expect("plane should build")
    }

    #[tokio::test]
    async fn state_is_ready_when_upstream_health_passes() {
        let plane = plane(FlakyClient::new(true, None));
        let state = plane.get_state().await;
        assert_eq!(state.state, OperationalState::Ready);
        assert!(state.reasons.is_empty());
    }

    #[tokio::test]
    async fn failed_health_probe_degrades_the_state() {
        let plane = plane(FlakyClient::new(false, None));
        let state = plane.get_state().await;
        assert_eq!(state.state, OperationalState::Degraded);
        assert_eq!(state.reasons, vec!["connectivity_check_failed"]);
    }

    #[tokio::test]
    async fn auth_signal_outranks_bad_connectivity() {
        let plane = plane(FlakyClient::new(false, Some(401)));
        let envelope = plane
            .run_inline(payload(), SubmitOptions::default(), Duration::from_secs(5))
            .await
            .expect("envelope should resolve");
        assert_eq!(
            envelope.error.expect("error block").code,
            codes::UPSTREAM_LOGIN_REQUIRED
        );

        let state = plane.get_state().await;
        assert_eq!(state.state, OperationalState::AuthRequired);
        assert!(state.reasons.contains(&"auth_required_signal"));
        assert!(state.reasons.contains(&"connectivity_check_failed"));
    }

    #[tokio::test]
    async fn metrics_response_carries_queue_metrics_and_alerts() {
        let plane = plane(FlakyClient::new(true, None));
        plane
            .run_inline(payload(), SubmitOptions::default(), Duration::from_secs(5))
            .await
            .expect("job should complete");

        let body = serde_json::to_value(plane.get_metrics()).expect("metrics should serialize");
        assert_eq!(body["queue"]["max_in_flight"], 1);
        assert_eq!(body["metrics"]["completed"], 1);
        assert!(body["replay_drift_alerts"].as_array().expect("array").is_empty());
    }

    #[tokio::test]
    async fn review_payload_requires_a_cached_envelope() {
        let plane = plane(FlakyClient::new(true, None));
        assert!(plane.review_payload("job-0-0").is_none());

        let envelope = plane
            .run_inline(payload(), SubmitOptions::default(), Duration::from_secs(5))
            .await
            .expect("job should complete");
        let review = plane
            .review_payload(&envelope.job_id)
            .expect("review should exist for cached envelope");
        assert_eq!(review.job_id, envelope.job_id);
        assert_eq!(review.rationale, "No fallback reason provided.");
    }
}
