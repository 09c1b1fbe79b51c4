use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client::ChatClient;
use crate::envelope::{
    build_envelope, AggressiveMeta, EnvelopeInput, JobEnvelope, JobStatus, LatencyTimings,
    Priority, RequestMeta, Timings,
};
use crate::error::{classify_upstream, codes, ApiError, UpstreamError};
use crate::metrics::{MetricsStore, DEFAULT_SAMPLE_CAP};
use crate::now_unix_ms;
use crate::signals::{CooldownConfig, CooldownSignals, SignalSnapshot};

pub const ALREADY_FINAL: &str = "ALREADY_FINAL";

const DRAIN_RESCHEDULE_FLOOR_MS: u64 = 50;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1_500,
            max_delay_ms: 45_000,
        }
    }
}

impl RetryPolicy {
    fn normalized(self) -> Self {
        Self {
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms.max(100),
        }
    }

    fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let factor = 1_u64 << exponent;
        let delay = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_in_flight: usize,
    pub max_queue_depth: usize,
    pub retry: RetryPolicy,
    pub cooldowns: CooldownConfig,
    pub upstream_timeout: Option<Duration>,
    pub metrics_sample_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_queue_depth: 120,
            retry: RetryPolicy::default(),
            cooldowns: CooldownConfig::default(),
            upstream_timeout: Some(Duration::from_secs(600)),
            metrics_sample_cap: DEFAULT_SAMPLE_CAP,
        }
    }
}

impl QueueConfig {
    fn normalized(self) -> Self {
        Self {
            max_in_flight: self.max_in_flight.max(1),
            max_queue_depth: self.max_queue_depth.max(1),
            retry: self.retry.normalized(),
            cooldowns: self.cooldowns.normalized(),
            upstream_timeout: self.upstream_timeout,
            metrics_sample_cap: self.metrics_sample_cap,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<String>,
    pub aggressive: AggressiveMeta,
    pub confidence_before: Option<f64>,
    pub dom_anchor: Option<Value>,
    pub screenshot_region: Option<Value>,
    pub reasoning_note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitLinks {
    pub status: String,
    pub result: String,
    pub cancel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitAck {
    pub job_id: String,
    pub status: JobStatus,
    pub links: SubmitLinks,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub running: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempts: u32,
    pub queued_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone)]
pub enum ResultLookup {
    Ready(JobEnvelope),
    Pending(JobStatus),
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneDepths {
    pub interactive: usize,
    pub retry: usize,
    pub batch: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub total: usize,
    pub by_priority: LaneDepths,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub max_in_flight: usize,
    pub max_queue_depth: usize,
    pub running: usize,
    pub depth: DepthSnapshot,
    pub signals: SignalSnapshot,
}

#[derive(Debug, Default)]
struct Lanes {
    interactive: VecDeque<String>,
    retry: VecDeque<String>,
    batch: VecDeque<String>,
}

impl Lanes {
    fn push(&mut self, priority: Priority, job_id: String) {
        match priority {
            Priority::Interactive => self.interactive.push_back(job_id),
            Priority::Retry => self.retry.push_back(job_id),
            Priority::Batch => self.batch.push_back(job_id),
        }
    }

    // Fixed precedence: interactive, then retry, then batch.
    fn pop_next(&mut self) -> Option<String> {
        self.interactive
            .pop_front()
            .or_else(|| self.retry.pop_front())
            .or_else(|| self.batch.pop_front())
    }

    fn remove(&mut self, job_id: &str) {
        self.interactive.retain(|id| id != job_id);
        self.retry.retain(|id| id != job_id);
        self.batch.retain(|id| id != job_id);
    }

    fn depth(&self) -> usize {
        self.interactive.len() + self.retry.len() + self.batch.len()
    }
}

struct Job {
    job_id: String,
    payload: Value,
    priority: Priority,
    status: JobStatus,
    attempts: u32,
    queued_at: u64,
    started_at: Option<u64>,
    completed_at: Option<u64>,
    cancel_requested: bool,
    meta: RequestMeta,
    waiters: Vec<oneshot::Sender<JobEnvelope>>,
    abort: Option<CancellationToken>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    lanes: Lanes,
    running: HashSet<String>,
    results: HashMap<String, JobEnvelope>,
    next_seq: u64,
    drain_scheduled: bool,
}

struct Inner {
    config: QueueConfig,
    client: Arc<dyn ChatClient>,
    metrics: MetricsStore,
    signals: CooldownSignals,
    state: Mutex<QueueState>,
    events: broadcast::Sender<JobEnvelope>,
}

// All queue state lives behind one lock and is scoped to the manager
// instance; no await happens while the lock is held.
#[derive(Clone)]
pub struct AsyncQueueManager {
    inner: Arc<Inner>,
}

impl AsyncQueueManager {
    pub fn new(config: QueueConfig, client: Arc<dyn ChatClient>) -> Self {
        let config = config.normalized();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                metrics: MetricsStore::new(config.metrics_sample_cap),
                signals: CooldownSignals::new(config.cooldowns),
                config,
                client,
                state: Mutex::new(QueueState::default()),
                events,
            }),
        }
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.inner.metrics
    }

    pub fn signals_snapshot(&self) -> SignalSnapshot {
        self.inner.signals.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEnvelope> {
        self.inner.events.subscribe()
    }

    pub fn submit(&self, payload: Value, options: SubmitOptions) -> Result<SubmitAck, ApiError> {
        let model = validate_payload(&payload)?;
        let priority = Priority::coerce(options.priority.as_deref());

        let job_id = {
            let mut state = lock_state(&self.inner);
            let depth = state.lanes.depth() + state.running.len();
            if depth >= self.inner.config.max_queue_depth {
                return Err(ApiError::queue_backpressure(
                    depth,
                    self.inner.config.max_queue_depth,
                ));
            }

            state.next_seq += 1;
            let job_id = format!("job-{}-{}", now_unix_ms(), state.next_seq);
            let meta = RequestMeta {
                model: Some(model),
                priority,
                aggressive: options.aggressive.clone(),
                confidence_before: options.confidence_before,
                dom_anchor: options.dom_anchor,
                screenshot_region: options.screenshot_region,
                reasoning_note: options.reasoning_note,
            };
            state.jobs.insert(
                job_id.clone(),
                Job {
                    job_id: job_id.clone(),
                    payload,
                    priority,
                    status: JobStatus::Queued,
                    attempts: 0,
                    queued_at: now_unix_ms(),
                    started_at: None,
                    completed_at: None,
                    cancel_requested: false,
                    meta,
                    waiters: Vec::new(),
                    abort: None,
                },
            );
            state.lanes.push(priority, job_id.clone());
            job_id
        };

        self.inner.metrics.record_submitted(
            options.aggressive.enabled,
            options.aggressive.fallback_reason.as_deref(),
        );
        tracing::info!(
            job_id = %job_id,
            priority = priority.as_str(),
            "queue.job_admitted"
        );
        schedule_drain(&self.inner);

        Ok(SubmitAck {
            status: JobStatus::Queued,
            links: SubmitLinks {
                status: format!("/api/async/status/{job_id}"),
                result: format!("/api/async/result/{job_id}"),
                cancel: format!("/api/async/cancel/{job_id}"),
            },
            job_id,
        })
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let finalized = {
            let mut state = lock_state(&self.inner);

            if let Some(envelope) = state.results.get(job_id) {
                return CancelOutcome {
                    cancelled: false,
                    running: false,
                    status: envelope.status.as_str().to_string(),
                    code: Some(ALREADY_FINAL),
                };
            }

            let Some(job) = state.jobs.get_mut(job_id) else {
                return CancelOutcome {
                    cancelled: false,
                    running: false,
                    status: "unknown".to_string(),
                    code: Some(codes::JOB_NOT_FOUND),
                };
            };

            if job.status == JobStatus::Running {
                job.cancel_requested = true;
                if let Some(abort) = &job.abort {
                    abort.cancel();
                }
                return CancelOutcome {
                    cancelled: true,
                    running: true,
                    status: "cancel_requested".to_string(),
                    code: None,
                };
            }

            // Queued or retrying: no upstream call is in flight, finalize now.
            job.cancel_requested = true;
            let error = ApiError::job_cancelled(job_id);
            finalize_job(&mut state, job_id, JobStatus::Cancelled, None, Some(error))
        };

        if let Some(envelope) = finalized {
            self.inner.metrics.record_cancelled();
            tracing::info!(job_id = %job_id, "queue.job_cancelled");
            let _ = self.inner.events.send(envelope);
            schedule_drain(&self.inner);
            CancelOutcome {
                cancelled: true,
                running: false,
                status: JobStatus::Cancelled.as_str().to_string(),
                code: None,
            }
        } else {
            CancelOutcome {
                cancelled: false,
                running: false,
                status: "unknown".to_string(),
                code: Some(codes::JOB_NOT_FOUND),
            }
        }
    }

    pub fn status_view(&self, job_id: &str) -> Option<JobStatusView> {
        let state = lock_state(&self.inner);
        if let Some(job) = state.jobs.get(job_id) {
            return Some(JobStatusView {
                job_id: job.job_id.clone(),
                status: job.status,
                priority: job.priority,
                attempts: job.attempts,
                queued_at: Some(job.queued_at),
                started_at: job.started_at,
                completed_at: job.completed_at,
                cancel_requested: job.cancel_requested,
            });
        }

        state.results.get(job_id).map(|envelope| JobStatusView {
            job_id: envelope.job_id.clone(),
            status: envelope.status,
            priority: envelope.request.priority,
            attempts: envelope.result.diagnostics.attempts,
            queued_at: envelope.timings.queued_at,
            started_at: envelope.timings.started_at,
            completed_at: envelope.timings.completed_at,
            cancel_requested: envelope.status == JobStatus::Cancelled,
        })
    }

    pub fn result_lookup(&self, job_id: &str) -> ResultLookup {
        let state = lock_state(&self.inner);
        if let Some(envelope) = state.results.get(job_id) {
            return ResultLookup::Ready(envelope.clone());
        }
        match state.jobs.get(job_id) {
            Some(job) => ResultLookup::Pending(job.status),
            None => ResultLookup::Unknown,
        }
    }

    pub fn envelope(&self, job_id: &str) -> Option<JobEnvelope> {
        lock_state(&self.inner).results.get(job_id).cloned()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = lock_state(&self.inner);
        QueueSnapshot {
            max_in_flight: self.inner.config.max_in_flight,
            max_queue_depth: self.inner.config.max_queue_depth,
            running: state.running.len(),
            depth: DepthSnapshot {
                total: state.lanes.depth(),
                by_priority: LaneDepths {
                    interactive: state.lanes.interactive.len(),
                    retry: state.lanes.retry.len(),
                    batch: state.lanes.batch.len(),
                },
            },
            signals: self.inner.signals.snapshot(),
        }
    }

    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<JobEnvelope, ApiError> {
        let receiver = {
            let mut state = lock_state(&self.inner);
            if let Some(envelope) = state.results.get(job_id) {
                return Ok(envelope.clone());
            }
            let Some(job) = state.jobs.get_mut(job_id) else {
                return Err(ApiError::job_not_found(job_id));
            };
            let (tx, rx) = oneshot::channel();
            job.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(ApiError::new(
                500,
                codes::INTERNAL_ERROR,
                format!("Waiter for job {job_id} was dropped before finalize."),
                false,
            )),
            // The waiter timer frees the caller only; the job keeps its slot.
            Err(_) => Err(ApiError::inline_wait_timeout(job_id)),
        }
    }

    pub async fn run_inline(
        &self,
        payload: Value,
        options: SubmitOptions,
        timeout: Duration,
    ) -> Result<JobEnvelope, ApiError> {
        let ack = self.submit(payload, options)?;
        self.wait_for_completion(&ack.job_id, timeout).await
    }
}

fn validate_payload(payload: &Value) -> Result<String, ApiError> {
    if !payload.is_object() {
        return Err(ApiError::invalid_request("payload must be a JSON object."));
    }
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| ApiError::invalid_request("payload.model is required."))?;
    if !payload.get("messages").is_some_and(Value::is_array) {
        return Err(ApiError::invalid_request(
            "payload.messages must be an array.",
        ));
    }
    Ok(model.to_string())
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, QueueState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Coalesced: at most one drain tick is pending at any time.
fn schedule_drain(inner: &Arc<Inner>) {
    {
        let mut state = lock_state(inner);
        if state.drain_scheduled {
            return;
        }
        state.drain_scheduled = true;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move { drain_tick(&inner) });
}

fn drain_tick(inner: &Arc<Inner>) {
    let mut to_start = Vec::new();
    {
        let mut state = lock_state(inner);
        state.drain_scheduled = false;

        let now = now_unix_ms();
        let gate = inner.signals.gate_deadline();
        if gate > now {
            state.drain_scheduled = true;
            let delay = Duration::from_millis((gate - now).max(DRAIN_RESCHEDULE_FLOOR_MS));
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut state = lock_state(&inner);
                    state.drain_scheduled = false;
                }
                schedule_drain(&inner);
            });
            return;
        }

        while state.running.len() < inner.config.max_in_flight {
            let Some(job_id) = state.lanes.pop_next() else {
                break;
            };
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }

            job.status = JobStatus::Running;
            job.started_at = Some(now_unix_ms());
            job.attempts += 1;
            let abort = CancellationToken::new();
            job.abort = Some(abort.clone());
            let payload = job.payload.clone();
            let attempt = job.attempts;
            state.running.insert(job_id.clone());
            to_start.push((job_id, payload, attempt, abort));
        }
    }

    for (job_id, payload, attempt, abort) in to_start {
        tracing::info!(job_id = %job_id, attempt, "queue.dispatch");
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            run_job(inner, job_id, payload, abort).await;
        });
    }
}

async fn run_job(inner: Arc<Inner>, job_id: String, payload: Value, abort: CancellationToken) {
    let outcome = tokio::select! {
        result = inner
            .client
            .chat_completions(&payload, inner.config.upstream_timeout) => result,
        _ = abort.cancelled() => Err(UpstreamError {
            code: Some("ABORTED".to_string()),
            message: format!("Job {job_id} aborted while the upstream call was in flight."),
            ..UpstreamError::default()
        }),
    };

    match outcome {
        Ok(raw) => finalize_success(&inner, &job_id, raw),
        Err(err) => handle_failure(&inner, &job_id, err),
    }
    schedule_drain(&inner);
}

fn finalize_success(inner: &Arc<Inner>, job_id: &str, raw: Value) {
    let finalized = {
        let mut state = lock_state(inner);
        finalize_job(&mut state, job_id, JobStatus::Completed, Some(raw), None)
    };

    let Some(envelope) = finalized else {
        return;
    };

    let diagnostics = &envelope.result.diagnostics;
    inner.metrics.record_completed(
        envelope.request.model.as_deref().unwrap_or("unknown"),
        diagnostics.latency.queue_wait_ms.unwrap_or(0),
        diagnostics.latency.model_ms.unwrap_or(0),
        diagnostics.latency.total_ms.unwrap_or(0),
        diagnostics.aggressive.enabled,
        diagnostics.aggressive.fallback_reason.as_deref(),
        diagnostics.aggressive.confidence_delta,
    );
    tracing::info!(
        job_id = %job_id,
        attempts = diagnostics.attempts,
        total_ms = diagnostics.latency.total_ms,
        "queue.job_completed"
    );
    let _ = inner.events.send(envelope);
}

fn handle_failure(inner: &Arc<Inner>, job_id: &str, err: UpstreamError) {
    let classified = classify_upstream(&err);
    inner.metrics.record_error_kind(&classified.code);
    inner.signals.apply_for_code(&classified.code, now_unix_ms());

    enum Next {
        Finalized(JobEnvelope, bool),
        RetryAfter(Duration),
        Gone,
    }

    let next = {
        let mut state = lock_state(inner);
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };

        if job.cancel_requested {
            let error = ApiError::job_cancelled(job_id);
            match finalize_job(&mut state, job_id, JobStatus::Cancelled, None, Some(error)) {
                Some(envelope) => Next::Finalized(envelope, true),
                None => Next::Gone,
            }
        } else if classified.retryable && job.attempts < inner.config.retry.max_attempts {
            job.status = JobStatus::Retrying;
            job.abort = None;
            let attempts = job.attempts;
            state.running.remove(job_id);
            Next::RetryAfter(inner.config.retry.delay_for(attempts))
        } else {
            match finalize_job(
                &mut state,
                job_id,
                JobStatus::Failed,
                None,
                Some(classified.clone()),
            ) {
                Some(envelope) => Next::Finalized(envelope, false),
                None => Next::Gone,
            }
        }
    };

    match next {
        Next::Finalized(envelope, was_cancelled) => {
            if was_cancelled {
                inner.metrics.record_cancelled();
            } else {
                inner
                    .metrics
                    .record_failed(envelope.request.model.as_deref().unwrap_or("unknown"));
            }
            tracing::warn!(
                job_id = %job_id,
                code = %classified.code,
                status = envelope.status.as_str(),
                "queue.job_finalized"
            );
            let _ = inner.events.send(envelope);
        }
        Next::RetryAfter(delay) => {
            inner.metrics.record_retry();
            tracing::info!(
                job_id = %job_id,
                code = %classified.code,
                delay_ms = delay.as_millis() as u64,
                "queue.job_retry_scheduled"
            );
            let inner = Arc::clone(inner);
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                requeue_retry(&inner, &job_id);
            });
        }
        Next::Gone => {}
    }
}

fn requeue_retry(inner: &Arc<Inner>, job_id: &str) {
    {
        let mut state = lock_state(inner);
        match state.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Retrying => {
                job.status = JobStatus::Queued;
                job.abort = None;
                // Retries always re-enter through the retry lane.
                state.lanes.retry.push_back(job_id.to_string());
            }
            _ => return,
        }
    }
    schedule_drain(inner);
}

fn finalize_job(
    state: &mut QueueState,
    job_id: &str,
    status: JobStatus,
    raw_response: Option<Value>,
    error: Option<ApiError>,
) -> Option<JobEnvelope> {
    let mut job = state.jobs.remove(job_id)?;
    state.running.remove(job_id);
    state.lanes.remove(job_id);

    let completed_at = now_unix_ms();
    job.completed_at = Some(completed_at);

    let latency = LatencyTimings {
        queue_wait_ms: job.started_at.map(|started| started.saturating_sub(job.queued_at)),
        model_ms: job
            .started_at
            .map(|started| completed_at.saturating_sub(started)),
        total_ms: Some(completed_at.saturating_sub(job.queued_at)),
    };

    let envelope = build_envelope(EnvelopeInput {
        job_id: job.job_id.clone(),
        status,
        meta: job.meta.clone(),
        raw_response,
        error,
        timings: Timings {
            queued_at: Some(job.queued_at),
            started_at: job.started_at,
            completed_at: Some(completed_at),
        },
        latency,
        attempts: job.attempts,
    });

    state.results.insert(job.job_id.clone(), envelope.clone());
    for waiter in job.waiters.drain(..) {
        let _ = waiter.send(envelope.clone());
    }
    Some(envelope)
}
