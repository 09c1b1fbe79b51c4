use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

pub const DEFAULT_SAMPLE_CAP: usize = 500;
const SAMPLE_CAP_FLOOR: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50: Option<u64>,
    pub p95: Option<u64>,
    pub mean: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyBlock {
    pub queue_wait_ms: LatencySummary,
    pub model_ms: LatencySummary,
    pub total_ms: LatencySummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggressiveBucket {
    pub triggered: u64,
    pub improved: u64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggressiveReport {
    pub triggered: u64,
    pub improved: u64,
    pub win_rate: f64,
    pub by_fallback_reason: BTreeMap<String, AggressiveBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub error_rate: f64,
    pub latency: LatencyBlock,
    pub models: BTreeMap<String, ModelStats>,
    pub errors: BTreeMap<String, u64>,
    pub aggressive: AggressiveReport,
}

#[derive(Debug, Default)]
struct Inner {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    queue_wait_ms: VecDeque<u64>,
    model_ms: VecDeque<u64>,
    total_ms: VecDeque<u64>,
    model_completed: BTreeMap<String, u64>,
    model_failed: BTreeMap<String, u64>,
    error_kinds: BTreeMap<String, u64>,
    aggressive_triggered: BTreeMap<String, u64>,
    aggressive_improved: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct MetricsStore {
    sample_cap: usize,
    inner: Mutex<Inner>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAP)
    }
}

impl MetricsStore {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            sample_cap: sample_cap.max(SAMPLE_CAP_FLOOR),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record_submitted(&self, aggressive_enabled: bool, fallback_reason: Option<&str>) {
        let mut inner = self.lock();
        inner.submitted += 1;
        if aggressive_enabled {
            let reason = normalize_reason(fallback_reason);
            *inner.aggressive_triggered.entry(reason).or_default() += 1;
        }
    }

    pub fn record_completed(
        &self,
        model: &str,
        queue_wait_ms: u64,
        model_ms: u64,
        total_ms: u64,
        aggressive_enabled: bool,
        fallback_reason: Option<&str>,
        confidence_delta: Option<f64>,
    ) {
        let cap = self.sample_cap;
        let mut inner = self.lock();
        inner.completed += 1;
        push_sample(&mut inner.queue_wait_ms, queue_wait_ms, cap);
        push_sample(&mut inner.model_ms, model_ms, cap);
        push_sample(&mut inner.total_ms, total_ms, cap);
        *inner.model_completed.entry(model.to_string()).or_default() += 1;
        if aggressive_enabled && matches!(confidence_delta, Some(delta) if delta > 0.0) {
            let reason = normalize_reason(fallback_reason);
            *inner.aggressive_improved.entry(reason).or_default() += 1;
        }
    }

    pub fn record_failed(&self, model: &str) {
        let mut inner = self.lock();
        inner.failed += 1;
        *inner.model_failed.entry(model.to_string()).or_default() += 1;
    }

    pub fn record_cancelled(&self) {
        self.lock().cancelled += 1;
    }

    pub fn record_retry(&self) {
        self.lock().retried += 1;
    }

    pub fn record_error_kind(&self, code: &str) {
        *self.lock().error_kinds.entry(code.to_string()).or_default() += 1;
    }

    pub fn error_rate(&self) -> f64 {
        let inner = self.lock();
        error_rate_of(inner.failed, inner.completed)
    }

    pub fn aggressive_report(&self) -> AggressiveReport {
        build_aggressive_report(&self.lock())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();

        let mut models = BTreeMap::new();
        for (model, &completed) in &inner.model_completed {
            models.insert(
                model.clone(),
                ModelStats {
                    completed,
                    failed: 0,
                    success_rate: 0.0,
                },
            );
        }
        for (model, &failed) in &inner.model_failed {
            models.entry(model.clone()).or_default().failed = failed;
        }
        for stats in models.values_mut() {
            let finished = stats.completed + stats.failed;
            stats.success_rate = if finished == 0 {
                0.0
            } else {
                round_4dp(stats.completed as f64 / finished as f64)
            };
        }

        MetricsSnapshot {
            submitted: inner.submitted,
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
            retried: inner.retried,
            error_rate: error_rate_of(inner.failed, inner.completed),
            latency: LatencyBlock {
                queue_wait_ms: summarize(&inner.queue_wait_ms),
                model_ms: summarize(&inner.model_ms),
                total_ms: summarize(&inner.total_ms),
            },
            models,
            errors: inner.error_kinds.clone(),
            aggressive: build_aggressive_report(&inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn push_sample(samples: &mut VecDeque<u64>, value: u64, cap: usize) {
    samples.push_back(value);
    while samples.len() > cap {
        samples.pop_front();
    }
}

// Nearest-rank at floor((n - 1) * p) over a sorted copy.
fn summarize(samples: &VecDeque<u64>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted = samples.iter().copied().collect::<Vec<_>>();
    sorted.sort_unstable();
    let rank = |p: f64| sorted[((sorted.len() - 1) as f64 * p).floor() as usize];
    let mean = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;

    LatencySummary {
        count: sorted.len(),
        p50: Some(rank(0.50)),
        p95: Some(rank(0.95)),
        mean: Some(round_3dp(mean)),
    }
}

fn build_aggressive_report(inner: &Inner) -> AggressiveReport {
    let mut by_fallback_reason = BTreeMap::new();
    for (reason, &triggered) in &inner.aggressive_triggered {
        by_fallback_reason.insert(
            reason.clone(),
            AggressiveBucket {
                triggered,
                improved: 0,
                win_rate: 0.0,
            },
        );
    }
    for (reason, &improved) in &inner.aggressive_improved {
        by_fallback_reason.entry(reason.clone()).or_default().improved = improved;
    }

    let mut triggered_total = 0;
    let mut improved_total = 0;
    for bucket in by_fallback_reason.values_mut() {
        triggered_total += bucket.triggered;
        improved_total += bucket.improved;
        bucket.win_rate = win_rate_of(bucket.improved, bucket.triggered);
    }

    AggressiveReport {
        triggered: triggered_total,
        improved: improved_total,
        win_rate: win_rate_of(improved_total, triggered_total),
        by_fallback_reason,
    }
}

fn normalize_reason(reason: Option<&str>) -> String {
    reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("unspecified")
        .to_string()
}

fn error_rate_of(failed: u64, completed: u64) -> f64 {
    let finished = failed + completed;
    if finished == 0 {
        0.0
    } else {
        round_4dp(failed as f64 / finished as f64)
    }
}

fn win_rate_of(improved: u64, triggered: u64) -> f64 {
    if triggered == 0 {
        0.0
    } else {
        round_4dp(improved as f64 / triggered as f64)
    }
}

fn round_3dp(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

fn round_4dp(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_nearest_rank_percentiles() {
        let store = MetricsStore::default();
        for value in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            store.record_completed("gpt-5-high", value, value, value, false, None, None);
        }

        let summary = store.snapshot().latency.total_ms;
        assert_eq!(summary.count, 10);
        // floor(9 * 0.50) = 4 -> 50, floor(9 * 0.95) = 8 -> 90
        assert_eq!(summary.p50, Some(50));
        assert_eq!(summary.p95, Some(90));
        assert_eq!(summary.mean, Some(55.0));
    }

    #[test]
    fn mean_rounds_to_three_decimals() {
        let store = MetricsStore::default();
        for value in [1, 1, 2] {
            store.record_completed("m", value, value, value, false, None, None);
        }
        assert_eq!(store.snapshot().latency.model_ms.mean, Some(1.333));
    }

    #[test]
    fn reservoirs_drop_oldest_beyond_cap() {
        let store = MetricsStore::new(50);
        for value in 0..120_u64 {
            store.record_completed("m", value, value, value, false, None, None);
        }

        let summary = store.snapshot().latency.queue_wait_ms;
        assert_eq!(summary.count, 50);
        // Oldest 70 samples were dropped, so the window is 70..=119.
        assert_eq!(summary.p50, Some(94));
    }

    #[test]
    fn sample_cap_floor_is_enforced() {
        let store = MetricsStore::new(1);
        for value in 0..60_u64 {
            store.record_completed("m", value, value, value, false, None, None);
        }
        assert_eq!(store.snapshot().latency.total_ms.count, 50);
    }

    #[test]
    fn empty_summary_is_all_null() {
        let summary = MetricsStore::default().snapshot().latency.total_ms;
        assert_eq!(summary.count, 0);
        assert_eq!(summary.p50, None);
        assert_eq!(summary.mean, None);
    }

    #[test]
    fn error_rate_is_failed_over_finished() {
        let store = MetricsStore::default();
        assert_eq!(store.error_rate(), 0.0);

        store.record_completed("m", 1, 1, 1, false, None, None);
        store.record_completed("m", 1, 1, 1, false, None, None);
        store.record_completed("m", 1, 1, 1, false, None, None);
        store.record_failed("m");
        assert_eq!(store.error_rate(), 0.25);
    }

    #[test]
    fn per_model_success_rate_tracks_both_outcomes() {
        let store = MetricsStore::default();
        store.record_completed("gpt-5-high", 1, 1, 1, false, None, None);
        store.record_failed("gpt-5-high");
        store.record_failed("gpt-5");

        let models = store.snapshot().models;
        assert_eq!(models["gpt-5-high"].success_rate, 0.5);
        assert_eq!(models["gpt-5"].completed, 0);
        assert_eq!(models["gpt-5"].success_rate, 0.0);
    }

    #[test]
    fn aggressive_win_rate_counts_improved_over_triggered() {
        let store = MetricsStore::default();
        store.record_submitted(true, Some("low_confidence"));
        store.record_submitted(true, Some("low_confidence"));
        store.record_submitted(true, None);
        store.record_submitted(false, None);

        store.record_completed("m", 1, 1, 1, true, Some("low_confidence"), Some(0.2));
        store.record_completed("m", 1, 1, 1, true, Some("low_confidence"), Some(-0.1));
        store.record_completed("m", 1, 1, 1, false, None, Some(0.9));

        let report = store.aggressive_report();
        assert_eq!(report.triggered, 3);
        assert_eq!(report.improved, 1);
        assert_eq!(report.win_rate, 0.3333);
        assert_eq!(report.by_fallback_reason["low_confidence"].triggered, 2);
        assert_eq!(report.by_fallback_reason["low_confidence"].win_rate, 0.5);
        assert_eq!(report.by_fallback_reason["unspecified"].triggered, 1);
    }

    #[test]
    fn error_kind_counters_accumulate() {
        let store = MetricsStore::default();
        store.record_error_kind("UPSTREAM_TIMEOUT");
        store.record_error_kind("UPSTREAM_TIMEOUT");
        store.record_error_kind("UPSTREAM_RATE_LIMITED");

        let errors = store.snapshot().errors;
        assert_eq!(errors["UPSTREAM_TIMEOUT"], 2);
        assert_eq!(errors["UPSTREAM_RATE_LIMITED"], 1);
    }
}
