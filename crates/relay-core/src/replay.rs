use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::envelope::AggressiveMeta;
use crate::error::ApiError;
use crate::now_unix_ms;
use crate::queue::{AsyncQueueManager, SubmitOptions};

const REPLAY_CASE_TIMEOUT: Duration = Duration::from_secs(900);
const DRIFT_THRESHOLD: f64 = -0.05;

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayCase {
    #[serde(default)]
    pub id: String,
    pub payload: Value,
    #[serde(default)]
    pub expected: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub replay_name: String,
    pub baseline_model: String,
    pub candidate_model: String,
    pub cases: Vec<ReplayCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldResult {
    pub expected: Value,
    pub baseline: Value,
    pub candidate: Value,
    pub baseline_match: bool,
    #[serde(rename = "match")]
    pub candidate_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub baseline_accuracy: f64,
    pub candidate_accuracy: f64,
    pub field_results: BTreeMap<String, FieldResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub message: String,
    pub previous_candidate_accuracy: f64,
    pub candidate_accuracy: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub case_count: usize,
    pub baseline_accuracy: f64,
    pub candidate_accuracy: f64,
    pub accuracy_delta: f64,
    pub drift_alerts: Vec<DriftAlert>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replay_id: String,
    pub replay_name: String,
    pub baseline_model: String,
    pub candidate_model: String,
    pub created_at: u64,
    pub summary: ReplaySummary,
    pub cases: Vec<CaseResult>,
}

// Reports are immutable once produced; the store keeps every report by id
// plus the latest per replay name, and optionally mirrors both to disk.
#[derive(Debug, Default)]
pub struct ReplayStore {
    reports_dir: Option<PathBuf>,
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    by_id: HashMap<String, ReplayReport>,
    latest_by_name: HashMap<String, ReplayReport>,
    last_id_ms: u64,
}

impl ReplayStore {
    pub fn new(reports_dir: Option<PathBuf>) -> io::Result<Self> {
        if let Some(dir) = &reports_dir {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            reports_dir,
            inner: Mutex::new(StoreInner::default()),
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    fn allocate_replay_id(&self) -> String {
        let mut inner = self.lock();
        let mut ms = now_unix_ms();
        if ms <= inner.last_id_ms {
            ms = inner.last_id_ms + 1;
        }
        inner.last_id_ms = ms;
        format!("replay-{ms}")
    }

    fn previous_latest(&self, replay_name: &str) -> Option<ReplayReport> {
        if let Some(dir) = &self.reports_dir {
            let path = dir.join(latest_file_name(replay_name));
            if !path.exists() {
                return None;
            }
            // A malformed prior report is ignored, not an error.
            return read_json::<ReplayReport>(&path).ok();
        }
        self.lock().latest_by_name.get(replay_name).cloned()
    }

    fn persist(&self, report: &ReplayReport) -> io::Result<()> {
        if let Some(dir) = &self.reports_dir {
            write_json_atomic(&dir.join(format!("{}.json", report.replay_id)), report)?;
            write_json_atomic(&dir.join(latest_file_name(&report.replay_name)), report)?;
        }
        let mut inner = self.lock();
        inner
            .by_id
            .insert(report.replay_id.clone(), report.clone());
        inner
            .latest_by_name
            .insert(report.replay_name.clone(), report.clone());
        Ok(())
    }

    pub fn report(&self, replay_id: &str) -> Option<ReplayReport> {
        if let Some(report) = self.lock().by_id.get(replay_id) {
            return Some(report.clone());
        }
        let dir = self.reports_dir.as_ref()?;
        if !is_safe_id(replay_id) {
            return None;
        }
        let path = dir.join(format!("{replay_id}.json"));
        if !path.exists() {
            return None;
        }
        read_json::<ReplayReport>(&path).ok()
    }

    pub fn drift_alerts(&self) -> Vec<DriftAlert> {
        let inner = self.lock();
        let mut names = inner.latest_by_name.keys().collect::<Vec<_>>();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| inner.latest_by_name[name].summary.drift_alerts.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub async fn run_replay(
    queue: &AsyncQueueManager,
    store: &ReplayStore,
    request: ReplayRequest,
) -> Result<ReplayReport, ApiError> {
    let baseline_model = request.baseline_model.trim();
    let candidate_model = request.candidate_model.trim();
    if baseline_model.is_empty() || candidate_model.is_empty() {
        return Err(ApiError::invalid_request(
            "baselineModel and candidateModel are required.",
        ));
    }

    let replay_name = {
        let trimmed = request.replay_name.trim();
        if trimmed.is_empty() {
            "default".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let mut cases = Vec::with_capacity(request.cases.len());
    for (index, case) in request.cases.iter().enumerate() {
        let case_id = if case.id.trim().is_empty() {
            format!("case-{index}")
        } else {
            case.id.trim().to_string()
        };

        let baseline_json = run_case(queue, &case.payload, baseline_model).await?;
        let candidate_json = run_case(queue, &case.payload, candidate_model).await?;

        let mut field_results = BTreeMap::new();
        let mut baseline_matched = 0_usize;
        let mut candidate_matched = 0_usize;
        for (key, expected) in &case.expected {
            let baseline = lookup_field(baseline_json.as_ref(), key);
            let candidate = lookup_field(candidate_json.as_ref(), key);
            let baseline_match = fields_match(expected, &baseline);
            let candidate_match = fields_match(expected, &candidate);
            if baseline_match {
                baseline_matched += 1;
            }
            if candidate_match {
                candidate_matched += 1;
            }
            field_results.insert(
                key.clone(),
                FieldResult {
                    expected: expected.clone(),
                    baseline,
                    candidate,
                    baseline_match,
                    candidate_match,
                },
            );
        }

        cases.push(CaseResult {
            case_id,
            baseline_accuracy: accuracy(baseline_matched, case.expected.len()),
            candidate_accuracy: accuracy(candidate_matched, case.expected.len()),
            field_results,
        });
    }

    let baseline_accuracy = mean(cases.iter().map(|c| c.baseline_accuracy));
    let candidate_accuracy = mean(cases.iter().map(|c| c.candidate_accuracy));

    let mut drift_alerts = Vec::new();
    if let Some(previous) = store.previous_latest(&replay_name) {
        let previous_accuracy = previous.summary.candidate_accuracy;
        if previous_accuracy.is_finite() {
            let delta = candidate_accuracy - previous_accuracy;
            if delta <= DRIFT_THRESHOLD {
                drift_alerts.push(DriftAlert {
                    kind: "accuracy_drop".to_string(),
                    level: "warn".to_string(),
                    message: format!(
                        "Candidate accuracy for {replay_name} dropped from {previous_accuracy} to {candidate_accuracy}."
                    ),
                    previous_candidate_accuracy: previous_accuracy,
                    candidate_accuracy,
                    delta: round_4dp(delta),
                });
            }
        }
    }

    let report = ReplayReport {
        replay_id: store.allocate_replay_id(),
        replay_name,
        baseline_model: baseline_model.to_string(),
        candidate_model: candidate_model.to_string(),
        created_at: now_unix_ms(),
        summary: ReplaySummary {
            case_count: cases.len(),
            baseline_accuracy,
            candidate_accuracy,
            accuracy_delta: round_4dp(candidate_accuracy - baseline_accuracy),
            drift_alerts,
        },
        cases,
    };

    store.persist(&report).map_err(|err| {
        ApiError::new(
            500,
            crate::error::codes::INTERNAL_ERROR,
            format!("Failed to persist replay report: {err}"),
            false,
        )
    })?;
    tracing::info!(
        replay_id = %report.replay_id,
        replay_name = %report.replay_name,
        candidate_accuracy = report.summary.candidate_accuracy,
        "replay.report_written"
    );

    Ok(report)
}

async fn run_case(
    queue: &AsyncQueueManager,
    payload: &Value,
    model: &str,
) -> Result<Option<Value>, ApiError> {
    let mut payload = payload.clone();
    if let Some(object) = payload.as_object_mut() {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }

    let envelope = queue
        .run_inline(
            payload,
            SubmitOptions {
                priority: Some("batch".to_string()),
                aggressive: AggressiveMeta::default(),
                ..SubmitOptions::default()
            },
            REPLAY_CASE_TIMEOUT,
        )
        .await?;
    Ok(envelope.result.parsed_json)
}

fn lookup_field(parsed: Option<&Value>, key: &str) -> Value {
    parsed
        .and_then(|value| value.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

#[derive(Debug, PartialEq)]
enum Normalized {
    Number(f64),
    Bool(bool),
    Text(String),
    Json(String),
}

// Strings are trimmed and case-folded; numeric strings coerce to canonical
// numbers so "56" matches 56. Everything else compares as JSON text.
fn normalize_field(value: &Value) -> Normalized {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(number) if number.is_finite() => Normalized::Number(number),
            _ => Normalized::Json(value.to_string()),
        },
        Value::Bool(b) => Normalized::Bool(*b),
        Value::String(s) => {
            let trimmed = s.trim();
            match trimmed.parse::<f64>() {
                Ok(number) if number.is_finite() => Normalized::Number(number),
                _ => Normalized::Text(trimmed.to_lowercase()),
            }
        }
        other => Normalized::Json(other.to_string()),
    }
}

fn fields_match(expected: &Value, actual: &Value) -> bool {
    normalize_field(expected) == normalize_field(actual)
}

fn accuracy(matched: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round_4dp(matched as f64 / total as f64)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected = values.collect::<Vec<_>>();
    if collected.is_empty() {
        0.0
    } else {
        round_4dp(collected.iter().sum::<f64>() / collected.len() as f64)
    }
}

fn latest_file_name(replay_name: &str) -> String {
    format!("latest-{}.json", safe_name(replay_name))
}

// Runs of characters outside [A-Za-z0-9._-] collapse into a single '_'.
fn safe_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

fn is_safe_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 256
        && raw
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice::<T>(&bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("failed to parse {}: {}", path.display(), err),
        )
    })
}

fn write_json_atomic(path: &Path, value: &impl Serialize) -> io::Result<()> {
    let payload = serde_json::to_vec_pretty(value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("failed to serialize {}: {}", path.display(), err),
        )
    })?;
    let temp_name = format!(
        "{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("tmp"),
        Ulid::new()
    );
    let temp_path = path.with_file_name(temp_name);
    fs::write(&temp_path, payload)?;
    if fs::rename(&temp_path, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&temp_path, path)?;
    }
    Ok(())
}

fn round_4dp(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::client::ChatClient;
    use crate::error::UpstreamError;
    use crate::queue::QueueConfig;

    struct ModelScriptClient {
        responses: StdHashMap<String, String>,
    }

    impl ModelScriptClient {
        fn new(responses: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .iter()
                    .map(|(model, content)| (model.to_string(), content.to_string()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl ChatClient for ModelScriptClient {
        async fn chat_completions(
            &self,
            payload: &Value,
            _timeout: Option<Duration>,
        ) -> Result<Value, UpstreamError> {
            let model = payload["model"].as_str().unwrap_or_default();
            let content = self
                .responses
                .get(model)
                .cloned()
                .unwrap_or_else(|| "{}".to_string());
            Ok(json!({
                "id": "chatcmpl-replay",
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": "stop",
                }],
            }))
        }

        async fn health(&self) -> Result<Value, UpstreamError> {
            Ok(json!({"status": "ok"}))
        }
    }

    fn mouse_case() -> ReplayCase {
        ReplayCase {
            id: "mouse".to_string(),
            payload: json!({
                "model": "placeholder",
                "messages": [{"role": "user", "content": "extract the product details"}],
            }),
            expected: json!({"weight_g": 56, "battery_h": 120})
                .as_object()
                .expect("expected map")
                .clone(),
        }
    }

    fn request(name: &str) -> ReplayRequest {
        ReplayRequest {
            replay_name: name.to_string(),
            baseline_model: "gpt-5".to_string(),
            candidate_model: "gpt-5-high".to_string(),
            cases: vec![mouse_case()],
        }
    }

    fn temp_reports_dir() -> PathBuf {
        std::env::temp_dir().join(format!("relay-replay-test-{}", Ulid::new()))
    }

    #[test]
    fn normalization_coerces_strings_and_numbers() {
        assert!(fields_match(&json!(56), &json!(56.0)));
        assert!(fields_match(&json!(56), &json!("56")));
        assert!(fields_match(&json!(" OK "), &json!("ok")));
        assert!(fields_match(&json!(true), &json!(true)));
        assert!(!fields_match(&json!(true), &json!("true")));
        assert!(fields_match(&json!({"a": 1}), &json!({"a": 1})));
        assert!(!fields_match(&json!(56), &json!(55)));
        assert!(!fields_match(&json!("present"), &Value::Null));
    }

    #[test]
    fn safe_name_collapses_runs_of_invalid_characters() {
        assert_eq!(safe_name("mouse-core"), "mouse-core");
        assert_eq!(safe_name("mouse core/v1"), "mouse_core_v1");
        assert_eq!(safe_name("a  //  b"), "a_b");
    }

    #[tokio::test]
    async fn field_accuracy_matches_the_reference_scenario() {
        let client = ModelScriptClient::new(&[
            ("gpt-5", r#"{"weight_g": 55, "battery_h": 120}"#),
            ("gpt-5-high", r#"{"weight_g": 56, "battery_h": 120}"#),
        ]);
        let queue = AsyncQueueManager::new(QueueConfig::default(), client);
        let store = ReplayStore::in_memory();

        let report = run_replay(&queue, &store, request("mouse-core"))
            .await
            .expect("replay should run");

        assert_eq!(report.summary.baseline_accuracy, 0.5);
        assert_eq!(report.summary.candidate_accuracy, 1.0);
        assert_eq!(report.summary.accuracy_delta, 0.5);
        assert!(report.summary.drift_alerts.is_empty());

        let case = &report.cases[0];
        assert_eq!(case.case_id, "mouse");
        assert!(case.field_results["weight_g"].candidate_match);
        assert!(!case.field_results["weight_g"].baseline_match);
        assert!(case.field_results["battery_h"].baseline_match);

        assert!(report.replay_id.starts_with("replay-"));
        assert_eq!(
            store
                .report(&report.replay_id)
                .expect("report should be addressable by id")
                .replay_id,
            report.replay_id
        );
    }

    #[tokio::test]
    async fn drift_alert_fires_when_candidate_accuracy_drops() {
        let dir = temp_reports_dir();
        let good = ModelScriptClient::new(&[
            ("gpt-5", r#"{"weight_g": 55, "battery_h": 120}"#),
            ("gpt-5-high", r#"{"weight_g": 56, "battery_h": 120}"#),
        ]);
        let bad = ModelScriptClient::new(&[
            ("gpt-5", r#"{"weight_g": 55, "battery_h": 120}"#),
            ("gpt-5-high", r#"{"weight_g": 0, "battery_h": 0}"#),
        ]);

        let store = ReplayStore::new(Some(dir.clone())).expect("store should initialize");
        let queue = AsyncQueueManager::new(QueueConfig::default(), good);
        let first = run_replay(&queue, &store, request("mouse-core"))
            .await
            .expect("first replay should run");
        assert_eq!(first.summary.candidate_accuracy, 1.0);
        assert!(dir.join("latest-mouse-core.json").exists());

        let queue = AsyncQueueManager::new(QueueConfig::default(), bad);
        let second = run_replay(&queue, &store, request("mouse-core"))
            .await
            .expect("second replay should run");

        assert_eq!(second.summary.candidate_accuracy, 0.0);
        assert_eq!(second.summary.drift_alerts.len(), 1);
        let alert = &second.summary.drift_alerts[0];
        assert_eq!(alert.kind, "accuracy_drop");
        assert_eq!(alert.level, "warn");
        assert_eq!(alert.previous_candidate_accuracy, 1.0);

        assert_eq!(store.drift_alerts().len(), 1);

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn malformed_prior_latest_is_ignored() {
        let dir = temp_reports_dir();
        fs::create_dir_all(&dir).expect("temp dir should create");
        fs::write(dir.join("latest-mouse-core.json"), b"{not json").expect("write should succeed");

        let client = ModelScriptClient::new(&[
            ("gpt-5", r#"{"weight_g": 56, "battery_h": 120}"#),
            ("gpt-5-high", r#"{"weight_g": 56, "battery_h": 120}"#),
        ]);
        let store = ReplayStore::new(Some(dir.clone())).expect("store should initialize");
        let queue = AsyncQueueManager::new(QueueConfig::default(), client);

        let report = run_replay(&queue, &store, request("mouse-core"))
            .await
            .expect("replay should run despite garbage latest file");
        assert!(report.summary.drift_alerts.is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn empty_models_are_rejected() {
        let client = ModelScriptClient::new(&[]);
        let queue = AsyncQueueManager::new(QueueConfig::default(), client);
        let store = ReplayStore::in_memory();

        let mut req = request("mouse-core");
        req.candidate_model = "  ".to_string();
        let err = run_replay(&queue, &store, req)
            .await
            .expect_err("blank candidate model must fail");
        assert_eq!(err.code, crate::error::codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn case_without_expected_fields_scores_zero() {
        let client = ModelScriptClient::new(&[]);
        let queue = AsyncQueueManager::new(QueueConfig::default(), client);
        let store = ReplayStore::in_memory();

        let mut req = request("empty");
        req.cases[0].expected = serde_json::Map::new();
        let report = run_replay(&queue, &store, req)
            .await
            .expect("replay should run");
        assert_eq!(report.summary.baseline_accuracy, 0.0);
        assert_eq!(report.summary.candidate_accuracy, 0.0);
    }

    #[tokio::test]
    async fn replay_ids_are_unique_within_the_same_millisecond() {
        let store = ReplayStore::in_memory();
        let first = store.allocate_replay_id();
        let second = store.allocate_replay_id();
        assert_ne!(first, second);
    }
}
