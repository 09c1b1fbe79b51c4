use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

const SNIPPET_MAX_CHARS: usize = 240;
const DEFAULT_TEXT_CONFIDENCE: f64 = 0.7;
const NO_RATIONALE: &str = "No fallback reason provided.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Interactive,
    Retry,
    #[default]
    Batch,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Interactive => "interactive",
            Priority::Retry => "retry",
            Priority::Batch => "batch",
        }
    }

    // Unknown priority strings coerce to batch rather than failing admission.
    pub fn coerce(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("interactive") => Priority::Interactive,
            Some("retry") => Priority::Retry,
            _ => Priority::Batch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggressiveMeta {
    pub enabled: bool,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub model: Option<String>,
    pub priority: Priority,
    pub aggressive: AggressiveMeta,
    pub confidence_before: Option<f64>,
    pub dom_anchor: Option<Value>,
    pub screenshot_region: Option<Value>,
    pub reasoning_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestBlock {
    pub model: Option<String>,
    pub priority: Priority,
    pub aggressive: AggressiveMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvidenceEntry {
    pub snippet_id: Option<String>,
    pub quote: Option<String>,
    pub dom_anchor: Option<Value>,
    pub screenshot_region: Option<Value>,
    pub model_path: Option<String>,
    pub reasoning_note: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyTimings {
    pub queue_wait_ms: Option<u64>,
    pub model_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggressiveDiagnostics {
    pub enabled: bool,
    pub fallback_reason: Option<String>,
    pub confidence_before: Option<f64>,
    pub confidence_after: Option<f64>,
    pub confidence_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub attempts: u32,
    pub model_path: Option<String>,
    pub latency: LatencyTimings,
    pub aggressive: AggressiveDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultBlock {
    pub assistant_text: Option<String>,
    pub parsed_json: Option<Value>,
    pub render_mode: Option<String>,
    pub rendered_html: Option<String>,
    pub raw_response: Option<Value>,
    pub evidence: Vec<EvidenceEntry>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Timings {
    pub queued_at: Option<u64>,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub status: JobStatus,
    pub request: RequestBlock,
    pub result: ResultBlock,
    pub error: Option<ApiError>,
    pub timings: Timings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewBefore {
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewAfter {
    pub confidence: Option<f64>,
    pub model_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewPayload {
    pub job_id: String,
    pub status: JobStatus,
    pub before: ReviewBefore,
    pub after: ReviewAfter,
    pub evidence_links: Vec<EvidenceEntry>,
    pub rationale: String,
    pub parsed_json: Option<Value>,
    pub assistant_text: Option<String>,
}

pub struct EnvelopeInput {
    pub job_id: String,
    pub status: JobStatus,
    pub meta: RequestMeta,
    pub raw_response: Option<Value>,
    pub error: Option<ApiError>,
    pub timings: Timings,
    pub latency: LatencyTimings,
    pub attempts: u32,
}

// The envelope shape is fixed across completed, failed, and cancelled
// outcomes; absent numeric fields serialize as explicit null.
pub fn build_envelope(input: EnvelopeInput) -> JobEnvelope {
    let assistant_text = extract_assistant_text(input.raw_response.as_ref());
    let parsed_json = assistant_text.as_deref().and_then(parse_assistant_json);

    let confidence_after = derive_confidence_after(parsed_json.as_ref(), assistant_text.as_deref());
    let confidence_delta = match (input.meta.confidence_before, confidence_after) {
        (Some(before), Some(after)) if before.is_finite() && after.is_finite() => {
            Some(round_6dp(after - before))
        }
        _ => None,
    };

    let model_path = input
        .raw_response
        .as_ref()
        .and_then(|raw| raw.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| input.meta.model.clone());

    let evidence = build_evidence(
        &input.job_id,
        parsed_json.as_ref(),
        assistant_text.as_deref(),
        &input.meta,
        model_path.as_deref(),
    );

    let render_mode = assistant_text
        .as_deref()
        .filter(|text| !text.is_empty())
        .map(|_| "markdown".to_string());

    JobEnvelope {
        job_id: input.job_id,
        status: input.status,
        request: RequestBlock {
            model: input.meta.model.clone(),
            priority: input.meta.priority,
            aggressive: input.meta.aggressive.clone(),
        },
        result: ResultBlock {
            assistant_text,
            parsed_json,
            render_mode,
            rendered_html: None,
            raw_response: input.raw_response,
            evidence,
            diagnostics: Diagnostics {
                attempts: input.attempts,
                model_path,
                latency: input.latency,
                aggressive: AggressiveDiagnostics {
                    enabled: input.meta.aggressive.enabled,
                    fallback_reason: input.meta.aggressive.fallback_reason.clone(),
                    confidence_before: input.meta.confidence_before,
                    confidence_after,
                    confidence_delta,
                },
            },
        },
        error: input.error,
        timings: input.timings,
    }
}

pub fn build_review(envelope: &JobEnvelope) -> ReviewPayload {
    let diagnostics = &envelope.result.diagnostics;
    let rationale = envelope
        .request
        .aggressive
        .fallback_reason
        .clone()
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| NO_RATIONALE.to_string());

    ReviewPayload {
        job_id: envelope.job_id.clone(),
        status: envelope.status,
        before: ReviewBefore {
            confidence: diagnostics.aggressive.confidence_before,
        },
        after: ReviewAfter {
            confidence: diagnostics.aggressive.confidence_after,
            model_path: diagnostics.model_path.clone(),
        },
        evidence_links: envelope.result.evidence.clone(),
        rationale,
        parsed_json: envelope.result.parsed_json.clone(),
        assistant_text: envelope.result.assistant_text.clone(),
    }
}

fn extract_assistant_text(raw: Option<&Value>) -> Option<String> {
    let content = raw?
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// Assistant output is usually either bare JSON or a fenced block around it.
fn parse_assistant_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let fence_start = trimmed.find("```")?;
    let after_fence = &trimmed[fence_start + 3..];
    let body_start = after_fence.find('\n')?;
    let body = &after_fence[body_start + 1..];
    let body_end = body.find("```")?;
    serde_json::from_str::<Value>(body[..body_end].trim()).ok()
}

fn derive_confidence_after(parsed_json: Option<&Value>, assistant_text: Option<&str>) -> Option<f64> {
    if let Some(parsed) = parsed_json {
        if let Some(confidence) = finite_number(parsed.get("confidence")) {
            return Some(confidence);
        }
        if let Some(confidence) = finite_number(parsed.get("meta").and_then(|m| m.get("confidence")))
        {
            return Some(confidence);
        }
    }
    match assistant_text {
        Some(text) if !text.is_empty() => Some(DEFAULT_TEXT_CONFIDENCE),
        _ => None,
    }
}

fn finite_number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|n| n.is_finite())
}

fn build_evidence(
    job_id: &str,
    parsed_json: Option<&Value>,
    assistant_text: Option<&str>,
    meta: &RequestMeta,
    model_path: Option<&str>,
) -> Vec<EvidenceEntry> {
    if let Some(entries) = parsed_json
        .and_then(|parsed| parsed.get("evidence"))
        .and_then(Value::as_array)
        .filter(|entries| !entries.is_empty())
    {
        return entries.iter().map(normalize_evidence_entry).collect();
    }

    vec![EvidenceEntry {
        snippet_id: Some(format!("{job_id}-snippet-0")),
        quote: assistant_text.map(|text| truncate_chars(text, SNIPPET_MAX_CHARS)),
        dom_anchor: meta.dom_anchor.clone(),
        screenshot_region: meta.screenshot_region.clone(),
        model_path: model_path.map(str::to_string),
        reasoning_note: meta
            .aggressive
            .fallback_reason
            .clone()
            .or_else(|| meta.reasoning_note.clone()),
    }]
}

fn normalize_evidence_entry(entry: &Value) -> EvidenceEntry {
    EvidenceEntry {
        snippet_id: string_field(entry, "snippet_id"),
        quote: string_field(entry, "quote"),
        dom_anchor: entry.get("dom_anchor").filter(|v| !v.is_null()).cloned(),
        screenshot_region: entry
            .get("screenshot_region")
            .filter(|v| !v.is_null())
            .cloned(),
        model_path: string_field(entry, "model_path"),
        reasoning_note: string_field(entry, "reasoning_note"),
    }
}

fn string_field(entry: &Value, key: &str) -> Option<String> {
    entry.get(key).and_then(Value::as_str).map(str::to_string)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn round_6dp(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
