use serde::Serialize;

pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const JOB_NOT_FOUND: &str = "JOB_NOT_FOUND";
    pub const JOB_CANCELLED: &str = "JOB_CANCELLED";
    pub const QUEUE_BACKPRESSURE: &str = "QUEUE_BACKPRESSURE";
    pub const QUEUE_COOLDOWN_ACTIVE: &str = "QUEUE_COOLDOWN_ACTIVE";
    pub const UPSTREAM_TIMEOUT: &str = "UPSTREAM_TIMEOUT";
    pub const UPSTREAM_LOGIN_REQUIRED: &str = "UPSTREAM_LOGIN_REQUIRED";
    pub const UPSTREAM_RATE_LIMITED: &str = "UPSTREAM_RATE_LIMITED";
    pub const UPSTREAM_CHALLENGE: &str = "UPSTREAM_CHALLENGE";
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const UPSTREAM_BAD_RESPONSE: &str = "UPSTREAM_BAD_RESPONSE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

const CHALLENGE_MARKERS: [&str; 3] = ["just a moment", "challenge", "verify you are human"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retryable,
            details: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(400, codes::INVALID_REQUEST, message, false)
    }

    pub fn job_not_found(job_id: &str) -> Self {
        Self::new(
            404,
            codes::JOB_NOT_FOUND,
            format!("No job with id {job_id}."),
            false,
        )
    }

    pub fn job_cancelled(job_id: &str) -> Self {
        Self::new(
            409,
            codes::JOB_CANCELLED,
            format!("Job {job_id} was cancelled."),
            false,
        )
    }

    pub fn queue_backpressure(depth: usize, max_depth: usize) -> Self {
        Self::new(
            429,
            codes::QUEUE_BACKPRESSURE,
            format!("Queue is full ({depth}/{max_depth} jobs in flight or waiting)."),
            true,
        )
    }

    pub fn inline_wait_timeout(job_id: &str) -> Self {
        Self::new(
            504,
            codes::UPSTREAM_TIMEOUT,
            format!("Timed out waiting for job {job_id} to finish."),
            true,
        )
    }

    pub fn public_body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, Default)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timed_out: bool,
}

impl UpstreamError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream error (status {}): {}", status, self.message),
            None => write!(f, "upstream error: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

// First matching rule wins; 5xx normalizes to 503 and unmatched 4xx to 424.
pub fn classify_upstream(err: &UpstreamError) -> ApiError {
    let message_lower = err.message.to_lowercase();
    let code_lower = err.code.as_deref().unwrap_or("").to_lowercase();

    let mut classified = if err.timed_out
        || code_lower.contains("timeout")
        || message_lower.contains("timeout")
        || message_lower.contains("timed out")
    {
        ApiError::new(
            504,
            codes::UPSTREAM_TIMEOUT,
            fallback_message(err, "Upstream request timed out."),
            true,
        )
    } else if err.status == Some(401) || code_lower == "login_required" {
        ApiError::new(
            401,
            codes::UPSTREAM_LOGIN_REQUIRED,
            fallback_message(err, "Upstream credentials are missing or expired."),
            false,
        )
    } else if err.status == Some(429) || message_lower.contains("rate limit") {
        ApiError::new(
            429,
            codes::UPSTREAM_RATE_LIMITED,
            fallback_message(err, "Upstream is rate limiting requests."),
            true,
        )
    } else if CHALLENGE_MARKERS.iter().any(|m| message_lower.contains(m)) {
        ApiError::new(
            503,
            codes::UPSTREAM_CHALLENGE,
            fallback_message(err, "Upstream is serving an interstitial challenge."),
            true,
        )
    } else if matches!(err.status, Some(s) if (500..=599).contains(&s)) {
        ApiError::new(
            503,
            codes::UPSTREAM_UNAVAILABLE,
            fallback_message(err, "Upstream returned a server error."),
            true,
        )
    } else if matches!(err.status, Some(s) if (400..=499).contains(&s)) {
        ApiError::new(
            424,
            codes::UPSTREAM_BAD_RESPONSE,
            fallback_message(err, "Upstream rejected the request."),
            false,
        )
    } else {
        ApiError::new(
            500,
            codes::INTERNAL_ERROR,
            fallback_message(err, "Upstream request failed."),
            false,
        )
    };

    classified.details = err.details.clone();
    classified
}

fn fallback_message(err: &UpstreamError, fallback: &str) -> String {
    let trimmed = err.message.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_marker_wins_over_status() {
        let err = UpstreamError {
            status: Some(500),
            timed_out: true,
            message: "upstream call exceeded deadline".to_string(),
            ..UpstreamError::default()
        };
        let classified = classify_upstream(&err);
        assert_eq!(classified.code, codes::UPSTREAM_TIMEOUT);
        assert_eq!(classified.status, 504);
        assert!(classified.retryable);
    }

    #[test]
    fn status_401_maps_to_login_required() {
        let classified = classify_upstream(&UpstreamError::from_status(401, "Missing credentials"));
        assert_eq!(classified.code, codes::UPSTREAM_LOGIN_REQUIRED);
        assert_eq!(classified.status, 401);
        assert!(!classified.retryable);
        assert_eq!(classified.message, "Missing credentials");
    }

    #[test]
    fn login_required_code_maps_without_status() {
        let err = UpstreamError {
            code: Some("LOGIN_REQUIRED".to_string()),
            message: "session expired".to_string(),
            ..UpstreamError::default()
        };
        assert_eq!(
            classify_upstream(&err).code,
            codes::UPSTREAM_LOGIN_REQUIRED
        );
    }

    #[test]
    fn rate_limit_matches_status_or_message() {
        let by_status = classify_upstream(&UpstreamError::from_status(429, "slow down"));
        assert_eq!(by_status.code, codes::UPSTREAM_RATE_LIMITED);
        assert!(by_status.retryable);

        let by_message =
            classify_upstream(&UpstreamError::transport("hit the rate limit, retry later"));
        assert_eq!(by_message.code, codes::UPSTREAM_RATE_LIMITED);
        assert_eq!(by_message.status, 429);
    }

    #[test]
    fn challenge_markers_map_to_challenge() {
        for marker in ["Just a moment...", "please verify you are human", "challenge issued"] {
            let classified = classify_upstream(&UpstreamError::transport(marker));
            assert_eq!(classified.code, codes::UPSTREAM_CHALLENGE, "marker {marker}");
            assert_eq!(classified.status, 503);
            assert!(classified.retryable);
        }
    }

    #[test]
    fn server_errors_normalize_to_503() {
        let classified = classify_upstream(&UpstreamError::from_status(500, "boom"));
        assert_eq!(classified.code, codes::UPSTREAM_UNAVAILABLE);
        assert_eq!(classified.status, 503);
        assert!(classified.retryable);
    }

    #[test]
    fn client_errors_normalize_to_424() {
        let classified = classify_upstream(&UpstreamError::from_status(400, "bad payload"));
        assert_eq!(classified.code, codes::UPSTREAM_BAD_RESPONSE);
        assert_eq!(classified.status, 424);
        assert!(!classified.retryable);
    }

    #[test]
    fn unmatched_errors_fall_through_to_internal() {
        let classified = classify_upstream(&UpstreamError::transport("socket hang up"));
        assert_eq!(classified.code, codes::INTERNAL_ERROR);
        assert_eq!(classified.status, 500);
        assert!(!classified.retryable);
    }

    #[test]
    fn empty_message_uses_kind_fallback() {
        let classified = classify_upstream(&UpstreamError::from_status(503, "  "));
        assert_eq!(classified.message, "Upstream returned a server error.");
    }

    #[test]
    fn details_survive_classification() {
        let err = UpstreamError {
            status: Some(502),
            message: "bad gateway".to_string(),
            details: Some(serde_json::json!({"upstream": "chat"})),
            ..UpstreamError::default()
        };
        let classified = classify_upstream(&err);
        assert_eq!(
            classified.details,
            Some(serde_json::json!({"upstream": "chat"}))
        );
    }

    #[test]
    fn public_body_has_stable_error_shape() {
        let body = ApiError::invalid_request("payload must be an object").public_body();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert_eq!(body["error"]["retryable"], false);
        assert!(body["error"].get("status").is_none());
    }
}
