use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::client::ChatClient;
use relay_core::error::UpstreamError;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// Forwards the opaque payload bag to the upstream chat endpoint and turns
// transport/status failures into the classifier's input shape.
pub struct HttpChatClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat_completions(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError> {
        let mut builder = self
            .http
            .post(self.endpoint("/v1/chat/completions"))
            .json(payload);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                UpstreamError::timeout("Upstream chat request timed out.")
            } else {
                UpstreamError::transport(format!("Upstream chat request failed: {err}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }

        response.json::<Value>().await.map_err(|err| {
            UpstreamError::transport(format!("Failed to parse upstream response: {err}"))
        })
    }

    async fn health(&self) -> Result<Value, UpstreamError> {
        let response = self
            .http
            .get(self.endpoint("/health"))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| {
                UpstreamError::transport(format!("Upstream health probe failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::from_status(
                status.as_u16(),
                "upstream health probe returned non-success status",
            ));
        }

        response.json::<Value>().await.map_err(|err| {
            UpstreamError::transport(format!("Failed to parse upstream health body: {err}"))
        })
    }
}

fn error_from_body(status: u16, body: &[u8]) -> UpstreamError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let error_block = parsed.as_ref().and_then(|value| value.get("error"));
    let message = error_block
        .and_then(|block| block.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("upstream returned status {status}"));
    let code = error_block
        .and_then(|block| block.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);

    UpstreamError {
        status: Some(status),
        code,
        message,
        details: parsed,
        timed_out: false,
    }
}
