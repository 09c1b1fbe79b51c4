use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::UpstreamError;

// Port consumed by the queue and facade. The payload is an opaque JSON bag;
// the core only ever inspects `model` and `messages`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat_completions(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, UpstreamError>;

    async fn health(&self) -> Result<Value, UpstreamError>;
}
