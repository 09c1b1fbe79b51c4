use std::io;
use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast::error::RecvError;

use relay_core::facade::ControlPlane;

pub mod config;
pub mod http;
pub mod metrics;
pub mod upstream;

pub fn build(config: &config::RelayConfig) -> io::Result<Router> {
    let client = Arc::new(upstream::HttpChatClient::new(&config.upstream_url));
    let plane = Arc::new(ControlPlane::new(
        config.queue.clone(),
        client,
        config.replay_dir.clone(),
    )?);

    let mut events = plane.queue().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => metrics::observe_job_final(envelope.status.as_str()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    Ok(http::router(plane))
}
