pub mod client;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod queue;
pub mod replay;
pub mod signals;
pub mod state;

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
