use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use relay_core::queue::{QueueConfig, RetryPolicy};
use relay_core::signals::CooldownConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub upstream_url: String,
    pub replay_dir: Option<PathBuf>,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl RelayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("RELAY_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("RELAY_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8126),
            "RELAY_BIND_ADDR",
        )?;

        let upstream_url = require_nonempty(kv, "RELAY_UPSTREAM_URL")?;

        let replay_dir = kv
            .get("RELAY_REPLAY_DIR")
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);

        let upstream_timeout_ms =
            parse_u64(kv, "RELAY_UPSTREAM_TIMEOUT_MS", 600_000, 0)?;
        let upstream_timeout = if upstream_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(upstream_timeout_ms))
        };

        let queue = QueueConfig {
            max_in_flight: parse_u64(kv, "ASYNC_MAX_IN_FLIGHT", 1, 1)? as usize,
            max_queue_depth: parse_u64(kv, "ASYNC_QUEUE_MAX_DEPTH", 120, 1)? as usize,
            retry: RetryPolicy {
                max_attempts: parse_u64(kv, "ASYNC_RETRY_MAX_ATTEMPTS", 2, 1)? as u32,
                base_delay_ms: parse_u64(kv, "ASYNC_RETRY_BASE_MS", 1_500, 0)?,
                max_delay_ms: parse_u64(kv, "ASYNC_RETRY_MAX_DELAY_MS", 45_000, 100)?,
            },
            cooldowns: CooldownConfig {
                auth_required_ms: parse_u64(kv, "ASYNC_AUTH_COOLDOWN_MS", 300_000, 1_000)?,
                challenge_ms: parse_u64(kv, "ASYNC_CHALLENGE_COOLDOWN_MS", 90_000, 1_000)?,
                rate_limited_ms: parse_u64(kv, "ASYNC_RATE_COOLDOWN_MS", 45_000, 1_000)?,
                degraded_ms: parse_u64(kv, "ASYNC_DEGRADED_COOLDOWN_MS", 15_000, 1_000)?,
            },
            upstream_timeout,
            ..QueueConfig::default()
        };

        Ok(Self {
            bind_addr,
            upstream_url,
            replay_dir,
            queue,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        let value = strip_quotes(value.trim());
        kv.insert(key.to_string(), value);
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let Some(value) = kv.get(key) else {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    };

    let value = value.trim();
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

// Values below the documented minimum clamp to it rather than failing startup.
fn parse_u64(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: u64,
    min: u64,
) -> Result<u64, StartupError> {
    let Some(raw) = kv.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(default.max(min));
    };

    let parsed = raw.parse::<u64>().map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("{} must be a non-negative integer", key),
    })?;
    Ok(parsed.max(min))
}
