//! Engine configuration, environment-driven.
//!
//! Every duration that shapes the concurrency model (lease, staleness
//! threshold, lock TTL/backoff, task timeout) is configurable here rather
//! than hard-coded. Missing inference credentials are the one fatal
//! condition: the engine cannot make judgment calls without them.

use std::time::Duration;

use crate::inference::InferenceSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the engine API listens on.
    pub port: u16,
    /// Path to the engine SQLite database.
    pub database_url: String,
    /// CORS origins allowed to call the API.
    pub allowed_origins: Vec<String>,
    /// Run lease duration. Must comfortably cover one iteration's
    /// worst-case latency; the lease renews on every heartbeat.
    pub run_lease: Duration,
    /// Heartbeat age beyond which a running entry is considered stale.
    pub heartbeat_staleness: Duration,
    /// Start lock TTL; bounds the damage of a lost release.
    pub lock_ttl: Duration,
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
    /// Per-task execution timeout within a level.
    pub task_timeout: Duration,
    /// Backstop against runaway autonomous loops.
    pub max_iterations: u32,
    /// Cap on `key_insights`; reflection re-bounds to this on every call.
    pub insight_cap: usize,
    /// Judgment confidence below which the decider pauses for the user.
    pub confidence_floor: f64,
    pub inference: InferenceSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let api_key = std::env::var("INFERENCE_API_KEY").map_err(|_| {
            anyhow::anyhow!(
                "INFERENCE_API_KEY is required: the engine cannot run judgment calls without credentials"
            )
        })?;

        Ok(Self {
            port: env_parse("ENGINE_PORT", 8090)?,
            database_url: env_str("ENGINE_DATABASE_URL", "sqlite:./data/engine.db"),
            allowed_origins: env_csv(
                "ENGINE_ALLOWED_ORIGINS",
                &["http://localhost:3000", "http://127.0.0.1:3000"],
            ),
            run_lease: Duration::from_secs(env_parse("RESEARCH_RUN_LEASE_SECS", 4 * 3600)?),
            heartbeat_staleness: Duration::from_secs(env_parse(
                "RESEARCH_HEARTBEAT_STALENESS_SECS",
                2 * 3600,
            )?),
            lock_ttl: Duration::from_secs(env_parse("RESEARCH_START_LOCK_TTL_SECS", 30)?),
            lock_attempts: env_parse("RESEARCH_START_LOCK_ATTEMPTS", 3)?,
            lock_backoff: Duration::from_millis(env_parse("RESEARCH_START_LOCK_BACKOFF_MS", 250)?),
            task_timeout: Duration::from_secs(env_parse("RESEARCH_TASK_TIMEOUT_SECS", 1800)?),
            max_iterations: env_parse("RESEARCH_MAX_ITERATIONS", 12)?,
            insight_cap: env_parse("RESEARCH_KEY_INSIGHT_CAP", 8)?,
            confidence_floor: env_parse("RESEARCH_CONFIDENCE_FLOOR", 0.5)?,
            inference: InferenceSettings {
                base_url: env_str("INFERENCE_BASE_URL", "https://api.openai.com/v1"),
                api_key,
                model: env_str("INFERENCE_MODEL", "gpt-4o-mini"),
                request_timeout: Duration::from_secs(env_parse("INFERENCE_TIMEOUT_SECS", 120)?),
            },
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
