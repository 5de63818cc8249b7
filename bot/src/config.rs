//! Process configuration, sourced from the environment after `config::load_and_apply` has
//! folded in XDG + `.env` values (spec.md §4.9, §6 "Configuration").

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub telegram_token: String,
    pub chat_id: i64,
    pub control_topic_id: i64,
    pub agent_binary: String,
    pub project_base_dir: String,
    pub instance_db_path: String,
    pub topic_db_path: String,
    pub orchestrator_start_port: u16,
    pub orchestrator_pool_size: u16,
    pub idle_timeout: Duration,
    pub restart_delay: Duration,
    pub max_restart_attempts: u32,
    pub registration_api_bind: String,
    pub registration_api_key: Option<String>,
}

fn env_var(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn env_var_or(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(key, v)),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let chat_id_raw = env_var("TELEGRAM_CHAT_ID")?;
        let chat_id = chat_id_raw
            .parse()
            .map_err(|_| ConfigError::Invalid("TELEGRAM_CHAT_ID", chat_id_raw))?;
        let control_topic_raw = env_var("CONTROL_TOPIC_ID")?;
        let control_topic_id = control_topic_raw
            .parse()
            .map_err(|_| ConfigError::Invalid("CONTROL_TOPIC_ID", control_topic_raw))?;

        Ok(Self {
            telegram_token: env_var("TELEGRAM_BOT_TOKEN")?,
            chat_id,
            control_topic_id,
            agent_binary: env_var_or("AGENT_BINARY", "opencode"),
            project_base_dir: env_var_or("PROJECT_BASE_DIR", "/workspace"),
            instance_db_path: env_var_or("INSTANCE_DB_PATH", "./state.db"),
            topic_db_path: env_var_or("TOPIC_DB_PATH", "./topics.db"),
            orchestrator_start_port: parse_or("ORCHESTRATOR_START_PORT", 4100)?,
            orchestrator_pool_size: parse_or("ORCHESTRATOR_POOL_SIZE", 32)?,
            idle_timeout: Duration::from_millis(parse_or("IDLE_TIMEOUT_MS", 1_800_000u64)?),
            restart_delay: Duration::from_millis(parse_or("RESTART_DELAY_MS", 2_000u64)?),
            max_restart_attempts: parse_or("MAX_RESTART_ATTEMPTS", 5)?,
            registration_api_bind: env_var_or("REGISTRATION_API_BIND", "127.0.0.1:8787"),
            registration_api_key: std::env::var("REGISTRATION_API_KEY").ok(),
        })
    }
}
