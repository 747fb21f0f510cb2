use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MediConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub scheduler: SchedulerConfig,
    pub push: PushConfig,
    pub calendar: CalendarConfig,
    pub embedding: EmbeddingConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Externally visible base URL, used to build the OAuth redirect URI.
    pub public_url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub password_iterations: u32,
    pub session_cookie: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub missed_grace_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PushConfig {
    pub vapid_public_key: String,
    pub vapid_private_key: String,
    pub subject: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalendarConfig {
    pub client_id: String,
    pub client_secret: String,
    pub time_zone: String,
    pub event_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AssistantConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retrieval_k: usize,
    pub fetch_k: usize,
    pub mmr_lambda: f32,
    pub rrf_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            log_level: "info".into(),
            public_url: "http://127.0.0.1:8000".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_medimimes_dir()
            .join("medimimes.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_iterations: 10_000,
            session_cookie: "medimimes_session".into(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            missed_grace_minutes: 5,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            vapid_public_key: String::new(),
            vapid_private_key: String::new(),
            subject: "mailto:medication-tracker@example.com".into(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            time_zone: "Asia/Kolkata".into(),
            event_minutes: 30,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_medimimes_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.groq.com/openai/v1/chat/completions".into(),
            api_key: String::new(),
            model: "llama-3.1-8b-instant".into(),
            temperature: 0.3,
            max_tokens: 512,
            retrieval_k: 2,
            fetch_k: 20,
            mmr_lambda: 0.7,
            rrf_k: 60,
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }
}

/// Returns `~/.medimimes/`
pub fn default_medimimes_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".medimimes")
}

/// Returns the default config file path: `~/.medimimes/config.toml`
pub fn default_config_path() -> PathBuf {
    default_medimimes_dir().join("config.toml")
}

impl MediConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MediConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEDIMIMES_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEDIMIMES_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEDIMIMES_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MEDIMIMES_PORT"),
            }
        }
        if let Ok(val) = std::env::var("VAPID_PUBLIC_KEY") {
            self.push.vapid_public_key = val;
        }
        if let Ok(val) = std::env::var("VAPID_PRIVATE_KEY") {
            self.push.vapid_private_key = val;
        }
        if let Ok(val) = std::env::var("GOOGLE_CALENDAR_CLIENT_ID") {
            self.calendar.client_id = val;
        }
        if let Ok(val) = std::env::var("GOOGLE_CALENDAR_CLIENT_SECRET") {
            self.calendar.client_secret = val;
        }
        if let Ok(val) = std::env::var("GROQ_API_KEY") {
            self.assistant.api_key = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// OAuth redirect URI registered with the calendar provider.
    pub fn calendar_redirect_uri(&self) -> String {
        format!(
            "{}/google/calendar/callback",
            self.server.public_url.trim_end_matches('/')
        )
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MediConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.scheduler.interval_secs, 60);
        assert_eq!(config.scheduler.missed_grace_minutes, 5);
        assert_eq!(config.assistant.chunk_size, 500);
        assert!(config.storage.db_path.ends_with("medimimes.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
public_url = "https://meds.example.com/"

[storage]
db_path = "/tmp/test.db"

[assistant]
retrieval_k = 4
"#;
        let config: MediConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.assistant.retrieval_k, 4);
        // defaults still apply for unset fields
        assert_eq!(config.assistant.chunk_overlap, 50);
        assert_eq!(config.server.port, 8000);
        assert_eq!(
            config.calendar_redirect_uri(),
            "https://meds.example.com/google/calendar/callback"
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MediConfig::default();
        std::env::set_var("MEDIMIMES_DB", "/tmp/override.db");
        std::env::set_var("MEDIMIMES_PORT", "9100");
        std::env::set_var("GROQ_API_KEY", "gsk-test");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.assistant.api_key, "gsk-test");

        std::env::remove_var("MEDIMIMES_DB");
        std::env::remove_var("MEDIMIMES_PORT");
        std::env::remove_var("GROQ_API_KEY");
    }
}
