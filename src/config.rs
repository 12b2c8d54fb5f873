use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::merge::{DEFAULT_MAX_PER_CATEGORY, DEFAULT_SIMILARITY_THRESHOLD, MergePolicy};

/// Main configuration structure loaded from parallizer.toml and environment variables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub producers: ProducersConfig,
    /// Problems found while loading, logged once tracing is up
    #[serde(skip)]
    warnings: Vec<String>,
}

/// Per-user feed cache limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_per_category: usize,
    pub similarity_threshold: f64,
    pub ttl_seconds: u64,
    /// Distinct user caches kept before the least recently used one is dropped
    pub max_users: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_per_category: DEFAULT_MAX_PER_CATEGORY,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            ttl_seconds: 3600,
            max_users: 1024,
        }
    }
}

impl CacheConfig {
    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            max_per_category: self.max_per_category,
            similarity_threshold: self.similarity_threshold,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// HTTP binding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, every route except /health requires `Authorization: Bearer <token>`
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    /// Client-side polling convention, advertised by /health
    pub poll_interval_seconds: u64,
    pub request_timeout_ms: u64,
    pub log_ansi: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            bearer_token: None,
            poll_interval_seconds: 3,
            request_timeout_ms: 10_000,
            log_ansi: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which producers run and how they reach their backends
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProducersConfig {
    pub placeholder: bool,
    pub code_search: bool,
    pub chat_completion: bool,
    pub chat_questions: bool,
    pub chat_math: bool,
    pub web_context: bool,
    pub emails: bool,
    pub rg_binary: String,
    pub code_search_max_results: usize,
    pub code_search_timeout_ms: u64,
    pub chat_api_base: String,
    pub chat_model: String,
    pub chat_timeout_ms: u64,
    /// Only ever read from the environment
    #[serde(skip)]
    pub chat_api_key: Option<String>,
    pub web_api_base: String,
    pub web_model: String,
    pub web_timeout_ms: u64,
    #[serde(skip)]
    pub web_api_key: Option<String>,
    /// Mailbox dump looked up under each request's scope root
    pub mailbox_file: String,
}

impl Default for ProducersConfig {
    fn default() -> Self {
        Self {
            placeholder: false,
            code_search: true,
            chat_completion: true,
            chat_questions: true,
            chat_math: false,
            web_context: true,
            emails: false,
            rg_binary: "rg".to_string(),
            code_search_max_results: 5,
            code_search_timeout_ms: 10_000,
            chat_api_base: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            chat_timeout_ms: 20_000,
            chat_api_key: None,
            web_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            web_model: "gemini-2.5-flash".to_string(),
            web_timeout_ms: 30_000,
            web_api_key: None,
            mailbox_file: "emails_data_dump.mbox".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Contents of the config file; `None` only when it does not exist
fn read_config_file(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("cannot read config file {}", path.display())),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    /// Load configuration from TOML file and environment variables
    /// Uses PARALLIZER_CONFIG environment variable or defaults to "parallizer.toml"
    pub fn load() -> anyhow::Result<Self> {
        // PARALLIZER_ENV_FILE if set, else ./.env when present
        if let Ok(env_path) = std::env::var("PARALLIZER_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::dotenv();
        }

        let config_path = std::env::var("PARALLIZER_CONFIG")
            .unwrap_or_else(|_| "parallizer.toml".to_string());

        let mut config = match read_config_file(Path::new(&config_path))? {
            Some(content) => Self::from_toml_str(&content)
                .with_context(|| format!("invalid config file {config_path}"))?,
            None => {
                let mut config = Self::default();
                config.warn(format!("Config file {config_path} not found, using defaults"));
                config
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Warnings collected by `load` and `validate`; the subscriber is not
    /// installed yet when they happen
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment always wins over the file
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("PARALLIZER_MAX_PER_CATEGORY") {
            self.cache.max_per_category = v;
        }
        if let Some(v) = env_parse("PARALLIZER_SIMILARITY_THRESHOLD") {
            self.cache.similarity_threshold = v;
        }
        if let Some(v) = env_parse("PARALLIZER_CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = env_parse("PARALLIZER_MAX_USERS") {
            self.cache.max_users = v;
        }

        if let Ok(host) = std::env::var("PARALLIZER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("PARALLIZER_PORT") {
            self.server.port = port;
        }
        if let Ok(token) = std::env::var("PARALLIZER_BEARER_TOKEN") {
            self.server.bearer_token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        }
        if let Some(v) = env_parse("PARALLIZER_POLL_INTERVAL_SECONDS") {
            self.server.poll_interval_seconds = v;
        }
        if let Some(v) = env_parse("PARALLIZER_REQUEST_TIMEOUT_MS") {
            self.server.request_timeout_ms = v;
        }
        if let Some(ansi) = env_flag("PARALLIZER_LOG_ANSI") {
            self.server.log_ansi = ansi;
        }

        if let Some(v) = env_flag("PARALLIZER_PLACEHOLDER") {
            self.producers.placeholder = v;
        }
        if let Some(v) = env_flag("PARALLIZER_CODE_SEARCH") {
            self.producers.code_search = v;
        }
        if let Ok(rg) = std::env::var("PARALLIZER_RG_BINARY") {
            self.producers.rg_binary = rg;
        }
        if let Ok(base) = std::env::var("PARALLIZER_CHAT_API_BASE") {
            self.producers.chat_api_base = base;
        }
        if let Ok(model) = std::env::var("PARALLIZER_CHAT_MODEL") {
            self.producers.chat_model = model;
        }
        self.producers.chat_api_key = std::env::var("PARALLIZER_CHAT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());

        if let Some(v) = env_flag("PARALLIZER_CHAT_MATH") {
            self.producers.chat_math = v;
        }
        if let Some(v) = env_flag("PARALLIZER_WEB_CONTEXT") {
            self.producers.web_context = v;
        }
        if let Some(v) = env_flag("PARALLIZER_EMAILS") {
            self.producers.emails = v;
        }
        if let Ok(model) = std::env::var("PARALLIZER_WEB_MODEL") {
            self.producers.web_model = model;
        }
        if let Ok(file) = std::env::var("PARALLIZER_MAILBOX_FILE") {
            self.producers.mailbox_file = file;
        }
        self.producers.web_api_key = std::env::var("PARALLIZER_WEB_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
    }

    /// Validate and clamp values; hard errors for values with no sane fallback
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            anyhow::bail!(
                "similarity_threshold must be between 0.0 and 1.0, got {}",
                self.cache.similarity_threshold
            );
        }
        if self.cache.max_per_category == 0 {
            anyhow::bail!("max_per_category must be at least 1");
        } else if self.cache.max_per_category > 50 {
            self.warn(format!(
                "max_per_category {} exceeds max 50, clamping to 50",
                self.cache.max_per_category
            ));
            self.cache.max_per_category = 50;
        }
        if self.cache.max_users == 0 {
            self.warn("max_users 0 is not usable, using 1".to_string());
            self.cache.max_users = 1;
        }
        if self.cache.ttl_seconds == 0 {
            self.warn("ttl_seconds 0 expires every idle cache on the next read".to_string());
        }
        if self.server.poll_interval_seconds == 0 {
            self.server.poll_interval_seconds = 1;
        }
        if self.producers.code_search_max_results == 0 {
            self.producers.code_search_max_results = 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.cache.max_per_category, 3);
        assert_eq!(config.cache.similarity_threshold, 0.5);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.server.poll_interval_seconds, 3);
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            max_per_category = 5

            [producers]
            placeholder = true
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.max_per_category, 5);
        assert_eq!(config.cache.similarity_threshold, 0.5);
        assert!(config.producers.placeholder);
        assert!(config.producers.code_search);
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.cache.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_clamps_large_capacity() {
        let mut config = Config::default();
        config.cache.max_per_category = 500;
        config.validate().unwrap();
        assert_eq!(config.cache.max_per_category, 50);
        let warnings = config.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("clamping to 50"));
        assert!(config.take_warnings().is_empty());
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let path = std::env::temp_dir().join(format!("parallizer-{}.toml", uuid::Uuid::new_v4()));
        assert!(read_config_file(&path).unwrap().is_none());
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        // a directory exists but cannot be read as a file
        let err = read_config_file(&std::env::temp_dir()).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }

    #[test]
    fn producer_sections_parse_from_toml() {
        let config = Config::from_toml_str(
            r#"
            [producers]
            web_context = false
            chat_math = true
            emails = true
            mailbox_file = "inbox.txt"
            web_model = "gemini-2.5-pro"
            "#,
        )
        .unwrap();
        assert!(!config.producers.web_context);
        assert!(config.producers.chat_math);
        assert!(config.producers.emails);
        assert_eq!(config.producers.mailbox_file, "inbox.txt");
        assert_eq!(config.producers.web_model, "gemini-2.5-pro");
        assert!(config.producers.web_api_key.is_none());
    }
}
