use crate::error::{Result, ScribeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    #[default]
    Openai,
    WhisperCpp,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "openai"),
            Provider::WhisperCpp => write!(f, "whisper-cpp"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "whisper-cpp" | "whisper.cpp" | "whispercpp" => Ok(Provider::WhisperCpp),
            _ => Err(format!(
                "Unknown provider: {}. Use 'openai' or 'whisper-cpp'",
                s
            )),
        }
    }
}

/// What to do when a resumed chunk's stored plan hash differs from the fresh plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMismatchPolicy {
    /// Refuse to resume.
    #[default]
    Reject,
    /// Throw away prior work for the mismatched chunks only.
    Replan,
    /// Keep prior work and log a warning.
    Reuse,
}

impl std::fmt::Display for PlanMismatchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanMismatchPolicy::Reject => write!(f, "reject"),
            PlanMismatchPolicy::Replan => write!(f, "replan"),
            PlanMismatchPolicy::Reuse => write!(f, "reuse"),
        }
    }
}

impl std::str::FromStr for PlanMismatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(PlanMismatchPolicy::Reject),
            "replan" => Ok(PlanMismatchPolicy::Replan),
            "reuse" => Ok(PlanMismatchPolicy::Reuse),
            _ => Err(format!(
                "Unknown plan mismatch policy: {}. Use 'reject', 'replan', or 'reuse'",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub provider: Provider,
    /// Model identifier; also part of every chunk's plan hash.
    pub model: String,
    pub whisper_cpp_binary: String,
    pub language: String,
    pub chunk_seconds: u64,
    pub engine_timeout_secs: u64,

    pub checkpoint_db: Option<PathBuf>,
    pub resume_checkpoint: bool,
    pub reset_checkpoint: bool,
    pub checkpoint_sync_uri: Option<String>,
    pub plan_mismatch: PlanMismatchPolicy,
    pub strict_reassembly: bool,

    pub max_chunk_attempts: u32,
    pub retry_base_delay_ms: u64,

    pub spot_drain_enabled: bool,
    pub spot_poll_interval_secs: f64,
    pub metadata_endpoint: String,

    pub publish_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            provider: Provider::default(),
            model: "whisper-1".to_string(),
            whisper_cpp_binary: "whisper-cli".to_string(),
            language: "en".to_string(),
            chunk_seconds: 600,
            engine_timeout_secs: 3600,
            checkpoint_db: None,
            resume_checkpoint: true,
            reset_checkpoint: false,
            checkpoint_sync_uri: None,
            plan_mismatch: PlanMismatchPolicy::default(),
            strict_reassembly: false,
            max_chunk_attempts: 3,
            retry_base_delay_ms: 1000,
            spot_drain_enabled: false,
            spot_poll_interval_secs: 10.0,
            metadata_endpoint: "http://169.254.169.254".to_string(),
            publish_dir: None,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if it exists
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                config = toml::from_str::<Config>(&contents).map_err(|e| {
                    ScribeError::Config(format!("{}: {e}", config_path.display()))
                })?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Override fields from `OPENAI_API_KEY` and `CHUNKSCRIBE_*` variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(p) = var("CHUNKSCRIBE_PROVIDER").and_then(|v| v.parse().ok()) {
            self.provider = p;
        }
        if let Some(model) = var("CHUNKSCRIBE_MODEL") {
            self.model = model;
        }
        if let Some(bin) = var("CHUNKSCRIBE_WHISPER_CPP_BIN") {
            self.whisper_cpp_binary = bin;
        }
        if let Some(lang) = var("CHUNKSCRIBE_LANGUAGE") {
            self.language = lang;
        }
        if let Some(secs) = var("CHUNKSCRIBE_CHUNK_SECONDS").and_then(|v| v.parse().ok()) {
            self.chunk_seconds = secs;
        }
        if let Some(path) = var("CHUNKSCRIBE_CHECKPOINT_DB") {
            self.checkpoint_db = Some(PathBuf::from(path));
        }
        if let Some(flag) = var("CHUNKSCRIBE_RESUME_CHECKPOINT").and_then(|v| parse_flag(&v)) {
            self.resume_checkpoint = flag;
        }
        if let Some(flag) = var("CHUNKSCRIBE_RESET_CHECKPOINT").and_then(|v| parse_flag(&v)) {
            self.reset_checkpoint = flag;
        }
        if let Some(uri) = var("CHUNKSCRIBE_CHECKPOINT_SYNC_URI") {
            self.checkpoint_sync_uri = Some(uri);
        }
        if let Some(policy) = var("CHUNKSCRIBE_PLAN_MISMATCH").and_then(|v| v.parse().ok()) {
            self.plan_mismatch = policy;
        }
        if let Some(flag) = var("CHUNKSCRIBE_STRICT_REASSEMBLY").and_then(|v| parse_flag(&v)) {
            self.strict_reassembly = flag;
        }
        if let Some(n) = var("CHUNKSCRIBE_MAX_CHUNK_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_chunk_attempts = n;
        }
        if let Some(flag) = var("CHUNKSCRIBE_SPOT_DRAIN_ENABLED").and_then(|v| parse_flag(&v)) {
            self.spot_drain_enabled = flag;
        }
        if let Some(secs) = var("CHUNKSCRIBE_SPOT_POLL_INTERVAL").and_then(|v| v.parse().ok()) {
            self.spot_poll_interval_secs = secs;
        }
        if let Some(ms) = var("CHUNKSCRIBE_RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry_base_delay_ms = ms;
        }
        if let Some(url) = var("CHUNKSCRIBE_METADATA_ENDPOINT") {
            self.metadata_endpoint = url;
        }
        if let Some(dir) = var("CHUNKSCRIBE_PUBLISH_DIR") {
            self.publish_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_seconds == 0 {
            return Err(ScribeError::Config(
                "Chunk length must be greater than 0 seconds".to_string(),
            ));
        }

        if self.max_chunk_attempts == 0 {
            return Err(ScribeError::Config(
                "Max chunk attempts must be at least 1".to_string(),
            ));
        }

        if self.spot_drain_enabled && self.spot_poll_interval_secs <= 0.0 {
            return Err(ScribeError::Config(
                "Spot poll interval must be positive when spot draining is enabled".to_string(),
            ));
        }

        if self.provider == Provider::Openai && self.openai_api_key.is_none() {
            return Err(ScribeError::Config(
                "OPENAI_API_KEY not set. Export it with: export OPENAI_API_KEY=sk-...".to_string(),
            ));
        }

        Ok(())
    }

    pub fn spot_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.spot_poll_interval_secs.max(0.0))
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("chunkscribe").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("openai".parse::<Provider>().unwrap(), Provider::Openai);
        assert_eq!("whisper-cpp".parse::<Provider>().unwrap(), Provider::WhisperCpp);
        assert_eq!("OPENAI".parse::<Provider>().unwrap(), Provider::Openai);
        assert!("gemini".parse::<Provider>().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "replan".parse::<PlanMismatchPolicy>().unwrap(),
            PlanMismatchPolicy::Replan
        );
        assert_eq!(PlanMismatchPolicy::default(), PlanMismatchPolicy::Reject);
        assert!("maybe".parse::<PlanMismatchPolicy>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.provider, Provider::Openai);
        assert_eq!(config.chunk_seconds, 600);
        assert!(config.resume_checkpoint);
        assert!(!config.reset_checkpoint);
        assert_eq!(config.max_chunk_attempts, 3);
    }

    #[test]
    fn test_validate_missing_api_key() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = Config {
            provider: Provider::WhisperCpp,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_length() {
        let config = Config {
            openai_api_key: Some("sk-test".to_string()),
            chunk_seconds: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ScribeError::Config(_))));
    }

    #[test]
    fn test_validate_drain_needs_interval() {
        let config = Config {
            openai_api_key: Some("sk-test".to_string()),
            spot_drain_enabled: true,
            spot_poll_interval_secs: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHUNKSCRIBE_CHUNK_SECONDS", "120"),
            ("CHUNKSCRIBE_RESUME_CHECKPOINT", "false"),
            ("CHUNKSCRIBE_PLAN_MISMATCH", "reuse"),
            ("CHUNKSCRIBE_PROVIDER", "whisper-cpp"),
            ("CHUNKSCRIBE_SPOT_POLL_INTERVAL", "2.5"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.chunk_seconds, 120);
        assert!(!config.resume_checkpoint);
        assert_eq!(config.plan_mismatch, PlanMismatchPolicy::Reuse);
        assert_eq!(config.provider, Provider::WhisperCpp);
        assert_eq!(config.spot_poll_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            language = "es"
            chunk_seconds = 300
            plan_mismatch = "replan"
            "#,
        )
        .unwrap();
        assert_eq!(config.language, "es");
        assert_eq!(config.chunk_seconds, 300);
        assert_eq!(config.plan_mismatch, PlanMismatchPolicy::Replan);
        assert_eq!(config.model, "whisper-1");
    }
}
