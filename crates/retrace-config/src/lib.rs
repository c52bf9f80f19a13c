use retrace_engine::ReplaySettings;
use retrace_monitor::CaptureConfig;
use retrace_shadow::ShadowSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const ENV_BASE_PATH: &str = "RETRACE_BASE_PATH";
pub const ENV_ADDR: &str = "RETRACE_ADDR";
pub const ENV_INDEX: &str = "RETRACE_INDEX";

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the trace store; traces live under `{base_path}/traces`.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    /// Maintain a SQLite metadata index next to the trace files.
    #[serde(default)]
    pub index: bool,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            index: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

fn default_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetraceConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub shadow: ShadowSettings,
    #[serde(default)]
    pub server: ServerConfig,
}

impl RetraceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise defaults, then overlays the environment.
    pub fn from_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `RETRACE_*` variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup(ENV_BASE_PATH).filter(|v| !v.is_empty()) {
            self.store.base_path = PathBuf::from(base);
        }
        if let Some(addr) = lookup(ENV_ADDR).filter(|v| !v.is_empty()) {
            self.server.addr = addr;
        }
        if let Some(index) = lookup(ENV_INDEX) {
            self.store.index = match index.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be a boolean, got {:?}",
                        ENV_INDEX, other
                    )))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.base_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("store.base_path is empty".into()));
        }
        self.server
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("server.addr {:?}: {}", self.server.addr, e)))?;

        let shadow = &self.shadow;
        for (name, rate) in [
            ("shadow.min_success_rate", shadow.min_success_rate),
            ("shadow.max_divergence_rate", shadow.max_divergence_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!("{} must be within [0, 1], got {}", name, rate)));
            }
        }
        if shadow.max_traces == 0 {
            return Err(ConfigError::Invalid("shadow.max_traces must be positive".into()));
        }
        if shadow.concurrency == 0 {
            return Err(ConfigError::Invalid("shadow.concurrency must be positive".into()));
        }
        if shadow.per_trace_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shadow.per_trace_timeout_ms must be positive".into()));
        }
        if self.replay.max_divergence_depth == Some(0) {
            return Err(ConfigError::Invalid("replay.max_divergence_depth must be positive".into()));
        }
        if self.capture.max_payload_bytes == Some(0) {
            return Err(ConfigError::Invalid("capture.max_payload_bytes must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_engine::MissPolicy;
    use std::collections::HashMap;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: RetraceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RetraceConfig::default());
        assert_eq!(config.store.base_path, PathBuf::from("data"));
        assert_eq!(config.replay.miss_policy, MissPolicy::Abort);
        assert_eq!(config.shadow.min_traces, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retrace.json");
        fs::write(
            &path,
            r#"{
                "store": {"base_path": "/var/lib/retrace", "index": true},
                "replay": {"miss_policy": "substitute"},
                "shadow": {"min_traces": 3}
            }"#,
        )
        .unwrap();

        let config = RetraceConfig::load(&path).unwrap();
        assert!(config.store.index);
        assert_eq!(config.replay.miss_policy, MissPolicy::Substitute);
        assert!(config.replay.compare_paths);
        assert_eq!(config.shadow.min_traces, 3);
        assert_eq!(config.shadow.max_traces, 50);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RetraceConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(RetraceConfig::load(&path), Err(ConfigError::Parse(_))));

        fs::write(&path, r#"{"shadow": {"min_success_rate": 1.5}}"#).unwrap();
        assert!(matches!(RetraceConfig::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_BASE_PATH, "/tmp/traces"),
            (ENV_ADDR, "127.0.0.1:9000"),
            (ENV_INDEX, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RetraceConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.base_path, PathBuf::from("/tmp/traces"));
        assert_eq!(config.server.addr, "127.0.0.1:9000");
        assert!(config.store.index);

        let err = config.apply_env(|key| (key == ENV_INDEX).then(|| "maybe".to_string()));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_max_divergence_depth_setting() {
        let config: RetraceConfig =
            serde_json::from_str(r#"{"replay": {"max_divergence_depth": 3}}"#).unwrap();
        assert_eq!(config.replay.max_divergence_depth, Some(3));
        assert!(config.validate().is_ok());

        let zero: RetraceConfig =
            serde_json::from_str(r#"{"replay": {"max_divergence_depth": 0}}"#).unwrap();
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_addr() {
        let mut config = RetraceConfig::default();
        config.server.addr = "not-an-addr".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
