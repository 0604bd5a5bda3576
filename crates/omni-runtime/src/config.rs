use std::path::{Path, PathBuf};

use omni_sandbox::{BackendKind, SandboxConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "omninexus.toml";
const ENV_PREFIX: &str = "OMNINEXUS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStoreKind {
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub file_store: FileStoreKind,
    pub file_store_path: PathBuf,
    pub sandbox: SandboxConfig,
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            file_store: FileStoreKind::Local,
            file_store_path: PathBuf::from(".omninexus/store"),
            sandbox: SandboxConfig::default(),
            runtime: RuntimeConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// In-sandbox plugins to bootstrap: `jupyter`, `vscode`.
    pub plugins: Vec<String>,
    /// Host environment variables with this prefix are exported into the
    /// sandbox, prefix stripped.
    pub env_prefix: String,
    pub plugin_ready_timeout_secs: u64,
    pub plugin_poll_interval_ms: u64,
    /// Repository-relative directory holding microagent documents.
    pub microagent_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            env_prefix: "SANDBOX_ENV_".to_owned(),
            plugin_ready_timeout_secs: 120,
            plugin_poll_interval_ms: 1000,
            microagent_prefix: ".omninexus/microagents".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Reject attach from users with no stored settings.
    pub require_settings: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_owned(),
            require_settings: false,
        }
    }
}

/// Loads configuration from `path`, or from `omninexus.toml` in the working
/// directory when present, then applies `OMNINEXUS_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let candidate = match path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        }
    };
    let text = match &candidate {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.clone(),
            message: err.to_string(),
        })?),
        None => None,
    };
    debug!(path = ?candidate, "loading configuration");
    load_config_from_sources(text.as_deref(), |key| std::env::var(key).ok())
}

/// Precedence: environment > file > defaults.
pub fn load_config_from_sources(
    text: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, ConfigError> {
    let mut config: AppConfig = match text {
        Some(text) => toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?,
        None => AppConfig::default(),
    };
    let var = |name: &str| {
        env(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
    };

    if let Some(value) = var("SANDBOX_BACKEND") {
        config.sandbox.backend = BackendKind::parse(&value).ok_or_else(|| ConfigError::Invalid {
            key: "OMNINEXUS_SANDBOX_BACKEND".into(),
            message: format!("unknown backend `{value}`"),
        })?;
    }
    if let Some(value) = var("SANDBOX_TIMEOUT") {
        config.sandbox.timeout_secs = value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: "OMNINEXUS_SANDBOX_TIMEOUT".into(),
            message: format!("`{value}` is not a number of seconds"),
        })?;
    }
    if let Some(value) = var("FILE_STORE") {
        config.file_store = match value.trim().to_ascii_lowercase().as_str() {
            "local" => FileStoreKind::Local,
            "memory" => FileStoreKind::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "OMNINEXUS_FILE_STORE".into(),
                    message: format!("unknown file store `{other}`"),
                });
            }
        };
    }
    if let Some(value) = var("FILE_STORE_PATH") {
        config.file_store_path = PathBuf::from(value);
    }
    if let Some(value) = var("LISTEN") {
        config.server.listen = value;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = load_config_from_sources(None, env_of(&[])).expect("defaults load");
        assert_eq!(config.sandbox.backend, BackendKind::Local);
        assert_eq!(config.sandbox.timeout_secs, 120);
        assert_eq!(config.runtime.env_prefix, "SANDBOX_ENV_");
        assert_eq!(config.file_store, FileStoreKind::Local);
    }

    #[test]
    fn file_values_fill_sections() {
        let text = r#"
            file_store = "memory"

            [sandbox]
            backend = "docker"
            timeout_secs = 30

            [sandbox.docker]
            enable_gpu = true

            [runtime]
            plugins = ["jupyter"]

            [server]
            require_settings = true
        "#;
        let config = load_config_from_sources(Some(text), env_of(&[])).expect("file loads");
        assert_eq!(config.file_store, FileStoreKind::Memory);
        assert_eq!(config.sandbox.backend, BackendKind::Docker);
        assert_eq!(config.sandbox.timeout_secs, 30);
        assert!(config.sandbox.docker.enable_gpu);
        assert_eq!(config.sandbox.docker.port_range_start, 30000);
        assert_eq!(config.runtime.plugins, vec!["jupyter".to_owned()]);
        assert!(config.server.require_settings);
    }

    #[test]
    fn environment_overrides_file() {
        let text = "[sandbox]\nbackend = \"docker\"\ntimeout_secs = 30\n";
        let env = env_of(&[
            ("OMNINEXUS_SANDBOX_BACKEND", "remote"),
            ("OMNINEXUS_SANDBOX_TIMEOUT", "45"),
            ("OMNINEXUS_LISTEN", "0.0.0.0:8080"),
        ]);
        let config = load_config_from_sources(Some(text), env).expect("overrides apply");
        assert_eq!(config.sandbox.backend, BackendKind::Remote);
        assert_eq!(config.sandbox.timeout_secs, 45);
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn example_config_parses() {
        let text = include_str!("../../../omninexus.toml.example");
        let config = load_config_from_sources(Some(text), env_of(&[])).expect("example parses");
        assert_eq!(config.runtime.plugins, vec!["jupyter".to_owned()]);
        let lang = config.sandbox.runtime_startup_env_vars.get("LANG");
        assert_eq!(lang.map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn bad_values_are_rejected() {
        let env = env_of(&[("OMNINEXUS_SANDBOX_TIMEOUT", "soon")]);
        let err = load_config_from_sources(None, env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = load_config_from_sources(Some("sandbox = 3"), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
