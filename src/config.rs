use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty document deserializes via field defaults")
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub sentry_dsn_env: Option<String>,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            sentry_dsn_env: None,
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "local".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

/// Dial-in parameters for the embedded message bus. The bus itself
/// (streams, consumers, the `sessions` KV bucket) is a collaborator; this
/// struct is only the connection address and file-backing root.
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            store_dir: default_store_dir(),
        }
    }
}

fn default_broker_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./store/js")
}

#[derive(Debug, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_scripts_root")]
    pub root: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            root: default_scripts_root(),
        }
    }
}

fn default_scripts_root() -> PathBuf {
    PathBuf::from("./scripts")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse switchboard.toml")?;
        Ok(config)
    }

    /// Load from `path` if present, otherwise fall back to defaults — the
    /// CLI should be usable with zero configuration.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn sentry_dsn(&self) -> String {
        self.server
            .sentry_dsn_env
            .as_ref()
            .and_then(|env_key| std::env::var(env_key).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_minimal_config() {
        let config = parse("");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.environment, "local");
        assert_eq!(config.broker.url, "nats://127.0.0.1:4222");
        assert_eq!(config.scripts.root, PathBuf::from("./scripts"));
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            [server]
            port = 9090
            environment = "production"
            sentry_dsn_env = "MY_SENTRY"
            data_dir = "/tmp/switchboard-data"

            [broker]
            url = "nats://broker.internal:4222"
            store_dir = "/tmp/store"

            [scripts]
            root = "/tmp/scripts"
        "#,
        );
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.environment, "production");
        assert_eq!(config.broker.url, "nats://broker.internal:4222");
        assert_eq!(config.broker.store_dir, PathBuf::from("/tmp/store"));
        assert_eq!(config.scripts.root, PathBuf::from("/tmp/scripts"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let result: std::result::Result<Config, _> = toml::from_str("not valid toml {{{}}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_sentry_dsn_reads_named_env_var() {
        // SAFETY: test-local env var name, not touched elsewhere.
        unsafe {
            std::env::set_var("SWITCHBOARD_TEST_SENTRY", "https://example.test/dsn");
        }
        let config = parse(
            r#"
            [server]
            sentry_dsn_env = "SWITCHBOARD_TEST_SENTRY"
        "#,
        );
        assert_eq!(config.sentry_dsn(), "https://example.test/dsn");
        unsafe {
            std::env::remove_var("SWITCHBOARD_TEST_SENTRY");
        }
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/switchboard.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
