// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "NETMON";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Load configuration from a file (YAML or JSON), then apply `NETMON__SETTINGS__*`
/// environment overrides.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let mut config = parse_config(&contents, ConfigFormat::from_path(path))?;

    let overrides = env_overrides().context("Failed to read environment overrides")?;
    overrides.apply(&mut config.settings);

    config.validate()?;
    Ok(config)
}

/// Parse and validate configuration text without touching the environment.
pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config> {
    let config: Config = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        }
        ConfigFormat::Json => {
            serde_json::from_str(contents).context("Failed to parse JSON config")?
        }
    };

    config.validate()?;
    Ok(config)
}

#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    settings: SettingsOverrides,
}

fn env_overrides() -> Result<SettingsOverrides> {
    let source = ::config::Config::builder()
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let overrides: EnvOverrides = source.try_deserialize()?;
    Ok(overrides.settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
settings:
  max_concurrency: 8
  failure_threshold: 2
targets:
  - id: ssh
    host: 10.0.0.1
    port: 22
    protocol: tcp
    interval_secs: 10
    timeout_ms: 2000
  - id: api
    url: https://api.example.com:8443/healthz
    protocol: http
    http:
      expected_status: 204
  - id: feed
    url: wss://feed.example.com/network-events
    protocol: websocket
    websocket:
      stomp:
        login: monitor
        passcode: secret
"#;

    #[test]
    fn test_parse_yaml() {
        let config = parse_config(YAML, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.settings.max_concurrency, 8);
        assert_eq!(config.settings.failure_threshold, 2);
        assert_eq!(config.settings.backoff_cap, Settings::default().backoff_cap);
        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.targets[0].protocol, ProtocolKind::Tcp);
        assert_eq!(config.targets[1].http.as_ref().unwrap().expected_status, 204);
        assert_eq!(config.targets[1].http.as_ref().unwrap().method, "GET");
        assert_eq!(config.targets[2].protocol, ProtocolKind::WebSocket);
        let stomp = config.targets[2].websocket.as_ref().unwrap().stomp.as_ref().unwrap();
        assert_eq!(stomp.login.as_deref(), Some("monitor"));
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "targets": [
                { "id": "db", "host": "db.internal", "port": 5432, "protocol": "tcp" }
            ]
        }"#;

        let config = parse_config(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.targets[0].interval_secs, 30);
        assert_eq!(config.targets[0].timeout_ms, 5_000);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
    }

    #[test]
    fn test_missing_targets_rejected() {
        assert!(parse_config("settings: {}", ConfigFormat::Yaml).is_err());
    }
}
