// src/config/models.rs
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no targets configured")]
    NoTargets,

    #[error("duplicate target id: {0}")]
    DuplicateTarget(String),

    #[error("target {id}: {reason}")]
    InvalidTarget { id: String, reason: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl ConfigError {
    pub fn target(id: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidTarget {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;

        // start() reports this as resource exhaustion; a config file gets a plain error
        if self.settings.max_concurrency == 0 {
            return Err(ConfigError::InvalidSettings(
                "max_concurrency must be at least 1".into(),
            ));
        }

        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.id.clone()));
            }
            target.validate()?;
        }

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(ConfigError::InvalidSettings(format!(
                "metrics path must start with '/': {}",
                self.metrics.path
            )));
        }

        Ok(())
    }
}

/// Global engine settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrency: usize,
    /// Consecutive failures before a target is reported Down.
    pub failure_threshold: u32,
    pub backoff_factor: u32,
    /// Largest backoff multiplier applied to a target's base interval.
    pub backoff_cap: u32,
    pub max_interval_secs: u64,
    pub latency_window: usize,
    /// Probes allowed to wait for a concurrency slot before new dispatches are
    /// skipped. Zero disables the queue: a probe runs only if a slot is free.
    pub max_pending: usize,
    pub drain_timeout_ms: u64,
    pub grace_ms: u64,
    pub jitter_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            failure_threshold: 3,
            backoff_factor: 2,
            backoff_cap: 8,
            max_interval_secs: 300,
            latency_window: 32,
            max_pending: 1024,
            drain_timeout_ms: 5_000,
            grace_ms: 500,
            jitter_ms: 0,
        }
    }
}

impl Settings {
    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidSettings(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.backoff_factor == 0 || self.backoff_cap == 0 {
            return Err(ConfigError::InvalidSettings(
                "backoff_factor and backoff_cap must be at least 1".into(),
            ));
        }
        if self.latency_window == 0 {
            return Err(ConfigError::InvalidSettings(
                "latency_window must be at least 1".into(),
            ));
        }
        if self.max_interval_secs == 0 {
            return Err(ConfigError::InvalidSettings(
                "max_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Environment overrides for [`Settings`]; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsOverrides {
    pub max_concurrency: Option<usize>,
    pub failure_threshold: Option<u32>,
    pub backoff_factor: Option<u32>,
    pub backoff_cap: Option<u32>,
    pub max_interval_secs: Option<u64>,
    pub latency_window: Option<usize>,
    pub max_pending: Option<usize>,
    pub drain_timeout_ms: Option<u64>,
    pub grace_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

impl SettingsOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        macro_rules! merge {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field {
                    settings.$field = value;
                })*
            };
        }
        merge!(
            max_concurrency,
            failure_threshold,
            backoff_factor,
            backoff_cap,
            max_interval_secs,
            latency_window,
            max_pending,
            drain_timeout_ms,
            grace_ms,
            jitter_ms
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_report_interval(),
        }
    }
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_report_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Tcp,
    Tls,
    Http,
    WebSocket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Shorthand for HTTP and WebSocket targets: fills host, port, path and
    /// TLS from the URL.
    #[serde(default)]
    pub url: Option<Url>,
    pub protocol: ProtocolKind,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub websocket: Option<WebSocketConfig>,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl TargetConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::target(&self.id, "id must not be empty"));
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::target(&self.id, "interval_secs must be positive"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::target(&self.id, "timeout_ms must be positive"));
        }
        if self.url.is_some()
            && !matches!(self.protocol, ProtocolKind::Http | ProtocolKind::WebSocket)
        {
            return Err(ConfigError::target(
                &self.id,
                "url is only valid for http and websocket targets",
            ));
        }
        if self.url.is_none() && (self.host.is_none() || self.port.is_none()) {
            return Err(ConfigError::target(&self.id, "host and port are required"));
        }
        if self.http.is_some() && self.protocol != ProtocolKind::Http {
            return Err(ConfigError::target(
                &self.id,
                "http options are only valid for http targets",
            ));
        }
        if self.websocket.is_some() && self.protocol != ProtocolKind::WebSocket {
            return Err(ConfigError::target(
                &self.id,
                "websocket options are only valid for websocket targets",
            ));
        }
        if self.tls.is_some() && self.protocol == ProtocolKind::Tcp {
            return Err(ConfigError::target(
                &self.id,
                "tls options are not valid for tcp targets",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Hex SHA-256 of the leaf certificate (DER).
    #[serde(default)]
    pub pinned_sha256: Option<String>,
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub host_header: Option<String>,
    #[serde(default)]
    pub body_contains: Option<String>,
    /// Speak HTTPS. Implied by an `https` URL.
    #[serde(default)]
    pub tls: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            path: default_path(),
            expected_status: default_expected_status(),
            host_header: None,
            body_contains: None,
            tls: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub host_header: Option<String>,
    /// Speak `wss`. Implied by a `wss` URL.
    #[serde(default)]
    pub tls: bool,
    /// After the upgrade, log in over STOMP and expect CONNECTED.
    #[serde(default)]
    pub stomp: Option<StompConfig>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            host_header: None,
            tls: false,
            stomp: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StompConfig {
    /// Virtual host sent in the `host` header; defaults to the target host.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub passcode: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_target(id: &str) -> TargetConfig {
        TargetConfig {
            id: id.to_string(),
            host: Some("127.0.0.1".into()),
            port: Some(22),
            url: None,
            protocol: ProtocolKind::Tcp,
            interval_secs: 10,
            timeout_ms: 2_000,
            tls: None,
            http: None,
            websocket: None,
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = Config {
            settings: Settings::default(),
            metrics: MetricsConfig::default(),
            report: ReportConfig::default(),
            targets: vec![tcp_target("a"), tcp_target("a")],
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateTarget(id)) if id == "a"
        ));
    }

    #[test]
    fn test_http_options_on_tcp_target_rejected() {
        let mut target = tcp_target("a");
        target.http = Some(HttpConfig::default());
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_websocket_options_on_http_target_rejected() {
        let mut target = tcp_target("a");
        target.protocol = ProtocolKind::Http;
        target.websocket = Some(WebSocketConfig::default());
        assert!(target.validate().is_err());

        target.protocol = ProtocolKind::WebSocket;
        assert!(target.validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let settings = Settings {
            failure_threshold: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected_in_config() {
        let config = Config {
            settings: Settings {
                max_concurrency: 0,
                ..Settings::default()
            },
            metrics: MetricsConfig::default(),
            report: ReportConfig::default(),
            targets: vec![tcp_target("a")],
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSettings(_))
        ));
        assert!(config.settings.validate().is_ok());
    }

    #[test]
    fn test_overrides_only_touch_set_fields() {
        let mut settings = Settings::default();
        let overrides = SettingsOverrides {
            max_concurrency: Some(4),
            jitter_ms: Some(250),
            ..SettingsOverrides::default()
        };

        overrides.apply(&mut settings);

        assert_eq!(settings.max_concurrency, 4);
        assert_eq!(settings.jitter_ms, 250);
        assert_eq!(settings.failure_threshold, Settings::default().failure_threshold);
    }
}
