// src/registry/target.rs
use crate::config::{
    ConfigError, HttpConfig, ProtocolKind, StompConfig, TargetConfig, TlsConfig, WebSocketConfig,
};
use hyper::Method;
use std::fmt;
use std::time::Duration;

pub type TargetId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How a TLS peer is verified.
///
/// A pin replaces chain verification: the handshake accepts any chain and the
/// leaf certificate digest must match instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsPolicy {
    pub server_name: Option<String>,
    pub ca_cert_pem: Option<Vec<u8>>,
    pub pinned_sha256: Option<[u8; 32]>,
    pub skip_verify: bool,
}

impl TlsPolicy {
    pub fn accepts_invalid_chain(&self) -> bool {
        self.skip_verify || self.pinned_sha256.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCheck {
    pub method: Method,
    pub path: String,
    pub expected_status: u16,
    pub host_header: Option<String>,
    pub body_contains: Option<String>,
    pub tls: Option<TlsPolicy>,
}

/// WebSocket upgrade, optionally followed by a STOMP login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketCheck {
    pub path: String,
    pub host_header: Option<String>,
    pub stomp: Option<StompLogin>,
    pub tls: Option<TlsPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StompLogin {
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
}

impl From<&StompConfig> for StompLogin {
    fn from(config: &StompConfig) -> Self {
        Self {
            host: config.host.clone(),
            login: config.login.clone(),
            passcode: config.passcode.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Tls(TlsPolicy),
    Http(HttpCheck),
    WebSocket(WebSocketCheck),
}

impl Protocol {
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls(_) => "tls",
            Protocol::Http(check) if check.tls.is_some() => "https",
            Protocol::Http(_) => "http",
            Protocol::WebSocket(check) if check.tls.is_some() => "wss",
            Protocol::WebSocket(_) => "ws",
        }
    }
}

/// A monitored endpoint. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub address: Address,
    pub protocol: Protocol,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Target {
    pub fn tcp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: Address {
                host: host.into(),
                port,
            },
            protocol: Protocol::Tcp,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a runtime target from its config entry. Reads the CA file, if any.
    pub fn from_config(config: &TargetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = config.id.as_str();

        let (address, url_path, url_tls) = match &config.url {
            Some(url) => {
                let host = url
                    .host_str()
                    .ok_or_else(|| ConfigError::target(id, "url has no host"))?
                    .trim_matches(|c| c == '[' || c == ']')
                    .to_string();
                let port = url
                    .port_or_known_default()
                    .ok_or_else(|| ConfigError::target(id, "url has no port"))?;
                let tls = match (config.protocol, url.scheme()) {
                    (ProtocolKind::Http, "https") | (ProtocolKind::WebSocket, "wss") => true,
                    (ProtocolKind::Http, "http") | (ProtocolKind::WebSocket, "ws") => false,
                    (_, other) => {
                        return Err(ConfigError::target(
                            id,
                            format!("unsupported url scheme: {}", other),
                        ))
                    }
                };
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                (Address { host, port }, Some(path), tls)
            }
            None => {
                // validate() guarantees both are present without a url
                let host = config.host.clone().unwrap_or_default();
                let port = config.port.unwrap_or_default();
                (Address { host, port }, None, false)
            }
        };

        let protocol = match config.protocol {
            ProtocolKind::Tcp => Protocol::Tcp,
            ProtocolKind::Tls => Protocol::Tls(tls_policy(id, config.tls.as_ref())?),
            ProtocolKind::Http => {
                let http = config.http.clone().unwrap_or_default();
                let use_tls = http.tls || url_tls || config.tls.is_some();
                let tls = if use_tls {
                    Some(tls_policy(id, config.tls.as_ref())?)
                } else {
                    None
                };
                Protocol::Http(http_check(id, &http, url_path, tls)?)
            }
            ProtocolKind::WebSocket => {
                let ws = config.websocket.clone().unwrap_or_default();
                let use_tls = ws.tls || url_tls || config.tls.is_some();
                let tls = if use_tls {
                    Some(tls_policy(id, config.tls.as_ref())?)
                } else {
                    None
                };
                Protocol::WebSocket(websocket_check(id, &ws, url_path, tls)?)
            }
        };

        Ok(Self {
            id: config.id.clone(),
            address,
            protocol,
            interval: config.interval(),
            timeout: config.timeout(),
        })
    }
}

fn tls_policy(id: &str, config: Option<&TlsConfig>) -> Result<TlsPolicy, ConfigError> {
    let config = match config {
        Some(config) => config,
        None => return Ok(TlsPolicy::default()),
    };

    let ca_cert_pem = match &config.ca_cert_path {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            ConfigError::target(id, format!("failed to read CA file {}: {}", path, e))
        })?),
        None => None,
    };

    let pinned_sha256 = match &config.pinned_sha256 {
        Some(hex) => Some(parse_sha256(hex).ok_or_else(|| {
            ConfigError::target(id, "pinned_sha256 must be 64 hex digits")
        })?),
        None => None,
    };

    Ok(TlsPolicy {
        server_name: config.server_name.clone(),
        ca_cert_pem,
        pinned_sha256,
        skip_verify: config.skip_verify,
    })
}

fn http_check(
    id: &str,
    config: &HttpConfig,
    url_path: Option<String>,
    tls: Option<TlsPolicy>,
) -> Result<HttpCheck, ConfigError> {
    let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| ConfigError::target(id, format!("invalid method: {}", config.method)))?;

    if !(100..=599).contains(&config.expected_status) {
        return Err(ConfigError::target(
            id,
            format!("invalid expected_status: {}", config.expected_status),
        ));
    }

    // an explicit non-default path wins over the url's
    let path = match url_path {
        Some(path) if config.path == "/" => path,
        _ => config.path.clone(),
    };
    if !path.starts_with('/') {
        return Err(ConfigError::target(id, "http path must start with '/'"));
    }

    Ok(HttpCheck {
        method,
        path,
        expected_status: config.expected_status,
        host_header: config.host_header.clone(),
        body_contains: config.body_contains.clone(),
        tls,
    })
}

fn websocket_check(
    id: &str,
    config: &WebSocketConfig,
    url_path: Option<String>,
    tls: Option<TlsPolicy>,
) -> Result<WebSocketCheck, ConfigError> {
    let path = match url_path {
        Some(path) if config.path == "/" => path,
        _ => config.path.clone(),
    };
    if !path.starts_with('/') {
        return Err(ConfigError::target(id, "websocket path must start with '/'"));
    }

    Ok(WebSocketCheck {
        path,
        host_header: config.host_header.clone(),
        stomp: config.stomp.as_ref().map(StompLogin::from),
        tls,
    })
}

/// Parse a hex SHA-256 digest, tolerating `:` separators as printed by openssl.
pub fn parse_sha256(hex: &str) -> Option<[u8; 32]> {
    let digits: Vec<u8> = hex.bytes().filter(|b| *b != b':').collect();
    if digits.len() != 64 {
        return None;
    }

    let mut out = [0u8; 32];
    for (i, pair) in digits.chunks(2).enumerate() {
        let pair = std::str::from_utf8(pair).ok()?;
        out[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(out)
}
