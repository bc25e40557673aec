// src/probe/result.rs
use crate::registry::TargetId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Timeout,
    ConnectionRefused,
    DnsFailure,
    TlsHandshakeFailure,
    CertificateInvalid,
    /// Reachable but unhealthy: wrong status, unexpected body, broken HTTP.
    ProtocolError,
    /// The probe never ran this cycle (resource exhaustion or a crashed probe task).
    Skipped,
    Cancelled,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    /// Outcomes that count toward the consecutive-failure threshold.
    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            Outcome::Success | Outcome::Skipped | Outcome::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionRefused => "connection_refused",
            Outcome::DnsFailure => "dns_failure",
            Outcome::TlsHandshakeFailure => "tls_handshake_failure",
            Outcome::CertificateInvalid => "certificate_invalid",
            Outcome::ProtocolError => "protocol_error",
            Outcome::Skipped => "skipped",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe. Produced once, handed to the state store, then dropped.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub target_id: TargetId,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    /// Only set on success.
    pub latency: Option<Duration>,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn success(target_id: impl Into<TargetId>, latency: Duration) -> Self {
        Self {
            target_id: target_id.into(),
            timestamp: Utc::now(),
            outcome: Outcome::Success,
            latency: Some(latency),
            message: None,
        }
    }

    pub fn failure(
        target_id: impl Into<TargetId>,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Self {
        debug_assert!(!outcome.is_success());
        Self {
            target_id: target_id.into(),
            timestamp: Utc::now(),
            outcome,
            latency: None,
            message: Some(message.into()),
        }
    }

    pub fn skipped(target_id: impl Into<TargetId>, reason: impl Into<String>) -> Self {
        Self::failure(target_id, Outcome::Skipped, reason)
    }

    pub fn cancelled(target_id: impl Into<TargetId>) -> Self {
        Self {
            target_id: target_id.into(),
            timestamp: Utc::now(),
            outcome: Outcome::Cancelled,
            latency: None,
            message: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
