// src/probe/mod.rs
//! Transport probes.
//!
//! A probe opens one connection, runs one check and always produces a
//! [`ProbeResult`]. Failures are data, never errors crossing the boundary.
//! Every I/O phase goes through [`ProbeContext::run`], which races it against
//! the probe deadline and the shutdown signal; dropping the phase future is
//! what releases the socket.

mod http;
mod result;
mod stomp;
mod tcp;
mod tls;
mod websocket;

pub use result::{Outcome, ProbeResult};
pub use tls::TlsConnectors;

use crate::registry::{Protocol, Target};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("certificate rejected: {0}")]
    Certificate(String),
    #[error("{0}")]
    Protocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ProbeError::Timeout(_) => Outcome::Timeout,
            ProbeError::Cancelled => Outcome::Cancelled,
            ProbeError::Dns(_) => Outcome::DnsFailure,
            ProbeError::Connect(_) => Outcome::ConnectionRefused,
            ProbeError::Handshake(_) => Outcome::TlsHandshakeFailure,
            ProbeError::Certificate(_) => Outcome::CertificateInvalid,
            ProbeError::Protocol(_) => Outcome::ProtocolError,
            ProbeError::Internal(_) => Outcome::Skipped,
        }
    }
}

impl ProbeResult {
    pub fn from_error(target_id: impl Into<String>, error: ProbeError) -> Self {
        match error {
            ProbeError::Cancelled => ProbeResult::cancelled(target_id),
            other => ProbeResult::failure(target_id, other.outcome(), other.to_string()),
        }
    }
}

/// Deadline and cancellation signal shared by every I/O call of one probe.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl ProbeContext {
    pub fn new(deadline: Instant, cancel: watch::Receiver<bool>) -> Self {
        Self { deadline, cancel }
    }

    /// A context that can only time out.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(Instant::now() + timeout, rx)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run one I/O phase under the deadline and the cancellation signal.
    pub async fn run<F>(&self, phase: &'static str, fut: F) -> Result<F::Output, ProbeError>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancelled(self.cancel.clone()) => Err(ProbeError::Cancelled),
            output = tokio::time::timeout_at(self.deadline, fut) => {
                output.map_err(|_| ProbeError::Timeout(phase))
            }
        }
    }
}

/// Resolves once the flag flips to `true`. Never resolves if the sender is gone.
pub(crate) async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one check against one target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target, ctx: &ProbeContext) -> ProbeResult;
}

/// Production prober: TCP connect, TLS handshake, HTTP(S) request or
/// WebSocket upgrade.
#[derive(Default)]
pub struct TransportProber {
    connectors: TlsConnectors,
}

impl TransportProber {
    pub fn new() -> Self {
        Self::default()
    }

    async fn check(&self, target: &Target, ctx: &ProbeContext) -> Result<(), ProbeError> {
        match &target.protocol {
            Protocol::Tcp => {
                let stream = tcp::connect(&target.address, ctx).await?;
                drop(stream);
                Ok(())
            }
            Protocol::Tls(policy) => {
                let stream = tcp::connect(&target.address, ctx).await?;
                let connector = self.connectors.get(policy)?;
                let tls = tls::handshake(&connector, stream, &target.address, policy, ctx).await?;
                drop(tls);
                Ok(())
            }
            Protocol::Http(check) => {
                let stream = tcp::connect(&target.address, ctx).await?;
                match &check.tls {
                    Some(policy) => {
                        let connector = self.connectors.get(policy)?;
                        let tls =
                            tls::handshake(&connector, stream, &target.address, policy, ctx).await?;
                        http::exchange(tls, &target.address, check, ctx).await
                    }
                    None => http::exchange(stream, &target.address, check, ctx).await,
                }
            }
            Protocol::WebSocket(check) => {
                let stream = tcp::connect(&target.address, ctx).await?;
                match &check.tls {
                    Some(policy) => {
                        let connector = self.connectors.get(policy)?;
                        let tls =
                            tls::handshake(&connector, stream, &target.address, policy, ctx).await?;
                        websocket::upgrade(tls, &target.address, check, ctx).await
                    }
                    None => websocket::upgrade(stream, &target.address, check, ctx).await,
                }
            }
        }
    }
}

#[async_trait]
impl Prober for TransportProber {
    async fn probe(&self, target: &Target, ctx: &ProbeContext) -> ProbeResult {
        let span = tracing::debug_span!(
            "probe",
            target = %target.id,
            kind = target.protocol.kind(),
            probe_id = %Uuid::new_v4(),
        );

        async {
            let started = Instant::now();
            let result = match self.check(target, ctx).await {
                Ok(()) => ProbeResult::success(target.id.clone(), started.elapsed()),
                Err(e) => ProbeResult::from_error(target.id.clone(), e),
            };
            tracing::debug!(outcome = %result.outcome, latency = ?result.latency, "Probe finished");
            result
        }
        .instrument(span)
        .await
    }
}
