// src/probe/http.rs
use super::{AbortOnDrop, ProbeContext, ProbeError};
use crate::registry::{Address, HttpCheck};
use hyper::body::HttpBody;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Body, Request};
use tokio::io::{AsyncRead, AsyncWrite};

const PROBE_USER_AGENT: &str = concat!("network-monitor/", env!("CARGO_PKG_VERSION"));

/// Bytes of body searched for `body_contains` before giving up.
const MAX_BODY_SCAN: usize = 64 * 1024;

/// Issue the configured request over an established connection and check the
/// answer. A reachable server answering wrongly is a protocol error, not a
/// transport failure.
pub(crate) async fn exchange<S>(
    io: S,
    address: &Address,
    check: &HttpCheck,
    ctx: &ProbeContext,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request = build_request(address, check)?;

    let (mut sender, connection) = ctx
        .run("http handshake", hyper::client::conn::handshake(io))
        .await?
        .map_err(|e| ProbeError::Protocol(format!("HTTP handshake failed: {}", e)))?;

    // The connection task owns the socket; aborting it on any exit path closes it.
    let _connection = AbortOnDrop(tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::trace!(error = %e, "Probe connection closed with error");
        }
    }));

    let response = ctx
        .run("http request", sender.send_request(request))
        .await?
        .map_err(|e| ProbeError::Protocol(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    if status.as_u16() != check.expected_status {
        return Err(ProbeError::Protocol(format!(
            "unexpected status {} (expected {})",
            status.as_u16(),
            check.expected_status
        )));
    }

    if let Some(needle) = &check.body_contains {
        let found = ctx
            .run("http body", body_contains(response.into_body(), needle.as_bytes()))
            .await?
            .map_err(|e| ProbeError::Protocol(format!("failed to read body: {}", e)))?;

        if !found {
            return Err(ProbeError::Protocol(format!(
                "response body does not contain {:?} within {} bytes",
                needle, MAX_BODY_SCAN
            )));
        }
    }

    Ok(())
}

/// Read chunks until `needle` shows up, the body ends, or the scan limit is hit.
async fn body_contains(mut body: Body, needle: &[u8]) -> Result<bool, hyper::Error> {
    let mut seen = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let room = MAX_BODY_SCAN - seen.len();
        seen.extend_from_slice(&chunk[..chunk.len().min(room)]);

        if contains(&seen, needle) {
            return Ok(true);
        }
        if seen.len() >= MAX_BODY_SCAN {
            break;
        }
    }
    Ok(false)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn build_request(address: &Address, check: &HttpCheck) -> Result<Request<Body>, ProbeError> {
    let default_port = if check.tls.is_some() { 443 } else { 80 };
    let host = match &check.host_header {
        Some(host) => host.clone(),
        None if address.port == default_port => address.host.clone(),
        None => address.to_string(),
    };

    Request::builder()
        .method(check.method.clone())
        .uri(check.path.as_str())
        .header(HOST, host)
        .header(USER_AGENT, PROBE_USER_AGENT)
        .body(Body::empty())
        .map_err(|e| ProbeError::Internal(format!("invalid request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Outcome, Prober, TransportProber};
    use crate::registry::{Protocol, Target};
    use hyper::Method;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn http_target(host_with_port: &str, path: &str, expected_status: u16) -> Target {
        let (host, port) = host_with_port.rsplit_once(':').unwrap();
        Target::tcp("web", host, port.parse().unwrap()).with_protocol(Protocol::Http(HttpCheck {
            method: Method::GET,
            path: path.to_string(),
            expected_status,
            host_header: None,
            body_contains: None,
            tls: None,
        }))
    }

    fn set_body_contains(target: &mut Target, needle: &str) {
        if let Protocol::Http(check) = &mut target.protocol {
            check.body_contains = Some(needle.to_string());
        }
    }

    #[tokio::test]
    async fn test_expected_status_is_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let target = http_target(&server.host_with_port(), "/health", 200);
        let ctx = ProbeContext::with_timeout(Duration::from_secs(5));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mismatch_is_protocol_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let target = http_target(&server.host_with_port(), "/health", 200);
        let ctx = ProbeContext::with_timeout(Duration::from_secs(5));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::ProtocolError);
        assert!(result.message.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_body_check() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_body(r#"{"db":"down"}"#)
            .create_async()
            .await;

        let mut target = http_target(&server.host_with_port(), "/status", 200);
        set_body_contains(&mut target, r#""db":"up""#);
        let ctx = ProbeContext::with_timeout(Duration::from_secs(5));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::ProtocolError);
    }

    #[tokio::test]
    async fn test_body_check_finds_needle_in_large_body() {
        let mut server = mockito::Server::new_async().await;
        let body = format!("{}\"db\":\"up\"{}", "x".repeat(1000), "y".repeat(MAX_BODY_SCAN));
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let mut target = http_target(&server.host_with_port(), "/status", 200);
        set_body_contains(&mut target, r#""db":"up""#);
        let ctx = ProbeContext::with_timeout(Duration::from_secs(5));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_body_scan_stops_at_limit() {
        let mut server = mockito::Server::new_async().await;
        let body = format!("{}marker", "x".repeat(MAX_BODY_SCAN));
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let mut target = http_target(&server.host_with_port(), "/status", 200);
        set_body_contains(&mut target, "marker");
        let ctx = ProbeContext::with_timeout(Duration::from_secs(5));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::ProtocolError);
        assert!(result.message.unwrap().contains("65536 bytes"));
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"status: ok", b"ok"));
        assert!(!contains(b"status: o", b"ok"));
        assert!(contains(b"anything", b""));
    }

    #[tokio::test]
    async fn test_unresponsive_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // swallow the request, never answer, report when the client hangs up
            loop {
                socket.readable().await.unwrap();
                match socket.try_read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => break,
                }
            }
            let _ = closed_tx.send(());
        });

        let target = http_target(&addr.to_string(), "/", 200);
        let ctx = ProbeContext::with_timeout(Duration::from_millis(300));
        let result = TransportProber::new().probe(&target, &ctx).await;

        assert_eq!(result.outcome, Outcome::Timeout);
        // the probe released its socket
        tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .expect("connection was not released")
            .unwrap();
    }

    #[test]
    fn test_host_header_omits_default_port() {
        let check = HttpCheck {
            method: Method::HEAD,
            path: "/".into(),
            expected_status: 200,
            host_header: None,
            body_contains: None,
            tls: None,
        };
        let default_port = Address {
            host: "example.com".into(),
            port: 80,
        };
        let other_port = Address {
            host: "example.com".into(),
            port: 8080,
        };

        let request = build_request(&default_port, &check).unwrap();
        assert_eq!(request.headers()[HOST], "example.com");
        assert_eq!(request.method(), Method::HEAD);

        let request = build_request(&other_port, &check).unwrap();
        assert_eq!(request.headers()[HOST], "example.com:8080");
    }
}
