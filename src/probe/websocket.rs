// src/probe/websocket.rs
use super::{stomp, ProbeContext, ProbeError};
use crate::registry::{Address, StompLogin, WebSocketCheck};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, WebSocketStream};

/// Complete the WebSocket upgrade over an established connection, then run
/// the STOMP login if one is configured. Anything but `101 Switching
/// Protocols` is a protocol error.
pub(crate) async fn upgrade<S>(
    io: S,
    address: &Address,
    check: &WebSocketCheck,
    ctx: &ProbeContext,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let url = request_url(address, check);
    let (mut ws, _response) = ctx
        .run("websocket upgrade", client_async(url.as_str(), io))
        .await?
        .map_err(upgrade_error)?;

    let result = match &check.stomp {
        Some(login) => {
            let vhost = login.host.as_deref().unwrap_or(&address.host);
            stomp_login(&mut ws, vhost, login, ctx).await
        }
        None => Ok(()),
    };

    // best effort; the verdict is already decided
    let _ = ctx.run("websocket close", ws.close(None)).await;
    result
}

fn request_url(address: &Address, check: &WebSocketCheck) -> String {
    let (scheme, default_port) = if check.tls.is_some() {
        ("wss", 443)
    } else {
        ("ws", 80)
    };
    let authority = match &check.host_header {
        Some(host) => host.clone(),
        None if address.port == default_port => address.host.clone(),
        None => address.to_string(),
    };
    format!("{}://{}{}", scheme, authority, check.path)
}

fn upgrade_error(error: WsError) -> ProbeError {
    match error {
        WsError::Http(response) => ProbeError::Protocol(format!(
            "unexpected status {} (expected 101)",
            response.status().as_u16()
        )),
        other => ProbeError::Protocol(format!("websocket upgrade failed: {}", other)),
    }
}

async fn stomp_login<S>(
    ws: &mut WebSocketStream<S>,
    vhost: &str,
    login: &StompLogin,
    ctx: &ProbeContext,
) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = stomp::connect_frame(vhost, login);
    ctx.run("stomp connect", ws.send(Message::Text(frame)))
        .await?
        .map_err(|e| ProbeError::Protocol(format!("failed to send STOMP frame: {}", e)))?;

    loop {
        match ctx.run("stomp connect", ws.next()).await? {
            Some(Ok(Message::Text(text))) => return stomp::expect_connected(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => return stomp::expect_connected(&data),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ProbeError::Protocol(
                    "connection closed before CONNECTED".into(),
                ))
            }
            // control frames
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ProbeError::Protocol(format!("websocket error: {}", e))),
        }
    }
}
