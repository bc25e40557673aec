// src/probe/tcp.rs
use super::{ProbeContext, ProbeError};
use crate::registry::Address;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;

/// Resolve the target host. Literal IPs skip the resolver.
pub(crate) async fn resolve(address: &Address, ctx: &ProbeContext) -> Result<Vec<SocketAddr>, ProbeError> {
    if let Ok(ip) = address.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, address.port)]);
    }

    let addrs: Vec<SocketAddr> = ctx
        .run(
            "resolve",
            tokio::net::lookup_host((address.host.as_str(), address.port)),
        )
        .await?
        .map_err(|e| ProbeError::Dns(format!("{}: {}", address.host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Dns(format!("no addresses found for {}", address.host)));
    }
    Ok(addrs)
}

/// Connect to the first resolved address that accepts, in resolver order.
pub(crate) async fn connect(address: &Address, ctx: &ProbeContext) -> Result<TcpStream, ProbeError> {
    let addrs = resolve(address, ctx).await?;

    let mut last_error = None;
    for addr in addrs {
        match ctx.run("connect", TcpStream::connect(addr)).await? {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                tracing::trace!(%addr, error = %e, "Connect attempt failed");
                last_error = Some(format!("{}: {}", addr, e));
            }
        }
    }

    Err(ProbeError::Connect(
        last_error.unwrap_or_else(|| format!("no reachable address for {}", address)),
    ))
}
