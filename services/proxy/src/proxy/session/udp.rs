//! Forwarding of a single framed UDP datagram.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tetherfi_events::{
    ByteTransferReport, ConnectionEvent, DestinationInfo, ErrorEvent, SessionId,
};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::error::SessionError;
use crate::mempool::PooledBuffer;
use crate::proxy::datagram::{decode_datagram, encode_datagram};

/// Forward the datagram in `packet[..len]` and relay one reply to `peer`.
///
/// `packet` stays claimed until the session ends. Datagrams from blocked
/// clients are dropped unanswered.
pub(crate) async fn run(
    ctx: Arc<SessionContext>,
    socket: Arc<UdpSocket>,
    packet: PooledBuffer,
    len: usize,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let id = SessionId::new();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(session_id = %id, peer_addr = %peer, "UDP session cancelled");
        }
        _ = serve(&ctx, id, &socket, &packet[..len], peer) => {}
    }
}

async fn serve(ctx: &SessionContext, id: SessionId, socket: &UdpSocket, packet: &[u8], peer: SocketAddr) {
    ctx.clients.seen(peer.ip());
    if ctx.clients.is_blocked(peer.ip()) {
        warn!(session_id = %id, peer_addr = %peer, "Dropping datagram from blocked client");
        return;
    }

    let mut destination = None;
    let mut transfer = ByteTransferReport::default();
    let result = forward(ctx, id, socket, packet, peer, &mut destination, &mut transfer).await;
    ctx.clients.record_transfer(peer.ip(), transfer);
    let Err(error) = result else {
        return;
    };

    warn!(session_id = %id, error = %error, "UDP session failed");
    let destination =
        destination.unwrap_or_else(|| DestinationInfo::new(peer.ip().to_string(), peer.port()));
    ctx.errors
        .submit(ErrorEvent::Udp {
            id,
            error: error.to_string(),
            destination,
        })
        .await;
}

async fn forward(
    ctx: &SessionContext,
    id: SessionId,
    socket: &UdpSocket,
    packet: &[u8],
    peer: SocketAddr,
    slot: &mut Option<DestinationInfo>,
    transfer: &mut ByteTransferReport,
) -> Result<(), SessionError> {
    let datagram = decode_datagram(packet)?;
    let mut destination = datagram.destination;
    if destination.host.parse::<IpAddr>().is_err() {
        destination.host = ctx.fixers.fix(&destination.host);
    }
    *slot = Some(destination.clone());

    if ctx.debug {
        info!(session_id = %id, destination = %destination, "Proxy datagram");
    } else {
        debug!(session_id = %id, destination = %destination, "Proxy datagram");
    }
    ctx.connections
        .submit(ConnectionEvent::Udp {
            id,
            destination: destination.clone(),
        })
        .await;

    let authority = destination.to_string();
    let target = lookup_host((destination.host.as_str(), destination.port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| SessionError::Resolve {
            authority: authority.clone(),
        })?;

    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let upstream = UdpSocket::bind(local).await?;
    let sent = upstream.send_to(datagram.payload, target).await?;
    transfer.proxy_to_internet += sent as u64;

    let mut reply = ctx.pool.claim();
    let (n, from) = timeout(ctx.udp_reply_timeout, upstream.recv_from(&mut reply))
        .await
        .map_err(|_| SessionError::ReplyTimeout { authority })??;

    let source = DestinationInfo::new(from.ip().to_string(), from.port());
    let framed = encode_datagram(&source, &reply[..n])?;
    drop(reply);

    socket.send_to(&framed, peer).await?;
    transfer.internet_to_proxy += n as u64;
    debug!(session_id = %id, bytes = n, "Relayed datagram reply");
    Ok(())
}
