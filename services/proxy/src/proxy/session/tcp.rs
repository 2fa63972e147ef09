//! HTTP proxy session over TCP.
//!
//! One session serves one client connection: it reads the request head,
//! resolves the destination, connects upstream and then relays bytes in both
//! directions until either side is done or the connection goes idle.

use std::net::SocketAddr;
use std::sync::Arc;

use tetherfi_events::{ByteTransferReport, ConnectionEvent, ErrorEvent, ProxyRequest, SessionId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IdleTimer, SessionContext};
use crate::error::SessionError;
use crate::mempool::BufferPool;
use crate::proxy::request::{
    find_head_end, parse_destination, rewrite_request_line, RequestError, RequestHead,
    MAX_HEAD_SIZE,
};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// How far a session got before it ended.
#[derive(Debug, Default)]
struct Progress {
    request: Option<ProxyRequest>,
    /// Set once upstream bytes may have reached the client.
    relaying: bool,
    transfer: ByteTransferReport,
}

/// Serve one client connection until it finishes or `cancel` fires.
pub(crate) async fn run(
    ctx: Arc<SessionContext>,
    client: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let id = SessionId::new();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(session_id = %id, peer_addr = %peer, "TCP session cancelled");
        }
        _ = serve(&ctx, id, client, peer) => {}
    }
}

async fn serve(ctx: &SessionContext, id: SessionId, mut client: TcpStream, peer: SocketAddr) {
    ctx.clients.seen(peer.ip());
    if ctx.clients.is_blocked(peer.ip()) {
        warn!(session_id = %id, peer_addr = %peer, "Refusing blocked client");
        let _ = client.write_all(FORBIDDEN).await;
        return;
    }

    let mut progress = Progress::default();
    let result = exchange(ctx, id, &mut client, &mut progress).await;
    ctx.clients.record_transfer(peer.ip(), progress.transfer);
    let Err(error) = result else {
        return;
    };

    warn!(session_id = %id, error = %error, "TCP session failed");
    if let Some(response) = error_response(&error, &progress) {
        // The client may already be gone; the error event is what matters.
        let _ = client.write_all(response).await;
    }

    ctx.errors
        .submit(ErrorEvent::Tcp {
            id,
            request: progress.request,
            error: error.to_string(),
        })
        .await;
}

async fn exchange(
    ctx: &SessionContext,
    id: SessionId,
    client: &mut TcpStream,
    progress: &mut Progress,
) -> Result<(), SessionError> {
    let idle = IdleTimer::new(ctx.idle_timeout);
    let Some((head, leftover)) = read_head(&ctx.pool, &idle, client).await? else {
        debug!(session_id = %id, "Client closed without sending a request");
        return Ok(());
    };

    let text = String::from_utf8_lossy(&head);
    let parsed = RequestHead::parse(&text)?;
    let url = ctx.fixers.fix(&parsed.url);
    let (host, port) = parse_destination(&parsed.method, &url, parsed.host_header())?;

    let request = ProxyRequest {
        version: parsed.version.clone(),
        method: parsed.method.clone(),
        url,
        host,
        port,
        raw: parsed.line.clone(),
    };
    progress.request = Some(request.clone());

    if ctx.debug {
        info!(session_id = %id, request = %request.raw, "Proxy request");
    } else {
        debug!(session_id = %id, request = %request.raw, "Proxy request");
    }
    ctx.connections
        .submit(ConnectionEvent::Tcp {
            id,
            request: request.clone(),
        })
        .await;

    let mut upstream = connect(ctx, &request).await?;

    let mut forwarded = 0;
    if request.is_connect() {
        client.write_all(CONNECTION_ESTABLISHED).await?;
    } else if request.url != parsed.url {
        let rewritten = rewrite_request_line(&head, &request.request_line());
        upstream.write_all(&rewritten).await?;
        forwarded += rewritten.len();
    } else {
        upstream.write_all(&head).await?;
        forwarded += head.len();
    }
    if !leftover.is_empty() {
        upstream.write_all(&leftover).await?;
        forwarded += leftover.len();
    }
    progress.transfer.proxy_to_internet += forwarded as u64;

    progress.relaying = true;
    relay(&ctx.pool, &idle, client, &mut upstream, &mut progress.transfer).await?;
    debug!(
        session_id = %id,
        bytes_to_upstream = progress.transfer.proxy_to_internet,
        bytes_from_upstream = progress.transfer.internet_to_proxy,
        "TCP session closed"
    );

    Ok(())
}

/// Read until the end of the request head.
///
/// Returns the head including its terminator and whatever arrived after it,
/// or `None` if the client closed without sending anything.
async fn read_head(
    pool: &Arc<BufferPool>,
    idle: &IdleTimer,
    client: &mut TcpStream,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, SessionError> {
    let mut received = Vec::new();
    loop {
        let mut buffer = pool.claim();
        let n = read_idle(idle, client, &mut buffer[..]).await?;
        if n == 0 {
            if received.is_empty() {
                return Ok(None);
            }
            return Err(RequestError::Incomplete.into());
        }
        received.extend_from_slice(&buffer[..n]);
        drop(buffer);

        if let Some(end) = find_head_end(&received) {
            let leftover = received.split_off(end);
            return Ok(Some((received, leftover)));
        }
        if received.len() > MAX_HEAD_SIZE {
            return Err(RequestError::HeadTooLarge {
                limit: MAX_HEAD_SIZE,
            }
            .into());
        }
    }
}

/// Read once, giving up when the session has been idle too long.
async fn read_idle<R>(idle: &IdleTimer, reader: &mut R, buf: &mut [u8]) -> Result<usize, SessionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(remaining) = idle.remaining() else {
            return Ok(reader.read(&mut *buf).await?);
        };
        if remaining.is_zero() {
            return Err(idle.expired());
        }
        // On timeout the other direction may have moved bytes meanwhile.
        if let Ok(read) = timeout(remaining, reader.read(&mut *buf)).await {
            let n = read?;
            idle.touch();
            return Ok(n);
        }
    }
}

async fn connect(ctx: &SessionContext, request: &ProxyRequest) -> Result<TcpStream, SessionError> {
    let authority = request.authority();
    let connecting = TcpStream::connect((request.host.as_str(), request.port));

    match timeout(ctx.connect_timeout, connecting).await {
        Ok(Ok(stream)) => {
            debug!(upstream = %authority, "Connected upstream");
            Ok(stream)
        }
        Ok(Err(source)) => Err(SessionError::Connect { authority, source }),
        Err(_) => Err(SessionError::ConnectTimeout { authority }),
    }
}

/// The response owed to a client still waiting on the proxy, if any.
fn error_response(error: &SessionError, progress: &Progress) -> Option<&'static [u8]> {
    if progress.relaying {
        return None;
    }
    match error {
        SessionError::Request(RequestError::Incomplete) | SessionError::IdleTimeout { .. } => None,
        SessionError::Request(_) => Some(BAD_REQUEST),
        _ => Some(BAD_GATEWAY),
    }
}

/// Relay both directions until each side has finished sending, counting
/// bytes into `transfer` as they move.
async fn relay(
    pool: &Arc<BufferPool>,
    idle: &IdleTimer,
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    transfer: &mut ByteTransferReport,
) -> Result<(), SessionError> {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    let ByteTransferReport {
        proxy_to_internet,
        internet_to_proxy,
    } = transfer;

    tokio::try_join!(
        copy(pool, idle, &mut client_read, &mut upstream_write, proxy_to_internet),
        copy(pool, idle, &mut upstream_read, &mut client_write, internet_to_proxy),
    )?;
    Ok(())
}

/// Copy until EOF, holding a pooled buffer for one read and one write at a time.
async fn copy<R, W>(
    pool: &Arc<BufferPool>,
    idle: &IdleTimer,
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut buffer = pool.claim();
        let n = read_idle(idle, reader, &mut buffer[..]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        idle.touch();
        *total += n as u64;
    }
    // Peer may have closed already.
    let _ = writer.shutdown().await;
    Ok(())
}
