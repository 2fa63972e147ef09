//! Test harness for proxy integration tests.
//!
//! Provides echo upstreams (TCP and UDP) and a running proxy bound to
//! ephemeral localhost ports.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;

use tetherfi_proxy::{Collaborators, ProxyKind, ProxyOptions, SharedProxy};

pub const WAIT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct UdpEchoBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UdpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let Ok((n, from)) = received else { break };
                        let _ = socket.send_to(&buf[..n], from).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for UdpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A started [`SharedProxy`] on ephemeral localhost ports.
pub struct ProxyHandle {
    pub proxy: Arc<SharedProxy>,
    pub tcp_addr: SocketAddr,
    pub udp_addr: Option<SocketAddr>,
}

impl ProxyHandle {
    pub async fn start(udp_enabled: bool) -> Self {
        let options = ProxyOptions {
            tcp_port: 0,
            udp_port: 0,
            udp_enabled,
            parallelism: 2,
            connect_timeout: Duration::from_secs(2),
            udp_reply_timeout: Duration::from_secs(2),
            ..ProxyOptions::default()
        };
        let proxy = Arc::new(SharedProxy::new(
            options,
            Collaborators::permissive(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ));
        proxy.start().await.expect("proxy should start");

        let addrs = proxy.local_addrs().await;
        let find = |kind| addrs.iter().find(|(k, _)| *k == kind).map(|(_, a)| *a);

        Self {
            tcp_addr: find(ProxyKind::Tcp).expect("tcp proxy should listen"),
            udp_addr: find(ProxyKind::Udp),
            proxy,
        }
    }

    pub async fn connect(&self) -> TcpStream {
        timeout(WAIT, TcpStream::connect(self.tcp_addr))
            .await
            .expect("connect timed out")
            .expect("connect failed")
    }
}

/// Read from `stream` until `len` bytes arrived.
pub async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Read until the peer closes.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// A localhost port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
