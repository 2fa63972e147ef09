mod harness;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use harness::{ProxyHandle, TcpEchoBackend, WAIT};
use tetherfi_events::{ConnectionEvent, RunningStatus};
use tetherfi_proxy::{
    Collaborators, ProxyError, ProxyOptions, SharedProxy, StaticAddressProvider,
    StaticPermissionGuard, StaticVpnChecker, StatusBroadcaster,
};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[tokio::test]
async fn status_observers_see_each_transition_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let status = StatusBroadcaster::with_refresh_hook({
        let seen = Arc::clone(&seen);
        move |s| seen.lock().unwrap().push(s.clone())
    });
    let proxy = SharedProxy::with_status(
        ProxyOptions {
            tcp_port: 0,
            udp_port: 0,
            parallelism: 2,
            ..ProxyOptions::default()
        },
        Collaborators::permissive(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        status,
    );

    proxy.start().await.unwrap();
    proxy.start().await.unwrap();
    proxy.stop().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            RunningStatus::Starting,
            RunningStatus::Running,
            RunningStatus::Stopping,
            RunningStatus::NotRunning,
        ]
    );
}

#[tokio::test]
async fn vpn_refusal_leaves_error_status() {
    let proxy = SharedProxy::new(
        ProxyOptions {
            tcp_port: 0,
            udp_port: 0,
            parallelism: 2,
            ..ProxyOptions::default()
        },
        Collaborators {
            address: Arc::new(StaticAddressProvider(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))),
            permissions: Arc::new(StaticPermissionGuard(true)),
            vpn: Arc::new(StaticVpnChecker(true)),
        },
    );

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::VpnActive));
    assert_eq!(proxy.status().get(), RunningStatus::error("a VPN is active"));
}

#[tokio::test]
async fn restart_clears_previous_events() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(false).await;

    let mut client = handle.connect().await;
    let request = format!("CONNECT {} HTTP/1.1\r\n\r\n", backend.addr);
    client.write_all(request.as_bytes()).await.unwrap();

    let mut connections = handle.proxy.connections().subscribe().await;
    timeout(WAIT, connections.next()).await.unwrap().unwrap();

    handle.proxy.stop().await;
    handle.proxy.start().await.unwrap();

    // Observers see a clear marker before the log is emptied.
    let mut saw_clear = false;
    while let Ok(Some(event)) =
        timeout(std::time::Duration::from_millis(100), connections.next()).await
    {
        saw_clear |= matches!(event, ConnectionEvent::Clear { .. });
    }
    assert!(saw_clear);
    assert!(handle.proxy.connections().is_empty().await);

    handle.proxy.stop().await;
}
