//! Connection and error event definitions.
//!
//! Each session emits at most one connection event and at most one error
//! event, both keyed by the session's [`SessionId`].

use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::SessionId;

/// The method that asks the proxy to open a raw tunnel (HTTPS).
pub const CONNECT_METHOD: &str = "CONNECT";

// =============================================================================
// Request Types
// =============================================================================

/// Parsed first line of an HTTP proxy request plus its resolved destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Protocol version token, e.g. `HTTP/1.1`.
    pub version: String,
    /// Request method, e.g. `GET` or `CONNECT`.
    pub method: String,
    /// Request target after URL fixing.
    pub url: String,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// The request line exactly as the client sent it.
    pub raw: String,
}

impl ProxyRequest {
    /// Whether this request opens an opaque tunnel rather than a plain HTTP exchange.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case(CONNECT_METHOD)
    }

    /// The request line to forward upstream: `METHOD URL VERSION`.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.url, self.version)
    }

    /// Destination as `host:port`.
    pub fn authority(&self) -> String {
        DestinationInfo::new(self.host.clone(), self.port).to_string()
    }
}

/// Target of a single UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub host: String,
    pub port: u16,
}

impl DestinationInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DestinationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bare IPv6 literals need brackets to be usable as `host:port`.
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event that can be stored in an id-deduplicated log.
pub trait LogEvent: Clone + Send + Sync + 'static {
    /// The session this event belongs to.
    fn id(&self) -> SessionId;
}

/// A proxy session was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Observers should drop everything rendered so far.
    Clear { id: SessionId },
    /// A TCP request line was parsed.
    Tcp {
        id: SessionId,
        request: ProxyRequest,
    },
    /// A UDP datagram was routed.
    Udp {
        id: SessionId,
        destination: DestinationInfo,
    },
}

impl ConnectionEvent {
    /// A fresh clear marker.
    pub fn clear() -> Self {
        Self::Clear {
            id: SessionId::new(),
        }
    }
}

impl LogEvent for ConnectionEvent {
    fn id(&self) -> SessionId {
        match self {
            Self::Clear { id } | Self::Tcp { id, .. } | Self::Udp { id, .. } => *id,
        }
    }
}

/// A proxy session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorEvent {
    /// Observers should drop everything rendered so far.
    Clear { id: SessionId },
    /// A TCP session failed, possibly before its request was parsed.
    Tcp {
        id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        request: Option<ProxyRequest>,
        error: String,
    },
    /// Forwarding a UDP datagram failed.
    Udp {
        id: SessionId,
        error: String,
        destination: DestinationInfo,
    },
}

impl ErrorEvent {
    /// A fresh clear marker.
    pub fn clear() -> Self {
        Self::Clear {
            id: SessionId::new(),
        }
    }

    /// The rendered error message, if this is not a clear marker.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Clear { .. } => None,
            Self::Tcp { error, .. } | Self::Udp { error, .. } => Some(error),
        }
    }
}

impl LogEvent for ErrorEvent {
    fn id(&self) -> SessionId {
        match self {
            Self::Clear { id } | Self::Tcp { id, .. } | Self::Udp { id, .. } => *id,
        }
    }
}

// =============================================================================
// Clients
// =============================================================================

/// Bytes moved on behalf of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteTransferReport {
    /// Client to destination.
    pub proxy_to_internet: u64,
    /// Destination back to client.
    pub internet_to_proxy: u64,
}

impl ByteTransferReport {
    pub fn new(proxy_to_internet: u64, internet_to_proxy: u64) -> Self {
        Self {
            proxy_to_internet,
            internet_to_proxy,
        }
    }

    pub fn total(&self) -> u64 {
        self.proxy_to_internet.saturating_add(self.internet_to_proxy)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Accumulate another report into this one.
    pub fn add(&mut self, other: ByteTransferReport) {
        self.proxy_to_internet = self.proxy_to_internet.saturating_add(other.proxy_to_internet);
        self.internet_to_proxy = self.internet_to_proxy.saturating_add(other.internet_to_proxy);
    }
}

/// A device that has talked to the proxy, keyed by its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetherClient {
    pub ip: IpAddr,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    #[serde(default)]
    pub transfer: ByteTransferReport,
    #[serde(default)]
    pub blocked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> ProxyRequest {
        ProxyRequest {
            version: "HTTP/1.1".to_string(),
            method: method.to_string(),
            url: "example.com:443".to_string(),
            host: "example.com".to_string(),
            port: 443,
            raw: format!("{method} example.com:443 HTTP/1.1"),
        }
    }

    #[test]
    fn test_connect_detection() {
        assert!(request("CONNECT").is_connect());
        assert!(request("connect").is_connect());
        assert!(!request("GET").is_connect());
    }

    #[test]
    fn test_request_line() {
        assert_eq!(
            request("CONNECT").request_line(),
            "CONNECT example.com:443 HTTP/1.1"
        );
        assert_eq!(request("GET").authority(), "example.com:443");
    }

    #[test]
    fn test_destination_display_brackets_ipv6() {
        assert_eq!(DestinationInfo::new("::1", 53).to_string(), "[::1]:53");
        assert_eq!(DestinationInfo::new("[::1]", 53).to_string(), "[::1]:53");
        assert_eq!(DestinationInfo::new("10.0.0.1", 53).to_string(), "10.0.0.1:53");
    }

    #[test]
    fn test_event_ids() {
        let id = SessionId::new();
        let conn = ConnectionEvent::Tcp {
            id,
            request: request("GET"),
        };
        assert_eq!(conn.id(), id);

        let err = ErrorEvent::Udp {
            id,
            error: "boom".to_string(),
            destination: DestinationInfo::new("1.1.1.1", 53),
        };
        assert_eq!(err.id(), id);
        assert_eq!(err.error(), Some("boom"));
        assert_eq!(ErrorEvent::clear().error(), None);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = ErrorEvent::Tcp {
            id: SessionId::new(),
            request: None,
            error: "connection refused".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tcp");
        assert!(json.get("request").is_none());

        let back: ErrorEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_transfer_report_accumulates() {
        let mut report = ByteTransferReport::default();
        assert!(report.is_empty());

        report.add(ByteTransferReport::new(10, 32));
        report.add(ByteTransferReport::new(5, u64::MAX));
        assert_eq!(report.proxy_to_internet, 15);
        assert_eq!(report.internet_to_proxy, u64::MAX);
        assert_eq!(report.total(), u64::MAX);
    }
}
