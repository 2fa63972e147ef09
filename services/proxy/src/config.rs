//! Proxy configuration (env-driven).

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::dispatcher::default_parallelism;
use crate::shared::{ProxyOptions, DEFAULT_IDLE_TIMEOUT, DEFAULT_PROXY_PORT};

/// Lower bound for every configurable timeout.
const MIN_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind both proxies on.
    pub host: IpAddr,

    /// TCP (HTTP proxy) port.
    pub port: u16,

    /// UDP relay port; defaults to the TCP port.
    pub udp_port: u16,

    pub udp_enabled: bool,

    /// Log every session at `info`.
    pub proxy_debug: bool,

    pub connect_timeout: Duration,

    pub udp_reply_timeout: Duration,

    /// TCP session inactivity limit; `None` waits forever.
    pub socket_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host: IpAddr = lookup("TETHERFI_HOST")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_HOST must be an IP address.")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let port: u16 = lookup("TETHERFI_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_PORT must be a port number.")?
            .unwrap_or(DEFAULT_PROXY_PORT);

        let udp_port: u16 = lookup("TETHERFI_UDP_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_UDP_PORT must be a port number.")?
            .unwrap_or(port);

        let udp_enabled = lookup("TETHERFI_UDP_ENABLED")
            .map(|v| is_truthy(&v))
            .unwrap_or(true);

        let proxy_debug = lookup("TETHERFI_PROXY_DEBUG")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        let connect_timeout_ms: u64 = lookup("TETHERFI_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(10_000);

        let udp_reply_timeout_ms: u64 = lookup("TETHERFI_UDP_REPLY_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_UDP_REPLY_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(5_000);

        // Zero disables the limit.
        let socket_timeout_ms: u64 = lookup("TETHERFI_SOCKET_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TETHERFI_SOCKET_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_IDLE_TIMEOUT.as_millis() as u64);
        let socket_timeout = (socket_timeout_ms > 0)
            .then(|| Duration::from_millis(socket_timeout_ms.max(MIN_TIMEOUT_MS)));

        let log_level = lookup("TETHERFI_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host,
            port,
            udp_port,
            udp_enabled,
            proxy_debug,
            connect_timeout: Duration::from_millis(connect_timeout_ms.max(MIN_TIMEOUT_MS)),
            udp_reply_timeout: Duration::from_millis(udp_reply_timeout_ms.max(MIN_TIMEOUT_MS)),
            socket_timeout,
            log_level,
        })
    }

    pub fn proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            tcp_port: self.port,
            udp_port: self.udp_port,
            udp_enabled: self.udp_enabled,
            bind_all: false,
            debug: self.proxy_debug,
            connect_timeout: self.connect_timeout,
            udp_reply_timeout: self.udp_reply_timeout,
            idle_timeout: self.socket_timeout,
            parallelism: default_parallelism(),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.port, 8228);
        assert_eq!(config.udp_port, 8228);
        assert!(config.udp_enabled);
        assert!(!config.proxy_debug);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.udp_reply_timeout, Duration::from_secs(5));
        assert_eq!(config.socket_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_udp_port_follows_tcp_port() {
        let config = load(&[("TETHERFI_PORT", "9000")]).unwrap();
        assert_eq!(config.udp_port, 9000);

        let config = load(&[("TETHERFI_PORT", "9000"), ("TETHERFI_UDP_PORT", "9001")]).unwrap();
        assert_eq!(config.udp_port, 9001);
    }

    #[test]
    fn test_flags_and_timeout_floor() {
        let config = load(&[
            ("TETHERFI_UDP_ENABLED", "false"),
            ("TETHERFI_PROXY_DEBUG", "TRUE"),
            ("TETHERFI_CONNECT_TIMEOUT_MS", "5"),
        ])
        .unwrap();

        assert!(!config.udp_enabled);
        assert!(config.proxy_debug);
        assert_eq!(config.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_socket_timeout_zero_is_unlimited() {
        let config = load(&[("TETHERFI_SOCKET_TIMEOUT_MS", "0")]).unwrap();
        assert_eq!(config.socket_timeout, None);
        assert_eq!(config.proxy_options().idle_timeout, None);

        let config = load(&[("TETHERFI_SOCKET_TIMEOUT_MS", "20")]).unwrap();
        assert_eq!(config.socket_timeout, Some(Duration::from_millis(100)));

        let err = load(&[("TETHERFI_SOCKET_TIMEOUT_MS", "-1")]).unwrap_err();
        assert!(err.to_string().contains("TETHERFI_SOCKET_TIMEOUT_MS"));
    }

    #[test]
    fn test_invalid_values_carry_context() {
        let err = load(&[("TETHERFI_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("TETHERFI_PORT"));

        let err = load(&[("TETHERFI_HOST", "localhost")]).unwrap_err();
        assert!(err.to_string().contains("TETHERFI_HOST"));
    }
}
