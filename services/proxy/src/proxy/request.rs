//! HTTP proxy request head parsing.
//!
//! Only the request line and the `Host` header are interpreted; everything
//! else in the head is forwarded upstream untouched.

use thiserror::Error;

/// Terminates the request head.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest request head accepted before giving up on the client.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Errors raised while parsing a request head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("connection closed before the request head was complete")]
    Incomplete,

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("request has no destination host")]
    MissingHost,

    #[error("invalid destination port: {0:?}")]
    InvalidPort(String),
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    pub version: String,
    /// The request line as received.
    pub line: String,
    host_header: Option<String>,
}

impl RequestHead {
    /// Parse the head text up to (not necessarily including) the blank line.
    pub fn parse(head: &str) -> Result<Self, RequestError> {
        let mut lines = head.split("\r\n");
        let line = lines.next().unwrap_or_default();
        let (method, url, version) = parse_request_line(line)?;

        let host_header = lines
            .take_while(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.trim().to_string());

        Ok(Self {
            method: method.to_string(),
            url: url.to_string(),
            version: version.to_string(),
            line: line.to_string(),
            host_header,
        })
    }

    /// Value of the `Host` header, if present.
    pub fn host_header(&self) -> Option<&str> {
        self.host_header.as_deref()
    }
}

/// Split `METHOD URL VERSION`.
///
/// The method ends at the first space and the version starts after the last
/// one, so a URL that itself contains spaces survives intact for the fixers.
pub fn parse_request_line(line: &str) -> Result<(&str, &str, &str), RequestError> {
    let malformed = || RequestError::MalformedRequestLine(line.to_string());

    let line = line.trim();
    let (method, rest) = line.split_once(' ').ok_or_else(malformed)?;
    let (url, version) = rest.rsplit_once(' ').ok_or_else(malformed)?;
    let url = url.trim();

    if method.is_empty() || url.is_empty() || version.is_empty() {
        return Err(malformed());
    }

    Ok((method, url, version))
}

/// Resolve the destination `(host, port)` of a request.
///
/// Handles absolute URLs (`http://host:port/path`), authority form
/// (`host:port`, used by `CONNECT`), and origin form (`/path`) which falls
/// back to the `Host` header. IPv6 hosts are returned without brackets.
pub fn parse_destination(
    method: &str,
    url: &str,
    host_header: Option<&str>,
) -> Result<(String, u16), RequestError> {
    let is_connect = method.eq_ignore_ascii_case(tetherfi_events::CONNECT_METHOD);

    let (authority, default_port) = if let Some((scheme, rest)) = url.split_once("://") {
        let port = if scheme.eq_ignore_ascii_case("https") {
            HTTPS_PORT
        } else {
            HTTP_PORT
        };
        (strip_path(rest), port)
    } else if url.starts_with('/') {
        let host = host_header.ok_or(RequestError::MissingHost)?;
        (host, HTTP_PORT)
    } else if is_connect {
        (strip_path(url), HTTPS_PORT)
    } else {
        (strip_path(url), HTTP_PORT)
    };

    // Credentials never take part in routing.
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    split_host_port(authority, default_port)
}

/// Index one past the end of the head terminator, if the buffer holds one.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|i| i + HEAD_TERMINATOR.len())
}

/// Replace the first line of `head` with `line`, keeping the rest verbatim.
pub fn rewrite_request_line(head: &[u8], line: &str) -> Vec<u8> {
    let rest = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .map_or(&[][..], |i| &head[i..]);

    let mut out = Vec::with_capacity(line.len() + rest.len());
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(rest);
    out
}

fn strip_path(authority: &str) -> &str {
    authority
        .find(['/', '?', '#'])
        .map_or(authority, |end| &authority[..end])
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), RequestError> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or(RequestError::MissingHost)?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(RequestError::InvalidPort(after.to_string())),
            },
        }
    } else if authority.matches(':').count() > 1 {
        // Bare IPv6 literal; a port is only recognised in bracket form.
        (authority, None)
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(RequestError::MissingHost);
    }

    let port = match port {
        None | Some("") => default_port,
        Some(port) => match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => return Err(RequestError::InvalidPort(port.to_string())),
        },
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("GET http://example.com/ HTTP/1.1", "GET", "http://example.com/", "HTTP/1.1")]
    #[case("CONNECT example.com:443 HTTP/1.1", "CONNECT", "example.com:443", "HTTP/1.1")]
    #[case(
        "GET http://a.playstation.net http://a.playstation.net/x HTTP/1.1",
        "GET",
        "http://a.playstation.net http://a.playstation.net/x",
        "HTTP/1.1"
    )]
    fn test_parse_request_line(
        #[case] line: &str,
        #[case] method: &str,
        #[case] url: &str,
        #[case] version: &str,
    ) {
        assert_eq!(parse_request_line(line).unwrap(), (method, url, version));
    }

    #[rstest]
    #[case("")]
    #[case("GET")]
    #[case("GET /")]
    fn test_parse_request_line_rejects_malformed(#[case] line: &str) {
        assert!(matches!(
            parse_request_line(line),
            Err(RequestError::MalformedRequestLine(_))
        ));
    }

    #[rstest]
    #[case("GET", "http://example.com/path", None, "example.com", 80)]
    #[case("GET", "https://example.com", None, "example.com", 443)]
    #[case("GET", "http://example.com:8080/a?b", None, "example.com", 8080)]
    #[case("GET", "http://user:pw@example.com/", None, "example.com", 80)]
    #[case("GET", "http://[::1]:8080/", None, "::1", 8080)]
    #[case("GET", "/index.html", Some("example.com:81"), "example.com", 81)]
    #[case("CONNECT", "example.com:8443", None, "example.com", 8443)]
    #[case("CONNECT", "example.com", None, "example.com", 443)]
    #[case("CONNECT", "[2001:db8::1]:443", None, "2001:db8::1", 443)]
    fn test_parse_destination(
        #[case] method: &str,
        #[case] url: &str,
        #[case] host_header: Option<&str>,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        assert_eq!(
            parse_destination(method, url, host_header).unwrap(),
            (host.to_string(), port)
        );
    }

    #[rstest]
    #[case("http://example.com:http/", RequestError::InvalidPort("http".to_string()))]
    #[case("http://example.com:0/", RequestError::InvalidPort("0".to_string()))]
    #[case("http://example.com:70000/", RequestError::InvalidPort("70000".to_string()))]
    #[case("http:///path", RequestError::MissingHost)]
    #[case("/no-host-header", RequestError::MissingHost)]
    fn test_parse_destination_errors(#[case] url: &str, #[case] expected: RequestError) {
        assert_eq!(parse_destination("GET", url, None).unwrap_err(), expected);
    }

    #[test]
    fn test_head_parse_reads_host_header() {
        let head = RequestHead::parse("GET / HTTP/1.1\r\nhOsT: example.com\r\nAccept: */*\r\n\r\n")
            .unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.url, "/");
        assert_eq!(head.line, "GET / HTTP/1.1");
        assert_eq!(head.host_header(), Some("example.com"));
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_rewrite_request_line_keeps_headers() {
        let head = b"GET http://a b HTTP/1.1\r\nHost: b\r\n\r\n";
        let rewritten = rewrite_request_line(head, "GET b HTTP/1.1");
        assert_eq!(rewritten, b"GET b HTTP/1.1\r\nHost: b\r\n\r\n");
    }
}
