//! SOCKS5-style UDP datagram framing.
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tetherfi_events::DestinationInfo;
use thiserror::Error;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const HEADER_PREFIX_LEN: usize = 4;

/// Errors raised while decoding a framed datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("reserved bytes must be zero")]
    Reserved,

    #[error("fragmented datagrams are not supported (frag={0})")]
    Fragmented(u8),

    #[error("unknown address type {0:#04x}")]
    AddressType(u8),

    #[error("domain name is not valid UTF-8")]
    Domain,

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("destination port 0 is not routable")]
    Port,
}

/// A decoded datagram borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub destination: DestinationInfo,
    pub payload: &'a [u8],
}

/// Decode a framed datagram.
pub fn decode_datagram(buf: &[u8]) -> Result<Datagram<'_>, DatagramError> {
    if buf.len() < HEADER_PREFIX_LEN {
        return Err(DatagramError::Truncated(buf.len()));
    }
    if buf[0] != 0 || buf[1] != 0 {
        return Err(DatagramError::Reserved);
    }
    if buf[2] != 0 {
        return Err(DatagramError::Fragmented(buf[2]));
    }

    let rest = &buf[HEADER_PREFIX_LEN..];
    let (host, rest) = match buf[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = take(rest, 4, buf.len())?
                .try_into()
                .map_err(|_| DatagramError::Truncated(buf.len()))?;
            (Ipv4Addr::from(octets).to_string(), &rest[4..])
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = take(rest, 16, buf.len())?
                .try_into()
                .map_err(|_| DatagramError::Truncated(buf.len()))?;
            (Ipv6Addr::from(octets).to_string(), &rest[16..])
        }
        ATYP_DOMAIN => {
            let len = *rest.first().ok_or(DatagramError::Truncated(buf.len()))? as usize;
            let name = take(&rest[1..], len, buf.len())?;
            let name = std::str::from_utf8(name).map_err(|_| DatagramError::Domain)?;
            (name.to_string(), &rest[1 + len..])
        }
        other => return Err(DatagramError::AddressType(other)),
    };

    let port = take(rest, 2, buf.len())?;
    let port = u16::from_be_bytes([port[0], port[1]]);
    if port == 0 {
        return Err(DatagramError::Port);
    }

    Ok(Datagram {
        destination: DestinationInfo::new(host, port),
        payload: &rest[2..],
    })
}

/// Frame `payload` as coming from `destination`.
///
/// Hosts that parse as IP literals use the address forms; anything else is
/// written as a domain name.
pub fn encode_datagram(
    destination: &DestinationInfo,
    payload: &[u8],
) -> Result<Vec<u8>, DatagramError> {
    let host = destination.host.trim_start_matches('[').trim_end_matches(']');
    let mut out = Vec::with_capacity(HEADER_PREFIX_LEN + 1 + host.len() + 2 + payload.len());
    out.extend_from_slice(&[0, 0, 0]);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .map_err(|_| DatagramError::DomainTooLong(host.len()))?;
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host.as_bytes());
        }
    }

    out.extend_from_slice(&destination.port.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn take(buf: &[u8], len: usize, total: usize) -> Result<&[u8], DatagramError> {
    buf.get(..len).ok_or(DatagramError::Truncated(total))
}
