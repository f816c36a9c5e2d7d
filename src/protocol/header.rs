//! Original-Destination Header
//!
//! The interception layer prepends a small binary header to every redirected
//! datagram (and to the front of every redirected stream) recording where the
//! traffic was headed before it was redirected to the local listener:
//!
//! ```text
//! +--------+----------------------+-----------+
//! | family | address (4 or 16 B)  | port (BE) |
//! +--------+----------------------+-----------+
//! ```
//!
//! The header length is a function of the family byte alone: 7 bytes for
//! IPv4 and 19 bytes for IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::constants::*;

/// Errors produced while parsing an original-destination header
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The declared header length exceeds the available bytes
    #[error("truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Unknown address family discriminant
    #[error("invalid address family: {0}")]
    InvalidFamily(u8),

    /// I/O failure while reading the header from a stream
    #[error("failed to read header: {0}")]
    Io(#[from] std::io::Error),
}

/// Header length implied by a family discriminant
pub fn header_len(family: u8) -> Result<usize, HeaderError> {
    match family {
        HEADER_FAMILY_IPV4 => Ok(HEADER_IPV4_LEN),
        HEADER_FAMILY_IPV6 => Ok(HEADER_IPV6_LEN),
        other => Err(HeaderError::InvalidFamily(other)),
    }
}

/// Destination that existed before interception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginalDestinationHeader {
    pub destination: SocketAddr,
}

impl OriginalDestinationHeader {
    /// Create a header for the given destination
    pub fn new(destination: SocketAddr) -> Self {
        Self { destination }
    }

    /// Family discriminant written on the wire
    pub fn family(&self) -> u8 {
        match self.destination.ip() {
            IpAddr::V4(_) => HEADER_FAMILY_IPV4,
            IpAddr::V6(_) => HEADER_FAMILY_IPV6,
        }
    }

    /// Number of bytes this header occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self.destination.ip() {
            IpAddr::V4(_) => HEADER_IPV4_LEN,
            IpAddr::V6(_) => HEADER_IPV6_LEN,
        }
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns the header and the offset at which the payload begins.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), HeaderError> {
        let family = *buf.first().ok_or(HeaderError::Truncated {
            needed: HEADER_FAMILY_LEN,
            available: 0,
        })?;
        let len = header_len(family)?;
        if buf.len() < len {
            return Err(HeaderError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }

        Ok((Self::decode_body(family, &buf[HEADER_FAMILY_LEN..len]), len))
    }

    /// Read a header from the front of a stream, consuming exactly its bytes
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HeaderError>
    where
        R: AsyncRead + Unpin,
    {
        let family = reader.read_u8().await?;
        let len = header_len(family)?;
        let mut body = [0u8; HEADER_IPV6_LEN - HEADER_FAMILY_LEN];
        let body = &mut body[..len - HEADER_FAMILY_LEN];
        reader.read_exact(body).await?;

        Ok(Self::decode_body(family, body))
    }

    /// Append the wire form of this header to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.family());
        match self.destination.ip() {
            IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
        }
        buf.put_u16(self.destination.port());
    }

    /// Wire form of this header
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode address and port; `body` length has already been checked
    fn decode_body(family: u8, body: &[u8]) -> Self {
        let (ip, port_bytes) = if family == HEADER_FAMILY_IPV4 {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[..4]);
            (IpAddr::V4(Ipv4Addr::from(octets)), &body[4..6])
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), &body[16..18])
        };
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

        Self::new(SocketAddr::new(ip, port))
    }
}
