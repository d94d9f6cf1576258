//! IP header parsing.
//!
//! Only the fields the tunnel needs are read. Headers are never modified: a
//! TTL decrement would require recomputing the checksum.

use std::{
    fmt::Debug,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use crate::daemon::error::PacketError;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// The header fields of an IPv4 or IPv6 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: IpVersion,
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Protocol (IPv4) or next header (IPv6) number.
    pub protocol: u8,
    /// TTL (IPv4) or hop limit (IPv6).
    pub ttl: u8,
    /// Declared length of the whole packet, header included.
    pub total_len: usize,
}

impl PacketHeader {
    /// Parses the header at the start of `buffer`, dispatching on the version nibble.
    pub fn parse(buffer: &[u8]) -> Result<Self, PacketError> {
        let Some(first) = buffer.first() else {
            return Err(PacketError::MalformedHeader("empty buffer".into()));
        };
        match first >> 4 {
            4 => Self::parse_v4(buffer),
            6 => Self::parse_v6(buffer),
            version => Err(PacketError::UnsupportedVersion(version)),
        }
    }

    fn parse_v4(buffer: &[u8]) -> Result<Self, PacketError> {
        if buffer.len() < IPV4_HEADER_LEN {
            return Err(too_short(IPV4_HEADER_LEN, buffer.len()));
        }
        let header_len = usize::from(buffer[0] & 0x0f) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > buffer.len() {
            return Err(PacketError::MalformedHeader(format!(
                "header length {header_len} does not fit a {} byte buffer",
                buffer.len()
            )));
        }
        let total_len = usize::from(u16::from_be_bytes([buffer[2], buffer[3]]));
        check_total_len(total_len, header_len, buffer.len())?;
        Ok(Self {
            version: IpVersion::V4,
            source: IpAddr::V4(Ipv4Addr::new(buffer[12], buffer[13], buffer[14], buffer[15])),
            destination: IpAddr::V4(Ipv4Addr::new(buffer[16], buffer[17], buffer[18], buffer[19])),
            protocol: buffer[9],
            ttl: buffer[8],
            total_len,
        })
    }

    fn parse_v6(buffer: &[u8]) -> Result<Self, PacketError> {
        if buffer.len() < IPV6_HEADER_LEN {
            return Err(too_short(IPV6_HEADER_LEN, buffer.len()));
        }
        let payload_len = usize::from(u16::from_be_bytes([buffer[4], buffer[5]]));
        let total_len = IPV6_HEADER_LEN + payload_len;
        check_total_len(total_len, IPV6_HEADER_LEN, buffer.len())?;
        Ok(Self {
            version: IpVersion::V6,
            source: IpAddr::V6(ipv6_at(buffer, 8)),
            destination: IpAddr::V6(ipv6_at(buffer, 24)),
            protocol: buffer[6],
            ttl: buffer[7],
            total_len,
        })
    }
}

fn too_short(min: usize, actual: usize) -> PacketError {
    PacketError::MalformedHeader(format!("need at least {min} bytes, got {actual}"))
}

fn check_total_len(
    total_len: usize,
    header_len: usize,
    available: usize,
) -> Result<(), PacketError> {
    if total_len < header_len || total_len > available {
        return Err(PacketError::MalformedHeader(format!(
            "total length {total_len} does not fit header {header_len} and buffer {available}"
        )));
    }
    Ok(())
}

fn ipv6_at(buffer: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buffer[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// A parsed packet, holding exactly the bytes its header declares.
///
/// Anything past the declared total length (padding left in the read buffer)
/// is discarded by [Packet::parse].
#[derive(Clone)]
pub struct Packet {
    header: PacketHeader,
    bytes: Arc<[u8]>,
}

impl Packet {
    pub fn parse(raw: &[u8]) -> Result<Self, PacketError> {
        let header = PacketHeader::parse(raw)?;
        Ok(Self {
            bytes: Arc::from(&raw[..header.total_len]),
            header,
        })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("source", &self.header.source)
            .field("destination", &self.header.destination)
            .field("protocol", &self.header.protocol)
            .field("len", &self.bytes.len())
            .finish()
    }
}
