//! Delivery of decoded packets towards their destination.
//!
//! Packets leave through a raw socket opened for the packet's destination and
//! protocol, one socket per packet. They are not written back into the local
//! tunnel interface.

use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use crate::daemon::{
    error::ReinjectionError,
    packet::{IpVersion, Packet, IPV6_HEADER_LEN},
};

/// Hands a decoded packet to the network stack.
///
/// Implementations may block; callers on the async runtime go through
/// [tokio::task::spawn_blocking].
pub trait PacketInjector: Send + Sync {
    fn inject(&self, packet: &Packet) -> Result<(), ReinjectionError>;
}

/// Writes packets to a raw IP socket. Needs `CAP_NET_RAW`.
///
/// IPv4 packets are written whole with `IP_HDRINCL`. IPv6 raw sockets cannot
/// carry a caller-built header, so the kernel rebuilds it and only the bytes
/// after the fixed header are written.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketInjector;

impl PacketInjector for RawSocketInjector {
    fn inject(&self, packet: &Packet) -> Result<(), ReinjectionError> {
        let header = packet.header();
        let destination = header.destination;
        let open_error = |source| ReinjectionError::Open {
            destination,
            source,
        };

        let domain = match destination {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(
            domain,
            Type::RAW,
            Some(Protocol::from(i32::from(header.protocol))),
        )
        .map_err(open_error)?;
        if header.version == IpVersion::V4 {
            socket.set_header_included(true).map_err(open_error)?;
        }
        socket
            .connect(&SockAddr::from(SocketAddr::new(destination, 0)))
            .map_err(open_error)?;

        let payload = wire_bytes(packet);
        let written = socket
            .send(payload)
            .map_err(|source| ReinjectionError::Write {
                destination,
                source,
            })?;
        if written != payload.len() {
            return Err(ReinjectionError::ShortWrite {
                destination,
                written,
                expected: payload.len(),
            });
        }
        debug!(%destination, protocol = header.protocol, len = written, "packet injected");
        Ok(())
    }
}

/// The bytes handed to the raw socket for `packet`.
fn wire_bytes(packet: &Packet) -> &[u8] {
    match packet.header().version {
        IpVersion::V4 => packet.bytes(),
        IpVersion::V6 => &packet.bytes()[IPV6_HEADER_LEN..],
    }
}
