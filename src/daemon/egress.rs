//! The egress loop: interface read to mail delivery, one packet at a time.

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::{
    codec::Codec,
    error::{DaemonError, EgressError},
    frame::MailFrameBuilder,
    packet::Packet,
    routing::RoutingTable,
    smtp::SmtpConnector,
    transmitter::MailTransmitter,
};

/// Largest frame read from the interface in one call.
pub const READ_BUFFER_SIZE: usize = 9000;

pub struct Egress<R, T, C, S> {
    interface: R,
    routing: T,
    builder: MailFrameBuilder<C>,
    transmitter: MailTransmitter<S>,
}

impl<R, T, C, S> Egress<R, T, C, S>
where
    R: AsyncRead + Unpin + Send,
    T: RoutingTable,
    C: Codec,
    S: SmtpConnector,
{
    pub fn new(
        interface: R,
        routing: T,
        builder: MailFrameBuilder<C>,
        transmitter: MailTransmitter<S>,
    ) -> Self {
        Self {
            interface,
            routing,
            builder,
            transmitter,
        }
    }

    /// Reads packets until the interface fails or `cancel` is triggered.
    ///
    /// A packet that cannot be parsed, routed or delivered is logged and
    /// dropped; the loop moves on to the next read.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let size = select! {
                _ = cancel.cancelled() => {
                    info!("egress stopped");
                    return Ok(());
                }
                read = self.interface.read(&mut buffer) => read.map_err(DaemonError::Interface)?,
            };
            if size == 0 {
                return Err(DaemonError::InterfaceClosed);
            }
            if let Err(error) = self.forward(&buffer[..size]).await {
                warn!(%error, len = size, "dropping outbound packet");
            }
        }
    }

    /// Sends one raw packet through the mail transport.
    pub async fn forward(&self, raw: &[u8]) -> Result<(), EgressError> {
        let packet = Packet::parse(raw)?;
        let header = packet.header();
        let recipient = self.routing.route(&header.destination.to_string())?;
        debug!(
            src = %header.source,
            dst = %header.destination,
            protocol = header.protocol,
            len = packet.len(),
            %recipient,
            "forwarding packet",
        );
        let message = self.builder.compose(&packet, recipient);
        self.transmitter.send(&message).await?;
        Ok(())
    }
}
