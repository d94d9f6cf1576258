//! The ipoe daemon. It runs the egress and ingress pipelines side by side.

pub mod codec;
pub mod egress;
pub mod error;
pub mod frame;
pub mod imap;
pub mod injector;
pub mod packet;
pub mod receiver;
pub mod routing;
pub mod smtp;
pub mod transmitter;
pub mod tun;

use std::time::Duration;

use tokio::{select, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use crate::daemon::error::DaemonError;
use crate::{
    config::Config,
    daemon::{
        codec::Base64Codec, egress::Egress, frame::MailFrameBuilder, imap::ImapConnection,
        injector::RawSocketInjector, receiver::MailReceiver, routing::SameMailboxRouting,
        smtp::SmtpConnection, transmitter::MailTransmitter,
    },
};

/// How long the pipelines get to wind down once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The ipoe daemon
///
/// Returns when `cancel` is triggered, or with the error of the first
/// pipeline that stops on its own.
pub async fn run_daemon(config: Config, cancel: CancellationToken) -> Result<(), DaemonError> {
    // Initialize pipelines
    let routing = SameMailboxRouting::new(&config.routing.dest_email)?;
    let interface = tun::open_interface(&config)?;
    let egress = Egress::new(
        interface,
        routing,
        MailFrameBuilder::new(
            config.routing.from_email.clone(),
            Base64Codec,
            config.routing.low_visibility,
        ),
        MailTransmitter::new(SmtpConnection::new(&config.smtp), &config.smtp),
    );
    let receiver = MailReceiver::new(
        ImapConnection::new(&config.imap),
        Base64Codec,
        RawSocketInjector,
        &config.imap,
        &config.archive,
    );

    // Run
    let mut join_set = JoinSet::new();
    join_set.spawn(egress.run(cancel.clone()));
    join_set.spawn(receiver.run(cancel.clone()));
    info!(interface = %config.interface_name, "ipoe is running");
    let result = select! {
        Some(joined) = join_set.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                error!(%error, "pipeline stopped");
                Err(error)
            }
            Err(error) => {
                error!(%error, "pipeline task failed");
                Err(DaemonError::Died)
            }
        },
        _ = cancel.cancelled() => {
            info!("Stopping...");
            Ok(())
        }
    };

    cancel.cancel();
    let drained = timeout(SHUTDOWN_GRACE, async {
        while join_set.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("pipelines did not stop in time");
        join_set.abort_all();
    }
    result
}
