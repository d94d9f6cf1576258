//! The ingress loop: mailbox notifications to packet injection.
//!
//! The receiver keeps one mailbox session open and moves between three
//! states. While idle-watching it waits on the server's new-message
//! notification. A notification switches it to draining, which fetches the
//! reported range, injects every frame found, and archives the batch. Messages
//! announced while a batch was in flight are drained before watching again.
//! Any runtime session failure switches it to reconnecting, which opens a new
//! session with exponential backoff.

use std::{sync::Arc, time::Duration};

use tokio::{select, task, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ArchiveConfig, ImapConfig, Secret},
    daemon::{
        codec::Codec,
        error::{DaemonError, IngressError, MailboxError},
        frame::extract_frame,
        imap::{FetchedMessage, IdleEvent, MailboxConnector, MailboxSession, SeqRange},
        injector::PacketInjector,
        packet::Packet,
    },
};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

enum State<S> {
    IdleWatching(S),
    Draining(S, u32),
    Reconnecting,
}

pub struct MailReceiver<M, C, I> {
    connector: M,
    codec: C,
    injector: Arc<I>,
    username: String,
    password: Secret,
    mailbox: String,
    archive: String,
}

impl<M, C, I> MailReceiver<M, C, I>
where
    M: MailboxConnector,
    C: Codec,
    I: PacketInjector + 'static,
{
    pub fn new(
        connector: M,
        codec: C,
        injector: I,
        imap: &ImapConfig,
        archive: &ArchiveConfig,
    ) -> Self {
        Self {
            connector,
            codec,
            injector: Arc::new(injector),
            username: imap.username.clone(),
            password: imap.password.clone(),
            mailbox: imap.mailbox.clone(),
            archive: archive.mailbox.clone(),
        }
    }

    /// Runs until `cancel` is triggered.
    ///
    /// Failing to open the first session is returned as an error, as is a
    /// server without IDLE support at any point. Other session failures are
    /// retried.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let mut state = State::IdleWatching(self.open_session().await?);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            state = match state {
                State::IdleWatching(mut session) => match session.idle(&cancel).await {
                    Ok(IdleEvent::Exists(count)) => State::Draining(session, count),
                    Ok(IdleEvent::Renew) => {
                        debug!(mailbox = %self.mailbox, "renewing idle watch");
                        State::IdleWatching(session)
                    }
                    Ok(IdleEvent::Cancelled) => {
                        if let Err(error) = session.logout().await {
                            debug!(%error, "logout failed");
                        }
                        info!("ingress stopped");
                        return Ok(());
                    }
                    Err(error) => {
                        warn!(%error, "lost mailbox watch");
                        State::Reconnecting
                    }
                },
                State::Draining(mut session, count) => match self.drain(&mut session, count).await {
                    Ok(()) => match session.announced_count() {
                        Some(count) if count > 0 => {
                            debug!(count, "messages arrived during the batch");
                            State::Draining(session, count)
                        }
                        _ => State::IdleWatching(session),
                    },
                    Err(error) => {
                        warn!(%error, "batch interrupted");
                        State::Reconnecting
                    }
                },
                State::Reconnecting => {
                    select! {
                        _ = cancel.cancelled() => {
                            info!("ingress stopped");
                            return Ok(());
                        }
                        _ = sleep(backoff) => {}
                    }
                    match self.open_session().await {
                        Ok(session) => {
                            info!(mailbox = %self.mailbox, "mailbox session restored");
                            backoff = INITIAL_BACKOFF;
                            State::IdleWatching(session)
                        }
                        Err(error) if error.is_fatal() => return Err(error.into()),
                        Err(error) => {
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                            warn!(%error, retry_in = ?backoff, "reconnect failed");
                            State::Reconnecting
                        }
                    }
                }
            };
        }
    }

    /// Connects, logs in and selects the watched mailbox.
    async fn open_session(&self) -> Result<M::Session, MailboxError> {
        let mut session = self
            .connector
            .connect(&self.username, self.password.expose())
            .await?;
        if !session.supports_idle() {
            return Err(MailboxError::IdleUnsupported);
        }
        let mailboxes = session.list_mailboxes().await?;
        debug!(?mailboxes, "available mailboxes");
        let count = session.select(&self.mailbox).await?;
        info!(mailbox = %self.mailbox, messages = count, "watching mailbox");
        Ok(session)
    }

    /// Processes messages `1..=count`, then archives them.
    ///
    /// Only session failures are returned; a message that fails to decode or
    /// inject is logged and skipped.
    async fn drain(&self, session: &mut M::Session, count: u32) -> Result<(), MailboxError> {
        if count == 0 {
            return Ok(());
        }
        let range = SeqRange::up_to(count);
        let messages = session.fetch(range).await?;
        info!(%range, fetched = messages.len(), "draining mailbox");
        for message in &messages {
            match self.ingest(message).await {
                Ok(0) => debug!(
                    seq = message.seq,
                    subject = ?message.subject,
                    "no frame in message"
                ),
                Ok(injected) => debug!(seq = message.seq, injected, "message processed"),
                Err(error) => warn!(seq = message.seq, %error, "skipping message"),
            }
        }
        self.archive(session, range).await
    }

    /// Injects every frame found in `message`, returning how many there were.
    ///
    /// Injection blocks on socket calls, so it runs on the blocking pool.
    async fn ingest(&self, message: &FetchedMessage) -> Result<usize, IngressError> {
        let mut injected = 0;
        for section in &message.sections {
            let Some(text) = extract_frame(section)? else {
                continue;
            };
            let raw = self.codec.decode(text)?;
            let packet = Packet::parse(&raw)?;
            let header = packet.header();
            debug!(
                seq = message.seq,
                src = %header.source,
                dst = %header.destination,
                protocol = header.protocol,
                len = packet.len(),
                "injecting packet",
            );
            let injector = self.injector.clone();
            task::spawn_blocking(move || injector.inject(&packet)).await??;
            injected += 1;
        }
        Ok(injected)
    }

    /// Moves `range` to the archive mailbox, creating it and retrying once if
    /// the first move is refused. A refused retry is only logged.
    async fn archive(
        &self,
        session: &mut M::Session,
        range: SeqRange,
    ) -> Result<(), MailboxError> {
        let error = match session.move_messages(range, &self.archive).await {
            Ok(()) => return Ok(()),
            Err(error @ MailboxError::Rejected { .. }) => error,
            Err(error) => return Err(error),
        };
        debug!(%error, archive = %self.archive, "archive move refused, creating mailbox");
        match session.create_mailbox(&self.archive).await {
            Ok(()) => info!(archive = %self.archive, "created archive mailbox"),
            Err(error @ MailboxError::Rejected { .. }) => debug!(%error, "create refused"),
            Err(error) => return Err(error),
        }
        match session.move_messages(range, &self.archive).await {
            Ok(()) => Ok(()),
            Err(error @ MailboxError::Rejected { .. }) => {
                warn!(%error, %range, "unable to archive processed messages");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}
