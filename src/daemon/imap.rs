//! Mailbox sessions.
//!
//! [MailboxSession] is the narrow interface the receiver drives. [ImapSession]
//! implements it on an `async-imap` session, using IDLE (RFC 2177) and MOVE
//! (RFC 6851) when the server offers them.

use std::{fmt, future::Future, io, sync::Arc, time::Duration};

use async_imap::{
    error::Error as ImapError,
    extensions::idle::IdleResponse,
    types::{Fetch, UnsolicitedResponse},
    Client, Session,
};
use futures::TryStreamExt;
use imap_proto::{MailboxDatum, Response};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    time::Instant,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{config::ImapConfig, daemon::error::MailboxError};

/// Fetched for every message: the envelope carries the subject.
const FETCH_ITEMS: &str = "(ENVELOPE BODY.PEEK[TEXT])";

/// IDLE is renewed before the 30 minute server timeout of RFC 2177.
pub const IDLE_RENEWAL: Duration = Duration::from_secs(29 * 60);

/// An inclusive range of message sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub first: u32,
    pub last: u32,
}

impl SeqRange {
    /// Every message from the first up to `count`.
    pub fn up_to(count: u32) -> Self {
        Self { first: 1, last: count }
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.first, self.last)
    }
}

/// What ended a long-poll wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The mailbox now holds this many messages.
    Exists(u32),
    /// The wait hit [IDLE_RENEWAL] and should be re-issued.
    Renew,
    Cancelled,
}

/// A message returned by a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub seq: u32,
    pub subject: Option<String>,
    /// Raw body sections, in the order the server sent them.
    pub sections: Vec<Vec<u8>>,
}

/// Opens new mailbox sessions.
pub trait MailboxConnector: Send + Sync {
    type Session: MailboxSession;

    /// Dials the server and logs in.
    fn connect(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Self::Session, MailboxError>> + Send;
}

/// An authenticated connection to a mail store.
pub trait MailboxSession: Send {
    fn supports_idle(&self) -> bool;

    fn list_mailboxes(&mut self) -> impl Future<Output = Result<Vec<String>, MailboxError>> + Send;

    /// Selects `mailbox` and returns how many messages it holds.
    fn select(&mut self, mailbox: &str) -> impl Future<Output = Result<u32, MailboxError>> + Send;

    /// Blocks until the server reports messages, the renewal timer fires, or
    /// `cancel` is triggered. The watch is closed before returning.
    fn idle(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<IdleEvent, MailboxError>> + Send;

    fn fetch(
        &mut self,
        range: SeqRange,
    ) -> impl Future<Output = Result<Vec<FetchedMessage>, MailboxError>> + Send;

    fn move_messages(
        &mut self,
        range: SeqRange,
        mailbox: &str,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    fn create_mailbox(
        &mut self,
        mailbox: &str,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// The mailbox size the server announced outside of IDLE since the last
    /// call, net of expunges announced after it.
    fn announced_count(&mut self) -> Option<u32>;

    fn logout(self) -> impl Future<Output = Result<(), MailboxError>> + Send;
}

/// Streams a mailbox session can run over.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send> ImapStream for T {}

/// A logged-in `async-imap` session.
pub struct ImapSession<T: ImapStream> {
    /// Empty while IDLE owns the session, and for good if IDLE failed.
    session: Option<Session<T>>,
    idle: bool,
    moves: bool,
    announced: Option<u32>,
}

impl<T: ImapStream> ImapSession<T> {
    /// Logs in on `client` and reads the server capabilities.
    pub async fn login(
        client: Client<T>,
        username: &str,
        password: &str,
    ) -> Result<Self, MailboxError> {
        let mut session = client
            .login(username, password)
            .await
            .map_err(|(error, _)| failed("LOGIN")(error))?;
        let capabilities = session.capabilities().await.map_err(failed("CAPABILITY"))?;
        let idle = capabilities.has_str("IDLE");
        let moves = capabilities.has_str("MOVE");
        debug!(idle, moves, "logged in");
        Ok(Self {
            session: Some(session),
            idle,
            moves,
            announced: None,
        })
    }

    fn session(&mut self) -> Result<&mut Session<T>, MailboxError> {
        self.session.as_mut().ok_or(MailboxError::Closed)
    }

    /// Folds the untagged `EXISTS`/`EXPUNGE` responses queued by the last
    /// commands into [Self::announced].
    fn collect_announcements(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(count) => self.announced = Some(count),
                UnsolicitedResponse::Expunge(_) => {
                    if let Some(announced) = &mut self.announced {
                        *announced = announced.saturating_sub(1);
                    }
                }
                other => trace!(response = ?other, "ignoring unsolicited response"),
            }
        }
    }

    fn forget_expunged(&mut self, count: usize) {
        if let Some(announced) = &mut self.announced {
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            *announced = announced.saturating_sub(count);
        }
    }
}

impl<T: ImapStream> MailboxSession for ImapSession<T> {
    fn supports_idle(&self) -> bool {
        self.idle
    }

    async fn list_mailboxes(&mut self) -> Result<Vec<String>, MailboxError> {
        let names: Vec<String> = self
            .session()?
            .list(Some(""), Some("*"))
            .await
            .map_err(failed("LIST"))?
            .map_ok(|name| name.name().to_string())
            .try_collect()
            .await
            .map_err(failed("LIST"))?;
        self.collect_announcements();
        Ok(names)
    }

    async fn select(&mut self, mailbox: &str) -> Result<u32, MailboxError> {
        let selected = self
            .session()?
            .select(mailbox)
            .await
            .map_err(failed("SELECT"))?;
        self.collect_announcements();
        self.announced = None;
        Ok(selected.exists)
    }

    async fn idle(&mut self, cancel: &CancellationToken) -> Result<IdleEvent, MailboxError> {
        let session = self.session.take().ok_or(MailboxError::Closed)?;
        let mut handle = session.idle();
        handle.init().await.map_err(failed("IDLE"))?;
        let deadline = Instant::now() + IDLE_RENEWAL;
        let event = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = {
                let (wait, _interrupt) = handle.wait_with_timeout(remaining);
                select! {
                    response = wait => response.map_err(failed("IDLE"))?,
                    _ = cancel.cancelled() => break IdleEvent::Cancelled,
                }
            };
            match response {
                IdleResponse::Timeout => break IdleEvent::Renew,
                IdleResponse::ManualInterrupt => break IdleEvent::Cancelled,
                IdleResponse::NewData(data) => match data.parsed() {
                    Response::MailboxData(MailboxDatum::Exists(count)) if *count > 0 => {
                        break IdleEvent::Exists(*count)
                    }
                    other => trace!(response = ?other, "ignoring response while idling"),
                },
            }
        };
        self.session = Some(handle.done().await.map_err(failed("DONE"))?);
        Ok(event)
    }

    async fn fetch(&mut self, range: SeqRange) -> Result<Vec<FetchedMessage>, MailboxError> {
        let fetches: Vec<Fetch> = self
            .session()?
            .fetch(range.to_string(), FETCH_ITEMS)
            .await
            .map_err(failed("FETCH"))?
            .try_collect()
            .await
            .map_err(failed("FETCH"))?;
        self.collect_announcements();
        Ok(fetches.iter().map(fetched_message).collect())
    }

    async fn move_messages(&mut self, range: SeqRange, mailbox: &str) -> Result<(), MailboxError> {
        let set = range.to_string();
        if self.moves {
            self.session()?
                .mv(&set, mailbox)
                .await
                .map_err(failed("MOVE"))?;
            self.collect_announcements();
            return Ok(());
        }
        let session = self.session()?;
        session.copy(&set, mailbox).await.map_err(failed("COPY"))?;
        session
            .store(&set, "+FLAGS.SILENT (\\Deleted)")
            .await
            .map_err(failed("STORE"))?
            .try_collect::<Vec<Fetch>>()
            .await
            .map_err(failed("STORE"))?;
        let expunged: Vec<u32> = session
            .expunge()
            .await
            .map_err(failed("EXPUNGE"))?
            .try_collect()
            .await
            .map_err(failed("EXPUNGE"))?;
        self.collect_announcements();
        self.forget_expunged(expunged.len());
        Ok(())
    }

    async fn create_mailbox(&mut self, mailbox: &str) -> Result<(), MailboxError> {
        self.session()?
            .create(mailbox)
            .await
            .map_err(failed("CREATE"))?;
        self.collect_announcements();
        Ok(())
    }

    fn announced_count(&mut self) -> Option<u32> {
        self.collect_announcements();
        self.announced.take()
    }

    async fn logout(self) -> Result<(), MailboxError> {
        if let Some(mut session) = self.session {
            session.logout().await.map_err(failed("LOGOUT"))?;
        }
        Ok(())
    }
}

/// Tags a server refusal with the command it answered.
fn failed(command: &'static str) -> impl FnOnce(ImapError) -> MailboxError {
    move |error| match error {
        ImapError::No(text) | ImapError::Bad(text) => MailboxError::Rejected {
            command: command.to_string(),
            text,
        },
        error => MailboxError::Imap(error),
    }
}

fn fetched_message(fetch: &Fetch) -> FetchedMessage {
    let subject = fetch
        .envelope()
        .and_then(|envelope| envelope.subject.as_deref())
        .map(|subject| String::from_utf8_lossy(subject).into_owned());
    FetchedMessage {
        seq: fetch.message,
        subject,
        sections: fetch.text().map(|text| vec![text.to_vec()]).unwrap_or_default(),
    }
}

/// Connects to the configured mail store, over implicit TLS unless disabled.
#[derive(Clone)]
pub struct ImapConnection {
    server: String,
    port: u16,
    tls: Option<TlsConnector>,
}

impl ImapConnection {
    pub fn new(config: &ImapConfig) -> Self {
        Self {
            server: config.server.clone(),
            port: config.port,
            tls: config.tls.then(tls_connector),
        }
    }
}

impl MailboxConnector for ImapConnection {
    type Session = ImapSession<Box<dyn ImapStream>>;

    async fn connect(&self, username: &str, password: &str) -> Result<Self::Session, MailboxError> {
        let stream = TcpStream::connect((self.server.as_str(), self.port)).await?;
        let stream: Box<dyn ImapStream> = match &self.tls {
            Some(connector) => {
                let server_name = rustls::ServerName::try_from(self.server.as_str())
                    .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
                Box::new(connector.connect(server_name, stream).await?)
            }
            None => Box::new(stream),
        };
        debug!(server = %self.server, port = self.port, "mailbox connection opened");
        ImapSession::login(Client::new(stream), username, password).await
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    const GREETING: &str = "* OK IMAP4rev1 ready\r\n";
    const LOGIN: (&str, &str) = ("LOGIN", "{tag} OK logged in\r\n");

    /// Plays the server side of a session. Each step names the command
    /// expected next and the reply to it; `{tag}` stands for the tag of that
    /// command, or of the IDLE being closed when the command is `DONE`.
    /// Returns every line the client sent.
    async fn serve(
        stream: DuplexStream,
        greeting: &'static str,
        script: Vec<(&'static str, &'static str)>,
    ) -> Vec<String> {
        let (read, mut write) = split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();
        let mut tag = String::new();
        write.write_all(greeting.as_bytes()).await.unwrap();
        for (command, reply) in script {
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains(command), "expected {command}, got {line:?}");
            if line != "DONE" {
                tag = line.split(' ').next().unwrap().to_string();
            }
            write
                .write_all(reply.replace("{tag}", &tag).as_bytes())
                .await
                .unwrap();
            received.push(line);
        }
        received
    }

    async fn logged_in(
        capabilities: &'static str,
        script: Vec<(&'static str, &'static str)>,
    ) -> (ImapSession<DuplexStream>, JoinHandle<Vec<String>>) {
        let (client, server) = duplex(16 * 1024);
        let mut steps = vec![LOGIN, ("CAPABILITY", capabilities)];
        steps.extend(script);
        let server = tokio::spawn(serve(server, GREETING, steps));
        let session = ImapSession::login(Client::new(client), "me", "secret")
            .await
            .unwrap();
        (session, server)
    }

    const IDLE_AND_MOVE: &str = "* CAPABILITY IMAP4rev1 IDLE MOVE\r\n{tag} OK\r\n";
    const PLAIN: &str = "* CAPABILITY IMAP4rev1\r\n{tag} OK\r\n";

    #[tokio::test]
    async fn logs_in_and_reads_capabilities() {
        let (session, server) = logged_in(IDLE_AND_MOVE, vec![]).await;
        assert!(session.supports_idle());
        let received = server.await.unwrap();
        assert!(received[0].ends_with("LOGIN \"me\" \"secret\""));
    }

    #[tokio::test]
    async fn refused_login_is_rejected() {
        let (client, server) = duplex(4096);
        let server = tokio::spawn(serve(
            server,
            GREETING,
            vec![("LOGIN", "{tag} NO [AUTHENTICATIONFAILED] invalid credentials\r\n")],
        ));
        let result = ImapSession::login(Client::new(client), "me", "wrong").await;
        assert!(matches!(
            result,
            Err(MailboxError::Rejected { ref command, .. }) if command == "LOGIN"
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_literal_fails_without_allocating() {
        let (client, server) = duplex(4096);
        let server = tokio::spawn(serve(
            server,
            "* 1 FETCH (BODY[TEXT] {18446744073709551615}\r\n",
            vec![],
        ));
        let login = ImapSession::login(Client::new(client), "me", "secret");
        let result = timeout(Duration::from_secs(5), login).await;
        assert!(matches!(result, Ok(Err(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lists_and_selects() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![
                (
                    "LIST",
                    "* LIST () \"/\" INBOX\r\n* LIST () \"/\" IPOE-Processed\r\n{tag} OK\r\n",
                ),
                (
                    "SELECT",
                    "* 3 EXISTS\r\n* 0 RECENT\r\n{tag} OK [READ-WRITE] SELECT completed\r\n",
                ),
            ],
        )
        .await;
        assert_eq!(
            session.list_mailboxes().await.unwrap(),
            ["INBOX", "IPOE-Processed"]
        );
        assert_eq!(session.select("INBOX").await.unwrap(), 3);
        assert_eq!(session.announced_count(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn idle_reports_new_messages() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![
                ("IDLE", "+ idling\r\n* 1 EXPUNGE\r\n* 2 EXISTS\r\n"),
                ("DONE", "{tag} OK IDLE terminated\r\n"),
            ],
        )
        .await;
        let event = session.idle(&CancellationToken::new()).await.unwrap();
        assert_eq!(event, IdleEvent::Exists(2));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_is_renewed_before_the_server_timeout() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![
                ("IDLE", "+ idling\r\n"),
                ("DONE", "{tag} OK IDLE terminated\r\n"),
            ],
        )
        .await;
        let start = Instant::now();
        let event = session.idle(&CancellationToken::new()).await.unwrap();
        assert_eq!(event, IdleEvent::Renew);
        assert!(start.elapsed() >= IDLE_RENEWAL);
        assert!(start.elapsed() < Duration::from_secs(30 * 60));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_idle_is_closed() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![
                ("IDLE", "+ idling\r\n"),
                ("DONE", "{tag} OK IDLE terminated\r\n"),
                ("LOGOUT", "{tag} OK LOGOUT completed\r\n"),
            ],
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(session.idle(&cancel).await.unwrap(), IdleEvent::Cancelled);
        session.logout().await.unwrap();
        let received = server.await.unwrap();
        assert_eq!(received.last().unwrap().split(' ').nth(1), Some("LOGOUT"));
    }

    #[tokio::test]
    async fn fetch_reads_subject_and_text() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![(
                "FETCH 1:1 (ENVELOPE BODY.PEEK[TEXT])",
                "* 1 FETCH (ENVELOPE (NIL \"10.0.0.1->10.0.0.2 (1)\" \
                 NIL NIL NIL NIL NIL NIL NIL NIL) BODY[TEXT] {7}\r\nhello\r\n)\r\n{tag} OK\r\n",
            )],
        )
        .await;
        let messages = session.fetch(SeqRange::up_to(1)).await.unwrap();
        assert_eq!(
            messages,
            [FetchedMessage {
                seq: 1,
                subject: Some("10.0.0.1->10.0.0.2 (1)".into()),
                sections: vec![b"hello\r\n".to_vec()],
            }]
        );
        assert_eq!(session.announced_count(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn arrivals_during_a_batch_are_announced() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![
                (
                    "FETCH",
                    "* 1 FETCH (BODY[TEXT] {2}\r\nhi)\r\n* 2 EXISTS\r\n{tag} OK\r\n",
                ),
                ("MOVE 1:1 ", "* 1 EXPUNGE\r\n{tag} OK\r\n"),
            ],
        )
        .await;
        session.fetch(SeqRange::up_to(1)).await.unwrap();
        session
            .move_messages(SeqRange::up_to(1), "IPOE-Processed")
            .await
            .unwrap();
        assert_eq!(session.announced_count(), Some(1));
        assert_eq!(session.announced_count(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn move_without_server_support_falls_back_to_copy() {
        let (mut session, server) = logged_in(
            PLAIN,
            vec![
                ("COPY 1:2 ", "{tag} OK\r\n"),
                ("STORE 1:2 +FLAGS.SILENT (\\Deleted)", "{tag} OK\r\n"),
                ("EXPUNGE", "* 1 EXPUNGE\r\n* 1 EXPUNGE\r\n{tag} OK\r\n"),
            ],
        )
        .await;
        assert!(!session.supports_idle());
        session
            .move_messages(SeqRange::up_to(2), "IPOE-Processed")
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_move_is_rejected() {
        let (mut session, server) = logged_in(
            IDLE_AND_MOVE,
            vec![("MOVE", "{tag} NO [TRYCREATE] no such mailbox\r\n")],
        )
        .await;
        let error = session
            .move_messages(SeqRange::up_to(1), "IPOE-Processed")
            .await
            .unwrap_err();
        assert!(matches!(error, MailboxError::Rejected { ref command, .. } if command == "MOVE"));
        server.await.unwrap();
    }

    #[test]
    fn ranges_are_inclusive() {
        assert_eq!(SeqRange::up_to(4).to_string(), "1:4");
    }
}
