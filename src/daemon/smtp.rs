//! Outbound mail sessions.
//!
//! [SmtpSession] is the narrow interface the transmitter drives.
//! [LettreSession] implements it on `lettre`'s async SMTP connection, issuing
//! one command per step so a failure keeps the step it happened in.

use std::{future::Future, time::Duration};

use lettre::{
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        commands::{Data, Mail, Rcpt},
        extension::ClientId,
    },
    Address,
};
use tracing::debug;

use crate::{config::SmtpConfig, daemon::error::SmtpError};

/// Upper bound on every network operation of a session.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Opens new outbound mail sessions.
pub trait SmtpConnector: Send + Sync {
    type Session: SmtpSession;

    /// Dials the server, reads its greeting and says hello.
    fn connect(&self) -> impl Future<Output = Result<Self::Session, SmtpError>> + Send;
}

/// One outbound mail session, from greeting to `QUIT`.
pub trait SmtpSession: Send {
    /// Upgrades the session to TLS and says hello again.
    fn start_tls(&mut self) -> impl Future<Output = Result<(), SmtpError>> + Send;

    fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), SmtpError>> + Send;

    fn mail_from(&mut self, sender: &str) -> impl Future<Output = Result<(), SmtpError>> + Send;

    fn rcpt_to(&mut self, recipient: &str) -> impl Future<Output = Result<(), SmtpError>> + Send;

    /// Sends `DATA` followed by the message; dot-stuffing is handled here.
    fn data(&mut self, data: &[u8]) -> impl Future<Output = Result<(), SmtpError>> + Send;

    fn quit(self) -> impl Future<Output = Result<(), SmtpError>> + Send;
}

/// Connects to the configured submission server over plain TCP.
///
/// Encryption, when configured, is negotiated later with `STARTTLS`.
#[derive(Debug, Clone)]
pub struct SmtpConnection {
    server: String,
    port: u16,
    helo_name: String,
}

impl SmtpConnection {
    pub fn new(config: &SmtpConfig) -> Self {
        Self {
            server: config.server.clone(),
            port: config.port,
            helo_name: config.helo_name.clone(),
        }
    }
}

impl SmtpConnector for SmtpConnection {
    type Session = LettreSession;

    async fn connect(&self) -> Result<LettreSession, SmtpError> {
        let hello_name = ClientId::Domain(self.helo_name.clone());
        let connection = AsyncSmtpConnection::connect_tokio1(
            (self.server.as_str(), self.port),
            Some(COMMAND_TIMEOUT),
            &hello_name,
            None,
            None,
        )
        .await?;
        debug!(server = %self.server, port = self.port, "mail session opened");
        Ok(LettreSession {
            connection,
            server: self.server.clone(),
            hello_name,
        })
    }
}

/// A session on a [lettre] SMTP connection.
pub struct LettreSession {
    connection: AsyncSmtpConnection,
    server: String,
    hello_name: ClientId,
}

impl SmtpSession for LettreSession {
    async fn start_tls(&mut self) -> Result<(), SmtpError> {
        if !self.connection.can_starttls() {
            return Err(SmtpError::Unsupported("STARTTLS"));
        }
        let parameters = TlsParameters::new(self.server.clone())?;
        self.connection
            .starttls(parameters, &self.hello_name)
            .await?;
        Ok(())
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), SmtpError> {
        let credentials = Credentials::new(username.to_string(), password.to_string());
        self.connection
            .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
            .await?;
        Ok(())
    }

    async fn mail_from(&mut self, sender: &str) -> Result<(), SmtpError> {
        let sender: Address = sender.parse()?;
        self.connection
            .command(Mail::new(Some(sender), Vec::new()))
            .await?;
        Ok(())
    }

    async fn rcpt_to(&mut self, recipient: &str) -> Result<(), SmtpError> {
        let recipient: Address = recipient.parse()?;
        self.connection
            .command(Rcpt::new(recipient, Vec::new()))
            .await?;
        Ok(())
    }

    async fn data(&mut self, data: &[u8]) -> Result<(), SmtpError> {
        self.connection.command(Data).await?;
        self.connection.message(data).await?;
        Ok(())
    }

    async fn quit(mut self) -> Result<(), SmtpError> {
        self.connection.quit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Accepts one client and answers like a submission server, refusing
    /// recipients with `rcpt_reply`. Returns every line the client sent.
    async fn scripted_server(rcpt_reply: &'static str) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            let mut in_data = false;
            write.write_all(b"220 mx.example.com ESMTP\r\n").await.unwrap();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply = if in_data {
                    in_data = line != ".";
                    if in_data {
                        ""
                    } else {
                        "250 queued\r\n"
                    }
                } else if line.starts_with("EHLO") {
                    "250-mx.example.com\r\n250 AUTH PLAIN LOGIN\r\n"
                } else if line.starts_with("AUTH") {
                    "235 accepted\r\n"
                } else if line.starts_with("MAIL") {
                    "250 ok\r\n"
                } else if line.starts_with("RCPT") {
                    rcpt_reply
                } else if line == "DATA" {
                    in_data = true;
                    "354 go ahead\r\n"
                } else if line == "QUIT" {
                    "221 bye\r\n"
                } else {
                    "500 unknown command\r\n"
                };
                received.push(line);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (port, server)
    }

    fn connection(port: u16) -> SmtpConnection {
        SmtpConnection::new(&SmtpConfig {
            server: "127.0.0.1".into(),
            port,
            starttls: false,
            ..SmtpConfig::default()
        })
    }

    #[tokio::test]
    async fn delivers_one_message() {
        let (port, server) = scripted_server("250 ok\r\n").await;
        let mut session = connection(port).connect().await.unwrap();
        session.authenticate("user", "secret").await.unwrap();
        session.mail_from("me@example.com").await.unwrap();
        session.rcpt_to("tunnel+10.0.0.2@example.com").await.unwrap();
        session
            .data(b"Subject: test\r\n\r\n.hidden\r\n--- START IPOE ---\r\nUElORw==\r\n")
            .await
            .unwrap();
        session.quit().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received[0], "EHLO localhost");
        assert_eq!(received[1], "AUTH PLAIN AHVzZXIAc2VjcmV0");
        assert_eq!(received[2], "MAIL FROM:<me@example.com>");
        assert_eq!(received[3], "RCPT TO:<tunnel+10.0.0.2@example.com>");
        assert_eq!(received[4], "DATA");
        assert!(received.contains(&"..hidden".to_string()));
        assert!(received.contains(&"UElORw==".to_string()));
        assert_eq!(received[received.len() - 2], ".");
        assert_eq!(received[received.len() - 1], "QUIT");
    }

    #[tokio::test]
    async fn refused_recipient_is_an_error() {
        let (port, server) = scripted_server("550 no such user\r\n").await;
        let mut session = connection(port).connect().await.unwrap();
        session.mail_from("me@example.com").await.unwrap();
        let error = session.rcpt_to("nobody@example.com").await.unwrap_err();
        assert!(matches!(error, SmtpError::Smtp(ref e) if e.is_permanent()));
        drop(session);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn starttls_requires_server_support() {
        let (port, server) = scripted_server("250 ok\r\n").await;
        let mut session = connection(port).connect().await.unwrap();
        let error = session.start_tls().await.unwrap_err();
        assert!(matches!(error, SmtpError::Unsupported("STARTTLS")));
        drop(session);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_sender_is_refused_before_sending() {
        let (port, server) = scripted_server("250 ok\r\n").await;
        let mut session = connection(port).connect().await.unwrap();
        let error = session.mail_from("not an address").await.unwrap_err();
        assert!(matches!(error, SmtpError::Address(_)));
        drop(session);
        let received = server.await.unwrap();
        assert!(!received.iter().any(|line| line.starts_with("MAIL")));
    }
}
