//! Delivery of composed mail messages.

use tracing::{debug, warn};

use crate::{
    config::{Secret, SmtpConfig},
    daemon::{
        error::{TransportError, TransportStage},
        frame::MailMessage,
        smtp::{SmtpConnector, SmtpSession},
    },
};

/// Delivers one message per call, over a fresh session each time.
pub struct MailTransmitter<C> {
    connector: C,
    starttls: bool,
    credentials: Option<(String, Secret)>,
}

impl<C: SmtpConnector> MailTransmitter<C> {
    /// Authentication is skipped when no username is configured.
    pub fn new(connector: C, config: &SmtpConfig) -> Self {
        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));
        Self {
            connector,
            starttls: config.starttls,
            credentials,
        }
    }

    /// Builds the message, then runs a full session: dial, optional STARTTLS,
    /// auth, envelope, data and quit. The first failing step is reported with
    /// its stage.
    pub async fn send(&self, message: &MailMessage) -> Result<(), TransportError> {
        let data = message
            .to_message()
            .map_err(TransportError::at(TransportStage::Compose))?
            .formatted();
        let mut session = self
            .connector
            .connect()
            .await
            .map_err(TransportError::at(TransportStage::Dial))?;
        if self.starttls {
            session
                .start_tls()
                .await
                .map_err(TransportError::at(TransportStage::StartTls))?;
        }
        if let Some((username, password)) = &self.credentials {
            session
                .authenticate(username, password.expose())
                .await
                .map_err(TransportError::at(TransportStage::Auth))?;
        }
        session
            .mail_from(&message.from)
            .await
            .map_err(TransportError::at(TransportStage::MailFrom))?;
        for recipient in &message.recipients {
            session
                .rcpt_to(recipient)
                .await
                .map_err(TransportError::at(TransportStage::Rcpt))?;
        }
        session
            .data(&data)
            .await
            .map_err(TransportError::at(TransportStage::Data))?;
        // The message is accepted once DATA succeeds.
        if let Err(error) = session.quit().await {
            warn!(%error, "mail session did not close cleanly");
        }
        debug!(recipients = ?message.recipients, subject = %message.subject, "mail delivered");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::RecordingConnector, *};
    use crate::{config::Secret, daemon::frame::frame_body};

    fn config(starttls: bool, username: &str) -> SmtpConfig {
        SmtpConfig {
            server: "mx.example.com".into(),
            starttls,
            username: username.into(),
            password: Secret::new("hunter2"),
            ..SmtpConfig::default()
        }
    }

    fn message() -> MailMessage {
        let mut message = MailMessage::new("me@example.com", "10.0.0.1->10.0.0.2 (1)");
        message.recipients.push("tunnel+10.0.0.2@example.com".into());
        message.body = frame_body("UElORw==");
        message
    }

    #[tokio::test]
    async fn runs_full_session_in_order() {
        let connector = RecordingConnector::default();
        let transmitter = MailTransmitter::new(connector.clone(), &config(true, "me"));
        transmitter.send(&message()).await.unwrap();

        let calls = connector.calls.lock().unwrap().clone();
        assert_eq!(
            calls[..5],
            [
                "connect",
                "starttls",
                "auth me hunter2",
                "mail me@example.com",
                "rcpt tunnel+10.0.0.2@example.com",
            ]
        );
        assert!(calls[5].contains("Subject: 10.0.0.1->10.0.0.2 (1)\r\n"));
        assert!(calls[5].ends_with("--- START IPOE ---\r\nUElORw==\r\n--- END IPOE --\r\n"));
        assert_eq!(calls[6], "quit");
    }

    #[tokio::test]
    async fn skips_optional_steps() {
        let connector = RecordingConnector::default();
        let transmitter = MailTransmitter::new(connector.clone(), &config(false, ""));
        transmitter.send(&message()).await.unwrap();

        let calls = connector.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|call| call == "starttls" || call.starts_with("auth")));
    }

    #[tokio::test]
    async fn reports_failing_stage() {
        for stage in [
            TransportStage::Dial,
            TransportStage::StartTls,
            TransportStage::Auth,
            TransportStage::MailFrom,
            TransportStage::Rcpt,
            TransportStage::Data,
        ] {
            let connector = RecordingConnector {
                fail_at: Some(stage),
                ..RecordingConnector::default()
            };
            let transmitter = MailTransmitter::new(connector, &config(true, "me"));
            let error = transmitter.send(&message()).await.unwrap_err();
            assert_eq!(error.stage, stage);
        }
    }

    #[tokio::test]
    async fn unbuildable_message_never_dials() {
        let connector = RecordingConnector::default();
        let transmitter = MailTransmitter::new(connector.clone(), &config(true, "me"));
        let mut message = message();
        message.from = "not an address".into();
        let error = transmitter.send(&message).await.unwrap_err();
        assert_eq!(error.stage, TransportStage::Compose);
        assert!(connector.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_quit_still_counts_as_delivered() {
        let connector = RecordingConnector {
            fail_at: Some(TransportStage::Quit),
            ..RecordingConnector::default()
        };
        let transmitter = MailTransmitter::new(connector, &config(true, "me"));
        assert!(transmitter.send(&message()).await.is_ok());
    }
}
