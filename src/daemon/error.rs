//! Errors that can happen in the ipoe daemon.
//!
//! Per-item errors ([EgressError], [IngressError]) are logged by the loop that
//! produced them and the affected packet or message is dropped. [DaemonError]
//! is what reaches the supervisor and always stops the process.

use std::{fmt, io, net::IpAddr};

use thiserror::Error;

/// Errors produced while parsing an IP header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}

/// Errors produced while mapping a destination address to a mailbox.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("mailbox address {0:?} has no '@' separator")]
    MissingSeparator(String),
    #[error("destination {0:?} cannot be carried as a subaddress")]
    UnroutableDestination(String),
}

/// Errors produced while extracting or decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("frame is not valid text: {0}")]
    NotText(#[from] std::str::Utf8Error),
    #[error("frame start marker without a matching end marker")]
    UnterminatedFrame,
}

/// Errors produced while composing or delivering an outbound message.
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error(transparent)]
    Address(#[from] lettre::address::AddressError),
    #[error(transparent)]
    Message(#[from] lettre::error::Error),
    #[error("invalid header name {0:?}")]
    HeaderName(String),
    #[error("body cannot be sent as 7bit text")]
    Body,
    #[error("server does not offer {0}")]
    Unsupported(&'static str),
}

/// The step of a mail delivery round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    Compose,
    Dial,
    StartTls,
    Auth,
    MailFrom,
    Rcpt,
    Data,
    Quit,
}

impl fmt::Display for TransportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Compose => "compose",
            Self::Dial => "dial",
            Self::StartTls => "starttls",
            Self::Auth => "auth",
            Self::MailFrom => "mail from",
            Self::Rcpt => "rcpt to",
            Self::Data => "data",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

/// A mail delivery failure, tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("mail delivery failed during {stage}: {source}")]
pub struct TransportError {
    pub stage: TransportStage,
    #[source]
    pub source: SmtpError,
}

impl TransportError {
    /// Returns a closure that tags an [SmtpError] with `stage`, for use with `map_err`.
    pub fn at(stage: TransportStage) -> impl FnOnce(SmtpError) -> Self {
        move |source| Self { stage, source }
    }
}

/// Errors produced by a mailbox session.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Imap(#[from] async_imap::error::Error),
    #[error("{command} rejected: {text}")]
    Rejected { command: String, text: String },
    #[error("server does not support IDLE and polling is not implemented")]
    IdleUnsupported,
    #[error("connection closed by server")]
    Closed,
}

impl MailboxError {
    /// Whether the failure can never be fixed by reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IdleUnsupported)
    }
}

/// Errors produced while delivering a decoded packet to its destination.
#[derive(Debug, Error)]
pub enum ReinjectionError {
    #[error("unable to open a socket towards {destination}: {source}")]
    Open {
        destination: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("unable to write packet to {destination}: {source}")]
    Write {
        destination: IpAddr,
        #[source]
        source: io::Error,
    },
    #[error("short write to {destination}: {written} of {expected} bytes")]
    ShortWrite {
        destination: IpAddr,
        written: usize,
        expected: usize,
    },
}

/// Why an outbound packet was dropped.
#[derive(Debug, Error)]
pub enum EgressError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why an inbound message was skipped.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Reinjection(#[from] ReinjectionError),
    #[error("injection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Enum representing errors that stop the ipoe daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("unable to bind the tunnel interface: {0}")]
    Tun(#[from] tun::Error),
    #[error("tunnel interface read failed: {0}")]
    Interface(#[source] io::Error),
    #[error("tunnel interface closed")]
    InterfaceClosed,
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("a pipeline died unexpectedly")]
    Died,
}
