//! Mail framing of packets.
//!
//! A frame is the region of a message body between [START_MARKER] and
//! [END_MARKER]. The two markers differ in their trailing dashes; both sides of
//! the tunnel must use them byte for byte.

use std::collections::BTreeMap;

use lettre::{
    message::{
        header::{ContentTransferEncoding, ContentType, HeaderName, HeaderValue},
        Body, Mailbox,
    },
    Message,
};

use crate::daemon::{
    codec::Codec,
    error::{DecodeError, SmtpError},
    packet::Packet,
};

pub const HEADER_PREFIX: &str = "X-IPOE-";
pub const START_MARKER: &str = "--- START IPOE ---\r\n";
pub const END_MARKER: &str = "--- END IPOE --\r\n";
/// Payload lines are wrapped at this width to stay within SMTP line limits.
pub const LINE_WIDTH: usize = 76;

/// A composed mail message, built once per outbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: String,
    pub from: String,
    pub recipients: Vec<String>,
    /// Header names already carry [HEADER_PREFIX].
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl MailMessage {
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            from: from.into(),
            recipients: Vec::new(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// Adds `name` under the [HEADER_PREFIX] namespace.
    pub fn add_header(&mut self, name: &str, value: impl ToString) -> &mut Self {
        self.headers
            .insert(format!("{HEADER_PREFIX}{name}"), value.to_string());
        self
    }

    /// Builds the RFC 5322 message, with `Date` and `Message-ID` filled in.
    ///
    /// The body is sent as 7bit text so the frame reaches the peer untouched.
    pub fn to_message(&self) -> Result<Message, SmtpError> {
        let mut builder = Message::builder()
            .from(self.from.parse::<Mailbox>()?)
            .subject(self.subject.clone())
            .message_id(None)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }
        for (name, value) in &self.headers {
            let header = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| SmtpError::HeaderName(name.clone()))?;
            builder = builder.raw_header(HeaderValue::new(header, value.clone()));
        }
        let body = Body::new_with_encoding(self.body.clone(), ContentTransferEncoding::SevenBit)
            .map_err(|_| SmtpError::Body)?;
        Ok(builder.body(body)?)
    }
}

/// Wraps an encoded payload in the frame markers, [LINE_WIDTH] characters per line.
pub fn frame_body(encoded: &str) -> String {
    let mut body = String::with_capacity(
        START_MARKER.len() + encoded.len() + encoded.len() / LINE_WIDTH * 2 + 2 + END_MARKER.len(),
    );
    body.push_str(START_MARKER);
    let mut rest = encoded;
    while rest.len() > LINE_WIDTH {
        let mut width = LINE_WIDTH;
        while !rest.is_char_boundary(width) {
            width -= 1;
        }
        let (line, tail) = rest.split_at(width);
        body.push_str(line);
        body.push_str("\r\n");
        rest = tail;
    }
    body.push_str(rest);
    body.push_str("\r\n");
    body.push_str(END_MARKER);
    body
}

/// Returns the text strictly between the first start marker and the end
/// marker that follows it.
///
/// `Ok(None)` means the body carries no frame at all.
pub fn extract_frame(body: &[u8]) -> Result<Option<&str>, DecodeError> {
    let Some(start) = find(body, START_MARKER.as_bytes()) else {
        return Ok(None);
    };
    let start = start + START_MARKER.len();
    let Some(len) = find(&body[start..], END_MARKER.as_bytes()) else {
        return Err(DecodeError::UnterminatedFrame);
    };
    Ok(Some(std::str::from_utf8(&body[start..start + len])?))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Composes the mail message that carries one packet.
#[derive(Debug, Clone)]
pub struct MailFrameBuilder<C> {
    from: String,
    codec: C,
    low_visibility: bool,
}

impl<C: Codec> MailFrameBuilder<C> {
    /// When `low_visibility` is set, the diagnostic `X-IPOE-*` headers are left out.
    pub fn new(from: impl Into<String>, codec: C, low_visibility: bool) -> Self {
        Self {
            from: from.into(),
            codec,
            low_visibility,
        }
    }

    pub fn compose(&self, packet: &Packet, recipient: String) -> MailMessage {
        let header = packet.header();
        let mut message = MailMessage::new(
            self.from.clone(),
            format!("{}->{} ({})", header.source, header.destination, header.protocol),
        );
        message.recipients.push(recipient);
        if !self.low_visibility {
            message
                .add_header("TTL", header.ttl)
                .add_header("SRC-IP", header.source)
                .add_header("DEST-IP", header.destination)
                .add_header("PROTO", header.protocol)
                .add_header("TOTLEN", header.total_len);
        }
        message.body = frame_body(&self.codec.encode(packet.bytes()));
        message
    }
}
