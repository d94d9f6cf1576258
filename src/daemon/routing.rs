//! Mapping of network destinations to mailbox addresses.

use crate::daemon::error::RoutingError;

/// Maps a destination network address to the mailbox that should receive it.
pub trait RoutingTable: Send + Sync {
    fn route(&self, destination: &str) -> Result<String, RoutingError>;
}

/// Routes every destination to one physical mailbox using subaddressing.
///
/// `tunnel@example.com` routes `10.0.0.2` to `tunnel+10.0.0.2@example.com`.
/// When the destination holds characters that are not allowed in a bare
/// local part (the colons of an IPv6 address) the local part is quoted:
/// `"tunnel+fd00::2"@example.com`. Destinations containing `+`, `@`, `"`,
/// `\` or whitespace are refused, since they would make the tag ambiguous.
#[derive(Debug, Clone)]
pub struct SameMailboxRouting {
    local_part: String,
    domain: String,
}

impl SameMailboxRouting {
    /// Splits `mailbox` at its first `@`.
    pub fn new(mailbox: &str) -> Result<Self, RoutingError> {
        let Some((local_part, domain)) = mailbox.split_once('@') else {
            return Err(RoutingError::MissingSeparator(mailbox.to_string()));
        };
        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }
}

impl RoutingTable for SameMailboxRouting {
    fn route(&self, destination: &str) -> Result<String, RoutingError> {
        if destination.is_empty()
            || destination
                .chars()
                .any(|c| matches!(c, '+' | '@' | '"' | '\\') || c.is_whitespace() || c.is_control())
        {
            return Err(RoutingError::UnroutableDestination(destination.to_string()));
        }
        let local_part = format!("{}+{}", self.local_part, destination);
        if local_part.chars().all(is_dot_atom_char) {
            Ok(format!("{}@{}", local_part, self.domain))
        } else {
            Ok(format!("\"{}\"@{}", local_part, self.domain))
        }
    }
}

/// Characters allowed in an unquoted RFC 5322 local part.
fn is_dot_atom_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c)
}
