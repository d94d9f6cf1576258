//! # ipoe: IP over Email
//!
//! **ipoe** carries IP packets inside email messages. Packets read from a
//! local TUN interface are encoded as text, framed in a mail body and sent
//! over SMTP to a subaddress of a shared mailbox. The other side watches that
//! mailbox over IMAP, decodes every frame it finds and writes the packet to
//! the network through a raw socket.
//!
//! ## How It Works
//! 1. **Egress**: each packet read from the interface is parsed, its
//!    destination is mapped to a mailbox (`tunnel@example.com` becomes
//!    `tunnel+10.0.0.2@example.com`), and the packet is mailed in its own
//!    message.
//! 2. **Ingress**: the receiver keeps an IMAP `IDLE` watch on the mailbox,
//!    fetches new messages when they arrive, injects the packets they carry,
//!    and moves the processed messages to an archive mailbox.
//!
//! ## Warning
//!
//! Every packet costs a full mail round trip. This is a toy, not a VPN, and
//! it gives you neither confidentiality nor anonymity beyond what your mail
//! provider offers.

pub mod config;
pub mod daemon;
