//! `maildepot` — a mailbox access core for a multi-protocol mail server.
//!
//! This crate is the storage-backed substrate POP3 and IMAP front-ends consume
//! after authentication: per-user hierarchical message stores, message metadata,
//! flag management, UID allocation, search evaluation, and concurrent session
//! isolation, over two on-disk backends (`mbox` and `maildir`).
//!
//! The wire parsers, session state machines, authentication realms and TLS are
//! owned by the protocol front-end and are not part of this crate.

mod error;
mod lock;
pub mod maildir;
pub mod mbox;
mod message;
mod message_set;
mod name_codec;
mod search;
mod store;

pub use error::{Error, Result};
pub use message::MessageContext;
pub use message_set::MessageSet;
pub use name_codec::{decode as decode_name, encode as encode_name, is_valid_encoded};
pub use search::{Expr as SearchExpression, ParseError as SearchParseError};
pub use store::{Descriptor, Mailbox, MailboxAttribute, MailboxStore};

use std::fmt;

/// One of the six closed-vocabulary message flags (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
  Seen,
  Answered,
  Flagged,
  Deleted,
  Draft,
  Recent,
}

impl Flag {
  pub const PERMANENT: [Flag; 5] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
  ];

  pub const ALL: [Flag; 6] = [
    Flag::Seen,
    Flag::Answered,
    Flag::Flagged,
    Flag::Deleted,
    Flag::Draft,
    Flag::Recent,
  ];

  /// Wire form: `\Seen`, `\Answered`, etc. (spec.md §6).
  pub fn wire_name(self) -> &'static str {
    match self {
      Flag::Seen => "\\Seen",
      Flag::Answered => "\\Answered",
      Flag::Flagged => "\\Flagged",
      Flag::Deleted => "\\Deleted",
      Flag::Draft => "\\Draft",
      Flag::Recent => "\\Recent",
    }
  }

  /// Case-insensitive parse of a wire-form flag name, `\`-prefix optional.
  pub fn parse(s: &str) -> Option<Self> {
    let s = s.strip_prefix('\\').unwrap_or(s);
    for flag in Self::ALL {
      if s.eq_ignore_ascii_case(flag.wire_name().trim_start_matches('\\')) {
        return Some(flag);
      }
    }
    None
  }

  /// The single Maildir filename letter for this flag (spec.md §4.3). `Recent`
  /// has no letter: it is never persisted.
  pub fn maildir_letter(self) -> Option<char> {
    match self {
      Flag::Draft => Some('D'),
      Flag::Flagged => Some('F'),
      Flag::Answered => Some('R'),
      Flag::Seen => Some('S'),
      Flag::Deleted => Some('T'),
      Flag::Recent => None,
    }
  }

  pub fn from_maildir_letter(letter: char) -> Option<Self> {
    match letter {
      'D' => Some(Flag::Draft),
      'F' => Some(Flag::Flagged),
      'R' => Some(Flag::Answered),
      'S' => Some(Flag::Seen),
      'T' => Some(Flag::Deleted),
      _ => None,
    }
  }
}

impl fmt::Display for Flag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.wire_name())
  }
}

/// A user-defined, case-sensitive, open-vocabulary message label, distinct from a
/// `Flag`.
pub type Keyword = String;

/// A 32-bit unique identifier, never reused within a mailbox.
pub type Uid = u32;

/// A mailbox's sequence number within an open handle: 1-based, dense, stable only
/// until the next `expunge()`.
pub type SequenceNumber = u32;
