//! The abstract `Mailbox`/`MailboxStore` interface (component C7) and the shared
//! `Descriptor`/`MailboxAttribute` types it operates on.
//!
//! Grounded conceptually on `other_examples/.../arkCyber-A3Mailer__crates-pop3-src-
//! mailbox.rs.rs` for the overall shape (a descriptor table backing enumeration,
//! flags and deletion tracking) but re-expressed in this crate's own idiom: plain
//! `std::sync` primitives and `&self` interior mutability instead of `tokio`, since
//! spec.md §5 mandates blocking, thread-safe, synchronous semantics, matching the
//! teacher's own synchronous, multi-threaded model.
//!
//! Both backends (`maildir::Store`/`maildir::MailboxHandle` and
//! `mbox::Store`/`mbox::MailboxHandle`) implement these traits. A protocol
//! front-end holds `Box<dyn MailboxStore>` / `Box<dyn Mailbox>` so it never needs
//! to know which backend it is talking to.

use crate::{Error, Flag, Keyword, MessageContext, MessageSet, Result, SequenceNumber, Uid};
use chrono::{DateTime, Local};
use std::{collections, io};

/// Lightweight metadata about one message (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
  pub sequence: SequenceNumber,
  pub size: u64,
  pub uid: Uid,
}

/// The closed vocabulary of mailbox attributes (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxAttribute {
  Noinferiors,
  Noselect,
  Marked,
  Unmarked,
  HasChildren,
  HasNoChildren,
  Subscribed,
  NonExistent,
  Remote,
  All,
  Archive,
  Drafts,
  Flagged,
  Important,
  Junk,
  Sent,
  Trash,
}

/// Per-user hierarchy manager (spec.md §4.7.1). One instance per authenticated
/// session; the factory that produces it is backend-specific
/// (`maildir::Store::open`, `mbox::Store::open`).
pub trait MailboxStore: Send + Sync {
  /// Single character separating mailbox name segments; stable for the lifetime
  /// of the store.
  fn hierarchy_delimiter(&self) -> char;

  /// Mailbox names matching `reference` + `pattern` (`*` any, `%` any except the
  /// delimiter), in hierarchy order.
  fn list_mailboxes(&self, reference: &str, pattern: &str) -> Result<Vec<String>>;

  /// Subset of the user's subscription set matching `reference` + `pattern`.
  fn list_subscribed(&self, reference: &str, pattern: &str) -> Result<Vec<String>>;

  fn subscribe(&self, name: &str) -> Result<()>;
  fn unsubscribe(&self, name: &str) -> Result<()>;

  fn open_mailbox(&self, name: &str, read_only: bool) -> Result<Box<dyn Mailbox>>;
  fn create_mailbox(&self, name: &str) -> Result<()>;
  fn delete_mailbox(&self, name: &str) -> Result<()>;
  fn rename_mailbox(&self, old: &str, new: &str) -> Result<()>;
  fn mailbox_attributes(&self, name: &str) -> Result<collections::HashSet<MailboxAttribute>>;

  /// Releases any per-user locks. Idempotent.
  fn close(&self) -> Result<()>;
}

/// One open mailbox handle (spec.md §4.7.2). Safe to share across sessions/threads:
/// every method takes `&self` and backends guard mutable state internally.
pub trait Mailbox: Send + Sync {
  // -- Enumeration --
  fn message_count(&self) -> Result<usize>;
  fn mailbox_size(&self) -> Result<u64>;
  /// Ascending sequence order. `\Deleted`-marked messages are excluded from both
  /// this list and `message_count`/`mailbox_size` (spec.md §4.7.2); their entries
  /// only disappear from the mailbox entirely, filenames and all, at `expunge`.
  fn message_list(&self) -> Result<Vec<Descriptor>>;
  fn message(&self, n: SequenceNumber) -> Result<Descriptor>;

  // -- Content access --
  fn message_content(&self, n: SequenceNumber) -> Result<Box<dyn io::Read + Send>>;
  /// Headers + blank separator + first `body_lines` lines of body. `body_lines ==
  /// 0` means headers only; the separator is still emitted.
  fn message_top(&self, n: SequenceNumber, body_lines: usize) -> Result<Box<dyn io::Read + Send>>;
  fn message_context(&self, n: SequenceNumber) -> Result<MessageContext>;

  // -- Flags --
  fn flags(&self, n: SequenceNumber) -> Result<(collections::HashSet<Flag>, collections::HashSet<Keyword>)>;
  fn set_flags(
    &self,
    n: SequenceNumber,
    flags: &collections::HashSet<Flag>,
    keywords: &collections::HashSet<Keyword>,
    add: bool,
  ) -> Result<()>;
  fn replace_flags(
    &self,
    n: SequenceNumber,
    flags: collections::HashSet<Flag>,
    keywords: collections::HashSet<Keyword>,
  ) -> Result<()>;
  /// The flags this store can persist across sessions (excludes `Recent`).
  fn permanent_flags(&self) -> Vec<Flag>;

  // -- Deletion --
  fn delete_message(&self, n: SequenceNumber) -> Result<()>;
  fn is_deleted(&self, n: SequenceNumber) -> Result<bool>;
  /// POP3 RSET: clears all deletion marks.
  fn undelete_all(&self) -> Result<()>;
  /// Permanently removes marked messages; returns the ascending list of sequence
  /// numbers that were expunged, as observed at removal time.
  fn expunge(&self) -> Result<Vec<SequenceNumber>>;

  // -- UID surface --
  fn unique_id(&self, n: SequenceNumber) -> Result<Uid>;
  fn uid_validity(&self) -> Result<u32>;
  fn uid_next(&self) -> Result<Uid>;

  // -- Streaming APPEND --
  /// At most one append in flight per handle (spec.md invariant 4). Opens a
  /// temporary spool file; a second call before `end_append`/failure is an
  /// `Error::InvalidState`.
  fn start_append(
    &self,
    flags: collections::HashSet<Flag>,
    keywords: collections::HashSet<Keyword>,
    internal_date: DateTime<Local>,
  ) -> Result<()>;
  /// Streams `buf` to the spool. Only valid after `start_append`.
  fn append_content(&self, buf: &[u8]) -> Result<()>;
  /// Assigns `UID = uid_next()`, bumps `uid_next`, atomically publishes the spool,
  /// and returns the new UID. On any failure the spool is removed and the mailbox
  /// is left exactly as if `start_append` had never been called.
  fn end_append(&self) -> Result<Uid>;

  // -- Copy / move --
  /// Maps source sequence number to destination UID. Source sequence numbers are
  /// resolved against the descriptor snapshot taken when the call starts, under
  /// this mailbox's lock held for the call's duration (DESIGN.md Open Question 3).
  fn copy(&self, numbers: &MessageSet, destination: &str) -> Result<collections::HashMap<SequenceNumber, Uid>>;
  /// Semantically copy + mark-deleted on the source.
  fn move_messages(
    &self,
    numbers: &MessageSet,
    destination: &str,
  ) -> Result<collections::HashMap<SequenceNumber, Uid>>;

  // -- Search --
  fn search(&self, expr: &crate::SearchExpression) -> Result<Vec<SequenceNumber>>;

  /// Commits (`expunge == true`) or discards all deletion marks and releases
  /// locks.
  fn close(&self, expunge: bool) -> Result<Vec<SequenceNumber>>;
}

/// Shared default-evaluation `search` helper: iterate live descriptors, skipping
/// `\Deleted`-marked messages, build a `MessageContext`, ask `expr` to match
/// (spec.md §4.7.1: "iterates descriptors, skips deleted"). Backends that can't
/// do better call this from their own `search` implementation.
pub fn default_search(mailbox: &dyn Mailbox, expr: &crate::SearchExpression) -> Result<Vec<SequenceNumber>> {
  let mut matches = Vec::new();
  for descriptor in mailbox.message_list()? {
    if mailbox.is_deleted(descriptor.sequence)? {
      continue;
    }
    let ctx = mailbox.message_context(descriptor.sequence)?;
    if expr.matches(&ctx) {
      matches.push(descriptor.sequence);
    }
  }
  Ok(matches)
}

/// Validates a protocol-supplied mailbox name: non-empty, no leading/trailing
/// delimiter, no adjacent delimiters, and its NameCodec round-trip is lossless
/// (spec.md §3, §6).
pub fn validate_name(name: &str, delimiter: char) -> Result<()> {
  if name.is_empty() {
    return Err(Error::InvalidName(name.to_string()));
  }
  if name.starts_with(delimiter) || name.ends_with(delimiter) {
    return Err(Error::InvalidName(name.to_string()));
  }
  let mut previous = None;
  for ch in name.chars() {
    if ch == delimiter && previous == Some(delimiter) {
      return Err(Error::InvalidName(name.to_string()));
    }
    previous = Some(ch);
  }
  Ok(())
}
