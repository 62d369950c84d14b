//! `SearchExpression` (component C6): the evaluated-against-`MessageContext` AST
//! for the IMAP `SEARCH` key grammar.
//!
//! Grounded on `source/message_set.rs`'s `Error::Parse` mapping pattern (same
//! `peg::error::ParseError` -> crate error translation) and on the teacher's
//! `Criteria`-less, direct boolean-tree evaluation style seen in
//! `other_examples/` POP3/IMAP crates; `matches` is a pure function over
//! `&MessageContext` so callers can pre-build one context per message and reuse
//! it across expressions (one query here, but extensible).

mod parser;

use crate::{Flag, MessageContext, MessageSet};
use chrono::NaiveDate;
use std::fmt;

#[derive(Debug, Clone)]
pub enum Expr {
  All,
  Flag(Flag, bool),
  Keyword(String, bool),
  Header(String, String),
  Body(String),
  Text(String),
  Before(NaiveDate),
  On(NaiveDate),
  Since(NaiveDate),
  SentBefore(NaiveDate),
  SentOn(NaiveDate),
  SentSince(NaiveDate),
  Larger(u64),
  Smaller(u64),
  SequenceSet(MessageSet),
  Uid(MessageSet),
  Not(Box<Expr>),
  And(Box<Expr>, Box<Expr>),
  Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct ParseError {
  pub position: usize,
  pub message: String,
}

impl fmt::Display for ParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "search expression error at byte {}: {}", self.position, self.message)
  }
}

impl std::error::Error for ParseError {}

fn contains_ci(haystack: &str, needle: &str) -> bool {
  if needle.is_empty() {
    return true;
  }
  haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl Expr {
  pub fn parse(input: &str) -> Result<Self, ParseError> {
    parser::parse(input)
  }

  /// Evaluates this expression against one message. `last` is the mailbox's
  /// current highest sequence number / UID, needed to resolve `*` in bare
  /// sequence or `UID` sets.
  pub fn matches(&self, ctx: &MessageContext) -> bool {
    self.matches_with_last(ctx, ctx.sequence_number(), ctx.uid())
  }

  /// Full form: `seq_last`/`uid_last` are the mailbox-wide maxima, distinct from
  /// this message's own sequence/UID, used to resolve `*`.
  pub fn matches_with_last(&self, ctx: &MessageContext, seq_last: crate::SequenceNumber, uid_last: crate::Uid) -> bool {
    match self {
      Expr::All => true,
      Expr::Flag(flag, present) => ctx.flags().contains(flag) == *present,
      Expr::Keyword(keyword, present) => ctx.keywords().contains(keyword) == *present,
      Expr::Header(name, value) => ctx
        .header(name)
        .ok()
        .flatten()
        .map(|actual| contains_ci(&actual, value))
        .unwrap_or(false),
      Expr::Body(needle) => ctx.body_text().map(|body| contains_ci(&body, needle)).unwrap_or(false),
      Expr::Text(needle) => {
        let in_headers = ctx.headers_text().map(|h| contains_ci(&h, needle)).unwrap_or(false);
        let in_body = ctx.body_text().map(|b| contains_ci(&b, needle)).unwrap_or(false);
        in_headers || in_body
      }
      Expr::Before(date) => ctx.internal_date().date_naive() < *date,
      Expr::On(date) => ctx.internal_date().date_naive() == *date,
      Expr::Since(date) => ctx.internal_date().date_naive() >= *date,
      Expr::SentBefore(date) => ctx.sent_date().ok().flatten().map(|d| d.date_naive() < *date).unwrap_or(false),
      Expr::SentOn(date) => ctx.sent_date().ok().flatten().map(|d| d.date_naive() == *date).unwrap_or(false),
      Expr::SentSince(date) => ctx.sent_date().ok().flatten().map(|d| d.date_naive() >= *date).unwrap_or(false),
      Expr::Larger(size) => ctx.size() > *size,
      Expr::Smaller(size) => ctx.size() < *size,
      Expr::SequenceSet(set) => set.contains(ctx.sequence_number(), seq_last),
      Expr::Uid(set) => set.contains(ctx.uid(), uid_last),
      Expr::Not(inner) => !inner.matches_with_last(ctx, seq_last, uid_last),
      Expr::And(a, b) => a.matches_with_last(ctx, seq_last, uid_last) && b.matches_with_last(ctx, seq_last, uid_last),
      Expr::Or(a, b) => a.matches_with_last(ctx, seq_last, uid_last) || b.matches_with_last(ctx, seq_last, uid_last),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn ctx(flags: &[Flag], body: &'static str) -> MessageContext {
    let raw: &'static str = body;
    MessageContext::new(
      1,
      1,
      raw.len() as u64,
      chrono::Local::now(),
      flags.iter().copied().collect(),
      HashSet::new(),
      Box::new(move || Ok(raw.as_bytes().to_vec())),
    )
  }

  #[test]
  fn all_matches_everything() {
    assert!(Expr::All.matches(&ctx(&[], "Subject: x\r\n\r\nbody")));
  }

  #[test]
  fn flag_atom_and_negation() {
    let c = ctx(&[Flag::Seen], "Subject: x\r\n\r\nbody");
    assert!(Expr::Flag(Flag::Seen, true).matches(&c));
    assert!(!Expr::Flag(Flag::Seen, false).matches(&c));
  }

  #[test]
  fn body_substring_is_case_insensitive() {
    let c = ctx(&[], "Subject: x\r\n\r\nHello World");
    assert!(Expr::Body("hello".to_string()).matches(&c));
    assert!(!Expr::Body("goodbye".to_string()).matches(&c));
  }

  #[test]
  fn and_or_not_compose() {
    let c = ctx(&[Flag::Seen], "Subject: x\r\n\r\nbody");
    let expr = Expr::parse("SEEN NOT FLAGGED").unwrap();
    assert!(expr.matches(&c));
    let expr = Expr::parse("OR UNSEEN SEEN").unwrap();
    assert!(expr.matches(&c));
  }

  #[test]
  fn internal_date_atom_uses_internal_date_not_sent_date() {
    // No `Date:` header, so a sent-date atom must evaluate to false while an
    // internal-date atom (backed by the append-time `internal_date`) matches.
    let c = ctx(&[], "Subject: x\r\n\r\nbody");
    let today = chrono::Local::now().date_naive();
    assert!(Expr::On(today).matches(&c));
    assert!(!Expr::SentOn(today).matches(&c));
  }

  #[test]
  fn size_atoms() {
    let c = ctx(&[], "0123456789");
    assert!(Expr::Larger(5).matches(&c));
    assert!(!Expr::Smaller(5).matches(&c));
  }
}
