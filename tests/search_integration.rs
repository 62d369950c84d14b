//! Exercises `SearchExpression::parse` and `Mailbox::search` together against
//! real appended messages, through the public trait surface only.

use maildepot::{Flag, MailboxStore, SearchExpression};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use test_log::test;

mod common;

#[test]
fn flag_atom_matches_flagged_messages() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("one", "body one"));
  common::append(&*inbox, &common::message("two", "body two"));

  let mut flagged = HashSet::new();
  flagged.insert(Flag::Flagged);
  inbox.set_flags(2, &flagged, &HashSet::new(), true).unwrap();

  let expr = SearchExpression::parse("FLAGGED").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse("UNFLAGGED").unwrap();
  assert_eq!(vec![1], inbox.search(&expr).unwrap());
}

#[test]
fn header_and_body_atoms_match_substrings() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("quarterly report", "see attached numbers"));
  common::append(&*inbox, &common::message("lunch plans", "bring the usual suspects"));

  let expr = SearchExpression::parse("HEADER Subject \"quarterly\"").unwrap();
  assert_eq!(vec![1], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse("BODY \"suspects\"").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse("TEXT \"plans\"").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());
}

#[test]
fn boolean_composition_and_or_not() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("alpha", "x"));
  common::append(&*inbox, &common::message("beta", "y"));
  common::append(&*inbox, &common::message("gamma", "z"));

  let mut seen = HashSet::new();
  seen.insert(Flag::Seen);
  inbox.set_flags(1, &seen, &HashSet::new(), true).unwrap();
  inbox.set_flags(3, &seen, &HashSet::new(), true).unwrap();

  let expr = SearchExpression::parse("SEEN HEADER Subject \"alpha\"").unwrap();
  assert_eq!(vec![1], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse("OR HEADER Subject \"beta\" HEADER Subject \"gamma\"").unwrap();
  let mut got = inbox.search(&expr).unwrap();
  got.sort();
  assert_eq!(vec![2, 3], got);

  let expr = SearchExpression::parse("NOT SEEN").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());
}

#[test]
fn size_atoms_compare_message_size() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("short", "x"));
  common::append(&*inbox, &common::message("long", &"y".repeat(500)));

  let expr = SearchExpression::parse("LARGER 300").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse("SMALLER 300").unwrap();
  assert_eq!(vec![1], inbox.search(&expr).unwrap());
}

#[test]
fn sequence_set_and_uid_atoms() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  let uid1 = common::append(&*inbox, &common::message("one", "x"));
  common::append(&*inbox, &common::message("two", "y"));
  common::append(&*inbox, &common::message("three", "z"));

  let expr = SearchExpression::parse("2:3").unwrap();
  assert_eq!(vec![2, 3], inbox.search(&expr).unwrap());

  let expr = SearchExpression::parse(&format!("UID {uid1}")).unwrap();
  assert_eq!(vec![1], inbox.search(&expr).unwrap());
}

#[test]
fn all_skips_deleted_messages() {
  let (_dir, store) = common::maildir_store("carol");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("one", "x"));
  common::append(&*inbox, &common::message("two", "y"));
  inbox.delete_message(1).unwrap();

  let expr = SearchExpression::parse("ALL").unwrap();
  assert_eq!(vec![2], inbox.search(&expr).unwrap());
}

#[test]
fn garbage_expression_is_rejected() {
  assert!(SearchExpression::parse("NOT NOT NOT (((").is_err());
}
