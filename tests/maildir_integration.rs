//! End-to-end exercises of the Maildir backend through the public
//! `MailboxStore`/`Mailbox` traits only (no internal `maildir::` types), mirroring
//! the teacher's black-box integration style.

use maildepot::{Flag, MailboxStore};
use std::collections::HashSet;
use test_log::test;

mod common;

#[test]
fn full_lifecycle_append_flag_expunge() {
  let (_dir, store) = common::maildir_store("alice");
  let inbox = store.open_mailbox("INBOX", false).unwrap();

  let uid1 = common::append(&*inbox, &common::message("first", "hello"));
  let uid2 = common::append(&*inbox, &common::message("second", "world"));
  assert_eq!(uid1 + 1, uid2);
  assert_eq!(2, inbox.message_count().unwrap());

  let mut seen = HashSet::new();
  seen.insert(Flag::Seen);
  inbox.set_flags(1, &seen, &HashSet::new(), true).unwrap();
  assert!(inbox.flags(1).unwrap().0.contains(&Flag::Seen));

  inbox.delete_message(1).unwrap();
  assert!(inbox.is_deleted(1).unwrap());
  assert_eq!(1, inbox.message_count().unwrap(), "deleted-but-unexpunged messages are excluded from message_count");

  let removed = inbox.expunge().unwrap();
  assert_eq!(vec![1], removed);
  assert_eq!(1, inbox.message_count().unwrap());
  assert_eq!(uid2, inbox.unique_id(1).unwrap());
}

#[test]
fn hierarchy_create_list_rename_delete() {
  let (_dir, store) = common::maildir_store("alice");
  store.create_mailbox("Projects").unwrap();
  store.create_mailbox("Projects/Active").unwrap();

  let listed = store.list_mailboxes("", "Projects*").unwrap();
  assert!(listed.contains(&"Projects".to_string()));
  assert!(listed.contains(&"Projects/Active".to_string()));

  assert!(matches!(
    store.delete_mailbox("Projects"),
    Err(maildepot::Error::HasChildren(_))
  ));

  store.rename_mailbox("Projects/Active", "Projects/Done").unwrap();
  let listed = store.list_mailboxes("", "Projects/*").unwrap();
  assert!(listed.contains(&"Projects/Done".to_string()));
  assert!(!listed.contains(&"Projects/Active".to_string()));

  store.delete_mailbox("Projects/Done").unwrap();
  store.delete_mailbox("Projects").unwrap();
}

#[test]
fn subscriptions_round_trip() {
  let (_dir, store) = common::maildir_store("alice");
  store.create_mailbox("Archive").unwrap();
  store.subscribe("Archive").unwrap();
  assert_eq!(vec!["Archive".to_string()], store.list_subscribed("", "*").unwrap());
  store.unsubscribe("Archive").unwrap();
  assert!(store.list_subscribed("", "*").unwrap().is_empty());
}

#[test]
fn copy_between_mailboxes_preserves_flags() {
  let (_dir, store) = common::maildir_store("alice");
  store.create_mailbox("Archive").unwrap();
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  common::append(&*inbox, &common::message("keep me", "body"));
  let mut flagged = HashSet::new();
  flagged.insert(Flag::Flagged);
  inbox.set_flags(1, &flagged, &HashSet::new(), true).unwrap();

  let set = maildepot::MessageSet::parse("1").unwrap();
  let result = inbox.copy(&set, "Archive").unwrap();
  assert_eq!(1, result.len());

  let archive = store.open_mailbox("Archive", false).unwrap();
  assert_eq!(1, archive.message_count().unwrap());
  assert!(archive.flags(1).unwrap().0.contains(&Flag::Flagged));
}

#[test]
fn state_survives_reopen_across_processes_simulated() {
  let (dir, store) = common::maildir_store("alice");
  {
    let inbox = store.open_mailbox("INBOX", false).unwrap();
    common::append(&*inbox, &common::message("persisted", "body"));
  }
  let reopened = maildepot::maildir::Store::open(dir.path(), "alice", '/').unwrap();
  let inbox = reopened.open_mailbox("INBOX", false).unwrap();
  assert_eq!(1, inbox.message_count().unwrap());
  assert_eq!(1, inbox.unique_id(1).unwrap());
}

#[test]
fn start_append_twice_without_end_is_invalid_state() {
  let (_dir, store) = common::maildir_store("alice");
  let inbox = store.open_mailbox("INBOX", false).unwrap();
  inbox
    .start_append(HashSet::new(), HashSet::new(), chrono::Local::now())
    .unwrap();
  let result = inbox.start_append(HashSet::new(), HashSet::new(), chrono::Local::now());
  assert!(matches!(result, Err(maildepot::Error::InvalidState(_))));
}
