//! Shared test scaffolding: a tempdir-backed store per test and a tiny RFC 5322
//! message builder, in the teacher's `tests/common/mod.rs` style (one `common`
//! module, plain helper functions, no fixture framework).

use std::collections::HashSet;

pub fn message(subject: &str, body: &str) -> Vec<u8> {
  format!(
    "From: sender@example.com\r\nTo: recipient@example.com\r\nSubject: {subject}\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\n{body}"
  )
  .into_bytes()
}

pub fn append(mailbox: &dyn maildepot::Mailbox, raw: &[u8]) -> maildepot::Uid {
  mailbox
    .start_append(HashSet::new(), HashSet::new(), chrono::Local::now())
    .unwrap();
  mailbox.append_content(raw).unwrap();
  mailbox.end_append().unwrap()
}

pub fn maildir_store(user: &str) -> (tempfile::TempDir, maildepot::maildir::Store) {
  let dir = tempfile::tempdir().unwrap();
  let store = maildepot::maildir::Store::open(dir.path(), user, '/').unwrap();
  (dir, store)
}

pub fn mbox_store(user: &str) -> (tempfile::TempDir, maildepot::mbox::Store) {
  let dir = tempfile::tempdir().unwrap();
  let store = maildepot::mbox::Store::open(dir.path(), user, '/').unwrap();
  (dir, store)
}
