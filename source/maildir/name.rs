//! Maildir filename grammar (component C3): Courier/qmail convention.
//!
//! ```text
//! filename := timestamp "." unique [ ",S=" size ] [ ":2," flags ]
//! flags    := flag-char*
//! ```
//!
//! Grounded on the teacher's `source/maildir.rs` (`tmp_named`, `cur`, the module's
//! own citations of `cr.yp.to/proto/maildir.html`), generalised from the teacher's
//! UUID-based uniqueness (acceptable for a sync client that never needs to be
//! re-parsed by another reader) to the classic `<pid>.<counter>` unique part that
//! spec.md §4.3 requires, since here the filename format is itself a first-class,
//! re-parsed entity rather than an opaque token.

use crate::Flag;
use std::{
  process,
  sync::atomic::{AtomicU64, Ordering},
};

static COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaildirName {
  pub timestamp: u64,
  pub unique: String,
  pub size: Option<u64>,
  pub flags: Vec<Flag>,
  pub keywords: Vec<usize>,
}

peg::parser! {
  grammar parser() for str {
    rule digits() -> &'input str = $(['0'..='9']+)

    rule size() -> u64
      = ",S=" n:digits() {? n.parse().or(Err("size")) }

    rule flag_char() -> char
      = c:['D' | 'F' | 'R' | 'S' | 'T' | 'a'..='z'] { c }

    rule flags() -> Vec<char>
      = ":2," f:flag_char()* { f }

    pub rule filename() -> (u64, &'input str, Option<u64>, Vec<char>)
      = t:digits() "." u:$((!("," / ":") [_])+) s:size()? f:flags()?
        { (t.parse().unwrap(), u, s, f.unwrap_or_default()) }
  }
}

impl MaildirName {
  /// Generates a fresh, unique filename. Two concurrent calls within the same
  /// millisecond produce different filenames because of the process-wide atomic
  /// counter (spec.md §4.3, §9 "process-global state").
  pub fn generate(size: Option<u64>, flags: Vec<Flag>, keywords: Vec<usize>) -> Self {
    let timestamp = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .expect("system clock before epoch")
      .as_millis() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    Self {
      timestamp,
      unique: format!("{}.{}", process::id(), counter),
      size,
      flags,
      keywords,
    }
  }

  /// Parses a Maildir filename. Unknown lowercase letters are reported as
  /// keyword indices 0-25 (resolved against a `KeywordTable` by the caller);
  /// unknown uppercase flag letters never occur because the grammar only admits
  /// the five defined ones.
  pub fn parse(filename: &str) -> Option<Self> {
    let (timestamp, unique, size, letters) = parser::filename(filename).ok()?;
    let mut flags = Vec::new();
    let mut keywords = Vec::new();
    for letter in letters {
      if let Some(flag) = Flag::from_maildir_letter(letter) {
        flags.push(flag);
      } else {
        keywords.push((letter as u8 - b'a') as usize);
      }
    }
    flags.sort();
    keywords.sort_unstable();
    Some(Self {
      timestamp,
      unique: unique.to_string(),
      size,
      flags,
      keywords,
    })
  }

  /// The `timestamp.unique[,S=size]` portion, stable across flag changes so files
  /// can be matched across renames.
  pub fn base(&self) -> String {
    match self.size {
      Some(size) => format!("{}.{},S={}", self.timestamp, self.unique, size),
      None => format!("{}.{}", self.timestamp, self.unique),
    }
  }

  /// Emits the full filename, flag letters alphabetical (uppercase flag letters
  /// sort before lowercase keyword letters in ASCII, matching Courier's emission
  /// order).
  pub fn emit(&self) -> String {
    let mut letters: Vec<char> = self
      .flags
      .iter()
      .filter_map(|flag| flag.maildir_letter())
      .collect();
    letters.extend(self.keywords.iter().map(|&index| (b'a' + index as u8) as char));
    letters.sort_unstable();
    if letters.is_empty() {
      self.base()
    } else {
      format!("{}:2,{}", self.base(), letters.into_iter().collect::<String>())
    }
  }

  pub fn with_flags(&self, flags: Vec<Flag>, keywords: Vec<usize>) -> Self {
    Self {
      timestamp: self.timestamp,
      unique: self.unique.clone(),
      size: self.size,
      flags,
      keywords,
    }
  }
}
