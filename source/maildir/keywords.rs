//! Persistent per-mailbox letter<->keyword mapping for the Maildir backend
//! (component C4).
//!
//! On-disk format (spec.md §4.4): UTF-8, one entry per line, header
//! `# gumdrop-keywords v1`, entries `<index> <keyword>`, `#` comments and blank
//! lines skipped, missing file == empty table.
//!
//! Grounded on the teacher's write-to-tmp-then-rename idiom
//! (`source/maildir.rs::tmp_named` + `fs::rename`), the only place in the teacher
//! that performs a durable atomic file update.

use crate::error::IoContext;
use crate::Result;
use std::{collections, fs, io::Write as _, path};

const HEADER: &str = "# gumdrop-keywords v1";
const MAX_KEYWORDS: usize = 26;

#[derive(Debug, Default)]
pub struct KeywordTable {
  path: path::PathBuf,
  by_index: collections::BTreeMap<usize, String>,
  by_name: collections::HashMap<String, usize>,
  dirty: bool,
}

impl KeywordTable {
  pub fn new(path: path::PathBuf) -> Self {
    Self {
      path,
      by_index: collections::BTreeMap::new(),
      by_name: collections::HashMap::new(),
      dirty: false,
    }
  }

  /// Loads from disk, replacing in-memory state. A missing file is an empty
  /// table; a header mismatch is logged and treated as empty, never an error.
  pub fn load(&mut self) -> Result<()> {
    self.by_index.clear();
    self.by_name.clear();
    self.dirty = false;

    let contents = match fs::read_to_string(&self.path) {
      Ok(contents) => contents,
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
      Err(error) => return Err(crate::Error::io(self.path.clone(), error)),
    };

    let mut lines = contents.lines();
    match lines.next() {
      Some(first) if first == HEADER => (),
      Some(other) => {
        log::warn!("{:?}: unexpected keyword table header {other:?}, treating as empty", self.path);
        return Ok(());
      }
      None => return Ok(()),
    }

    for line in lines {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let Some((index, keyword)) = line.split_once(' ') else {
        log::warn!("{:?}: malformed keyword line {line:?}, skipping", self.path);
        continue;
      };
      let Ok(index) = index.parse::<usize>() else {
        log::warn!("{:?}: malformed keyword index {index:?}, skipping", self.path);
        continue;
      };
      self.by_index.insert(index, keyword.to_string());
      self.by_name.insert(keyword.to_string(), index);
    }
    Ok(())
  }

  /// No-op if not dirty; otherwise write-to-tmp then atomic rename.
  pub fn save(&mut self) -> Result<()> {
    if !self.dirty {
      return Ok(());
    }
    let tmp = self.path.with_extension("tmp");
    {
      let mut file = fs::File::create(&tmp).path_context(&tmp)?;
      writeln!(file, "{HEADER}").path_context(&tmp)?;
      for (index, keyword) in &self.by_index {
        writeln!(file, "{index} {keyword}").path_context(&tmp)?;
      }
      file.sync_all().path_context(&tmp)?;
    }
    fs::rename(&tmp, &self.path).path_context(&self.path)?;
    self.dirty = false;
    Ok(())
  }

  pub fn name(&self, index: usize) -> Option<&str> {
    self.by_index.get(&index).map(String::as_str)
  }

  pub fn index(&self, keyword: &str) -> Option<usize> {
    self.by_name.get(keyword).copied()
  }

  /// Returns an existing index, allocates the next free slot, or `-1` (`None`
  /// here) if all 26 slots are taken.
  pub fn get_or_create(&mut self, keyword: &str) -> Option<usize> {
    if let Some(&index) = self.by_name.get(keyword) {
      return Some(index);
    }
    let next = (0..MAX_KEYWORDS).find(|index| !self.by_index.contains_key(index))?;
    self.by_index.insert(next, keyword.to_string());
    self.by_name.insert(keyword.to_string(), next);
    self.dirty = true;
    Some(next)
  }

  pub fn keywords(&self) -> impl Iterator<Item = &str> {
    self.by_index.values().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = KeywordTable::new(dir.path().join(".keywords"));
    table.load().unwrap();
    assert_eq!(None, table.index("foo"));
  }

  #[test]
  fn get_or_create_persists_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".keywords");
    let mut table = KeywordTable::new(path.clone());
    table.load().unwrap();
    let index = table.get_or_create("urgent").unwrap();
    table.save().unwrap();

    let mut reloaded = KeywordTable::new(path);
    reloaded.load().unwrap();
    assert_eq!(Some(index), reloaded.index("urgent"));
    assert_eq!(Some("urgent"), reloaded.name(index));
  }

  #[test]
  fn caps_at_26_slots() {
    let dir = tempfile::tempdir().unwrap();
    let mut table = KeywordTable::new(dir.path().join(".keywords"));
    table.load().unwrap();
    for i in 0..26 {
      assert!(table.get_or_create(&format!("kw{i}")).is_some());
    }
    assert_eq!(None, table.get_or_create("overflow"));
  }

  #[test]
  fn unknown_header_is_treated_as_empty_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".keywords");
    fs::write(&path, "# something else\n0 foo\n").unwrap();
    let mut table = KeywordTable::new(path);
    table.load().unwrap();
    assert_eq!(None, table.index("foo"));
  }

  #[test]
  fn save_is_noop_when_not_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".keywords");
    let mut table = KeywordTable::new(path.clone());
    table.load().unwrap();
    table.save().unwrap();
    assert!(!path.exists());
  }
}
