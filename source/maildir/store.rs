//! `Store`/`MailboxHandle`: the Maildir implementation of `MailboxStore`/
//! `Mailbox` (component C7, Maildir variant).
//!
//! Grounded on the teacher's `source/maildir.rs` for directory-scanning and
//! `tmp`-then-`rename` spooling idiom, on `source/lock.rs` for per-mailbox
//! concurrency, and on `other_examples/.../A3Mailer pop3 mailbox.rs` for the
//! overall descriptor-table shape (`Vec<Entry>` indexed by sequence number).
//! UID persistence (`.uidlist`) is this module's own addition, documented in
//! `mod.rs` and `DESIGN.md`.

use super::{keywords::KeywordTable, mailbox_path, name::MaildirName, Paths};
use crate::error::IoContext;
use crate::store::{default_search, validate_name, Descriptor, Mailbox, MailboxAttribute, MailboxStore};
use crate::{name_codec, Error, Flag, Keyword, MessageContext, MessageSet, Result, SequenceNumber, Uid};
use crate::{lock, SearchExpression};
use chrono::{DateTime, Local, TimeZone};
use std::{
  collections::{HashMap, HashSet},
  fs, io,
  io::Write as _,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, RwLock, Weak},
};

/// Per-user Maildir hierarchy manager.
pub struct Store {
  user_root: PathBuf,
  delimiter: char,
}

fn is_mailbox_dir(path: &Path) -> bool {
  path.join("cur").is_dir() && path.join("new").is_dir()
}

/// IMAP `LIST`/`LSUB` wildcard match: `*` matches any run of characters
/// including the hierarchy delimiter, `%` matches any run excluding it.
fn glob_match(pattern: &[char], name: &[char], delimiter: char) -> bool {
  match pattern.first() {
    None => name.is_empty(),
    Some('*') => (0..=name.len()).any(|i| glob_match(&pattern[1..], &name[i..], delimiter)),
    Some('%') => (0..=name.len())
      .take_while(|&i| !name[..i].contains(&delimiter))
      .any(|i| glob_match(&pattern[1..], &name[i..], delimiter)),
    Some(&c) => matches!(name.first(), Some(&n) if n == c) && glob_match(&pattern[1..], &name[1..], delimiter),
  }
}

impl Store {
  pub fn open(root: &Path, user: &str, delimiter: char) -> Result<Self> {
    let user_root = root.join(name_codec::encode(user));
    fs::create_dir_all(&user_root).path_context(&user_root)?;
    let store = Self { user_root, delimiter };
    Paths::new(mailbox_path(&store.user_root, "INBOX", delimiter)).ensure()?;
    Ok(store)
  }

  fn path_for(&self, name: &str) -> PathBuf {
    mailbox_path(&self.user_root, name, self.delimiter)
  }

  fn subscriptions_path(&self) -> PathBuf {
    self.user_root.join(".subscriptions")
  }

  fn read_subscriptions(&self) -> Result<HashSet<String>> {
    match fs::read_to_string(self.subscriptions_path()) {
      Ok(contents) => Ok(
        contents
          .lines()
          .map(str::trim)
          .filter(|l| !l.is_empty())
          .map(name_codec::decode)
          .collect(),
      ),
      Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(HashSet::new()),
      Err(error) => Err(Error::io(self.subscriptions_path(), error)),
    }
  }

  fn write_subscriptions(&self, subscriptions: &HashSet<String>) -> Result<()> {
    let path = self.subscriptions_path();
    let tmp = path.with_extension("tmp");
    let mut names: Vec<&String> = subscriptions.iter().collect();
    names.sort();
    let mut body = String::new();
    for name in names {
      body.push_str(&name_codec::encode(name));
      body.push('\n');
    }
    fs::write(&tmp, body).path_context(&tmp)?;
    fs::rename(&tmp, &path).path_context(&path)?;
    Ok(())
  }

  fn list_all(&self) -> Result<Vec<String>> {
    let mut names = Vec::new();
    self.walk(&self.user_root, "", &mut names)?;
    names.sort();
    Ok(names)
  }

  fn walk(&self, dir: &Path, prefix: &str, names: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
      Err(error) => return Err(Error::io(dir.to_path_buf(), error)),
    };
    for entry in entries {
      let entry = entry.path_context(dir)?;
      let path = entry.path();
      if !path.is_dir() {
        continue;
      }
      let segment = entry.file_name().to_string_lossy().to_string();
      if segment.starts_with('.') || segment == "cur" || segment == "new" || segment == "tmp" {
        continue;
      }
      let decoded = if segment.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
      } else {
        name_codec::decode(&segment)
      };
      let name = if prefix.is_empty() {
        decoded
      } else {
        format!("{prefix}{}{decoded}", self.delimiter)
      };
      if is_mailbox_dir(&path) {
        names.push(name.clone());
      }
      self.walk(&path, &name, names)?;
    }
    Ok(())
  }
}

impl MailboxStore for Store {
  fn hierarchy_delimiter(&self) -> char {
    self.delimiter
  }

  fn list_mailboxes(&self, reference: &str, pattern: &str) -> Result<Vec<String>> {
    let combined: Vec<char> = format!("{reference}{pattern}").chars().collect();
    Ok(
      self
        .list_all()?
        .into_iter()
        .filter(|name| glob_match(&combined, &name.chars().collect::<Vec<_>>(), self.delimiter))
        .collect(),
    )
  }

  fn list_subscribed(&self, reference: &str, pattern: &str) -> Result<Vec<String>> {
    let combined: Vec<char> = format!("{reference}{pattern}").chars().collect();
    let subscribed = self.read_subscriptions()?;
    Ok(
      self
        .list_all()?
        .into_iter()
        .filter(|name| subscribed.contains(name))
        .filter(|name| glob_match(&combined, &name.chars().collect::<Vec<_>>(), self.delimiter))
        .collect(),
    )
  }

  fn subscribe(&self, name: &str) -> Result<()> {
    validate_name(name, self.delimiter)?;
    let mut subscriptions = self.read_subscriptions()?;
    subscriptions.insert(name.to_string());
    self.write_subscriptions(&subscriptions)
  }

  fn unsubscribe(&self, name: &str) -> Result<()> {
    let mut subscriptions = self.read_subscriptions()?;
    subscriptions.remove(name);
    self.write_subscriptions(&subscriptions)
  }

  fn open_mailbox(&self, name: &str, read_only: bool) -> Result<Box<dyn Mailbox>> {
    validate_name(name, self.delimiter)?;
    let path = self.path_for(name);
    if !is_mailbox_dir(&path) {
      return Err(Error::NotFound(name.to_string()));
    }
    Ok(Box::new(MailboxHandle::open(path, self.user_root.clone(), self.delimiter, read_only)?))
  }

  fn create_mailbox(&self, name: &str) -> Result<()> {
    validate_name(name, self.delimiter)?;
    let path = self.path_for(name);
    if is_mailbox_dir(&path) {
      return Err(Error::Exists(name.to_string()));
    }
    Paths::new(path).ensure()
  }

  fn delete_mailbox(&self, name: &str) -> Result<()> {
    if name.eq_ignore_ascii_case("INBOX") {
      return Err(Error::Unsupported("INBOX cannot be deleted"));
    }
    let path = self.path_for(name);
    if !is_mailbox_dir(&path) {
      return Err(Error::NotFound(name.to_string()));
    }
    let has_children = fs::read_dir(&path)
      .path_context(&path)?
      .flatten()
      .any(|entry| entry.path().is_dir() && is_mailbox_dir(&entry.path()) || nested_mailbox_under(&entry.path()));
    if has_children {
      return Err(Error::HasChildren(name.to_string()));
    }
    if lock::is_open(&path) {
      return Err(Error::InUse(name.to_string()));
    }
    fs::remove_dir_all(&path).path_context(&path)?;
    let mut subscriptions = self.read_subscriptions()?;
    if subscriptions.remove(name) {
      self.write_subscriptions(&subscriptions)?;
    }
    Ok(())
  }

  fn rename_mailbox(&self, old: &str, new: &str) -> Result<()> {
    validate_name(new, self.delimiter)?;
    let old_path = self.path_for(old);
    let new_path = self.path_for(new);
    if !is_mailbox_dir(&old_path) {
      return Err(Error::NotFound(old.to_string()));
    }
    if is_mailbox_dir(&new_path) {
      return Err(Error::Exists(new.to_string()));
    }
    if lock::is_open(&old_path) {
      return Err(Error::InUse(old.to_string()));
    }
    let (a, b) = lock::handle_pair(&old_path, &new_path);
    let _a = a.write().unwrap();
    let _b = b.write().unwrap();
    if old.eq_ignore_ascii_case("INBOX") {
      // INBOX itself can never stop existing: move its messages into a freshly
      // created mailbox instead of renaming the directory.
      Paths::new(new_path.clone()).ensure()?;
      for sub in ["cur", "new"] {
        let from = old_path.join(sub);
        let to = new_path.join(sub);
        for entry in fs::read_dir(&from).path_context(&from)? {
          let entry = entry.path_context(&from)?;
          fs::rename(entry.path(), to.join(entry.file_name())).path_context(&to)?;
        }
      }
    } else {
      if let Some(parent) = new_path.parent() {
        fs::create_dir_all(parent).path_context(parent)?;
      }
      fs::rename(&old_path, &new_path).path_context(&new_path)?;
    }
    Ok(())
  }

  fn mailbox_attributes(&self, name: &str) -> Result<HashSet<MailboxAttribute>> {
    let path = self.path_for(name);
    if !is_mailbox_dir(&path) {
      return Err(Error::NotFound(name.to_string()));
    }
    let mut attrs = HashSet::new();
    let has_children = fs::read_dir(&path)
      .path_context(&path)?
      .flatten()
      .any(|entry| entry.path().is_dir() && !["cur", "new", "tmp"].contains(&entry.file_name().to_string_lossy().as_ref()));
    attrs.insert(if has_children {
      MailboxAttribute::HasChildren
    } else {
      MailboxAttribute::HasNoChildren
    });
    if self.read_subscriptions()?.contains(name) {
      attrs.insert(MailboxAttribute::Subscribed);
    }
    if name.eq_ignore_ascii_case("INBOX") {
      attrs.insert(MailboxAttribute::Unmarked);
    }
    Ok(attrs)
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

fn nested_mailbox_under(dir: &Path) -> bool {
  fs::read_dir(dir)
    .map(|entries| {
      entries
        .flatten()
        .any(|entry| entry.path().is_dir() && (is_mailbox_dir(&entry.path()) || nested_mailbox_under(&entry.path())))
    })
    .unwrap_or(false)
}

#[derive(Debug, Clone)]
struct Entry {
  uid: Uid,
  filename: String,
  in_new: bool,
  size: u64,
}

struct AppendState {
  spool_path: PathBuf,
  file: fs::File,
  flags: HashSet<Flag>,
  keywords: HashSet<Keyword>,
  internal_date: DateTime<Local>,
}

struct State {
  uidvalidity: u32,
  uidnext: Uid,
  keywords: KeywordTable,
  entries: Vec<Entry>,
  appending: Option<AppendState>,
}

/// One open Maildir mailbox. `state` is shared (by canonical mailbox directory)
/// across every handle opened on the same mailbox, so two independently-opened
/// handles mutate the same in-memory UID/entry table instead of racing on stale
/// private snapshots (see [`shared_state`]).
pub struct MailboxHandle {
  paths: Paths,
  user_root: PathBuf,
  delimiter: char,
  read_only: bool,
  rwlock: Arc<RwLock<()>>,
  state: Arc<Mutex<State>>,
  _open_guard: lock::OpenGuard,
}

/// Process-wide registry of live `State`s, keyed by mailbox directory. Holds only
/// `Weak` references: once every handle on a mailbox drops, its entry decays and
/// the next `open` re-reads from disk, matching the previous per-open-scan
/// behaviour. While at least one handle is alive, every new `open` on the same
/// path joins that same `State`, so UID assignment and persistence are
/// serialized through one `Mutex` instead of duplicated across stale copies.
static STATE_REGISTRY: once_cell::sync::Lazy<Mutex<HashMap<PathBuf, Weak<Mutex<State>>>>> =
  once_cell::sync::Lazy::new(|| Mutex::new(HashMap::new()));

fn shared_state(paths: &Paths, read_only: bool) -> Result<Arc<Mutex<State>>> {
  let mut registry = STATE_REGISTRY.lock().unwrap();
  if let Some(existing) = registry.get(&paths.root).and_then(Weak::upgrade) {
    return Ok(existing);
  }
  let state = load_state(paths, read_only)?;
  let arc = Arc::new(Mutex::new(state));
  registry.insert(paths.root.clone(), Arc::downgrade(&arc));
  Ok(arc)
}

fn scan_disk(paths: &Paths) -> Result<HashMap<String, (String, bool, u64)>> {
  let mut found = HashMap::new();
  for (dir, in_new) in [(paths.cur(), false), (paths.new_dir(), true)] {
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
      Err(error) => return Err(Error::io(dir.clone(), error)),
    };
    for entry in entries {
      let entry = entry.path_context(&dir)?;
      let file_name = entry.file_name().to_string_lossy().to_string();
      let Some(parsed) = MaildirName::parse(&file_name) else {
        log::warn!("{:?}: skipping unparseable maildir filename", entry.path());
        continue;
      };
      let size = match parsed.size {
        Some(size) => size,
        None => entry.metadata().path_context(&entry.path())?.len(),
      };
      found.insert(parsed.base(), (file_name, in_new, size));
    }
  }
  Ok(found)
}

fn read_uidlist(path: &Path) -> Result<(u32, Uid, HashMap<String, Uid>)> {
  let contents = match fs::read_to_string(path) {
    Ok(contents) => contents,
    Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok((0, 1, HashMap::new())),
    Err(error) => return Err(Error::io(path.to_path_buf(), error)),
  };
  let mut lines = contents.lines();
  let Some(header) = lines.next() else {
    return Ok((0, 1, HashMap::new()));
  };
  let mut header_parts = header.split_whitespace();
  let uidvalidity: u32 = header_parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
  let uidnext: Uid = header_parts.next().and_then(|s| s.parse().ok()).unwrap_or(1);
  let mut by_base = HashMap::new();
  for line in lines {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    if let Some((uid, base)) = line.split_once(' ') {
      if let Ok(uid) = uid.parse::<Uid>() {
        by_base.insert(base.to_string(), uid);
      }
    }
  }
  Ok((uidvalidity, uidnext, by_base))
}

fn write_uidlist(path: &Path, uidvalidity: u32, uidnext: Uid, entries: &[Entry]) -> Result<()> {
  let tmp = path.with_extension("tmp");
  {
    let mut file = fs::File::create(&tmp).path_context(&tmp)?;
    writeln!(file, "{uidvalidity} {uidnext}").path_context(&tmp)?;
    for entry in entries {
      let base = MaildirName::parse(&entry.filename).map(|n| n.base()).unwrap_or_else(|| entry.filename.clone());
      writeln!(file, "{} {}", entry.uid, base).path_context(&tmp)?;
    }
    file.sync_all().path_context(&tmp)?;
  }
  fs::rename(&tmp, path).path_context(path)?;
  Ok(())
}

/// Reads `.keywords`/`.uidlist` and the `cur`/`new` directory listing from disk
/// and builds the initial `State`. Only runs the first time a mailbox is opened
/// while no other handle holds it; subsequent opens join the already-loaded
/// shared `State` via [`shared_state`] instead of re-scanning.
fn load_state(paths: &Paths, read_only: bool) -> Result<State> {
  let mut keywords = KeywordTable::new(paths.keywords());
  keywords.load()?;

  let on_disk = scan_disk(paths)?;
  let (mut uidvalidity, mut uidnext, mut assigned) = read_uidlist(&paths.uidlist())?;
  if uidvalidity == 0 {
    uidvalidity = chrono::Utc::now().timestamp() as u32;
  }

  // Bases present on disk but unseen before get a fresh UID, in filename
  // order, so delivery order is preserved across a first scan.
  let mut bases: Vec<&String> = on_disk.keys().collect();
  bases.sort();
  for base in bases {
    assigned.entry(base.clone()).or_insert_with(|| {
      let uid = uidnext;
      uidnext += 1;
      uid
    });
  }

  let mut entries: Vec<Entry> = assigned
    .into_iter()
    .filter_map(|(base, uid)| on_disk.get(&base).map(|(filename, in_new, size)| Entry {
      uid,
      filename: filename.clone(),
      in_new: *in_new,
      size: *size,
    }))
    .collect();
  entries.sort_by_key(|entry| entry.uid);

  if !read_only {
    write_uidlist(&paths.uidlist(), uidvalidity, uidnext, &entries)?;
  }

  Ok(State {
    uidvalidity,
    uidnext,
    keywords,
    entries,
    appending: None,
  })
}

impl MailboxHandle {
  fn open(root: PathBuf, user_root: PathBuf, delimiter: char, read_only: bool) -> Result<Self> {
    let paths = Paths::new(root);
    paths.ensure()?;

    let state = shared_state(&paths, read_only)?;

    let rwlock = lock::handle(&paths.root);
    let open_guard = lock::mark_open(&paths.root);

    Ok(Self {
      paths,
      user_root,
      delimiter,
      read_only,
      rwlock,
      state,
      _open_guard: open_guard,
    })
  }

  fn current_path(&self, entry: &Entry) -> PathBuf {
    if entry.in_new {
      self.paths.new_dir().join(&entry.filename)
    } else {
      self.paths.cur().join(&entry.filename)
    }
  }

  fn descriptor(entry: &Entry, sequence: SequenceNumber) -> Descriptor {
    Descriptor {
      sequence,
      size: entry.size,
      uid: entry.uid,
    }
  }

  fn entry_at(state: &State, n: SequenceNumber) -> Result<&Entry> {
    let index = n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))? as usize;
    state.entries.get(index).ok_or(Error::NoSuchMessage(n as usize))
  }

  /// `\Deleted` is filename-encoded for this backend, so checking it means
  /// re-parsing the filename rather than a direct field read.
  fn entry_is_deleted(entry: &Entry) -> bool {
    MaildirName::parse(&entry.filename)
      .map(|parsed| parsed.flags.contains(&Flag::Deleted))
      .unwrap_or(false)
  }

  fn persist(&self, state: &State) -> Result<()> {
    write_uidlist(&self.paths.uidlist(), state.uidvalidity, state.uidnext, &state.entries)
  }
}

impl Mailbox for MailboxHandle {
  fn message_count(&self) -> Result<usize> {
    Ok(
      self
        .state
        .lock()
        .unwrap()
        .entries
        .iter()
        .filter(|e| !Self::entry_is_deleted(e))
        .count(),
    )
  }

  fn mailbox_size(&self) -> Result<u64> {
    Ok(
      self
        .state
        .lock()
        .unwrap()
        .entries
        .iter()
        .filter(|e| !Self::entry_is_deleted(e))
        .map(|e| e.size)
        .sum(),
    )
  }

  fn message_list(&self) -> Result<Vec<Descriptor>> {
    let _guard = self.rwlock.read().unwrap();
    let state = self.state.lock().unwrap();
    Ok(
      state
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| !Self::entry_is_deleted(e))
        .map(|(i, e)| Self::descriptor(e, (i + 1) as SequenceNumber))
        .collect(),
    )
  }

  fn message(&self, n: SequenceNumber) -> Result<Descriptor> {
    let state = self.state.lock().unwrap();
    Ok(Self::descriptor(Self::entry_at(&state, n)?, n))
  }

  fn message_content(&self, n: SequenceNumber) -> Result<Box<dyn io::Read + Send>> {
    let state = self.state.lock().unwrap();
    let entry = Self::entry_at(&state, n)?;
    let path = self.current_path(entry);
    Ok(Box::new(fs::File::open(&path).path_context(&path)?))
  }

  fn message_top(&self, n: SequenceNumber, body_lines: usize) -> Result<Box<dyn io::Read + Send>> {
    let bytes = {
      let mut reader = self.message_content(n)?;
      let mut buf = Vec::new();
      io::Read::read_to_end(&mut reader, &mut buf).map_err(|e| Error::io(PathBuf::from(format!("message {n}")), e))?;
      buf
    };
    let split = memchr::memmem::find(&bytes, b"\r\n\r\n").map(|p| p + 4).unwrap_or(bytes.len());
    let (headers, body) = bytes.split_at(split);
    let mut out = headers.to_vec();
    let mut lines_seen = 0;
    let mut start = 0;
    while lines_seen < body_lines {
      match memchr::memchr(b'\n', &body[start..]) {
        Some(pos) => {
          start += pos + 1;
          lines_seen += 1;
        }
        None => {
          start = body.len();
          break;
        }
      }
    }
    out.extend_from_slice(&body[..start]);
    Ok(Box::new(io::Cursor::new(out)))
  }

  fn message_context(&self, n: SequenceNumber) -> Result<MessageContext> {
    let (uid, size, flags, keywords, path) = {
      let state = self.state.lock().unwrap();
      let entry = Self::entry_at(&state, n)?;
      let parsed = MaildirName::parse(&entry.filename).ok_or_else(|| Error::Corrupt(entry.filename.clone()))?;
      let flags: HashSet<Flag> = parsed.flags.iter().copied().collect();
      let keywords: HashSet<Keyword> = parsed
        .keywords
        .iter()
        .filter_map(|&i| state.keywords.name(i).map(str::to_string))
        .collect();
      (entry.uid, entry.size, flags, keywords, self.current_path(entry))
    };
    let internal_date = fs::metadata(&path)
      .path_context(&path)?
      .modified()
      .ok()
      .and_then(|t| Local.timestamp_opt(
        t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0),
        0,
      ).single())
      .unwrap_or_else(Local::now);
    Ok(MessageContext::new(
      n,
      uid,
      size,
      internal_date,
      flags,
      keywords,
      Box::new(move || fs::read(&path).path_context(&path)),
    ))
  }

  fn flags(&self, n: SequenceNumber) -> Result<(HashSet<Flag>, HashSet<Keyword>)> {
    let state = self.state.lock().unwrap();
    let entry = Self::entry_at(&state, n)?;
    let parsed = MaildirName::parse(&entry.filename).ok_or_else(|| Error::Corrupt(entry.filename.clone()))?;
    let flags = parsed.flags.iter().copied().collect();
    let keywords = parsed
      .keywords
      .iter()
      .filter_map(|&i| state.keywords.name(i).map(str::to_string))
      .collect();
    Ok((flags, keywords))
  }

  fn set_flags(&self, n: SequenceNumber, flags: &HashSet<Flag>, keywords: &HashSet<Keyword>, add: bool) -> Result<()> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let entry_index = (n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))?) as usize;
    if entry_index >= state.entries.len() {
      return Err(Error::NoSuchMessage(n as usize));
    }
    let old_path = self.current_path(&state.entries[entry_index]);
    let parsed = MaildirName::parse(&state.entries[entry_index].filename).ok_or_else(|| Error::Corrupt(state.entries[entry_index].filename.clone()))?;

    let mut new_flags: HashSet<Flag> = parsed.flags.iter().copied().collect();
    let mut new_keywords: HashSet<String> = parsed
      .keywords
      .iter()
      .filter_map(|&i| state.keywords.name(i).map(str::to_string))
      .collect();
    if add {
      new_flags.extend(flags.iter().copied());
      new_keywords.extend(keywords.iter().cloned());
    } else {
      for flag in flags {
        new_flags.remove(flag);
      }
      for keyword in keywords {
        new_keywords.remove(keyword);
      }
    }
    self.rewrite_entry(&mut state, entry_index, &old_path, new_flags, new_keywords)
  }

  fn replace_flags(&self, n: SequenceNumber, flags: HashSet<Flag>, keywords: HashSet<Keyword>) -> Result<()> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let entry_index = (n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))?) as usize;
    if entry_index >= state.entries.len() {
      return Err(Error::NoSuchMessage(n as usize));
    }
    let old_path = self.current_path(&state.entries[entry_index]);
    self.rewrite_entry(&mut state, entry_index, &old_path, flags, keywords)
  }

  fn permanent_flags(&self) -> Vec<Flag> {
    Flag::PERMANENT.to_vec()
  }

  fn delete_message(&self, n: SequenceNumber) -> Result<()> {
    let mut flags = HashSet::new();
    flags.insert(Flag::Deleted);
    self.set_flags(n, &flags, &HashSet::new(), true)
  }

  fn is_deleted(&self, n: SequenceNumber) -> Result<bool> {
    Ok(self.flags(n)?.0.contains(&Flag::Deleted))
  }

  fn undelete_all(&self) -> Result<()> {
    let count = self.message_count()?;
    let mut flags = HashSet::new();
    flags.insert(Flag::Deleted);
    for n in 1..=count as SequenceNumber {
      self.set_flags(n, &flags, &HashSet::new(), false)?;
    }
    Ok(())
  }

  fn expunge(&self) -> Result<Vec<SequenceNumber>> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let mut removed = Vec::new();
    let mut kept = Vec::new();
    for (i, entry) in state.entries.iter().enumerate() {
      let sequence = (i + 1) as SequenceNumber;
      let parsed = MaildirName::parse(&entry.filename);
      if parsed.as_ref().map(|p| p.flags.contains(&Flag::Deleted)).unwrap_or(false) {
        let path = self.current_path(entry);
        fs::remove_file(&path).path_context(&path)?;
        removed.push(sequence);
      } else {
        kept.push(entry.clone());
      }
    }
    state.entries = kept;
    self.persist(&state)?;
    Ok(removed)
  }

  fn unique_id(&self, n: SequenceNumber) -> Result<Uid> {
    let state = self.state.lock().unwrap();
    Ok(Self::entry_at(&state, n)?.uid)
  }

  fn uid_validity(&self) -> Result<u32> {
    Ok(self.state.lock().unwrap().uidvalidity)
  }

  fn uid_next(&self) -> Result<Uid> {
    Ok(self.state.lock().unwrap().uidnext)
  }

  fn start_append(&self, flags: HashSet<Flag>, keywords: HashSet<Keyword>, internal_date: DateTime<Local>) -> Result<()> {
    if self.read_only {
      return Err(Error::InvalidState("mailbox opened read-only"));
    }
    let mut state = self.state.lock().unwrap();
    if state.appending.is_some() {
      return Err(Error::InvalidState("an append is already in flight"));
    }
    let spool_name = MaildirName::generate(None, Vec::new(), Vec::new()).base();
    let spool_path = self.paths.tmp().join(&spool_name);
    let file = fs::File::create(&spool_path).path_context(&spool_path)?;
    state.appending = Some(AppendState {
      spool_path,
      file,
      flags,
      keywords,
      internal_date,
    });
    Ok(())
  }

  fn append_content(&self, buf: &[u8]) -> Result<()> {
    let mut state = self.state.lock().unwrap();
    let append = state.appending.as_mut().ok_or(Error::InvalidState("no append in flight"))?;
    let path = append.spool_path.clone();
    append.file.write_all(buf).path_context(&path)?;
    Ok(())
  }

  fn end_append(&self) -> Result<Uid> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let mut append = state.appending.take().ok_or(Error::InvalidState("no append in flight"))?;
    append.file.sync_all().path_context(&append.spool_path)?;
    let size = fs::metadata(&append.spool_path).path_context(&append.spool_path)?.len();

    let mut keyword_indices = Vec::new();
    for keyword in &append.keywords {
      match state.keywords.get_or_create(keyword) {
        Some(index) => keyword_indices.push(index),
        None => log::warn!("{:?}: keyword table full, dropping keyword {keyword:?}", self.paths.root),
      }
    }
    let flags: Vec<Flag> = append.flags.iter().copied().collect();
    let timestamp = append.internal_date.timestamp_millis().max(0) as u64;
    let name = MaildirName::parse(&append.spool_path.file_name().unwrap().to_string_lossy())
      .map(|parsed| MaildirName {
        timestamp,
        size: Some(size),
        flags,
        keywords: keyword_indices,
        ..parsed
      })
      .ok_or_else(|| Error::Corrupt("spool filename".to_string()))?;
    let filename = name.emit();
    let destination = self.paths.cur().join(&filename);

    if let Err(error) = fs::rename(&append.spool_path, &destination) {
      let _ = fs::remove_file(&append.spool_path);
      return Err(Error::io(destination, error));
    }

    let uid = state.uidnext;
    state.uidnext += 1;
    state.entries.push(Entry {
      uid,
      filename,
      in_new: false,
      size,
    });
    state.keywords.save()?;
    self.persist(&state)?;
    Ok(uid)
  }

  fn copy(&self, numbers: &MessageSet, destination: &str) -> Result<HashMap<SequenceNumber, Uid>> {
    let _guard = self.rwlock.read().unwrap();
    validate_name(destination, self.delimiter)?;
    let dest_path = mailbox_path(&self.user_root, destination, self.delimiter);
    if !is_mailbox_dir(&dest_path) {
      return Err(Error::NotFound(destination.to_string()));
    }
    let snapshot = self.message_list()?;
    let last = snapshot.len() as SequenceNumber;
    let mut result = HashMap::new();
    for descriptor in &snapshot {
      if !numbers.contains(descriptor.sequence, last) {
        continue;
      }
      let bytes = {
        let mut reader = self.message_content(descriptor.sequence)?;
        let mut buf = Vec::new();
        io::Read::read_to_end(&mut reader, &mut buf).map_err(|e| Error::io(dest_path.clone(), e))?;
        buf
      };
      let (flags, keywords) = self.flags(descriptor.sequence)?;
      let internal_date = self.message_context(descriptor.sequence)?.internal_date();
      let target = MailboxHandle::open(dest_path.clone(), self.user_root.clone(), self.delimiter, false)?;
      target.start_append(flags, keywords, internal_date)?;
      target.append_content(&bytes)?;
      let uid = target.end_append()?;
      result.insert(descriptor.sequence, uid);
    }
    Ok(result)
  }

  fn move_messages(&self, numbers: &MessageSet, destination: &str) -> Result<HashMap<SequenceNumber, Uid>> {
    let copied = self.copy(numbers, destination)?;
    for &sequence in copied.keys() {
      self.delete_message(sequence)?;
    }
    Ok(copied)
  }

  fn search(&self, expr: &SearchExpression) -> Result<Vec<SequenceNumber>> {
    default_search(self, expr)
  }

  fn close(&self, expunge: bool) -> Result<Vec<SequenceNumber>> {
    if expunge {
      self.expunge()
    } else {
      Ok(Vec::new())
    }
  }
}

impl MailboxHandle {
  fn rewrite_entry(
    &self,
    state: &mut State,
    entry_index: usize,
    old_path: &Path,
    flags: HashSet<Flag>,
    keywords: HashSet<String>,
  ) -> Result<()> {
    let mut keyword_indices = Vec::new();
    for keyword in &keywords {
      match state.keywords.get_or_create(keyword) {
        Some(index) => keyword_indices.push(index),
        None => log::warn!("{:?}: keyword table full, dropping keyword {keyword:?}", self.paths.root),
      }
    }
    let flag_list: Vec<Flag> = flags.into_iter().collect();
    let base = MaildirName::parse(&state.entries[entry_index].filename)
      .ok_or_else(|| Error::Corrupt(state.entries[entry_index].filename.clone()))?;
    let updated = base.with_flags(flag_list, keyword_indices);
    let new_filename = updated.emit();
    let new_path = self.paths.cur().join(&new_filename);
    if new_path != *old_path {
      fs::rename(old_path, &new_path).path_context(&new_path)?;
    }
    state.entries[entry_index].filename = new_filename;
    state.entries[entry_index].in_new = false;
    state.keywords.save()?;
    self.persist(state)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet as Set;

  fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), "alice", '/').unwrap();
    (dir, store)
  }

  #[test]
  fn inbox_exists_on_open() {
    let (_dir, store) = open_store();
    assert!(store.open_mailbox("INBOX", false).is_ok());
  }

  #[test]
  fn create_list_delete_mailbox() {
    let (_dir, store) = open_store();
    store.create_mailbox("Work").unwrap();
    assert!(store.list_mailboxes("", "*").unwrap().contains(&"Work".to_string()));
    store.delete_mailbox("Work").unwrap();
    assert!(!store.list_mailboxes("", "*").unwrap().contains(&"Work".to_string()));
  }

  #[test]
  fn create_existing_mailbox_fails() {
    let (_dir, store) = open_store();
    store.create_mailbox("Work").unwrap();
    assert!(matches!(store.create_mailbox("Work"), Err(Error::Exists(_))));
  }

  #[test]
  fn append_then_list_round_trips() {
    let (_dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
    mailbox.append_content(b"Subject: hi\r\n\r\nbody").unwrap();
    let uid = mailbox.end_append().unwrap();
    assert_eq!(1, uid);
    assert_eq!(1, mailbox.message_count().unwrap());
    assert_eq!(uid, mailbox.unique_id(1).unwrap());
  }

  #[test]
  fn double_start_append_is_invalid_state() {
    let (_dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
    assert!(matches!(
      mailbox.start_append(Set::new(), Set::new(), Local::now()),
      Err(Error::InvalidState(_))
    ));
  }

  #[test]
  fn set_flags_persists_across_reopen() {
    let (dir, store) = open_store();
    {
      let mailbox = store.open_mailbox("INBOX", false).unwrap();
      mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
      mailbox.append_content(b"Subject: hi\r\n\r\nbody").unwrap();
      mailbox.end_append().unwrap();
      let mut flags = Set::new();
      flags.insert(Flag::Seen);
      mailbox.set_flags(1, &flags, &Set::new(), true).unwrap();
    }
    let reopened = Store::open(dir.path(), "alice", '/').unwrap();
    let mailbox = reopened.open_mailbox("INBOX", false).unwrap();
    assert!(mailbox.flags(1).unwrap().0.contains(&Flag::Seen));
  }

  #[test]
  fn expunge_removes_deleted_and_keeps_others_dense() {
    let (_dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    for body in [&b"a"[..], &b"b"[..], &b"c"[..]] {
      mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
      mailbox.append_content(body).unwrap();
      mailbox.end_append().unwrap();
    }
    mailbox.delete_message(2).unwrap();
    assert_eq!(2, mailbox.message_count().unwrap(), "deleted messages are excluded from message_count before expunge");
    let removed = mailbox.expunge().unwrap();
    assert_eq!(vec![2], removed);
    assert_eq!(2, mailbox.message_count().unwrap());
  }

  #[test]
  fn delete_mailbox_with_children_fails() {
    let (_dir, store) = open_store();
    store.create_mailbox("Work").unwrap();
    store.create_mailbox("Work/Projects").unwrap();
    assert!(matches!(store.delete_mailbox("Work"), Err(Error::HasChildren(_))));
  }

  #[test]
  fn delete_inbox_is_unsupported() {
    let (_dir, store) = open_store();
    assert!(matches!(store.delete_mailbox("INBOX"), Err(Error::Unsupported(_))));
  }
}
