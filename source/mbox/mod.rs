//! One-file-per-message backend (component C7, "mbox" variant, spec.md §6's
//! reference on-disk layout):
//!
//! ```text
//! <root>/<user>/<encoded-path>/
//!   1.eml, 2.eml, ...   bare RFC 5322 bytes, contiguously numbered
//!   .uidvalidity        ASCII decimal integer + newline
//!   .uidnext            ASCII decimal integer + newline
//!   .uidmap             lines: <filename> <uid>
//!   .flags              lines: <filename> <flag-and-keyword-tokens...>
//! <root>/<user>/.subscriptions
//! ```
//!
//! Unlike `maildir`, a message's filename *is* its sequence number, so
//! `expunge`/any removal must physically renumber the trailing files — this
//! backend pays that cost at every structural mutation in exchange for never
//! needing Maildir's base/flags split. Grounded on the teacher's write-to-tmp-
//! then-rename idiom (`source/maildir.rs`), generalised to whole-file
//! mapping rewrites the same way `maildir::keywords::KeywordTable::save` does.

use crate::error::IoContext;
use crate::store::{default_search, validate_name, Descriptor, Mailbox, MailboxAttribute, MailboxStore};
use crate::{lock, name_codec, Error, Flag, Keyword, MessageContext, MessageSet, Result, SearchExpression, SequenceNumber, Uid};
use chrono::{DateTime, Local, TimeZone};
use std::{
  collections::{HashMap, HashSet},
  fs, io,
  io::Write as _,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, RwLock, Weak},
};

fn is_mailbox_dir(path: &Path) -> bool {
  path.join(".uidvalidity").is_file() && path.join(".uidnext").is_file()
}

fn mailbox_path(user_root: &Path, name: &str, delimiter: char) -> PathBuf {
  let mut path = user_root.to_path_buf();
  for segment in name.split(delimiter) {
    if segment.eq_ignore_ascii_case("INBOX") {
      path.push("INBOX");
    } else {
      path.push(name_codec::encode(segment));
    }
  }
  path
}

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

fn ensure_mailbox_dir(path: &Path) -> Result<()> {
  fs::create_dir_all(path).path_context(path)?;
  let uidvalidity = path.join(".uidvalidity");
  if !uidvalidity.exists() {
    fs::write(&uidvalidity, format!("{}\n", chrono::Utc::now().timestamp())).path_context(&uidvalidity)?;
  }
  let uidnext = path.join(".uidnext");
  if !uidnext.exists() {
    fs::write(&uidnext, "1\n").path_context(&uidnext)?;
  }
  Ok(())
}

/// Per-user one-file-per-message hierarchy manager.
pub struct Store {
  user_root: PathBuf,
  delimiter: char,
}

impl Store {
  pub fn open(root: &Path, user: &str, delimiter: char) -> Result<Self> {
    let user_root = root.join(name_codec::encode(user));
    fs::create_dir_all(&user_root).path_context(&user_root)?;
    let store = Self { user_root, delimiter };
    ensure_mailbox_dir(&mailbox_path(&store.user_root, "INBOX", delimiter))?;
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
      if segment.starts_with('.') {
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
    ensure_mailbox_dir(&path)
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
      .any(|entry| entry.path().is_dir());
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
      ensure_mailbox_dir(&new_path)?;
      for entry in fs::read_dir(&old_path).path_context(&old_path)? {
        let entry = entry.path_context(&old_path)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
          continue;
        }
        fs::rename(entry.path(), new_path.join(&name)).path_context(&new_path)?;
      }
      // Reset INBOX to an empty, freshly-validated mailbox (UIDVALIDITY MUST
      // bump per spec.md §4.7.1 rename semantics).
      fs::write(old_path.join(".uidvalidity"), format!("{}\n", chrono::Utc::now().timestamp()))
        .path_context(&old_path)?;
      fs::write(old_path.join(".uidnext"), "1\n").path_context(&old_path)?;
      let _ = fs::remove_file(old_path.join(".uidmap"));
      let _ = fs::remove_file(old_path.join(".flags"));
    } else {
      if let Some(parent) = new_path.parent() {
        fs::create_dir_all(parent).path_context(parent)?;
      }
      fs::rename(&old_path, &new_path).path_context(&new_path)?;
      fs::write(new_path.join(".uidvalidity"), format!("{}\n", chrono::Utc::now().timestamp()))
        .path_context(&new_path)?;
    }
    Ok(())
  }

  fn mailbox_attributes(&self, name: &str) -> Result<HashSet<MailboxAttribute>> {
    let path = self.path_for(name);
    if !is_mailbox_dir(&path) {
      return Err(Error::NotFound(name.to_string()));
    }
    let mut attrs = HashSet::new();
    let has_children = fs::read_dir(&path).path_context(&path)?.flatten().any(|entry| entry.path().is_dir());
    attrs.insert(if has_children {
      MailboxAttribute::HasChildren
    } else {
      MailboxAttribute::HasNoChildren
    });
    if self.read_subscriptions()?.contains(name) {
      attrs.insert(MailboxAttribute::Subscribed);
    }
    Ok(attrs)
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }
}

#[derive(Debug, Clone)]
struct Entry {
  uid: Uid,
  filename: String,
  flags: HashSet<Flag>,
  keywords: HashSet<Keyword>,
  size: u64,
}

struct AppendState {
  flags: HashSet<Flag>,
  keywords: HashSet<Keyword>,
  internal_date: DateTime<Local>,
  buffer: Vec<u8>,
}

struct State {
  uidvalidity: u32,
  uidnext: Uid,
  entries: Vec<Entry>,
  appending: Option<AppendState>,
}

/// One open one-file-per-message mailbox. `state` is shared (by mailbox
/// directory) across every handle opened on the same mailbox, so two
/// independently-opened handles mutate the same in-memory UID/entry table
/// instead of racing on stale private snapshots (see [`shared_state`]). This
/// matters more here than in the Maildir backend: `end_append` derives the next
/// filename from `state.entries.len()`, so two handles with independently stale
/// counts would otherwise both target the same `<n>.eml` and silently clobber
/// each other.
pub struct MailboxHandle {
  root: PathBuf,
  user_root: PathBuf,
  delimiter: char,
  read_only: bool,
  rwlock: Arc<RwLock<()>>,
  state: Arc<Mutex<State>>,
  _open_guard: lock::OpenGuard,
}

static STATE_REGISTRY: once_cell::sync::Lazy<Mutex<HashMap<PathBuf, Weak<Mutex<State>>>>> =
  once_cell::sync::Lazy::new(|| Mutex::new(HashMap::new()));

fn shared_state(root: &Path, read_only: bool) -> Result<Arc<Mutex<State>>> {
  let mut registry = STATE_REGISTRY.lock().unwrap();
  if let Some(existing) = registry.get(root).and_then(Weak::upgrade) {
    return Ok(existing);
  }
  let state = load_state(root, read_only)?;
  let arc = Arc::new(Mutex::new(state));
  registry.insert(root.to_path_buf(), Arc::downgrade(&arc));
  Ok(arc)
}

fn read_count(path: &Path, default: u32) -> u32 {
  fs::read_to_string(path)
    .ok()
    .and_then(|s| s.trim().parse().ok())
    .unwrap_or(default)
}

fn token_for_flag(flag: Flag) -> &'static str {
  flag.wire_name().trim_start_matches('\\')
}

fn parse_token(token: &str) -> Result<(Option<Flag>, Option<Keyword>)> {
  if let Some(flag) = Flag::parse(token) {
    Ok((Some(flag), None))
  } else {
    Ok((None, Some(token.to_string())))
  }
}

fn read_uidmap(path: &Path) -> HashMap<String, Uid> {
  fs::read_to_string(path)
    .map(|contents| {
      contents
        .lines()
        .filter_map(|line| {
          let Some((file, uid)) = line.split_once(' ') else {
            log::warn!("{path:?}: malformed uidmap line {line:?}, skipping");
            return None;
          };
          match uid.trim().parse() {
            Ok(uid) => Some((file.to_string(), uid)),
            Err(_) => {
              log::warn!("{path:?}: malformed uidmap entry {line:?}, skipping");
              None
            }
          }
        })
        .collect()
    })
    .unwrap_or_default()
}

fn read_flags_file(path: &Path) -> HashMap<String, (HashSet<Flag>, HashSet<Keyword>)> {
  fs::read_to_string(path)
    .map(|contents| {
      contents
        .lines()
        .filter_map(|line| line.split_once(' '))
        .map(|(file, tokens)| {
          let mut flags = HashSet::new();
          let mut keywords = HashSet::new();
          for token in tokens.split_whitespace() {
            if let Ok((flag, keyword)) = parse_token(token) {
              if let Some(flag) = flag {
                flags.insert(flag);
              }
              if let Some(keyword) = keyword {
                keywords.insert(keyword);
              }
            }
          }
          (file.to_string(), (flags, keywords))
        })
        .collect()
    })
    .unwrap_or_default()
}

fn scan_messages(root: &Path) -> Result<Vec<(u64, String, u64)>> {
  let mut found = Vec::new();
  let entries = match fs::read_dir(root) {
    Ok(entries) => entries,
    Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(error) => return Err(Error::io(root.to_path_buf(), error)),
  };
  for entry in entries {
    let entry = entry.path_context(root)?;
    let file_name = entry.file_name().to_string_lossy().to_string();
    let Some(number) = file_name.strip_suffix(".eml").and_then(|n| n.parse::<u64>().ok()) else {
      continue;
    };
    let size = entry.metadata().path_context(&entry.path())?.len();
    found.push((number, file_name, size));
  }
  found.sort_by_key(|(n, _, _)| *n);
  Ok(found)
}

/// Reads `.uidvalidity`/`.uidnext`/`.uidmap`/`.flags` and the message directory
/// listing from disk and builds the initial `State`. Only runs the first time a
/// mailbox is opened while no other handle holds it; subsequent opens join the
/// already-loaded shared `State` via [`shared_state`] instead of re-scanning.
fn load_state(root: &Path, read_only: bool) -> Result<State> {
  fs::create_dir_all(root).path_context(root)?;
  let uidvalidity_path = root.join(".uidvalidity");
  let uidnext_path = root.join(".uidnext");
  let mut uidvalidity = read_count(&uidvalidity_path, 0);
  if uidvalidity == 0 {
    uidvalidity = chrono::Utc::now().timestamp() as u32;
  }
  let mut uidnext = read_count(&uidnext_path, 1).max(1);

  let uidmap = read_uidmap(&root.join(".uidmap"));
  let flags_map = read_flags_file(&root.join(".flags"));
  let on_disk = scan_messages(root)?;

  let mut entries = Vec::with_capacity(on_disk.len());
  for (_, filename, size) in &on_disk {
    let uid = match uidmap.get(filename) {
      Some(&uid) => uid,
      None => {
        let assigned = uidnext;
        uidnext += 1;
        assigned
      }
    };
    let (flags, keywords) = flags_map.get(filename).cloned().unwrap_or_default();
    entries.push(Entry {
      uid,
      filename: filename.clone(),
      flags,
      keywords,
      size: *size,
    });
  }
  entries.sort_by_key(|e| e.uid);

  let state = State {
    uidvalidity,
    uidnext,
    entries,
    appending: None,
  };
  if !read_only {
    persist_metadata_at(root, &state)?;
  }
  Ok(state)
}

fn persist_metadata_at(root: &Path, state: &State) -> Result<()> {
  fs::write(root.join(".uidvalidity"), format!("{}\n", state.uidvalidity)).path_context(root)?;
  fs::write(root.join(".uidnext"), format!("{}\n", state.uidnext)).path_context(root)?;

  let uidmap_tmp = root.join(".uidmap.tmp");
  {
    let mut file = fs::File::create(&uidmap_tmp).path_context(&uidmap_tmp)?;
    for entry in &state.entries {
      writeln!(file, "{} {}", entry.filename, entry.uid).path_context(&uidmap_tmp)?;
    }
  }
  fs::rename(&uidmap_tmp, root.join(".uidmap")).path_context(root)?;

  let flags_tmp = root.join(".flags.tmp");
  {
    let mut file = fs::File::create(&flags_tmp).path_context(&flags_tmp)?;
    for entry in &state.entries {
      let mut tokens: Vec<String> = entry.flags.iter().map(|&f| token_for_flag(f).to_string()).collect();
      tokens.extend(entry.keywords.iter().cloned());
      writeln!(file, "{} {}", entry.filename, tokens.join(" ")).path_context(&flags_tmp)?;
    }
  }
  fs::rename(&flags_tmp, root.join(".flags")).path_context(root)?;
  Ok(())
}

impl MailboxHandle {
  fn open(root: PathBuf, user_root: PathBuf, delimiter: char, read_only: bool) -> Result<Self> {
    let state = shared_state(&root, read_only)?;

    let rwlock = lock::handle(&root);
    let open_guard = lock::mark_open(&root);
    Ok(Self {
      root,
      user_root,
      delimiter,
      read_only,
      rwlock,
      state,
      _open_guard: open_guard,
    })
  }

  fn persist_metadata(&self, state: &State) -> Result<()> {
    persist_metadata_at(&self.root, state)
  }

  /// Physically renumbers files on disk to a contiguous `1.eml..n.eml`,
  /// matching `state.entries`' current order, in two passes to avoid
  /// collisions when entries are reordered or removed.
  fn renumber(&self, state: &mut State) -> Result<()> {
    for entry in state.entries.iter_mut() {
      let from = self.root.join(&entry.filename);
      let staged = format!("{}.renumbering", entry.filename);
      let to = self.root.join(&staged);
      if from != to {
        fs::rename(&from, &to).path_context(&to)?;
      }
      entry.filename = staged;
    }
    for (i, entry) in state.entries.iter_mut().enumerate() {
      let final_name = format!("{}.eml", i + 1);
      let from = self.root.join(&entry.filename);
      let to = self.root.join(&final_name);
      fs::rename(&from, &to).path_context(&to)?;
      entry.filename = final_name;
    }
    Ok(())
  }

  fn entry_at(state: &State, n: SequenceNumber) -> Result<&Entry> {
    let index = n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))? as usize;
    state.entries.get(index).ok_or(Error::NoSuchMessage(n as usize))
  }

  fn descriptor(entry: &Entry, sequence: SequenceNumber) -> Descriptor {
    Descriptor {
      sequence,
      size: entry.size,
      uid: entry.uid,
    }
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
        .filter(|e| !e.flags.contains(&Flag::Deleted))
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
        .filter(|e| !e.flags.contains(&Flag::Deleted))
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
        .filter(|(_, e)| !e.flags.contains(&Flag::Deleted))
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
    let path = self.root.join(&entry.filename);
    Ok(Box::new(fs::File::open(&path).path_context(&path)?))
  }

  fn message_top(&self, n: SequenceNumber, body_lines: usize) -> Result<Box<dyn io::Read + Send>> {
    let bytes = {
      let mut reader = self.message_content(n)?;
      let mut buf = Vec::new();
      io::Read::read_to_end(&mut reader, &mut buf).map_err(|e| Error::io(self.root.clone(), e))?;
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
      (entry.uid, entry.size, entry.flags.clone(), entry.keywords.clone(), self.root.join(&entry.filename))
    };
    let internal_date = fs::metadata(&path)
      .ok()
      .and_then(|m| m.modified().ok())
      .and_then(|t| {
        Local
          .timestamp_opt(t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0), 0)
          .single()
      })
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
    Ok((entry.flags.clone(), entry.keywords.clone()))
  }

  fn set_flags(&self, n: SequenceNumber, flags: &HashSet<Flag>, keywords: &HashSet<Keyword>, add: bool) -> Result<()> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let index = (n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))?) as usize;
    if index >= state.entries.len() {
      return Err(Error::NoSuchMessage(n as usize));
    }
    if add {
      state.entries[index].flags.extend(flags.iter().copied());
      state.entries[index].keywords.extend(keywords.iter().cloned());
    } else {
      for flag in flags {
        state.entries[index].flags.remove(flag);
      }
      for keyword in keywords {
        state.entries[index].keywords.remove(keyword);
      }
    }
    self.persist_metadata(&state)
  }

  fn replace_flags(&self, n: SequenceNumber, flags: HashSet<Flag>, keywords: HashSet<Keyword>) -> Result<()> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let index = (n.checked_sub(1).ok_or(Error::NoSuchMessage(n as usize))?) as usize;
    if index >= state.entries.len() {
      return Err(Error::NoSuchMessage(n as usize));
    }
    state.entries[index].flags = flags;
    state.entries[index].keywords = keywords;
    self.persist_metadata(&state)
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
      if entry.flags.contains(&Flag::Deleted) {
        let path = self.root.join(&entry.filename);
        fs::remove_file(&path).path_context(&path)?;
        removed.push((i + 1) as SequenceNumber);
      } else {
        kept.push(entry.clone());
      }
    }
    state.entries = kept;
    self.renumber(&mut state)?;
    self.persist_metadata(&state)?;
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
    state.appending = Some(AppendState {
      flags,
      keywords,
      internal_date,
      buffer: Vec::new(),
    });
    Ok(())
  }

  fn append_content(&self, buf: &[u8]) -> Result<()> {
    let mut state = self.state.lock().unwrap();
    let append = state.appending.as_mut().ok_or(Error::InvalidState("no append in flight"))?;
    append.buffer.extend_from_slice(buf);
    Ok(())
  }

  fn end_append(&self) -> Result<Uid> {
    let _guard = self.rwlock.write().unwrap();
    let mut state = self.state.lock().unwrap();
    let append = state.appending.take().ok_or(Error::InvalidState("no append in flight"))?;
    let filename = format!("{}.eml", state.entries.len() + 1);
    let path = self.root.join(&filename);
    if let Err(error) = fs::write(&path, &append.buffer) {
      return Err(Error::io(path, error));
    }
    let size = append.buffer.len() as u64;
    let uid = state.uidnext;
    state.uidnext += 1;
    state.entries.push(Entry {
      uid,
      filename,
      flags: append.flags,
      keywords: append.keywords,
      size,
    });
    let _ = append.internal_date;
    self.persist_metadata(&state)?;
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

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet as Set;

  fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), "bob", '/').unwrap();
    (dir, store)
  }

  #[test]
  fn append_creates_sequential_filenames() {
    let (dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    for body in [&b"one"[..], &b"two"[..]] {
      mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
      mailbox.append_content(body).unwrap();
      mailbox.end_append().unwrap();
    }
    let inbox_path = dir.path().join(name_codec::encode("bob")).join("INBOX");
    assert!(inbox_path.join("1.eml").exists());
    assert!(inbox_path.join("2.eml").exists());
  }

  #[test]
  fn expunge_renumbers_trailing_files() {
    let (dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    for body in [&b"one"[..], &b"two"[..], &b"three"[..]] {
      mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
      mailbox.append_content(body).unwrap();
      mailbox.end_append().unwrap();
    }
    mailbox.delete_message(1).unwrap();
    let removed = mailbox.expunge().unwrap();
    assert_eq!(vec![1], removed);
    assert_eq!(2, mailbox.message_count().unwrap());
    let inbox_path = dir.path().join(name_codec::encode("bob")).join("INBOX");
    assert!(inbox_path.join("1.eml").exists());
    assert!(inbox_path.join("2.eml").exists());
    assert!(!inbox_path.join("3.eml").exists());
    let mut reader = mailbox.message_content(1).unwrap();
    let mut content = String::new();
    io::Read::read_to_string(&mut reader, &mut content).unwrap();
    assert_eq!("two", content);
  }

  #[test]
  fn metadata_survives_reopen() {
    let (dir, store) = open_store();
    {
      let mailbox = store.open_mailbox("INBOX", false).unwrap();
      mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
      mailbox.append_content(b"hello").unwrap();
      mailbox.end_append().unwrap();
      let mut flags = Set::new();
      flags.insert(Flag::Flagged);
      mailbox.set_flags(1, &flags, &Set::new(), true).unwrap();
    }
    let reopened = Store::open(dir.path(), "bob", '/').unwrap();
    let mailbox = reopened.open_mailbox("INBOX", false).unwrap();
    assert!(mailbox.flags(1).unwrap().0.contains(&Flag::Flagged));
    assert_eq!(1, mailbox.unique_id(1).unwrap());
  }

  #[test]
  fn rename_inbox_moves_messages_and_bumps_uidvalidity() {
    let (_dir, store) = open_store();
    let mailbox = store.open_mailbox("INBOX", false).unwrap();
    mailbox.start_append(Set::new(), Set::new(), Local::now()).unwrap();
    mailbox.append_content(b"hello").unwrap();
    mailbox.end_append().unwrap();
    let before = mailbox.uid_validity().unwrap();
    drop(mailbox);
    store.rename_mailbox("INBOX", "Archive").unwrap();
    let archive = store.open_mailbox("Archive", false).unwrap();
    assert_eq!(1, archive.message_count().unwrap());
    let inbox = store.open_mailbox("INBOX", false).unwrap();
    assert_eq!(0, inbox.message_count().unwrap());
    assert_ne!(before, inbox.uid_validity().unwrap());
  }
}
