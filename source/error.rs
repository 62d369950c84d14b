//! The error taxonomy shared by both backends and every component that can fail.
//!
//! Local, per-message corruption ("skip and log") never reaches this type; see
//! `Mailbox::message_list` and friends, which log and omit instead of propagating.
//! Everything else is surfaced here, verbatim, as the spec's error handling design
//! requires.

use std::{io, path};

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("mailbox {0:?} does not exist")]
  NotFound(String),

  #[error("message {0} does not exist")]
  NoSuchMessage(usize),

  #[error("mailbox {0:?} already exists")]
  Exists(String),

  #[error("mailbox {0:?} has children and cannot be deleted")]
  HasChildren(String),

  #[error("mailbox {0:?} is currently open")]
  InUse(String),

  #[error("operation {0} is not supported by this backend")]
  Unsupported(&'static str),

  #[error("invalid mailbox name {0:?}")]
  InvalidName(String),

  #[error("invalid state: {0}")]
  InvalidState(&'static str),

  #[error("parse error at {position}: {message}")]
  Parse { position: usize, message: String },

  #[error("I/O error on {path:?}: {source}")]
  Io {
    path: path::PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("corrupt mailbox state: {0}")]
  Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  pub fn io(path: impl Into<path::PathBuf>, source: io::Error) -> Self {
    Self::Io {
      path: path.into(),
      source,
    }
  }
}

/// Attaches a path to an `io::Error`, the way `anyhow::Context` attaches a message
/// elsewhere in this crate's internal plumbing.
pub trait IoContext<T> {
  fn path_context(self, path: impl Into<path::PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
  fn path_context(self, path: impl Into<path::PathBuf>) -> Result<T> {
    self.map_err(|source| Error::io(path, source))
  }
}
