//! `maildepotctl`: a small command-line harness over the `maildepot` library,
//! for exercising a mailbox store without a POP3/IMAP front-end attached.
//!
//! Logging setup is carried over verbatim from the teacher's `main.rs`
//! (`log4rs` console + rotating-by-namespace file appender driven by
//! `clap_verbosity_flag`); only the `Arguments`/dispatch shape changed, since
//! this crate exposes a storage library rather than a long-running server.

use clap::Parser as _;
use maildepot::{Flag, MailboxStore};
use std::{collections::HashSet, path};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Backend {
  Maildir,
  Mbox,
}

#[derive(clap::Parser)]
struct Arguments {
  /// Root directory holding every user's mailbox hierarchy.
  #[arg(long, default_value = "./maildepot-data")]
  root: path::PathBuf,
  /// Mailbox owner.
  #[arg(long)]
  user: String,
  /// On-disk backend.
  #[arg(long, value_enum, default_value_t = Backend::Maildir)]
  backend: Backend,
  /// Hierarchy delimiter between mailbox name segments.
  #[arg(long, default_value_t = '/')]
  delimiter: char,
  #[arg(
    long = "log-directory",
    help = "Log directory",
    default_value_t = String::from("$ENV{XDG_RUNTIME_DIR}")
  )]
  log_directory: String,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
  #[command(subcommand)]
  command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
  /// Lists mailboxes matching a pattern (`*`/`%` wildcards).
  List {
    #[arg(default_value = "*")]
    pattern: String,
  },
  /// Creates a mailbox.
  Create { name: String },
  /// Deletes a mailbox.
  Delete { name: String },
  /// Renames a mailbox.
  Rename { old: String, new: String },
  /// Appends a message read from standard input.
  Append {
    mailbox: String,
    #[arg(long, value_delimiter = ',')]
    flags: Vec<String>,
  },
  /// Lists messages in a mailbox.
  Fetch { mailbox: String },
  /// Marks a message `\Deleted` and expunges the mailbox.
  Expunge { mailbox: String },
  /// Evaluates a SEARCH expression against a mailbox.
  Search { mailbox: String, expression: String },
  /// Subscribes to a mailbox.
  Subscribe { name: String },
  /// Unsubscribes from a mailbox.
  Unsubscribe { name: String },
}

fn open_store(arguments: &Arguments) -> anyhow::Result<Box<dyn MailboxStore>> {
  Ok(match arguments.backend {
    Backend::Maildir => Box::new(maildepot::maildir::Store::open(&arguments.root, &arguments.user, arguments.delimiter)?),
    Backend::Mbox => Box::new(maildepot::mbox::Store::open(&arguments.root, &arguments.user, arguments.delimiter)?),
  })
}

fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let store = open_store(arguments)?;
  match &arguments.command {
    Command::List { pattern } => {
      for name in store.list_mailboxes("", pattern)? {
        println!("{name}");
      }
    }
    Command::Create { name } => store.create_mailbox(name)?,
    Command::Delete { name } => store.delete_mailbox(name)?,
    Command::Rename { old, new } => store.rename_mailbox(old, new)?,
    Command::Append { mailbox, flags } => {
      use std::io::Read as _;
      let mut buf = Vec::new();
      std::io::stdin().read_to_end(&mut buf)?;
      let flags: HashSet<Flag> = flags.iter().filter_map(|f| Flag::parse(f)).collect();
      let handle = store.open_mailbox(mailbox, false)?;
      handle.start_append(flags, HashSet::new(), chrono::Local::now())?;
      handle.append_content(&buf)?;
      let uid = handle.end_append()?;
      println!("appended as UID {uid}");
    }
    Command::Fetch { mailbox } => {
      let handle = store.open_mailbox(mailbox, true)?;
      for descriptor in handle.message_list()? {
        let (flags, keywords) = handle.flags(descriptor.sequence)?;
        let flag_names: Vec<&str> = flags.iter().map(|f| f.wire_name()).collect();
        println!(
          "{}\tuid={}\tsize={}\tflags={:?}\tkeywords={:?}",
          descriptor.sequence, descriptor.uid, descriptor.size, flag_names, keywords
        );
      }
    }
    Command::Expunge { mailbox } => {
      let handle = store.open_mailbox(mailbox, false)?;
      let removed = handle.close(true)?;
      println!("expunged {} message(s)", removed.len());
    }
    Command::Search { mailbox, expression } => {
      let handle = store.open_mailbox(mailbox, true)?;
      let expr = maildepot::SearchExpression::parse(expression).map_err(|e| anyhow::anyhow!(e.to_string()))?;
      for sequence in handle.search(&expr)? {
        println!("{sequence}");
      }
    }
    Command::Subscribe { name } => store.subscribe(name)?,
    Command::Unsubscribe { name } => store.unsubscribe(name)?,
  }
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(
    "{d(%F %T)} {l} {t} - {m}{n}",
  ));
  log4rs::init_config(
    log4rs::config::Config::builder()
      .appender(
        log4rs::config::Appender::builder()
          .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
            log::LevelFilter::Trace,
          )))
          .build(
            "file",
            Box::new(
              log4rs::append::file::FileAppender::builder()
                .encoder(encoder.clone())
                .build(path::Path::new(&arguments.log_directory).join("maildepotctl.log"))?,
            ),
          ),
      )
      .appender(
        log4rs::config::Appender::builder()
          .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
            arguments.verbose.log_level_filter(),
          )))
          .build(
            "console",
            Box::new(
              log4rs::append::console::ConsoleAppender::builder()
                .encoder(encoder)
                .build(),
            ),
          ),
      )
      .build(
        log4rs::config::Root::builder()
          .appenders(["console", "file"])
          .build(log::LevelFilter::Trace),
      )?,
  )?;

  run(&arguments)
}
