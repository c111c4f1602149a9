// Hand-rolled error types, matched against with downcast_ref at call sites
// instead of pulling in a derive-macro error crate: a struct per error kind,
// predicate methods for the cases callers need to distinguish, manual
// Display, and an empty impl Error.

use std::{error, fmt, io};

/// Raised by `header::parse` when a section-header line is malformed:
/// either it isn't delimited correctly, or one of its `name(value)` options
/// doesn't end in `)`.
#[derive(Debug)]
pub struct HeaderError {
  pub(crate) line: Vec<u8>,
  pub(crate) reason: &'static str,
}

impl fmt::Display for HeaderError {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      formatter,
      "invalid section header ({}): {:?}",
      self.reason, self.line
    )
  }
}

impl error::Error for HeaderError {}

/// Raised by `store::PersistedSections::load` when the on-disk file exists
/// but isn't a valid serialization of the store (bad magic, truncated
/// entry, non-numeric timestamp, ...).
#[derive(Debug)]
pub struct StoreCorrupt {
  pub(crate) path: std::path::PathBuf,
  pub(crate) reason: String,
}

impl StoreCorrupt {
  /// True when the corruption looks like "this isn't our format at all"
  /// (wrong or missing magic line) as opposed to a truncated/partial write.
  pub fn unrecognized_format(&self) -> bool {
    self.reason.starts_with("bad magic")
  }
}

impl fmt::Display for StoreCorrupt {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      formatter,
      "persisted section store at {:?} is corrupt: {}",
      self.path, self.reason
    )
  }
}

impl error::Error for StoreCorrupt {}

/// Raised when the crash-safe write of the persisted-section store (temp
/// file + fsync + rename) fails partway through.
#[derive(Debug)]
pub struct PersistError {
  pub(crate) path: std::path::PathBuf,
  pub(crate) source: io::Error,
}

impl PersistError {
  pub fn io_error(&self) -> &io::Error {
    &self.source
  }
}

impl fmt::Display for PersistError {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      formatter,
      "couldn't persist section store at {:?}: {}",
      self.path, self.source
    )
  }
}

impl error::Error for PersistError {
  fn source(&self) -> Option<&(dyn error::Error + 'static)> {
    Some(&self.source)
  }
}

/// Raised by the summarizer when an expected-version comparison can't be
/// evaluated (e.g. a daily-build version that doesn't split the way a
/// daily build is supposed to). Not raised when `debug_enabled` is set on
/// `SummarizerConfig` — in that case the underlying error propagates as-is
/// so a developer sees the real failure.
#[derive(Debug)]
pub struct VersionCheckError {
  pub(crate) agent_version: String,
  pub(crate) expected: String,
  pub(crate) reason: String,
}

impl fmt::Display for VersionCheckError {
  fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      formatter,
      "unable to check agent version (agent: {}, expected: {}, error: {})",
      self.agent_version, self.expected, self.reason
    )
  }
}

impl error::Error for VersionCheckError {}
