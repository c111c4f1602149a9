// The on-disk persisted-section store, one file per host.
//
// Format is a small, self-rolled, versioned text format rather than pulling
// in a serialization crate for what's a handful of tab-separated fields.
//
// MAGIC\n
// (SECTIONNAME \t captured_at \t valid_until \t row_count \n
//  ROW...                                                     ){row_count}
// ...

use crate::accumulator::{HostSections, PersistedEntry, SectionPayload};
use crate::error::{PersistError, StoreCorrupt};
use crate::header::SectionName;
use std::{collections, fs, io::Write as _, path};

const MAGIC: &str = "agentwire-persisted-sections v1";

/// An in-memory snapshot of the store's content: SectionName ->
/// `(captured_at, valid_until, payload)`.
#[derive(Clone, Debug, Default)]
pub struct PersistedSections(collections::HashMap<SectionName, PersistedEntry>);

impl PersistedSections {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: SectionName, entry: PersistedEntry) {
    self.0.insert(name, entry);
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, name: &SectionName) -> Option<&PersistedEntry> {
    self.0.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&SectionName, &PersistedEntry)> {
    self.0.iter()
  }
}

fn escape_field(field: &str) -> String {
  let mut escaped = String::with_capacity(field.len());
  for c in field.chars() {
    match c {
      '\\' => escaped.push_str("\\\\"),
      '\t' => escaped.push_str("\\t"),
      '\n' => escaped.push_str("\\n"),
      _ => escaped.push(c),
    }
  }
  escaped
}

fn unescape_field(field: &str) -> Option<String> {
  let mut unescaped = String::with_capacity(field.len());
  let mut chars = field.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      unescaped.push(c);
      continue;
    }
    match chars.next()? {
      '\\' => unescaped.push('\\'),
      't' => unescaped.push('\t'),
      'n' => unescaped.push('\n'),
      _ => return None,
    }
  }
  Some(unescaped)
}

fn serialize(sections: &PersistedSections) -> String {
  let mut out = String::new();
  out.push_str(MAGIC);
  out.push('\n');
  for (name, (captured_at, valid_until, payload)) in sections.iter() {
    out.push_str(&format!("{}\t{}\t{}\t{}\n", name, captured_at, valid_until, payload.len()));
    for row in payload {
      let fields: Vec<String> = row.iter().map(|field| escape_field(field)).collect();
      out.push_str(&fields.join("\t"));
      out.push('\n');
    }
  }
  out
}

fn deserialize(path: &path::Path, content: &str) -> Result<PersistedSections, StoreCorrupt> {
  let corrupt = |reason: String| StoreCorrupt {
    path: path.to_path_buf(),
    reason,
  };
  let mut lines = content.lines();
  match lines.next() {
    Some(magic) if magic == MAGIC => (),
    Some(other) => return Err(corrupt(format!("bad magic line {other:?}"))),
    None => return Err(corrupt("empty file".to_string())),
  }
  let mut sections = PersistedSections::new();
  loop {
    let Some(header) = lines.next() else { break };
    let fields: Vec<&str> = header.split('\t').collect();
    let [name, captured_at, valid_until, row_count] = fields[..] else {
      return Err(corrupt(format!("malformed entry header {header:?}")));
    };
    let name =
      SectionName::new(name).map_err(|_| corrupt(format!("invalid section name {name:?}")))?;
    let captured_at: u64 = captured_at
      .parse()
      .map_err(|_| corrupt(format!("non-integer captured_at in {header:?}")))?;
    let valid_until: u64 = valid_until
      .parse()
      .map_err(|_| corrupt(format!("non-integer valid_until in {header:?}")))?;
    if valid_until <= captured_at {
      return Err(corrupt(format!(
        "valid_until must be after captured_at in {header:?}"
      )));
    }
    let row_count: usize = row_count
      .parse()
      .map_err(|_| corrupt(format!("non-integer row count in {header:?}")))?;
    let mut payload: SectionPayload = Vec::with_capacity(row_count);
    for _ in 0..row_count {
      let row = lines
        .next()
        .ok_or_else(|| corrupt("truncated payload".to_string()))?;
      let fields = row
        .split('\t')
        .map(unescape_field)
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| corrupt(format!("malformed escape sequence in row {row:?}")))?;
      payload.push(fields);
    }
    sections.insert(name, (captured_at, valid_until, payload));
  }
  Ok(sections)
}

/// A per-host durable store of persisted sections, backed by a single file.
/// Concurrent parses for the *same* host must be serialized by the caller
/// (an advisory lock on the store file is enough); this type performs no
/// locking of its own.
pub struct SectionStore {
  path: path::PathBuf,
  keep_outdated: bool,
}

impl SectionStore {
  pub fn new(path: impl Into<path::PathBuf>, keep_outdated: bool) -> Self {
    Self {
      path: path.into(),
      keep_outdated,
    }
  }

  /// Deserializes the store from disk. A missing file is an empty store;
  /// anything else unreadable-as-our-format is `StoreCorrupt`.
  pub fn load(&self) -> anyhow::Result<PersistedSections> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(PersistedSections::new()),
      Err(error) => {
        return Err(PersistError {
          path: self.path.clone(),
          source: error,
        }
        .into())
      }
    };
    Ok(deserialize(&self.path, &content)?)
  }

  /// Replaces, for every name in `fresh`, the on-disk entry (fresh always
  /// wins), then writes the result crash-safely: temp file in the same
  /// directory, `fsync`, atomic rename.
  pub fn update(&self, fresh: &PersistedSections) -> anyhow::Result<()> {
    if fresh.is_empty() {
      return Ok(());
    }
    let mut merged = self.load()?;
    for (name, entry) in fresh.iter() {
      merged.insert(name.clone(), entry.clone());
    }
    self.write_atomically(&merged)
  }

  fn write_atomically(&self, sections: &PersistedSections) -> anyhow::Result<()> {
    let content = serialize(sections);
    let persist_error = |source| {
      PersistError {
        path: self.path.clone(),
        source,
      }
      .into()
    };
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).map_err(persist_error)?;
    }
    let file_name = self
      .path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();
    let tmp_path = self
      .path
      .with_file_name(format!("{file_name}.tmp-{}", std::process::id()));
    let mut tmp = fs::File::create(&tmp_path).map_err(persist_error)?;
    tmp.write_all(content.as_bytes()).map_err(persist_error)?;
    tmp.sync_all().map_err(persist_error)?;
    fs::rename(&tmp_path, &self.path).map_err(persist_error)?;
    Ok(())
  }

  /// Merges persisted entries into `accumulator`: fresh sections always
  /// win, outdated entries are dropped unless `keep_outdated` was set at
  /// construction. Every entry that survives (fresh-shadowed or not) is
  /// also recorded in `accumulator.persisted_sections`, so a caller can see
  /// which sections are currently durable and under what horizon.
  pub fn merge_into(&self, accumulator: &mut HostSections, now: u64) -> anyhow::Result<()> {
    let persisted = self.load()?;
    for (name, (captured_at, valid_until, payload)) in persisted.iter() {
      // spec.md §4.4's own order: check fresh-wins first. A name already
      // present in accumulator.sections is never dropped-as-outdated or
      // logged about, even if its persisted copy has in fact expired — it
      // was never going to be used anyway, but it still surfaces through
      // persisted_sections so a caller can see the durable entry.
      if accumulator.sections.contains_key(name) {
        accumulator
          .persisted_sections
          .insert(name.clone(), (*captured_at, *valid_until, payload.clone()));
        continue;
      }
      if now > *valid_until && !self.keep_outdated {
        log::info!("dropping outdated persisted section {name} (valid until {valid_until}, now {now})");
        continue;
      }
      accumulator
        .persisted_sections
        .insert(name.clone(), (*captured_at, *valid_until, payload.clone()));
      accumulator.sections.insert(name.clone(), payload.clone());
      accumulator
        .cache_info
        .insert(name.clone(), (*captured_at, valid_until.saturating_sub(*captured_at)));
    }
    Ok(())
  }
}
