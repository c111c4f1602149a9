// The in-memory per-host accumulator built up over one parse.

use crate::framing::HostName;
use crate::header::SectionName;
use std::collections;

/// A section's content: an ordered sequence of rows, each row an ordered
/// sequence of decoded text fields.
pub type SectionPayload = Vec<Vec<String>>;

/// What a caller asks `AgentParser::parse` to keep in the returned
/// `HostSections`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selection {
  All,
  Only(collections::HashSet<SectionName>),
}

/// A persisted entry as carried inside a `HostSections` once the store has
/// been merged in: `(captured_at, valid_until, payload)`.
pub type PersistedEntry = (u64, u64, SectionPayload);

/// The accumulator built up by one `AgentParser::parse` call.
/// Insertion order of `sections` is preserved (`IndexMap`-less: a
/// `Vec<SectionName>` alongside the map would add nothing a `HashMap` +
/// first-insertion bookkeeping doesn't already give the one place that
/// cares — the CLI's printing order — so we track it there instead).
#[derive(Clone, Debug, Default)]
pub struct HostSections {
  pub sections: collections::HashMap<SectionName, SectionPayload>,
  pub piggybacked_raw_data: collections::HashMap<HostName, Vec<Vec<u8>>>,
  pub cache_info: collections::HashMap<SectionName, (u64, u64)>,
  pub persisted_sections: collections::HashMap<SectionName, PersistedEntry>,
  order: Vec<SectionName>,
}

impl HostSections {
  /// Ensures a section exists (creating it empty if this is the first time
  /// its header is seen), without touching any rows already there — the
  /// "repeated headers append, never clear" invariant.
  pub fn open_section(&mut self, name: &SectionName) {
    if !self.sections.contains_key(name) {
      self.sections.insert(name.clone(), Vec::new());
      self.order.push(name.clone());
    }
  }

  pub fn append_row(&mut self, name: &SectionName, row: Vec<String>) {
    self.open_section(name);
    self.sections.get_mut(name).unwrap().push(row);
  }

  /// Names in insertion order, for deterministic output (CLI printing,
  /// golden-file tests).
  pub fn section_names(&self) -> &[SectionName] {
    &self.order
  }

  /// Restricts `sections`/`cache_info` to `selection`. Piggybacked raw
  /// data is always retained in full.
  pub fn filter(mut self, selection: &Selection) -> Self {
    let Selection::Only(keep) = selection else {
      return self;
    };
    self.sections.retain(|name, _| keep.contains(name));
    self.cache_info.retain(|name, _| keep.contains(name));
    self.order.retain(|name| keep.contains(name));
    self
  }
}
