// Shared scaffolding for the integration tests: a tempfile-backed
// persisted-section store plus a thin wrapper around `AgentParser::parse`.

use agentwire::{AgentParser, HostName, ParserConfig, SectionStore, Selection};

pub struct Harness {
  directory: tempfile::TempDir,
}

impl Harness {
  pub fn new() -> Self {
    Self {
      directory: tempfile::tempdir().unwrap(),
    }
  }

  pub fn store(&self, keep_outdated: bool) -> SectionStore {
    SectionStore::new(self.directory.path().join("store"), keep_outdated)
  }

  pub fn parse(&self, raw: &[u8], hostname: &str, check_interval: u64) -> agentwire::HostSections {
    self.parse_with(raw, hostname, check_interval, &self.store(false))
  }

  pub fn parse_with(
    &self,
    raw: &[u8],
    hostname: &str,
    check_interval: u64,
    store: &SectionStore,
  ) -> agentwire::HostSections {
    let parser = AgentParser::new(ParserConfig {
      check_mk_check_interval: check_interval,
      agent_simulator: None,
    });
    parser.parse(raw, &HostName::new(hostname), store, &Selection::All).unwrap()
  }
}
