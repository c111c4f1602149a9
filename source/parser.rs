// The orchestrator tying header/framing/accumulator/store together.
// `AgentParser::parse` is the one public entry point a caller needs: raw
// bytes in, a filtered `HostSections` out.

use crate::accumulator::{HostSections, Selection};
use crate::framing::{Context, HostName, PersistRequests, State};
use crate::store::{PersistedSections, SectionStore};

/// An external collaborator that may rewrite the raw agent output before
/// it's parsed.
pub type Simulator = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Tunables for one `AgentParser`, passed in at construction instead of
/// read from ambient configuration.
pub struct ParserConfig {
  pub check_mk_check_interval: u64,
  pub agent_simulator: Option<Simulator>,
}

impl Default for ParserConfig {
  fn default() -> Self {
    Self {
      check_mk_check_interval: 60,
      agent_simulator: None,
    }
  }
}

fn now_seconds() -> u64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

/// Ties the framing state machine, the in-memory accumulator and the
/// on-disk persisted-section store into a single `parse` operation.
pub struct AgentParser {
  config: ParserConfig,
}

impl AgentParser {
  pub fn new(config: ParserConfig) -> Self {
    Self { config }
  }

  /// Runs the full pipeline: simulator hook (if any) -> line split ->
  /// framing -> persisted-store update -> persisted-store merge ->
  /// selection filter.
  pub fn parse(
    &self,
    raw_bytes: &[u8],
    hostname: &HostName,
    store: &SectionStore,
    selection: &Selection,
  ) -> anyhow::Result<HostSections> {
    let simulated;
    let raw_bytes = match &self.config.agent_simulator {
      Some(simulate) => {
        simulated = simulate(raw_bytes);
        &simulated[..]
      }
      None => raw_bytes,
    };

    let captured_at = now_seconds();
    let cache_age = (self.config.check_mk_check_interval * 3) / 2; // floor(1.5 * interval)

    let mut accumulator = HostSections::default();
    let mut persist_requests = PersistRequests::new();
    let mut state = State::Noop;
    {
      let mut ctx = Context {
        hostname,
        accumulator: &mut accumulator,
        persist_requests: &mut persist_requests,
        captured_at,
        cache_age,
      };
      for line in raw_bytes.split(|&byte| byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        state = state.feed(line, &mut ctx);
      }
    }
    let _ = state; // trailing state is discarded; only the accumulator matters

    // The final payload for a persist(...) section is only known once every
    // line has been fed, so requests staged during framing are resolved
    // against the finished accumulator here.
    let mut fresh = PersistedSections::new();
    for (name, (captured_at, persist_until)) in persist_requests.iter() {
      if let Some(payload) = accumulator.sections.get(name) {
        fresh.insert(name.clone(), (*captured_at, *persist_until, payload.clone()));
      }
    }
    store.update(&fresh)?;
    store.merge_into(&mut accumulator, captured_at)?;

    Ok(accumulator.filter(selection))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header::SectionName;

  fn parse(raw: &[u8], hostname: &str, store: &SectionStore) -> HostSections {
    let parser = AgentParser::new(ParserConfig {
      check_mk_check_interval: 60,
      ..Default::default()
    });
    parser
      .parse(raw, &HostName::new(hostname), store, &Selection::All)
      .unwrap()
  }

  #[test]
  fn basic_section() {
    let dir = tempfile::tempdir().unwrap();
    let store = SectionStore::new(dir.path().join("store"), false);
    let accumulator = parse(b"<<<check_mk>>>\nVersion: 2.0.0\nAgentOS: linux\n<<<>>>\n", "myhost", &store);
    assert_eq!(
      &vec![
        vec!["Version:".to_string(), "2.0.0".to_string()],
        vec!["AgentOS:".to_string(), "linux".to_string()],
      ],
      accumulator.sections.get(&SectionName::new("check_mk").unwrap()).unwrap()
    );
  }

  #[test]
  fn persist_request_is_written_and_merged_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = SectionStore::new(dir.path().join("store"), false);
    let accumulator = parse(b"<<<foo:persist(99999999999)>>>\na b\n", "myhost", &store);
    assert_eq!(
      &vec![vec!["a".to_string(), "b".to_string()]],
      accumulator.sections.get(&SectionName::new("foo").unwrap()).unwrap()
    );

    // A second, empty parse should still see the persisted section merged
    // back in from disk: fresh wins when present, persisted survives gaps.
    let accumulator = parse(b"", "myhost", &store);
    assert_eq!(
      &vec![vec!["a".to_string(), "b".to_string()]],
      accumulator.sections.get(&SectionName::new("foo").unwrap()).unwrap()
    );
  }

  #[test]
  fn selection_filters_returned_sections() {
    let dir = tempfile::tempdir().unwrap();
    let store = SectionStore::new(dir.path().join("store"), false);
    let parser = AgentParser::new(ParserConfig::default());
    let mut keep = std::collections::HashSet::new();
    keep.insert(SectionName::new("mem").unwrap());
    let accumulator = parser
      .parse(
        b"<<<check_mk>>>\na\n<<<>>>\n<<<mem>>>\nb\n<<<>>>\n",
        &HostName::new("myhost"),
        &store,
        &Selection::Only(keep),
      )
      .unwrap();
    assert!(accumulator.sections.contains_key(&SectionName::new("mem").unwrap()));
    assert!(!accumulator.sections.contains_key(&SectionName::new("check_mk").unwrap()));
  }

  #[test]
  fn agent_simulator_hook_rewrites_raw_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SectionStore::new(dir.path().join("store"), false);
    let parser = AgentParser::new(ParserConfig {
      agent_simulator: Some(Box::new(|_raw: &[u8]| b"<<<check_mk>>>\nVersion: sim\n".to_vec())),
      ..Default::default()
    });
    let accumulator = parser
      .parse(b"ignored", &HostName::new("myhost"), &store, &Selection::All)
      .unwrap();
    assert_eq!(
      &vec![vec!["Version:".to_string(), "sim".to_string()]],
      accumulator.sections.get(&SectionName::new("check_mk").unwrap()).unwrap()
    );
  }
}
