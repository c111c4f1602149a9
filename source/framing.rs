// The per-line framing state machine: three states sharing a single
// line-consumer capability, dispatched with one step per line. Kept as a
// tagged sum rather than a trait-object hierarchy: demoting to NOOP reads
// cleanest as an explicit state return rather than a subclass swap.

use crate::accumulator::HostSections;
use crate::header::{self, SectionHeader, SectionName};
use std::collections;

const ALLOWED_HOST_NAME_CHARS: &str =
  "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.-";

/// An opaque, sanitized host identifier: every character outside
/// `[A-Za-z0-9_.-]` has already been replaced with `_`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HostName(String);

impl HostName {
  /// Wraps an already-trusted name (the receiving host's own name, as
  /// configured) without re-sanitizing it.
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  /// Sanitizes an arbitrary piggyback target name: replaces every character
  /// outside the allowed alphabet with `_` (host-name translation itself is
  /// an external collaborator and is expected to have already run).
  pub fn sanitize(raw: &str) -> Self {
    let sanitized: String = raw
      .chars()
      .map(|c| if ALLOWED_HOST_NAME_CHARS.contains(c) { c } else { '_' })
      .collect();
    Self(sanitized)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for HostName {
  fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(formatter, "{}", self.0)
  }
}

/// Tracks `persist(...)` requests observed while opening sections, so the
/// orchestrator can stage a persisted entry at the end of the parse (the
/// final payload for a name is only known once every line has been fed).
pub type PersistRequests = collections::HashMap<SectionName, (u64, u64)>;

#[derive(Debug)]
pub enum State {
  Noop,
  HostSection(SectionHeader),
  Piggyback(HostName),
}

pub struct Context<'a> {
  pub hostname: &'a HostName,
  pub accumulator: &'a mut HostSections,
  pub persist_requests: &'a mut PersistRequests,
  pub captured_at: u64,
  pub cache_age: u64,
}

fn trim_ascii(line: &[u8]) -> &[u8] {
  let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
  let end = line
    .iter()
    .rposition(|b| !b.is_ascii_whitespace())
    .map(|i| i + 1)
    .unwrap_or(start);
  &line[start..end]
}

fn piggyback_target(line: &[u8], receiving: &HostName) -> HostName {
  let trimmed = trim_ascii(line);
  let inner = String::from_utf8_lossy(&trimmed[4..trimmed.len() - 4]);
  let target = HostName::sanitize(&inner);
  let _ = receiving; // equality against the receiving host is checked by the caller, not here
  target
}

fn open_host_section(header: SectionHeader, ctx: &mut Context) -> State {
  let name = header.name.clone();
  ctx.accumulator.open_section(&name);
  if let Some(persist_until) = header.persist() {
    if persist_until > ctx.captured_at {
      ctx
        .persist_requests
        .insert(name.clone(), (ctx.captured_at, persist_until));
      ctx
        .accumulator
        .cache_info
        .insert(name.clone(), (ctx.captured_at, persist_until - ctx.captured_at));
    } else {
      log::warn!(
        "ignoring persist({persist_until}) for section {name}: not after captured_at ({})",
        ctx.captured_at
      );
    }
  }
  if let Some((captured_at, interval)) = header.cached() {
    ctx.accumulator.cache_info.insert(name, (captured_at, interval));
  }
  State::HostSection(header)
}

fn try_open_host_section(body: &[u8], ctx: &mut Context) -> State {
  let body = String::from_utf8_lossy(body);
  match SectionHeader::parse(&body) {
    Ok(header) => open_host_section(header, ctx),
    Err(error) => {
      log::warn!("ignoring invalid raw section: {error}");
      State::Noop
    }
  }
}

fn decode_row(line: &[u8], header: &SectionHeader) -> Vec<String> {
  let line = if header.nostrip() { line } else { trim_ascii(line) };
  let text = decode_with_fallback(line, header.encoding());
  match header.separator() {
    Some(sep) => text.split(sep as char).map(str::to_string).collect(),
    None => text.split_ascii_whitespace().map(str::to_string).collect(),
  }
}

/// Decodes `bytes` as `encoding`, falling back to latin-1 (total on any
/// 8-bit input) on failure. Mirrors `ensure_str_with_fallback` in the
/// original implementation.
fn decode_with_fallback(bytes: &[u8], encoding: &str) -> String {
  let label = encoding.as_bytes();
  if let Some(decoder) = encoding_rs::Encoding::for_label(label) {
    let (text, _, had_errors) = decoder.decode(bytes);
    if !had_errors {
      return text.into_owned();
    }
    log::debug!("decode errors under {encoding}, falling back to latin-1");
  } else {
    log::debug!("unknown encoding {encoding:?}, falling back to latin-1");
  }
  // True Latin-1/ISO-8859-1: every byte maps 1:1 to the Unicode code point of
  // the same value, so this is total and never needs encoding_rs itself.
  // encoding_rs has no "ISO-8859-1" label distinct from windows-1252 (the
  // WHATWG mapping reassigns 0x80-0x9F to printable characters), so it can't
  // be reused here.
  bytes.iter().map(|&b| b as char).collect()
}

impl State {
  pub fn feed(self, line: &[u8], ctx: &mut Context) -> State {
    if trim_ascii(line).is_empty() {
      return self;
    }
    match self {
      State::Noop => Self::step_noop(line, ctx),
      State::HostSection(header) => Self::step_host_section(header, line, ctx),
      State::Piggyback(target) => Self::step_piggyback(target, line, ctx),
    }
  }

  fn step_noop(line: &[u8], ctx: &mut Context) -> State {
    if header::is_piggyback_header(line) {
      let target = piggyback_target(line, ctx.hostname);
      return if &target == ctx.hostname {
        State::Noop
      } else {
        State::Piggyback(target)
      };
    }
    if header::is_host_section_header(line) {
      let trimmed = trim_ascii(line);
      let body = &trimmed[3..trimmed.len() - 3];
      return try_open_host_section(body, ctx);
    }
    State::Noop
  }

  fn step_host_section(header: SectionHeader, line: &[u8], ctx: &mut Context) -> State {
    if header::is_piggyback_header(line) {
      let target = piggyback_target(line, ctx.hostname);
      return if &target == ctx.hostname {
        State::HostSection(header)
      } else {
        State::Piggyback(target)
      };
    }
    if header::is_host_section_footer(line) {
      return State::Noop;
    }
    if header::is_host_section_header(line) {
      let trimmed = trim_ascii(line);
      let body = &trimmed[3..trimmed.len() - 3];
      return try_open_host_section(body, ctx);
    }
    let row = decode_row(line, &header);
    ctx.accumulator.append_row(&header.name, row);
    State::HostSection(header)
  }

  fn step_piggyback(target: HostName, line: &[u8], ctx: &mut Context) -> State {
    if header::is_piggyback_footer(line) {
      return State::Noop;
    }
    if header::is_piggyback_header(line) {
      let new_target = piggyback_target(line, ctx.hostname);
      // A self-piggyback header closes the currently-open piggyback block
      // rather than being silently ignored.
      return if &new_target == ctx.hostname {
        State::Noop
      } else {
        State::Piggyback(new_target)
      };
    }
    let to_forward = if header::is_host_section_header(line) {
      let trimmed = trim_ascii(line);
      header::rewrite_with_cache_info(trimmed, ctx.captured_at, ctx.cache_age)
    } else {
      line.to_vec()
    };
    ctx
      .accumulator
      .piggybacked_raw_data
      .entry(target.clone())
      .or_default()
      .push(to_forward);
    State::Piggyback(target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::accumulator::HostSections;

  fn run(lines: &[&[u8]], hostname: &str) -> (HostSections, PersistRequests) {
    let hostname = HostName::new(hostname);
    let mut accumulator = HostSections::default();
    let mut persist_requests = PersistRequests::new();
    let mut state = State::Noop;
    {
      let mut ctx = Context {
        hostname: &hostname,
        accumulator: &mut accumulator,
        persist_requests: &mut persist_requests,
        captured_at: 1000,
        cache_age: 90,
      };
      for line in lines {
        state = state.feed(line, &mut ctx);
      }
    }
    let _ = state;
    (accumulator, persist_requests)
  }

  #[test]
  fn basic_section() {
    let (accumulator, _) = run(
      &[b"<<<check_mk>>>", b"Version: 2.0.0", b"AgentOS: linux", b"<<<>>>"],
      "myhost",
    );
    assert_eq!(
      &vec![
        vec!["Version:".to_string(), "2.0.0".to_string()],
        vec!["AgentOS:".to_string(), "linux".to_string()],
      ],
      accumulator.sections.get(&SectionName::new("check_mk").unwrap()).unwrap()
    );
  }

  #[test]
  fn piggyback_rewrite() {
    let (accumulator, _) = run(&[b"<<<<web01>>>>", b"<<<uptime>>>", b"123", b"<<<<>>>>"], "myhost");
    let raw = accumulator
      .piggybacked_raw_data
      .get(&HostName::sanitize("web01"))
      .unwrap();
    assert_eq!(&b"<<<uptime:cached(1000,90)>>>"[..], &raw[0][..]);
    assert_eq!(&b"123"[..], &raw[1][..]);
  }

  #[test]
  fn custom_separator() {
    let (accumulator, _) = run(&[b"<<<mem:sep(124)>>>", b"MemTotal|1024"], "myhost");
    assert_eq!(
      &vec![vec!["MemTotal".to_string(), "1024".to_string()]],
      accumulator.sections.get(&SectionName::new("mem").unwrap()).unwrap()
    );
  }

  #[test]
  fn invalid_utf8_falls_back_to_true_latin1() {
    // 0xe9 is not valid UTF-8 on its own, so the declared (default) utf-8
    // decode fails and the latin-1 fallback kicks in: byte 0xe9 must map to
    // U+00E9 (e-acute), not to windows-1252's reassignment of that range.
    let (accumulator, _) = run(&[b"<<<raw>>>", b"caf\xe9"], "myhost");
    assert_eq!(
      &vec![vec!["caf\u{e9}".to_string()]],
      accumulator.sections.get(&SectionName::new("raw").unwrap()).unwrap()
    );
  }

  #[test]
  fn persist_stages_request() {
    let (_, persist_requests) = run(&[b"<<<foo:persist(2000)>>>", b"a b"], "myhost");
    assert_eq!(
      Some(&(1000, 2000)),
      persist_requests.get(&SectionName::new("foo").unwrap())
    );
  }

  #[test]
  fn persist_in_the_past_is_dropped_not_staged() {
    // captured_at is 1000 in these tests; a persist(...) at or before that
    // can never satisfy valid_until > captured_at, so it must never reach
    // the store instead of poisoning it for the next load().
    let (accumulator, persist_requests) = run(&[b"<<<foo:persist(10)>>>", b"a b"], "myhost");
    assert!(persist_requests.get(&SectionName::new("foo").unwrap()).is_none());
    assert!(!accumulator.cache_info.contains_key(&SectionName::new("foo").unwrap()));
    // The section itself is still parsed normally; only persistence is skipped.
    assert_eq!(
      &vec![vec!["a".to_string(), "b".to_string()]],
      accumulator.sections.get(&SectionName::new("foo").unwrap()).unwrap()
    );
  }

  #[test]
  fn broken_header_is_isolated() {
    let (accumulator, _) = run(&[b"<<<garbage:broken(>>>", b"<<<ok>>>", b"x"], "myhost");
    assert!(!accumulator.sections.contains_key(&SectionName::new("garbage").unwrap()));
    assert_eq!(
      &vec![vec!["x".to_string()]],
      accumulator.sections.get(&SectionName::new("ok").unwrap()).unwrap()
    );
  }

  #[test]
  fn self_piggyback_is_dropped() {
    let (accumulator, _) = run(&[b"<<<<myhost>>>>", b"payload"], "myhost");
    assert!(accumulator.piggybacked_raw_data.is_empty());
  }

  #[test]
  fn self_piggyback_closes_open_block() {
    let (accumulator, _) = run(
      &[b"<<<<web01>>>>", b"line1", b"<<<<myhost>>>>", b"line2"],
      "myhost",
    );
    let raw = accumulator.piggybacked_raw_data.get(&HostName::sanitize("web01")).unwrap();
    assert_eq!(1, raw.len()); // "line2" landed nowhere, the self-piggyback closed the block
  }

  #[test]
  fn footer_is_optional() {
    let (with_footer, _) = run(&[b"<<<check_mk>>>", b"a b", b"<<<>>>"], "myhost");
    let (without_footer, _) = run(&[b"<<<check_mk>>>", b"a b"], "myhost");
    assert_eq!(with_footer.sections, without_footer.sections);
  }

  #[test]
  fn repeated_identical_header_appends_not_clears() {
    let (once, _) = run(&[b"<<<check_mk>>>", b"a b"], "myhost");
    let (twice, _) = run(&[b"<<<check_mk>>>", b"<<<check_mk>>>", b"a b"], "myhost");
    assert_eq!(once.sections, twice.sections);
  }

  #[test]
  fn nostrip_preserves_empty_fields_with_separator() {
    // sep(32) is a literal space: exact split, preserving empty leading/trailing fields.
    let (accumulator, _) = run(&[b"<<<raw:nostrip:sep(32)>>>", b"  spaced  "], "myhost");
    assert_eq!(
      &vec![vec![
        "".to_string(),
        "".to_string(),
        "spaced".to_string(),
        "".to_string(),
        "".to_string()
      ]],
      accumulator.sections.get(&SectionName::new("raw").unwrap()).unwrap()
    );

    let (stripped, _) = run(&[b"<<<raw2:sep(32)>>>", b"  spaced  "], "myhost");
    assert_eq!(
      &vec![vec!["spaced".to_string()]],
      stripped.sections.get(&SectionName::new("raw2").unwrap()).unwrap()
    );
  }
}
