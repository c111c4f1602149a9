// Section-header mini-language: `<<<name:opt(value):opt(value)...>>>`.
//
// Line classification (host header/footer, piggyback header/footer) lives
// here too since it's all the same delimiter grammar; source/framing.rs only
// drives the state transitions.

use crate::error::HeaderError;
use std::collections;

const ALLOWED_NAME_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.-";

/// An opaque, validated section identifier. Non-empty, restricted to
/// `[A-Za-z0-9_.-]`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SectionName(String);

impl SectionName {
  pub fn new(name: &str) -> Result<Self, HeaderError> {
    if name.is_empty() || !name.chars().all(|c| ALLOWED_NAME_CHARS.contains(c)) {
      return Err(HeaderError {
        line: name.as_bytes().to_vec(),
        reason: "section name isn't a non-empty identifier",
      });
    }
    Ok(Self(name.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for SectionName {
  fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(formatter, "{}", self.0)
  }
}

/// A decoded `(name, options)` pair, plus the already-validated typed
/// projections of the recognized options.
#[derive(Clone, Debug)]
pub struct SectionHeader {
  pub name: SectionName,
  options: collections::HashMap<String, String>,
  cached: Option<(u64, u64)>,
  persist: Option<u64>,
  encoding: String,
  separator: Option<u8>,
  nostrip: bool,
}

fn balanced(value: &str) -> bool {
  let mut depth = 0i32;
  for c in value.chars() {
    match c {
      '(' => depth += 1,
      ')' => depth -= 1,
      _ => (),
    }
    if depth < 0 {
      return false;
    }
  }
  depth == 0
}

fn invalid(line: &[u8], reason: &'static str) -> HeaderError {
  HeaderError {
    line: line.to_vec(),
    reason,
  }
}

fn parse_options(
  line: &[u8],
  tokens: &[&str],
) -> Result<collections::HashMap<String, String>, HeaderError> {
  let mut options = collections::HashMap::new();
  for token in tokens {
    let Some(open) = token.find('(') else {
      // Tokens without "(" carry no value and are ignored.
      continue;
    };
    let (name, rest) = token.split_at(open);
    let rest = &rest[1..]; // drop the "("
    if !rest.ends_with(')') {
      return Err(invalid(line, "option value doesn't end in ')'"));
    }
    let value = &rest[..rest.len() - 1];
    if !balanced(value) {
      return Err(invalid(line, "unbalanced parentheses in option value"));
    }
    options.insert(name.to_string(), value.to_string());
  }
  Ok(options)
}

fn parse_cached(line: &[u8], options: &collections::HashMap<String, String>) -> Result<Option<(u64, u64)>, HeaderError> {
  let Some(value) = options.get("cached") else {
    return Ok(None);
  };
  let mut parts = value.split(',');
  let (Some(captured_at), Some(interval), None) = (parts.next(), parts.next(), parts.next()) else {
    return Err(invalid(line, "cached(...) must be \"captured_at,interval\""));
  };
  let captured_at: u64 = captured_at
    .parse()
    .map_err(|_| invalid(line, "cached(...) captured_at isn't an integer"))?;
  let interval: u64 = interval
    .parse()
    .map_err(|_| invalid(line, "cached(...) interval isn't an integer"))?;
  Ok(Some((captured_at, interval)))
}

fn parse_persist(line: &[u8], options: &collections::HashMap<String, String>) -> Result<Option<u64>, HeaderError> {
  let Some(value) = options.get("persist") else {
    return Ok(None);
  };
  value
    .parse()
    .map(Some)
    .map_err(|_| invalid(line, "persist(...) isn't an integer"))
}

fn parse_separator(line: &[u8], options: &collections::HashMap<String, String>) -> Result<Option<u8>, HeaderError> {
  let Some(value) = options.get("sep") else {
    return Ok(None);
  };
  let code: u32 = value
    .parse()
    .map_err(|_| invalid(line, "sep(...) isn't an integer"))?;
  u8::try_from(code)
    .map(Some)
    .map_err(|_| invalid(line, "sep(...) isn't a single byte"))
}

impl SectionHeader {
  /// Parses the *body* of a host-section header (the part between `<<<` and
  /// `>>>`), e.g. `mem:sep(124):nostrip`.
  pub fn parse(body: &str) -> Result<Self, HeaderError> {
    let line = format!("<<<{body}>>>").into_bytes();
    let mut parts = body.split(':');
    let name = SectionName::new(parts.next().unwrap_or(""))?;
    let tokens: Vec<&str> = parts.collect();
    let options = parse_options(&line, &tokens)?;
    let cached = parse_cached(&line, &options)?;
    let persist = parse_persist(&line, &options)?;
    let separator = parse_separator(&line, &options)?;
    let encoding = options
      .get("encoding")
      .cloned()
      .unwrap_or_else(|| "utf-8".to_string());
    let nostrip = options.contains_key("nostrip");
    Ok(Self {
      name,
      options,
      cached,
      persist,
      encoding,
      separator,
      nostrip,
    })
  }

  pub fn cached(&self) -> Option<(u64, u64)> {
    self.cached
  }

  pub fn persist(&self) -> Option<u64> {
    self.persist
  }

  pub fn encoding(&self) -> &str {
    &self.encoding
  }

  pub fn separator(&self) -> Option<u8> {
    self.separator
  }

  pub fn nostrip(&self) -> bool {
    self.nostrip
  }

  pub fn option(&self, name: &str) -> Option<&str> {
    self.options.get(name).map(String::as_str)
  }

  /// Purely textual check used by the piggyback rewrite rule: neither
  /// `cached(` nor `persist(` must appear as an
  /// option name, checked by substring match on the raw header text, not by
  /// inspecting the decoded options map.
  fn raw_carries_cache_or_persist(raw: &[u8]) -> bool {
    memchr::memmem::find(raw, b":cached(").is_some() || memchr::memmem::find(raw, b":persist(").is_some()
  }
}

fn trimmed(line: &[u8]) -> &[u8] {
  let start = line
    .iter()
    .position(|b| !b.is_ascii_whitespace())
    .unwrap_or(line.len());
  let end = line
    .iter()
    .rposition(|b| !b.is_ascii_whitespace())
    .map(|i| i + 1)
    .unwrap_or(start);
  &line[start..end]
}

pub fn is_host_section_footer(line: &[u8]) -> bool {
  trimmed(line) == b"<<<>>>"
}

pub fn is_piggyback_footer(line: &[u8]) -> bool {
  trimmed(line) == b"<<<<>>>>"
}

pub fn is_piggyback_header(line: &[u8]) -> bool {
  let line = trimmed(line);
  line.starts_with(b"<<<<") && line.ends_with(b">>>>") && !is_piggyback_footer(line)
}

pub fn is_host_section_header(line: &[u8]) -> bool {
  let line = trimmed(line);
  line.starts_with(b"<<<")
    && line.ends_with(b">>>")
    && !is_host_section_footer(line)
    && !is_piggyback_header(line)
    && !is_piggyback_footer(line)
}

/// Rewrites a piggybacked inner host-section header to embed
/// `cached(captured_at, cache_age)` unless it already carries `cached(` or
/// `persist(`. `raw` must already be trimmed and must be a
/// host-section header (`is_host_section_header(raw)`).
pub fn rewrite_with_cache_info(raw: &[u8], captured_at: u64, cache_age: u64) -> Vec<u8> {
  if SectionHeader::raw_carries_cache_or_persist(raw) {
    return raw.to_vec();
  }
  let body = &raw[3..raw.len() - 3];
  let mut rewritten = Vec::with_capacity(raw.len() + 32);
  rewritten.extend_from_slice(b"<<<");
  rewritten.extend_from_slice(body);
  rewritten.extend_from_slice(format!(":cached({captured_at},{cache_age})").as_bytes());
  rewritten.extend_from_slice(b">>>");
  rewritten
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classification() {
    assert!(is_host_section_header(b"<<<check_mk>>>"));
    assert!(!is_host_section_header(b"<<<>>>"));
    assert!(is_host_section_footer(b"<<<>>>"));
    assert!(is_piggyback_header(b"<<<<web01>>>>"));
    assert!(!is_piggyback_header(b"<<<<>>>>"));
    assert!(is_piggyback_footer(b"<<<<>>>>"));
    assert!(!is_host_section_header(b"<<<<web01>>>>"));
  }

  #[test]
  fn trims_surrounding_whitespace() {
    assert!(is_host_section_header(b"  <<<check_mk>>>  \r"));
  }

  #[test]
  fn name_and_simple_option() {
    let header = SectionHeader::parse("mem:sep(124)").unwrap();
    assert_eq!("mem", header.name.as_str());
    assert_eq!(Some(b'|'), header.separator());
  }

  #[test]
  fn tokens_without_parens_are_ignored() {
    let header = SectionHeader::parse("mem:garbage:sep(124)").unwrap();
    assert_eq!(Some(b'|'), header.separator());
  }

  #[test]
  fn cached_and_persist() {
    let header = SectionHeader::parse("foo:cached(1000,90)").unwrap();
    assert_eq!(Some((1000, 90)), header.cached());

    let header = SectionHeader::parse("foo:persist(2000)").unwrap();
    assert_eq!(Some(2000), header.persist());
  }

  #[test]
  fn encoding_default_and_explicit() {
    assert_eq!("utf-8", SectionHeader::parse("foo").unwrap().encoding());
    assert_eq!(
      "latin-1",
      SectionHeader::parse("foo:encoding(latin-1)").unwrap().encoding()
    );
  }

  #[test]
  fn nostrip_presence() {
    assert!(!SectionHeader::parse("foo").unwrap().nostrip());
    assert!(SectionHeader::parse("foo:nostrip").unwrap().nostrip());
  }

  #[test]
  fn missing_closing_paren_is_rejected() {
    assert!(SectionHeader::parse("garbage:broken(").is_err());
  }

  #[test]
  fn unbalanced_parens_rejected() {
    assert!(SectionHeader::parse("foo:bar(a(b)").is_err());
  }

  #[test]
  fn non_integer_cached_is_rejected() {
    assert!(SectionHeader::parse("foo:cached(notanumber,90)").is_err());
  }

  #[test]
  fn empty_name_is_rejected() {
    assert!(SectionHeader::parse("").is_err());
  }

  #[test]
  fn rewrite_adds_cache_info_once() {
    let rewritten = rewrite_with_cache_info(b"<<<uptime>>>", 1000, 90);
    assert_eq!(&b"<<<uptime:cached(1000,90)>>>"[..], &rewritten[..]);
    // Idempotent: rewriting the rewritten header is a no-op.
    let twice = rewrite_with_cache_info(&rewritten, 1000, 90);
    assert_eq!(rewritten, twice);
  }

  #[test]
  fn rewrite_skips_when_persist_present() {
    let raw = b"<<<foo:persist(2000)>>>";
    assert_eq!(raw.to_vec(), rewrite_with_cache_info(raw, 1000, 90));
  }
}
