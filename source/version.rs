// Version-string helpers: daily-build detection and a monotonic integer
// encoding of a release version string, used to compare an agent's
// self-reported version against an expected minimum.
//
// The exact pre-release ordering below (a plain release outranks `p`
// outranks `i` outranks `b` pre-releases of the same dotted prefix) is this
// crate's own choice — see DESIGN.md.

fn is_date_like(component: &str) -> bool {
  let parts: Vec<&str> = component.split('.').collect();
  parts.len() == 3
    && parts[0].len() == 4
    && parts.iter().all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// A daily build is named either `YYYY.MM.DD` (the `master` branch) or
/// `branch-YYYY.MM.DD` (a branch build).
pub fn is_daily_build_version(version: &str) -> bool {
  match version.rsplit_once('-') {
    Some((_, date)) if is_date_like(date) => true,
    _ => is_date_like(version),
  }
}

/// `"master"` for a bare date, or the text before the `-` for a branch build.
pub fn branch_of_daily_build(version: &str) -> &str {
  match version.rsplit_once('-') {
    Some((branch, date)) if is_date_like(date) => branch,
    _ => "master",
  }
}

/// The date portion of a daily build, encoded as an integer with dots
/// removed (`2014.06.01` -> `20140601`), regardless of branch.
pub fn daily_build_number(version: &str) -> Option<u64> {
  let date = match version.rsplit_once('-') {
    Some((_, date)) if is_date_like(date) => date,
    _ if is_date_like(version) => version,
    _ => return None,
  };
  date.replace('.', "").parse().ok()
}

/// Encodes a release version string (`MAJOR.MINOR.PATCH[p|i|b<N>]`) into a
/// monotonically comparable integer. A plain release outranks a `p`
/// (patch), `i` (innovation) or `b` (beta) pre-release sharing the same
/// dotted prefix.
pub fn parse_release_version(version: &str) -> Option<u64> {
  let split_at = version.find(|c: char| !c.is_ascii_digit() && c != '.');
  let (prefix, tag) = match split_at {
    None => (version, None),
    Some(index) => {
      let (prefix, rest) = version.split_at(index);
      let mut chars = rest.chars();
      let letter = chars.next()?;
      if !matches!(letter, 'p' | 'i' | 'b') {
        return None;
      }
      let number_text = &rest[letter.len_utf8()..];
      let number: u64 = if number_text.is_empty() { 0 } else { number_text.parse().ok()? };
      (prefix, Some((letter, number)))
    }
  };

  let mut components = [0u64; 3];
  let parts: Vec<&str> = prefix.split('.').collect();
  if parts.is_empty() || parts.len() > 3 || parts.iter().any(|part| part.is_empty()) {
    return None;
  }
  for (slot, part) in components.iter_mut().zip(parts.iter()) {
    *slot = part.parse().ok()?;
  }

  let base = (components[0] * 1_000 + components[1]) * 1_000 + components[2];
  let (tag_rank, tag_number) = match tag {
    None => (3u64, 0u64),
    Some(('p', n)) => (2, n),
    Some(('i', n)) => (1, n),
    Some(('b', n)) => (0, n),
    Some(_) => unreachable!(),
  };
  Some((base * 4 + tag_rank) * 1_000 + tag_number.min(999))
}

/// What a host's `check_mk` agent version is expected to satisfy,
/// configured per-host rather than read from ambient state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AgentTargetVersion {
  Literal(String),
  AtLeast {
    daily_build: Option<String>,
    release: Option<String>,
  },
}

impl std::fmt::Display for AgentTargetVersion {
  fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Literal(version) => write!(formatter, "{version}"),
      Self::AtLeast { daily_build, release } => {
        write!(formatter, "at least")?;
        if let Some(daily_build) = daily_build {
          write!(formatter, " build {daily_build}")?;
        }
        if let Some(release) = release {
          if daily_build.is_some() {
            write!(formatter, " or")?;
          }
          write!(formatter, " release {release}")?;
        }
        Ok(())
      }
    }
  }
}

/// Whether `agent_version` satisfies `expected`. `Ok(false)` is a normal
/// mismatch; `Err` is an unevaluable comparison (malformed daily-build or
/// release string) for the caller to turn into a `VersionCheckError`.
pub fn is_expected_agent_version(agent_version: &str, expected: &AgentTargetVersion) -> Result<bool, String> {
  if agent_version.is_empty() || matches!(agent_version, "(unknown)" | "None") {
    return Ok(false);
  }
  match expected {
    AgentTargetVersion::Literal(text) => Ok(text == agent_version),
    AgentTargetVersion::AtLeast { daily_build, release } => {
      let agent_is_daily_build = is_daily_build_version(agent_version);
      if agent_is_daily_build && daily_build.is_some() {
        let expected_text = daily_build.as_ref().unwrap();
        let expected_number = daily_build_number(expected_text)
          .ok_or_else(|| format!("malformed expected daily build version {expected_text:?}"))?;
        let agent_number = daily_build_number(agent_version)
          .ok_or_else(|| format!("malformed daily build agent version {agent_version:?}"))?;
        Ok(agent_number >= expected_number)
      } else if let Some(release) = release {
        if agent_is_daily_build {
          // A daily build never satisfies a release-only expectation.
          Ok(false)
        } else {
          let agent_number = parse_release_version(agent_version)
            .ok_or_else(|| format!("malformed agent version {agent_version:?}"))?;
          let expected_number = parse_release_version(release)
            .ok_or_else(|| format!("malformed expected release version {release:?}"))?;
          Ok(agent_number >= expected_number)
        }
      } else {
        Ok(true)
      }
    }
  }
}
