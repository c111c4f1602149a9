// The version/policy summarizer. Operates on the distinguished `check_mk`
// section of an already-parsed `HostSections` and produces a
// `(status, summary_text, perfdata)` verdict.

use crate::accumulator::SectionPayload;
use crate::error::VersionCheckError;
use crate::version::{self, AgentTargetVersion};
use std::collections::{BTreeSet, HashMap};

/// A single performance-data point. Neither sub-check in this crate emits
/// one today (the original never does either); the type exists so a future
/// sub-check has somewhere to put its numbers.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricTuple {
  pub name: String,
  pub value: f64,
  pub warn: Option<f64>,
  pub crit: Option<f64>,
}

/// Everything the summarizer needs, explicit rather than read from ambient
/// process-wide configuration.
#[derive(Clone, Debug, Default)]
pub struct SummarizerConfig {
  pub agent_target_version: Option<AgentTargetVersion>,
  pub only_from: Option<Vec<String>>,
  pub is_cluster: bool,
  pub wrong_version: u8,
  pub restricted_address_mismatch: u8,
  pub debug_enabled: bool,
  /// The legacy `agent_version < agent_min_version` check, preserved
  /// opt-in and flagged rather than dropped: it compares a version string
  /// against another string lexicographically,
  /// which is not a meaningful numeric comparison for most version formats.
  pub legacy_min_version: Option<String>,
}

fn state_marker(status: u8) -> &'static str {
  match status {
    0 => "",
    1 => " (!)",
    2 => " (!!)",
    _ => " (?)",
  }
}

fn get_agent_info(cmk_section: Option<&SectionPayload>) -> HashMap<String, Option<String>> {
  let mut info = HashMap::new();
  info.insert("version".to_string(), Some("unknown".to_string()));
  info.insert("agentos".to_string(), Some("unknown".to_string()));
  let Some(rows) = cmk_section else { return info };
  for row in rows {
    let Some(first) = row.first() else { continue };
    let key = first.strip_suffix(':').unwrap_or(first).to_lowercase();
    let value = if row.len() > 1 { Some(row[1..].join(" ")) } else { None };
    info.insert(key, value);
  }
  info
}

type SubResult = (u8, String, Vec<MetricTuple>);

fn sub_result_version(agent_version: &str, config: &SummarizerConfig) -> anyhow::Result<Option<SubResult>> {
  if let Some(expected) = &config.agent_target_version {
    match version::is_expected_agent_version(agent_version, expected) {
      Ok(true) => (),
      Ok(false) => {
        let status = config.wrong_version;
        return Ok(Some((
          status,
          format!(
            "unexpected agent version {agent_version} (should be {expected}){}",
            state_marker(status)
          ),
          Vec::new(),
        )));
      }
      Err(reason) => {
        let error = VersionCheckError {
          agent_version: agent_version.to_string(),
          expected: expected.to_string(),
          reason,
        };
        if config.debug_enabled {
          return Err(error.into());
        }
        log::warn!("{error}");
        let status = config.wrong_version;
        return Ok(Some((status, format!("{error}{}", state_marker(status)), Vec::new())));
      }
    }
  }

  if let Some(min_version) = &config.legacy_min_version {
    if agent_version < min_version.as_str() {
      log::warn!(
        "legacy agent_min_version check fired (lexicographic string comparison, not numeric): {agent_version:?} < {min_version:?}"
      );
      let status = config.wrong_version;
      return Ok(Some((
        status,
        format!(
          "old plugin version {agent_version} (should be at least {min_version}){}",
          state_marker(status)
        ),
        Vec::new(),
      )));
    }
  }

  Ok(None)
}

fn normalize_ip_ranges(text: &str) -> BTreeSet<String> {
  text.split_ascii_whitespace().map(|token| token.to_ascii_lowercase()).collect()
}

fn sub_result_only_from(agent_only_from: Option<&str>, config: &SummarizerConfig) -> Option<SubResult> {
  let agent_only_from = agent_only_from?;
  let config_only_from = config.only_from.as_ref()?;

  let allowed: BTreeSet<String> = normalize_ip_ranges(agent_only_from);
  let expected: BTreeSet<String> = config_only_from.iter().flat_map(|range| normalize_ip_ranges(range)).collect();

  if allowed == expected {
    let joined: Vec<&str> = allowed.iter().map(String::as_str).collect();
    return Some((0, format!("Allowed IP ranges: {}{}", joined.join(" "), state_marker(0)), Vec::new()));
  }

  let mut infotexts = Vec::new();
  let exceeding: Vec<&str> = allowed.difference(&expected).map(String::as_str).collect();
  if !exceeding.is_empty() {
    infotexts.push(format!("exceeding: {}", exceeding.join(" ")));
  }
  let missing: Vec<&str> = expected.difference(&allowed).map(String::as_str).collect();
  if !missing.is_empty() {
    infotexts.push(format!("missing: {}", missing.join(" ")));
  }

  let status = config.restricted_address_mismatch;
  Some((
    status,
    format!("Unexpected allowed IP ranges ({}){}", infotexts.join(", "), state_marker(status)),
    Vec::new(),
  ))
}

/// Computes the `(status, summary_text, perfdata)` verdict for a host.
/// `for_checking` mirrors a checking-mode run: the version and only-from
/// sub-checks only run in that mode, and only when a `check_mk` section was
/// actually present and carried at least one row.
pub fn summarize(
  cmk_section: Option<&SectionPayload>,
  for_checking: bool,
  config: &SummarizerConfig,
) -> anyhow::Result<(u8, String, Vec<MetricTuple>)> {
  let agent_info = get_agent_info(cmk_section);
  let agent_version = agent_info.get("version").cloned().flatten();

  let mut status = 0u8;
  let mut output = Vec::new();
  let mut perfdata = Vec::new();

  if !config.is_cluster {
    if let Some(version) = &agent_version {
      output.push(format!("Version: {version}"));
    }
    if let Some(agent_os) = agent_info.get("agentos").cloned().flatten() {
      output.push(format!("OS: {agent_os}"));
    }
  }

  // The version sub-check still needs a comparison value even when the
  // `Version:` line itself was omitted above.
  let agent_version = agent_version.unwrap_or_else(|| "unknown".to_string());

  // Python truthiness on the original's `if for_checking and cmk_section:`
  // treats an empty list as falsy: a `check_mk` header with no rows before
  // EOF/footer must skip the sub-checks just like a missing section would,
  // not run them against the "unknown" defaults.
  if for_checking && cmk_section.map_or(false, |section| !section.is_empty()) {
    if let Some((sub_status, sub_output, sub_perfdata)) = sub_result_version(&agent_version, config)? {
      status = status.max(sub_status);
      output.push(sub_output);
      perfdata.extend(sub_perfdata);
    }
    let agent_only_from = agent_info.get("onlyfrom").cloned().flatten();
    if let Some((sub_status, sub_output, sub_perfdata)) = sub_result_only_from(agent_only_from.as_deref(), config) {
      status = status.max(sub_status);
      output.push(sub_output);
      perfdata.extend(sub_perfdata);
    }
  }

  Ok((status, output.join(", "), perfdata))
}
