//! Parses the raw line-oriented output of a monitoring agent into a
//! structured per-host view (including sections piggybacked on behalf of
//! other hosts), persists sections whose validity outlives a single
//! collection cycle, and distills a `check_mk` section into a compact
//! health verdict.
//!
//! The pipeline, end to end: [`header`] and [`framing`] turn raw bytes into
//! a [`accumulator::HostSections`]; [`store`] durably carries sections
//! across collection cycles; [`parser::AgentParser`] ties the two
//! together; [`summarizer`] (with [`version`]) turns the result's
//! `check_mk` section into a status.

pub mod accumulator;
pub mod error;
pub mod framing;
pub mod header;
pub mod parser;
pub mod store;
pub mod summarizer;
pub mod version;

pub use accumulator::{HostSections, Selection};
pub use framing::HostName;
pub use header::SectionName;
pub use parser::{AgentParser, ParserConfig};
pub use store::SectionStore;
pub use summarizer::{summarize, SummarizerConfig};
pub use version::AgentTargetVersion;

use anyhow::Context as _;
use std::{
  collections, fs,
  io::Read as _,
  path,
};

/// CLI surface for the demo binary (`source/main.rs`): flags feed the
/// explicit `ParserConfig`/`SummarizerConfig` structs rather than being
/// read back out of ambient state.
#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Path to raw agent output to parse, or \"-\" for stdin")]
  pub input: String,
  #[arg(long = "hostname", help = "Host name to parse as")]
  pub hostname: String,
  #[arg(
    long = "store-directory",
    help = "Directory holding persisted-section files, one per host"
  )]
  pub store_directory: String,
  #[arg(
    long = "check-interval",
    help = "check_mk check interval in seconds",
    default_value_t = 60
  )]
  pub check_interval: u64,
  #[arg(
    long = "keep-outdated-persisted-sections",
    help = "Keep persisted sections past their valid_until",
    default_value_t = false
  )]
  pub keep_outdated_persisted_sections: bool,
  #[arg(long = "section", help = "Restrict output to this section (repeatable; default: all)")]
  pub sections: Vec<String>,

  #[arg(long = "summarize", help = "Run the check_mk summarizer on the result", default_value_t = false)]
  pub summarize: bool,
  #[arg(
    long = "cluster",
    help = "Treat this host as a cluster (suppresses Version/OS text)",
    default_value_t = false
  )]
  pub is_cluster: bool,
  #[arg(long = "agent-target-version", help = "Literal expected agent version")]
  pub agent_target_version: Option<String>,
  #[arg(long = "only-from", help = "Expected allowed IP range (repeatable)")]
  pub only_from: Vec<String>,
  #[arg(long = "wrong-version-status", default_value_t = 1)]
  pub wrong_version_status: u8,
  #[arg(long = "restricted-address-mismatch-status", default_value_t = 1)]
  pub restricted_address_mismatch_status: u8,
  #[arg(
    long = "debug",
    help = "Propagate version-comparison errors instead of degrading to a status",
    default_value_t = false
  )]
  pub debug_enabled: bool,
}

fn read_input(path: &str) -> anyhow::Result<Vec<u8>> {
  if path == "-" {
    let mut buffer = Vec::new();
    std::io::stdin()
      .read_to_end(&mut buffer)
      .context("couldn't read agent output from stdin")?;
    return Ok(buffer);
  }
  fs::read(path).with_context(|| format!("couldn't read {path:?}"))
}

/// Parses, prints and (optionally) summarizes one host's agent output.
/// Returns the summarizer's status (0 when `--summarize` wasn't passed) so
/// `main` can use it as the process exit code.
pub fn run(arguments: &Arguments) -> anyhow::Result<i32> {
  let raw_bytes = read_input(&arguments.input)?;
  let hostname = HostName::new(arguments.hostname.clone());
  let store = SectionStore::new(
    path::Path::new(&arguments.store_directory).join(&arguments.hostname),
    arguments.keep_outdated_persisted_sections,
  );

  let selection = if arguments.sections.is_empty() {
    Selection::All
  } else {
    let names = arguments
      .sections
      .iter()
      .map(|name| SectionName::new(name))
      .collect::<Result<collections::HashSet<_>, _>>()?;
    Selection::Only(names)
  };

  let parser = AgentParser::new(ParserConfig {
    check_mk_check_interval: arguments.check_interval,
    agent_simulator: None,
  });
  let result = parser.parse(&raw_bytes, &hostname, &store, &selection)?;

  for name in result.section_names() {
    println!("<<<{name}>>>");
    for row in &result.sections[name] {
      println!("{}", row.join(" "));
    }
  }
  for (target, lines) in &result.piggybacked_raw_data {
    log::info!("piggybacked {} line(s) to {target}", lines.len());
  }

  if !arguments.summarize {
    return Ok(0);
  }

  let config = SummarizerConfig {
    agent_target_version: arguments.agent_target_version.clone().map(AgentTargetVersion::Literal),
    only_from: (!arguments.only_from.is_empty()).then(|| arguments.only_from.clone()),
    is_cluster: arguments.is_cluster,
    wrong_version: arguments.wrong_version_status,
    restricted_address_mismatch: arguments.restricted_address_mismatch_status,
    debug_enabled: arguments.debug_enabled,
    legacy_min_version: None,
  };
  let cmk_section = result.sections.get(&SectionName::new("check_mk")?);
  let (status, text, _perfdata) = summarize(cmk_section, true, &config)?;
  println!("{status} {text}");
  Ok(status as i32)
}
