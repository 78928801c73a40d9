use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;

const EXAMPLES: &str = "\
Examples:
  rawprox 8080:example.com:80
  rawprox 8080:api.example.com:80 3306:db.example.com:3306
  rawprox 9000:server.com:443 @traffic.ndjson
  rawprox 8080:api.example.com:80 --flush-interval-ms=100 @debug.ndjson";

#[derive(Debug, Parser)]
#[command(author, version, about, after_help = EXAMPLES)]
pub struct Cli {
    /// Forwarding rules and output selection.
    ///
    /// LOCAL_PORT:TARGET_HOST:TARGET_PORT adds a forwarding rule (at least one is required,
    /// local ports must be unique). @FILEPATH appends events to that file instead of stdout.
    #[arg(value_name = "ARGS")]
    pub args: Vec<String>,

    /// How often buffered events are written out, in milliseconds [default: 2000].
    #[arg(long, value_name = "MILLISECONDS")]
    pub flush_interval_ms: Option<u64>,

    /// Optional path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (e.g. info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Maps one local listening port to a remote target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardingRule {
    /// Target as configured, in `host:port` form with IPv6 literals bracketed.
    pub fn target(&self) -> String {
        if self.target_host.contains(':') {
            format!("[{}]:{}", self.target_host, self.target_port)
        } else {
            format!("{}:{}", self.target_host, self.target_port)
        }
    }
}

impl FromStr for ForwardingRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (local, rest) = s
            .split_once(':')
            .with_context(|| format!("invalid forwarding rule {s:?}; expected LOCAL_PORT:TARGET_HOST:TARGET_PORT"))?;
        let (host, target) = rest
            .rsplit_once(':')
            .with_context(|| format!("invalid forwarding rule {s:?}; expected LOCAL_PORT:TARGET_HOST:TARGET_PORT"))?;

        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => inner,
            None if host.contains([':', '[', ']']) => {
                bail!("invalid forwarding rule {s:?}; expected LOCAL_PORT:TARGET_HOST:TARGET_PORT")
            }
            None => host,
        };
        if host.is_empty() {
            bail!("invalid forwarding rule {s:?}; target host is empty");
        }

        Ok(Self {
            local_port: parse_port(local)?,
            target_host: host.to_string(),
            target_port: parse_port(target)?,
        })
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.target())
    }
}

fn parse_port(value: &str) -> Result<u16> {
    let port: u32 = value
        .parse()
        .with_context(|| format!("invalid port number {value:?}"))?;
    if !(1..=65535).contains(&port) {
        bail!("port numbers must be between 1 and 65535, got {port}");
    }
    Ok(port as u16)
}

#[serde_as]
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub forward: Vec<ForwardingRule>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str::<FileConfig>(&data)
            .with_context(|| format!("invalid TOML in {}", path.display()))
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub rules: Vec<ForwardingRule>,
    pub output: Option<PathBuf>,
    pub flush_interval: Duration,
}

pub fn load_settings(cli: &Cli) -> Result<Settings> {
    let file = match cli.config.as_ref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let mut rules = file.forward;
    let mut output = file.output;
    for arg in &cli.args {
        if let Some(path) = arg.strip_prefix('@') {
            if path.is_empty() {
                bail!("missing file path after '@'");
            }
            output = Some(PathBuf::from(path));
        } else {
            rules.push(arg.parse()?);
        }
    }
    validate_rules(&rules)?;

    let flush_interval_ms = cli
        .flush_interval_ms
        .or(file.flush_interval_ms)
        .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS);
    if flush_interval_ms == 0 {
        bail!("invalid flush interval: must be at least 1 millisecond");
    }

    Ok(Settings {
        rules,
        output,
        flush_interval: Duration::from_millis(flush_interval_ms),
    })
}

fn validate_rules(rules: &[ForwardingRule]) -> Result<()> {
    if rules.is_empty() {
        bail!("at least one port forwarding rule required");
    }
    let mut used = HashSet::new();
    for rule in rules {
        if !used.insert(rule.local_port) {
            bail!("duplicate local port: {}", rule.local_port);
        }
    }
    Ok(())
}
