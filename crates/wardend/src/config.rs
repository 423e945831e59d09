//! warden.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use warden_alarm::parse_duration;
use warden_state::AutoScale;

pub const DEFAULT_DATA_DIR: &str = "/var/lib/warden";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub datasources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
    #[serde(default)]
    pub autoscale: Vec<AutoScale>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    pub data_dir: Option<PathBuf>,
    pub interval: Option<String>,
    pub action_timeout: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    /// Overrides the built-in expression template for this datasource.
    pub expression_template: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ScaleUp,
    ScaleDown,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub kind: ActionKind,
    /// Unit API base for scale actions, target URL for webhooks.
    pub url: String,
    pub token: Option<String>,
}

impl WardenConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: WardenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.daemon.interval()?;
        self.daemon.action_timeout()?;
        let mut names: Vec<&str> = self.actions.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            bail!("action {:?} is configured twice", dup[0]);
        }
        Ok(())
    }
}

impl DaemonConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn interval(&self) -> anyhow::Result<Duration> {
        duration_or(
            "interval",
            self.interval.as_deref(),
            warden_alarm::autoscale::DEFAULT_INTERVAL,
        )
    }

    pub fn action_timeout(&self) -> anyhow::Result<Duration> {
        duration_or(
            "action_timeout",
            self.action_timeout.as_deref(),
            warden_alarm::autoscale::DEFAULT_ACTION_TIMEOUT,
        )
    }
}

fn duration_or(key: &str, raw: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match raw {
        None => Ok(default),
        Some(s) => match parse_duration(s) {
            Some(d) if !d.is_zero() => Ok(d),
            _ => bail!("invalid duration for {key}: {s:?}"),
        },
    }
}
