use std::time::Duration;

use anyhow::{bail, Context, Result};

use fleet_rpc::BlockingQueryConfig;

use crate::bad_nodes::BadNodeTrackerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct PlanApplierConfig {
    /// Plans that may wait in the queue before submitters block.
    pub queue_depth: usize,
    /// How long a plan may wait for the store to reach its snapshot index.
    pub snapshot_wait: Duration,
}

impl Default for PlanApplierConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            snapshot_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub applier: PlanApplierConfig,
    pub bad_nodes: BadNodeTrackerConfig,
    pub blocking: BlockingQueryConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let region = lookup("FLEET_REGION").unwrap_or_else(|| "global".to_string());

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let log_format = match lookup("FLEET_LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => bail!("FLEET_LOG_FORMAT must be json or pretty, got {other:?}"),
        };

        let queue_depth: usize = parse(&lookup, "FLEET_PLAN_QUEUE_DEPTH", 64)?;
        if queue_depth == 0 {
            bail!("FLEET_PLAN_QUEUE_DEPTH must be positive");
        }
        let snapshot_wait = Duration::from_secs(parse(&lookup, "FLEET_SNAPSHOT_WAIT_SECS", 5)?);

        let bad_nodes = BadNodeTrackerConfig {
            threshold: parse(&lookup, "FLEET_BAD_NODE_THRESHOLD", 100)?,
            window: Duration::from_secs(parse(&lookup, "FLEET_BAD_NODE_WINDOW_SECS", 300)?),
        };

        let blocking = BlockingQueryConfig {
            max_query_time: Duration::from_secs(parse(&lookup, "FLEET_MAX_QUERY_TIME_SECS", 300)?),
            ..BlockingQueryConfig::default()
        };

        Ok(Self {
            region,
            log_level,
            log_format,
            applier: PlanApplierConfig {
                queue_depth,
                snapshot_wait,
            },
            bad_nodes,
            blocking,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
