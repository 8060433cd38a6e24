use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, DurationMilliSeconds};
use tokio::runtime::Runtime;
use tracing::level_filters::LevelFilter;

use crate::ring::Address;
use crate::transport::path::ROOT;

/// Default period of the node heartbeat.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Current version of the crate.
pub(crate) const PCK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drives tasks spawned from threads without a tokio context, such as edge
/// close callbacks fired by a foreign transport.
static FALLBACK_RT: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    tracing::debug!("Building fallback runtime");
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("ringlink-fallback")
        .enable_time()
        .build()
        .inspect_err(|error| tracing::error!(%error, "Failed building fallback runtime"))
        .ok()
});

#[derive(clap::Parser, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Configuration file, TOML unless the extension is `.json`.
    #[arg(long, short, env = "RINGLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address of this node, random when not given.
    #[arg(long, env = "RINGLINK_ADDRESS")]
    pub address: Option<Address>,

    /// Paths to multiplex over the physical listener.
    #[arg(long = "path", env = "RINGLINK_PATHS", value_delimiter = ',')]
    pub paths: Vec<String>,

    /// Heartbeat period in milliseconds.
    #[arg(long, env = "RINGLINK_HEARTBEAT_MS")]
    pub heartbeat_ms: Option<u64>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// Show the version of the application.
    #[arg(long, short = 'V')]
    pub version: bool,
}

impl ConfigArgs {
    pub fn current_version(&self) -> &str {
        PCK_VERSION
    }

    /// Reads the configuration file, if any, and applies the command line
    /// on top of it.
    pub fn build(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(address) = self.address {
            config.address = Some(address);
        }
        if !self.paths.is_empty() {
            config.paths = self.paths;
        }
        if let Some(millis) = self.heartbeat_ms {
            config.heartbeat_period = Duration::from_millis(millis);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }
}

mod serde_log_level_filter {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        level
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level: {level}")))
    }
}

#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Node address in its `ringlink:node:` form.
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub address: Option<Address>,
    pub paths: Vec<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "heartbeat_period_ms")]
    pub heartbeat_period: Duration,
    #[serde(with = "serde_log_level_filter")]
    pub log_level: LevelFilter,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: None,
            paths: vec![ROOT.to_owned()],
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            log_level: LevelFilter::INFO,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON config {}", path.display()))?,
            _ => toml::from_str(&raw)
                .with_context(|| format!("invalid TOML config {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// The configured address, or a fresh random one.
    pub fn address(&self) -> Address {
        self.address.unwrap_or_else(Address::random)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.paths.is_empty() {
            anyhow::bail!("at least one path must be configured");
        }
        if self.heartbeat_period.is_zero() {
            anyhow::bail!("heartbeat period must be positive");
        }
        Ok(())
    }
}

/// Spawns onto the current tokio runtime, or onto a lazily built fallback
/// runtime when called outside of one.
pub struct GlobalExecutor;

impl GlobalExecutor {
    pub fn spawn<R: Send + 'static>(
        f: impl Future<Output = R> + Send + 'static,
    ) -> tokio::task::JoinHandle<R> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.spawn(f),
            Err(error) => match &*FALLBACK_RT {
                Some(rt) => rt.spawn(f),
                None => panic!("cannot spawn without a runtime: {error}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;

    #[test]
    fn loads_toml() -> testresult::TestResult {
        let address = Address::random();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            "address = \"{address}\"\npaths = [\"/a\", \"/b\"]\nheartbeat_period_ms = 250\nlog_level = \"debug\""
        )?;
        let config = NodeConfig::load(file.path())?;
        assert_eq!(config.address, Some(address));
        assert_eq!(config.paths, vec!["/a", "/b"]);
        assert_eq!(config.heartbeat_period, Duration::from_millis(250));
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        Ok(())
    }

    #[test]
    fn loads_json_with_defaults() -> testresult::TestResult {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(file, r#"{{"paths": ["/x"]}}"#)?;
        let config = NodeConfig::load(file.path())?;
        assert_eq!(config.paths, vec!["/x"]);
        assert_eq!(config.heartbeat_period, DEFAULT_HEARTBEAT_PERIOD);
        assert!(config.address.is_none());
        Ok(())
    }

    #[test]
    fn rejects_empty_paths() -> testresult::TestResult {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "paths = []")?;
        assert!(NodeConfig::load(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn command_line_overrides_file() -> testresult::TestResult {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        writeln!(file, "paths = [\"/from-file\"]\nheartbeat_period_ms = 100")?;
        let path = file.path().to_string_lossy().into_owned();
        let args = ConfigArgs::try_parse_from([
            "ringlink",
            "--config",
            path.as_str(),
            "--path",
            "/one,/two",
            "--log-level",
            "trace",
        ])?;
        let config = args.build()?;
        assert_eq!(config.paths, vec!["/one", "/two"]);
        assert_eq!(config.heartbeat_period, Duration::from_millis(100));
        assert_eq!(config.log_level, LevelFilter::TRACE);
        Ok(())
    }

    #[test]
    fn spawns_without_runtime() {
        let handle = GlobalExecutor::spawn(async { 7 });
        let value = FALLBACK_RT
            .as_ref()
            .expect("fallback runtime")
            .block_on(handle)
            .unwrap();
        assert_eq!(value, 7);
    }
}
