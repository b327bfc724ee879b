use config::{Config, ConfigError, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tempo_node::{DelivererConfig, DiscoveryConfig};

/// Shape of the in-memory simulation run by the daemon.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Nodes on the simulated network, the local node included.
    pub nodes: usize,
    /// Entries seeded on every remote node.
    pub entries_per_node: usize,
    pub entry_bytes: usize,
    /// Extra remote replicas of every seeded entry.
    pub replicas: usize,
    /// Drop all traffic from the local node to the first remote node.
    pub lossy_primary: bool,
    /// Give up waiting for outcomes after this long.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub deliverer: DelivererConfig,
    pub discovery: DiscoveryConfig,
    pub sim: SimConfig,
}

impl DaemonConfig {
    /// Layers defaults, then the optional TOML file, then `TEMPO_*`
    /// environment variables (`__` separates nested keys).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load(config_path, None)
    }

    /// Like [`DaemonConfig::new`], but reads `TEMPO_*` variables from `env`
    /// instead of the process environment when it is given.
    pub fn load(
        config_path: Option<PathBuf>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("deliverer.request_timeout", "5s")?
            .set_default("deliverer.request_queue_capacity", 8192)?
            .set_default("deliverer.request_processor_threads", 2)?
            .set_default("deliverer.response_limit", 1024)?
            .set_default("discovery.max_backoff", 4)?
            .set_default("discovery.retry_base_delay", "1s")?
            .set_default("discovery.housekeeping_interval", "30s")?
            .set_default("sim.nodes", 3)?
            .set_default("sim.entries_per_node", 16)?
            .set_default("sim.entry_bytes", 256)?
            .set_default("sim.replicas", 1)?
            .set_default("sim.lossy_primary", false)?
            .set_default("sim.deadline", "60s")?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("TEMPO")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.deliverer = cfg.deliverer.normalized();
        cfg.sim.nodes = cfg.sim.nodes.max(2);
        Ok(cfg)
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = DaemonConfig::load(None, env(&[])).expect("failed to build config");

        assert_eq!(cfg.deliverer, DelivererConfig::default());
        assert_eq!(cfg.discovery, DiscoveryConfig::default());
        assert_eq!(cfg.sim.nodes, 3);
        assert_eq!(cfg.sim.entries_per_node, 16);
        assert_eq!(cfg.sim.replicas, 1);
        assert!(!cfg.sim.lossy_primary);
        assert_eq!(cfg.sim.deadline, Duration::from_secs(60));
    }

    #[test]
    fn nested_env_vars_override_defaults() {
        let vars = env(&[
            ("TEMPO_DELIVERER__REQUEST_TIMEOUT", "750ms"),
            ("TEMPO_DELIVERER__REQUEST_PROCESSOR_THREADS", "0"),
            ("TEMPO_DISCOVERY__MAX_BACKOFF", "7"),
            ("TEMPO_SIM__LOSSY_PRIMARY", "true"),
            ("OTHER_SIM__NODES", "9"),
        ]);
        let cfg = DaemonConfig::load(None, vars).expect("failed to build config");
        assert_eq!(cfg.deliverer.request_timeout, Duration::from_millis(750));
        assert_eq!(cfg.deliverer.request_processor_threads, 1);
        assert_eq!(cfg.discovery.max_backoff, 7);
        assert!(cfg.sim.lossy_primary);
        assert_eq!(cfg.sim.nodes, 3, "unprefixed variables are ignored");
    }

    #[test]
    fn env_overrides_file_and_file_overrides_defaults() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
[deliverer]
request_timeout = "2s"
request_queue_capacity = 64

[sim]
nodes = 1
entries_per_node = 4
"#
        )
        .expect("write to temp file");

        let vars = env(&[("TEMPO_SIM__ENTRIES_PER_NODE", "9")]);
        let cfg = DaemonConfig::load(Some(PathBuf::from(tmp.path())), vars).expect("load config");
        assert_eq!(cfg.deliverer.request_timeout, Duration::from_secs(2));
        assert_eq!(cfg.deliverer.request_queue_capacity, 64);
        assert_eq!(cfg.deliverer.response_limit, 1024);
        assert_eq!(cfg.sim.nodes, 2, "a simulation needs a remote node");
        assert_eq!(cfg.sim.entries_per_node, 9);
    }

    #[test]
    fn printed_config_loads_back() {
        let cfg = DaemonConfig::load(None, env(&[])).expect("failed to build config");
        let rendered = cfg.to_toml().expect("render toml");
        assert!(rendered.contains("request_timeout = \"5s\""));

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        std::io::Write::write_all(&mut tmp, rendered.as_bytes()).expect("write");
        let reloaded =
            DaemonConfig::load(Some(PathBuf::from(tmp.path())), env(&[])).expect("reload");
        assert_eq!(reloaded, cfg);
    }
}
