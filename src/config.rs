//! Configuration management for the supervisor.
//!
//! Two TOML files are involved: the supervisor configuration (binary paths,
//! temp directory, port range, log size) and the desired-state file listing
//! the agents to run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::agent::{AgentDescriptor, AgentType};
use crate::logger::DEFAULT_LOG_LINES;

/// Default lower bound of the listen port range.
pub const DEFAULT_PORT_MIN: u16 = 42000;
/// Default upper bound of the listen port range.
pub const DEFAULT_PORT_MAX: u16 = 51999;

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of output lines kept per process.
    #[serde(default = "default_log_lines_count")]
    pub log_lines_count: usize,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub ports: Ports,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_lines_count: DEFAULT_LOG_LINES,
            paths: Paths::default(),
            ports: Ports::default(),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    /// Base directory for per-agent text files.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Agent type name (e.g. `node_exporter`) to binary path.
    #[serde(default)]
    pub binaries: BTreeMap<String, PathBuf>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            binaries: BTreeMap::new(),
        }
    }
}

impl Paths {
    /// Returns the configured binary for an agent type.
    pub fn binary(&self, agent_type: AgentType) -> Option<&Path> {
        self.binaries
            .get(agent_type.as_str())
            .map(PathBuf::as_path)
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn with_binary(mut self, agent_type: AgentType, path: impl Into<PathBuf>) -> Self {
        self.binaries.insert(agent_type.as_str().to_string(), path.into());
        self
    }
}

/// Listen port range, inclusive.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Ports {
    #[serde(default = "default_port_min")]
    pub min: u16,
    #[serde(default = "default_port_max")]
    pub max: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
        }
    }
}

fn default_log_lines_count() -> usize {
    DEFAULT_LOG_LINES
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("agent-supervisor")
}

fn default_port_min() -> u16 {
    DEFAULT_PORT_MIN
}

fn default_port_max() -> u16 {
    DEFAULT_PORT_MAX
}

impl Config {
    /// Checks values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        if self.log_lines_count == 0 {
            bail!("log_lines_count must be positive");
        }
        if self.ports.min == 0 || self.ports.min > self.ports.max {
            bail!(
                "invalid port range {}-{}",
                self.ports.min,
                self.ports.max
            );
        }
        for name in self.paths.binaries.keys() {
            if AgentType::from_name(name).is_none() {
                bail!("unknown agent type {:?} in paths.binaries", name);
            }
        }
        Ok(())
    }
}

/// Desired-state file: `[agents.<id>]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub agents: HashMap<String, AgentDescriptor>,
}

/// Loads, parses and validates the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// Loads the desired agents from a file path.
pub fn load_desired_state(path: &Path) -> Result<HashMap<String, AgentDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read desired state {}", path.display()))?;
    let state: DesiredState = toml::from_str(&raw)
        .with_context(|| format!("failed to parse desired state {}", path.display()))?;
    Ok(state.agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config() {
        let raw = r#"
log_lines_count = 200

[paths]
temp_dir = "/var/tmp/agents"

[paths.binaries]
node_exporter = "/usr/local/bin/node_exporter"
vm_agent = "/usr/local/bin/vmagent"

[ports]
min = 30000
max = 30100
"#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_lines_count, 200);
        assert_eq!(config.paths.temp_dir, PathBuf::from("/var/tmp/agents"));
        assert_eq!(
            config.paths.binary(AgentType::NodeExporter),
            Some(Path::new("/usr/local/bin/node_exporter"))
        );
        assert_eq!(config.paths.binary(AgentType::MysqldExporter), None);
        assert_eq!(config.ports.min, 30000);
        assert_eq!(config.ports.max, 30100);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_lines_count, DEFAULT_LOG_LINES);
        assert_eq!(config.ports.min, DEFAULT_PORT_MIN);
        assert_eq!(config.ports.max, DEFAULT_PORT_MAX);
        assert!(config.paths.binaries.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let config: Config = toml::from_str("[ports]\nmin = 10\nmax = 5\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config =
            toml::from_str("[paths.binaries]\nfoo_exporter = \"/bin/foo\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("foo_exporter"));
    }

    #[test]
    fn parses_desired_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        std::fs::write(
            &path,
            r#"
[agents.node1]
type = "node_exporter"
args = ["--web.listen-address=:{{ .ListenPort }}"]

[agents."/agent_id/mysql"]
type = "mysqld_exporter"
env = ["HTTP_AUTH=pmm:secret"]
enabled = false
redact_words = ["secret"]

[agents."/agent_id/mysql".text_files]
Config = "port={{ .ListenPort }}"
"#,
        )
        .unwrap();

        let agents = load_desired_state(&path).unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents["node1"].agent_type, AgentType::NodeExporter);
        let mysql = &agents["/agent_id/mysql"];
        assert!(!mysql.enabled);
        assert_eq!(mysql.text_files["Config"], "port={{ .ListenPort }}");
        assert_eq!(mysql.redact_words, vec!["secret"]);
    }

    #[test]
    fn missing_files_have_context() {
        let err = load_config(Path::new("/nonexistent/agent-supervisor.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
