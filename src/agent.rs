//! Desired-state description of supervised agents.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of external process an agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    NodeExporter,
    MysqldExporter,
    MongodbExporter,
    PostgresExporter,
    ProxysqlExporter,
    RdsExporter,
    AzureDatabaseExporter,
    VmAgent,
    NomadAgent,
}

impl AgentType {
    pub const ALL: [AgentType; 9] = [
        AgentType::NodeExporter,
        AgentType::MysqldExporter,
        AgentType::MongodbExporter,
        AgentType::PostgresExporter,
        AgentType::ProxysqlExporter,
        AgentType::RdsExporter,
        AgentType::AzureDatabaseExporter,
        AgentType::VmAgent,
        AgentType::NomadAgent,
    ];

    /// Name used in configuration, directory names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::NodeExporter => "node_exporter",
            AgentType::MysqldExporter => "mysqld_exporter",
            AgentType::MongodbExporter => "mongodb_exporter",
            AgentType::PostgresExporter => "postgres_exporter",
            AgentType::ProxysqlExporter => "proxysql_exporter",
            AgentType::RdsExporter => "rds_exporter",
            AgentType::AzureDatabaseExporter => "azure_database_exporter",
            AgentType::VmAgent => "vm_agent",
            AgentType::NomadAgent => "nomad_agent",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether agents of this type get a listen port.
    ///
    /// Nomad manages its own ports.
    pub fn listens(&self) -> bool {
        !matches!(self, AgentType::NomadAgent)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_enabled() -> bool {
    true
}

/// Desired configuration of one agent, keyed by agent ID in the desired state.
///
/// Two descriptors are compared before templating: any difference restarts
/// the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment templates, `KEY=VALUE` after rendering.
    #[serde(default)]
    pub env: Vec<String>,
    /// Text file templates by file name.
    #[serde(default)]
    pub text_files: BTreeMap<String, String>,
    /// Disabled agents are not run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Left template delimiter; empty means `{{`.
    #[serde(default)]
    pub template_left_delim: String,
    /// Right template delimiter; empty means `}}`.
    #[serde(default)]
    pub template_right_delim: String,
    /// Words replaced by `***` in captured output.
    #[serde(default)]
    pub redact_words: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            args: Vec::new(),
            env: Vec::new(),
            text_files: BTreeMap::new(),
            enabled: true,
            template_left_delim: String::new(),
            template_right_delim: String::new(),
            redact_words: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_text_file(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.text_files.insert(name.into(), template.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
