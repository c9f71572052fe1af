//! Exporter binary version detection.
//!
//! Exporters print their version for `--version`; the version is reported
//! with every state change of the agent.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::agent::AgentType;

/// How long `<binary> --version` may run.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

fn pattern(agent_type: AgentType) -> Option<&'static str> {
    match agent_type {
        AgentType::NodeExporter => Some(r"node_exporter, version v?([!-~]+)"),
        AgentType::MysqldExporter => Some(r"mysqld_exporter, version v?([!-~]+)"),
        AgentType::MongodbExporter => Some(r"(?m)^Version: v?([!-~]+)"),
        AgentType::PostgresExporter => Some(r"postgres_exporter, version v?([!-~]+)"),
        AgentType::ProxysqlExporter => Some(r"proxysql_exporter, version v?([!-~]+)"),
        AgentType::RdsExporter => Some(r"rds_exporter, version v?([!-~]+)"),
        AgentType::AzureDatabaseExporter => {
            Some(r"azure_metrics_exporter, version v?([!-~]+)")
        }
        AgentType::VmAgent | AgentType::NomadAgent => None,
    }
}

// Compiled once per type; a pattern that fails to compile disables detection
// for that type.
fn version_re(agent_type: AgentType) -> Option<&'static Regex> {
    static RES: OnceLock<Vec<(AgentType, Option<Regex>)>> = OnceLock::new();
    RES.get_or_init(|| {
        AgentType::ALL
            .into_iter()
            .map(|t| (t, pattern(t).and_then(|p| Regex::new(p).ok())))
            .collect()
    })
    .iter()
    .find(|(t, _)| *t == agent_type)
    .and_then(|(_, re)| re.as_ref())
}

/// Extracts the version from `--version` output. Types without version
/// reporting always yield `None`.
pub fn parse_version(agent_type: AgentType, output: &str) -> Option<String> {
    let captures = version_re(agent_type)?.captures(output)?;
    captures.get(1).map(|m| m.as_str().to_string())
}

/// Runs `<path> --version` and parses its combined output.
///
/// Failures are logged and yield `None`; they never prevent the agent from
/// starting.
pub async fn binary_version(agent_type: AgentType, path: &Path) -> Option<String> {
    version_re(agent_type)?;

    let mut command = Command::new(path);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = match tokio::time::timeout(VERSION_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!("Cannot run {} --version: {}.", path.display(), err);
            return None;
        }
        Err(_) => {
            warn!("{} --version timed out after {:?}.", path.display(), VERSION_TIMEOUT);
            return None;
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let version = parse_version(agent_type, &combined);
    match &version {
        Some(version) => debug!("{} is {} {}.", path.display(), agent_type, version),
        None => warn!("Cannot parse version for type {}.", agent_type),
    }
    version
}
