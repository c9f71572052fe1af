//! State change notifications published by the supervisor.

use std::path::PathBuf;

use serde::Serialize;

use crate::process::ProcessStatus;

/// One state transition of one supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    /// Agent the transition belongs to.
    pub agent_id: String,
    /// State the agent's process just entered.
    pub status: ProcessStatus,
    /// Listen port allocated for the agent, if its type listens.
    pub listen_port: Option<u16>,
    /// Binary the process runs.
    pub process_exec_path: PathBuf,
    /// Version reported by the binary, resolved once per start.
    pub version: Option<String>,
}
