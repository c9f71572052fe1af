//! Reconciliation of desired agents against running processes.
//!
//! The [`Supervisor`] owns every running agent. [`Supervisor::set_state`]
//! compares the desired agents with the running ones and starts, restarts or
//! stops processes accordingly; everything else only reads.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentDescriptor, AgentType};
use crate::config::{Config, Paths};
use crate::events::StateChange;
use crate::logger::ProcessLogger;
use crate::ports::{PortsError, PortsRegistry};
use crate::process::{Process, ProcessParams, ProcessStatus, Timeouts};
use crate::templates::{TemplateError, TemplateParams, TemplateRenderer};
use crate::version::binary_version;

const CHANGES_CAPACITY: usize = 256;
/// Start attempts per agent and reconciliation; every retry reserves a fresh port.
pub const START_ATTEMPTS: usize = 3;

/// Reasons an agent could not be started. They only affect that one agent.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("no binary configured for agent type {0}")]
    NoBinary(AgentType),
    #[error("failed to reserve port: {0}")]
    Port(#[from] PortsError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Agent IDs to act on, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub to_start: Vec<String>,
    pub to_restart: Vec<String>,
    pub to_stop: Vec<String>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_restart.is_empty() && self.to_stop.is_empty()
    }
}

/// Splits agent IDs into the ones to start, restart with new parameters, and
/// stop. Unchanged agents are left out. Disabled desired agents count as
/// absent.
pub fn diff(
    current: &HashMap<String, AgentDescriptor>,
    desired: &HashMap<String, AgentDescriptor>,
) -> Reconciliation {
    let mut plan = Reconciliation::default();

    for id in current.keys() {
        if !desired.get(id).is_some_and(|d| d.enabled) {
            plan.to_stop.push(id.clone());
        }
    }

    for (id, wanted) in desired.iter().filter(|(_, d)| d.enabled) {
        match current.get(id) {
            None => plan.to_start.push(id.clone()),
            // compare parameters before templating
            Some(running) if running == wanted => {}
            Some(_) => plan.to_restart.push(id.clone()),
        }
    }

    plan.to_start.sort();
    plan.to_restart.sort();
    plan.to_stop.sort();
    plan
}

/// Summary of one supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: ProcessStatus,
    pub listen_port: Option<u16>,
    pub process_exec_path: PathBuf,
    pub version: Option<String>,
}

struct AgentInfo {
    process: Process,
    cancel: CancellationToken,
    // Completes once the process reached DONE and its changes were forwarded.
    done: JoinHandle<()>,
    descriptor: AgentDescriptor,
    listen_port: Option<u16>,
    exec_path: PathBuf,
    version: Option<String>,
    temp_dir: PathBuf,
}

/// Supervises agent processes on the local host.
pub struct Supervisor {
    paths: Paths,
    log_lines_count: usize,
    timeouts: Timeouts,
    ports: PortsRegistry,
    changes: broadcast::Sender<StateChange>,
    shutdown: CancellationToken,
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self::with_timeouts(config, Timeouts::default())
    }

    /// Creates a supervisor with non-default state machine timings.
    pub fn with_timeouts(config: &Config, timeouts: Timeouts) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            paths: config.paths.clone(),
            log_lines_count: config.log_lines_count.max(1),
            timeouts,
            ports: PortsRegistry::new(config.ports.min, config.ports.max, []),
            changes,
            shutdown: CancellationToken::new(),
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to state changes of all agents.
    ///
    /// Changes of one agent arrive in order. A subscriber that falls behind
    /// by more than the channel capacity loses the oldest changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Starts, restarts and stops agents so that exactly the enabled agents of
    /// `desired` run.
    ///
    /// Agents being stopped or restarted are waited for before anything new is
    /// started, so one agent ID never has two live processes.
    pub async fn set_state(&self, desired: HashMap<String, AgentDescriptor>) -> Reconciliation {
        let mut agents = self.agents.write().await;

        // check if the supervisor was stopped while we waited for the lock
        if self.shutdown.is_cancelled() {
            error!("Ignoring SetState: supervisor is stopped.");
            return Reconciliation::default();
        }

        let current = agents
            .iter()
            .map(|(id, agent)| (id.clone(), agent.descriptor.clone()))
            .collect();
        let plan = diff(&current, &desired);
        if plan.is_empty() {
            return plan;
        }
        info!(
            "Starting {}, restarting {}, and stopping {} agent processes.",
            plan.to_start.len(),
            plan.to_restart.len(),
            plan.to_stop.len()
        );

        // stop first to avoid extra load
        for id in &plan.to_stop {
            if let Some(agent) = agents.remove(id) {
                if let Some(port) = self.stop_agent(id, agent).await {
                    self.release_port(port);
                }
            }
        }

        // restart while preserving port
        for id in &plan.to_restart {
            let Some(agent) = agents.remove(id) else {
                continue;
            };
            let port = self.stop_agent(id, agent).await;
            self.try_start(&mut agents, id, &desired[id], port).await;
        }

        for id in &plan.to_start {
            self.try_start(&mut agents, id, &desired[id], None).await;
        }

        plan
    }

    /// Restarts every agent with its current descriptor and port.
    pub async fn restart_agents(&self) {
        let mut agents = self.agents.write().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut ids: Vec<String> = agents.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(agent) = agents.remove(&id) else {
                continue;
            };
            let descriptor = agent.descriptor.clone();
            let port = self.stop_agent(&id, agent).await;
            self.try_start(&mut agents, &id, &descriptor, port).await;
        }
    }

    /// Stops every agent and releases its resources. Later `set_state` calls
    /// are ignored.
    pub async fn stop_all(&self) {
        let mut agents = self.agents.write().await;
        self.shutdown.cancel();

        let mut stopping: Vec<(String, AgentInfo)> = agents.drain().collect();
        stopping.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, agent) in stopping {
            if let Some(port) = self.stop_agent(&id, agent).await {
                self.release_port(port);
            }
        }
        info!("Done.");
    }

    /// Returns a flat snapshot of every agent: `<id>/type`, `<id>/status`,
    /// `<id>/exec_path`, `<id>/logs` (newline separated) and, for listening
    /// agents, `<id>/listen_port`.
    pub async fn status(&self) -> HashMap<String, String> {
        let agents = self.agents.read().await;
        let mut status = HashMap::with_capacity(agents.len() * 5);
        for (id, agent) in agents.iter() {
            status.insert(
                format!("{}/type", id),
                agent.descriptor.agent_type.to_string(),
            );
            status.insert(format!("{}/status", id), agent.process.status().to_string());
            status.insert(
                format!("{}/exec_path", id),
                agent.exec_path.display().to_string(),
            );
            status.insert(format!("{}/logs", id), agent.process.logs().join("\n"));
            if let Some(port) = agent.listen_port {
                status.insert(format!("{}/listen_port", id), port.to_string());
            }
        }
        status
    }

    /// Lists all agents sorted by ID.
    pub async fn agents_list(&self) -> Vec<AgentSummary> {
        let agents = self.agents.read().await;
        let mut list: Vec<AgentSummary> = agents
            .iter()
            .map(|(id, agent)| AgentSummary {
                agent_id: id.clone(),
                agent_type: agent.descriptor.agent_type,
                status: agent.process.status(),
                listen_port: agent.listen_port,
                process_exec_path: agent.exec_path.clone(),
                version: agent.version.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    /// Latest output of every agent keyed by `"<type> <id>"`.
    pub async fn agent_logs(&self) -> HashMap<String, Vec<String>> {
        let agents = self.agents.read().await;
        agents
            .iter()
            .map(|(id, agent)| {
                (
                    format!("{} {}", agent.descriptor.agent_type, id),
                    agent.process.logs(),
                )
            })
            .collect()
    }

    /// Latest output of one agent.
    pub async fn agent_log_by_id(&self, id: &str) -> Option<Vec<String>> {
        let agents = self.agents.read().await;
        agents.get(id).map(|agent| agent.process.logs())
    }

    /// Resolves the binary, arguments and environment for one agent run.
    ///
    /// Text files are rendered into the agent's temp directory first; their
    /// paths are then visible to arguments and environment as
    /// `{{ .TextFiles.<name> }}`.
    pub fn process_params(
        &self,
        agent_id: &str,
        descriptor: &AgentDescriptor,
        listen_port: Option<u16>,
    ) -> Result<ProcessParams, StartError> {
        let agent_type = descriptor.agent_type;
        let path = self
            .paths
            .binary(agent_type)
            .ok_or(StartError::NoBinary(agent_type))?
            .to_path_buf();

        let renderer = TemplateRenderer::new(
            &descriptor.template_left_delim,
            &descriptor.template_right_delim,
        );
        let mut params = TemplateParams {
            listen_port,
            text_files: None,
        };
        let text_files = if descriptor.text_files.is_empty() {
            BTreeMap::new()
        } else {
            let dir = self.agent_temp_dir(agent_id, agent_type);
            renderer.render_files(&dir, &descriptor.text_files, &params)?
        };
        params.text_files = Some(text_files);

        let args = descriptor
            .args
            .iter()
            .map(|arg| renderer.render("args", arg, &params))
            .collect::<Result<Vec<_>, _>>()?;
        let env = descriptor
            .env
            .iter()
            .map(|entry| renderer.render("env", entry, &params))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ProcessParams { path, args, env })
    }

    /// Directory holding the rendered text files of one agent.
    ///
    /// The ID is percent-encoded, so distinct IDs never share a directory and
    /// the name never leaves the base directory.
    pub fn agent_temp_dir(&self, agent_id: &str, agent_type: AgentType) -> PathBuf {
        self.paths
            .temp_dir
            .join(format!("{}-{}", agent_type, urlencoding::encode(agent_id)))
    }

    // Must be called with the agents lock held for writing.
    async fn try_start(
        &self,
        agents: &mut HashMap<String, AgentInfo>,
        id: &str,
        descriptor: &AgentDescriptor,
        port: Option<u16>,
    ) {
        match self.start_agent(id, descriptor, port).await {
            Ok(agent) => {
                agents.insert(id.to_string(), agent);
            }
            Err(err) => error!(agent_id = %id, "Failed to start Agent: {}.", err),
        }
    }

    // Only the first attempt uses the preserved port.
    async fn start_agent(
        &self,
        id: &str,
        descriptor: &AgentDescriptor,
        preserved_port: Option<u16>,
    ) -> Result<AgentInfo, StartError> {
        let mut port = preserved_port;
        let mut attempt = 1;
        loop {
            let err = match self.start_attempt(id, descriptor, port.take()).await {
                Ok(agent) => return Ok(agent),
                Err(err) => err,
            };
            if attempt >= START_ATTEMPTS {
                return Err(err);
            }
            warn!(agent_id = %id, attempt, "Failed to start Agent: {}, retrying.", err);
            attempt += 1;
        }
    }

    // Releases everything it acquired when it fails.
    async fn start_attempt(
        &self,
        id: &str,
        descriptor: &AgentDescriptor,
        preserved_port: Option<u16>,
    ) -> Result<AgentInfo, StartError> {
        let listen_port = match (descriptor.agent_type.listens(), preserved_port) {
            (true, Some(port)) => Some(port),
            (true, None) => Some(self.ports.reserve()?),
            (false, Some(port)) => {
                self.release_port(port);
                None
            }
            (false, None) => None,
        };

        let result = self.launch(id, descriptor, listen_port).await;
        if result.is_err() {
            if let Some(port) = listen_port {
                self.release_port(port);
            }
            remove_temp_dir(&self.agent_temp_dir(id, descriptor.agent_type));
        }
        result
    }

    async fn launch(
        &self,
        id: &str,
        descriptor: &AgentDescriptor,
        listen_port: Option<u16>,
    ) -> Result<AgentInfo, StartError> {
        let params = self.process_params(id, descriptor, listen_port)?;
        let agent_type = descriptor.agent_type;
        debug!(agent_id = %id, agent_type = %agent_type, "Starting: {}.", params);
        let version = binary_version(agent_type, &params.path).await;

        let logger = ProcessLogger::new(id, agent_type.as_str(), self.log_lines_count)
            .with_redact_words(descriptor.redact_words.iter().cloned());
        let cancel = self.shutdown.child_token();
        let exec_path = params.path.clone();
        let (process, mut changes) =
            Process::spawn(params, Arc::new(logger), self.timeouts, cancel.clone());

        let tx = self.changes.clone();
        let agent_id = id.to_string();
        let path = exec_path.clone();
        let reported_version = version.clone();
        let done = tokio::spawn(async move {
            while let Some(status) = changes.recv().await {
                info!(agent_id = %agent_id, listen_port = ?listen_port, "Sending status: {}.", status);
                // no subscribers is fine
                let _ = tx.send(StateChange {
                    agent_id: agent_id.clone(),
                    status,
                    listen_port,
                    process_exec_path: path.clone(),
                    version: reported_version.clone(),
                });
            }
        });

        Ok(AgentInfo {
            process,
            cancel,
            done,
            descriptor: descriptor.clone(),
            listen_port,
            exec_path,
            version,
            temp_dir: self.agent_temp_dir(id, agent_type),
        })
    }

    // Cancels the agent, waits for DONE, and removes its temp directory.
    // Returns the port, which stays reserved.
    async fn stop_agent(&self, id: &str, agent: AgentInfo) -> Option<u16> {
        agent.cancel.cancel();
        if let Err(err) = agent.done.await {
            warn!(agent_id = %id, "Status forwarder failed: {}.", err);
            agent.process.done().await;
        }
        remove_temp_dir(&agent.temp_dir);
        agent.listen_port
    }

    fn release_port(&self, port: u16) {
        if let Err(err) = self.ports.release(port) {
            error!("Failed to release port: {}.", err);
        }
    }
}

fn remove_temp_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed {}.", dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to cleanup directory {}: {}.", dir.display(), err),
    }
}
