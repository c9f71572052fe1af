//! Supervisor for locally running monitoring agents.
//!
//! Given a desired set of agents, [`Supervisor`] starts each one as an
//! external process, keeps it running with exponential backoff, allocates its
//! listen port, renders its templated arguments and configuration files, and
//! stops processes that are no longer wanted.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod events;
pub mod logger;
pub mod ports;
pub mod process;
pub mod supervisor;
pub mod templates;
pub mod version;
pub mod watch;

pub use agent::{AgentDescriptor, AgentType};
pub use config::Config;
pub use events::StateChange;
pub use process::{ProcessParams, ProcessStatus, Timeouts};
pub use supervisor::{AgentSummary, Reconciliation, StartError, Supervisor};
