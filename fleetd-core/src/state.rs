use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::descriptor::{Component, ProjectDescriptor};

/// Lifecycle state of one `(project, component)` pair.
///
/// Owned exclusively by the lifecycle manager; every transition goes through
/// its per-project lock. No state is terminal: `Error --start--> Starting`
/// is a valid, operator-initiated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One row of the port table.
///
/// `pid` is set only while the component's process is alive. The port value
/// outlives `running`: it is the sticky hint the allocator reuses on the
/// next start of the same component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub port: u16,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub running: bool,
}

impl PortAssignment {
    pub fn reserved(port: u16) -> Self {
        Self {
            port,
            pid: None,
            running: false,
        }
    }
}

/// Persisted form of one project: its descriptor plus port assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedProject {
    pub descriptor: ProjectDescriptor,
    #[serde(default)]
    pub assignments: BTreeMap<Component, PortAssignment>,
}

/// Everything that survives a daemon restart.
///
/// `running` flags are seeded false on load; the liveness monitor reconciles
/// them against actually-live OS processes using the persisted pids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub projects: Vec<PersistedProject>,
}
