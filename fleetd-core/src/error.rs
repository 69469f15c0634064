use thiserror::Error;

use crate::descriptor::Component;

/// Errors surfaced across the daemon's subsystem boundaries.
///
/// Config-script parse failures are recovered locally (the registry falls
/// back to a synthesized descriptor) and only reach this type when a caller
/// asks for strict validation. Crashes of supervised processes are reported
/// as a state change, never as an error value.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("failed to parse config output for project {project}: {reason}")]
    ConfigParse { project: String, reason: String },

    #[error("no free port for {project}/{component} after {attempts} attempts from {base}")]
    PortExhausted {
        project: String,
        component: Component,
        base: u16,
        attempts: u32,
    },

    #[error("failed to spawn dev command for {project}/{component}: {reason}")]
    SpawnFailure {
        project: String,
        component: Component,
        reason: String,
    },

    #[error("{project}/{component} did not become reachable on port {port} within {timeout_secs}s")]
    ProbeTimeout {
        project: String,
        component: Component,
        port: u16,
        timeout_secs: u64,
    },

    #[error("archive does not contain a project directory with a {marker} entry point")]
    MissingManifest { marker: String },

    #[error("archive size {size} exceeds the import ceiling of {ceiling} bytes")]
    ArchiveTooLarge { size: usize, ceiling: usize },

    #[error("not a gzip-compressed tar archive")]
    InvalidArchive,

    #[error("invalid PNG container: {0}")]
    InvalidContainerFormat(String),

    #[error("image carries no embedded payload")]
    NotEmbedded,

    #[error("unknown project: {0}")]
    ProjectNotFound(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
