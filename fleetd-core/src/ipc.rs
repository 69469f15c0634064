use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::descriptor::{Component, ConfigSource, ProjectType};
use crate::state::ProcessState;

/// Per-component slice of a project's status view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatusView {
    pub state: ProcessState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub running: bool,
    /// Unix seconds of the last successful start, if any.
    pub started_at: Option<i64>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub output_tail: Vec<String>,
}

/// What the dashboard polls for each project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatusView {
    pub name: String,
    pub display_name: String,
    pub project_type: ProjectType,
    pub config_source: ConfigSource,
    pub root_path: PathBuf,
    /// True when the project directory disappeared from the projects root
    /// while a process of it may still be alive. Explicit stop required.
    pub orphaned: bool,
    pub components: BTreeMap<Component, ComponentStatusView>,
}

/// One row of the port table as exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortTableRow {
    pub project: String,
    pub component: Component,
    pub port: u16,
    pub pid: Option<u32>,
    pub running: bool,
}

/// Per-project outcome of a batch start/stop. A batch never fails as a
/// whole; callers get one of these per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub project: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Manifest entry of an embedded payload, without file content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedFileInfo {
    pub path: String,
    pub tag: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub image_base64: String,
    pub archive_base64: String,
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub image_base64: String,
}

#[derive(Debug, Serialize)]
pub struct ExtractedFile {
    pub path: String,
    pub tag: String,
    pub size: u64,
    pub content_base64: String,
}

#[derive(Debug, Serialize)]
pub struct InspectResponse {
    pub embedded: bool,
    pub files: Vec<EmbeddedFileInfo>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub project: String,
    /// Where a displaced same-name project was moved, if any.
    pub backed_up_to: Option<PathBuf>,
}
