use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::FleetError;

/// One independently startable part of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Frontend,
    Backend,
    Websocket,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Frontend, Component::Backend, Component::Websocket];
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frontend => write!(f, "frontend"),
            Self::Backend => write!(f, "backend"),
            Self::Websocket => write!(f, "websocket"),
        }
    }
}

impl std::str::FromStr for Component {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frontend" => Ok(Self::Frontend),
            "backend" => Ok(Self::Backend),
            "websocket" => Ok(Self::Websocket),
            other => Err(FleetError::UnknownComponent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    Static,
    React,
    Vue,
    Angular,
    NodeGeneric,
    Other,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::React => write!(f, "react"),
            Self::Vue => write!(f, "vue"),
            Self::Angular => write!(f, "angular"),
            Self::NodeGeneric => write!(f, "node-generic"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl ProjectType {
    /// True for types whose tooling is npm-driven.
    pub fn is_node(self) -> bool {
        matches!(self, Self::React | Self::Vue | Self::Angular | Self::NodeGeneric)
    }
}

/// Where a descriptor's fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// The project's own `fleet-config` script was executed and parsed.
    Declared,
    /// Defaults synthesized because the script failed or produced garbage.
    Fallback,
}

/// Install/dev/build command strings. Opaque to the daemon; handed verbatim
/// to the process supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub dev: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
}

/// Ports the project itself asked for, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredPorts {
    #[serde(default)]
    pub frontend: Option<u16>,
    #[serde(default)]
    pub backend: Option<u16>,
    #[serde(default)]
    pub websocket: Option<u16>,
}

impl DeclaredPorts {
    pub fn get(&self, component: Component) -> Option<u16> {
        match component {
            Component::Frontend => self.frontend,
            Component::Backend => self.backend,
            Component::Websocket => self.websocket,
        }
    }
}

/// The registry's canonical record of one manageable project.
///
/// Replaced wholesale on every rescan; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
    /// Unique key, derived from the directory name.
    pub name: String,
    pub display_name: String,
    pub project_type: ProjectType,
    pub root_path: PathBuf,
    pub config_source: ConfigSource,
    pub commands: CommandSet,
    #[serde(default)]
    pub declared_ports: DeclaredPorts,
}

/// Default display name: underscores to spaces, each word capitalized.
pub fn display_name_from(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic per-project port offset in `0..100`, derived from a sha256
/// of the project name. Spreads fallback defaults across the probe range so
/// two unconfigured projects rarely collide before allocation even runs.
pub fn default_port_offset(name: &str) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash_str = hex::encode(&digest[..2]);
    u16::from_str_radix(&hash_str, 16).unwrap_or(0) % 100
}
