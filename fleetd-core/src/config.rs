use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File name of the per-project config entry point. Its presence at a
/// directory root is what qualifies the directory as a project; executing it
/// with `--describe` yields a [`DescribeOutput`] document.
pub const CONFIG_ENTRYPOINT: &str = "fleet-config";

/// Flag passed to the entry point to request its description document.
pub const DESCRIBE_FLAG: &str = "--describe";

fn default_listen_port() -> u16 {
    7420
}

fn default_describe_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_grace_period() -> u64 {
    5
}

fn default_liveness_interval() -> u64 {
    2
}

fn default_install_timeout() -> u64 {
    300
}

fn default_max_import_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_port_scan_attempts() -> u32 {
    100
}

/// Base ports per component for fallback descriptors and probe starts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortBases {
    pub frontend: u16,
    pub backend: u16,
    pub websocket: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            frontend: 3000,
            backend: 8050,
            websocket: 8750,
        }
    }
}

impl PortBases {
    pub fn get(&self, component: crate::descriptor::Component) -> u16 {
        use crate::descriptor::Component;
        match component {
            Component::Frontend => self.frontend,
            Component::Backend => self.backend,
            Component::Websocket => self.websocket,
        }
    }
}

/// Daemon configuration, read from `$XDG_CONFIG_HOME/fleetd/config.toml`.
/// Every field has a default so a missing file means a fully default config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Directory scanned one level deep for project directories.
    pub projects_root: PathBuf,
    /// Daemon state directory (staging, backups, persisted tables).
    /// Defaults to the XDG data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub port_bases: PortBases,
    #[serde(default = "default_port_scan_attempts")]
    pub port_scan_attempts: u32,
    #[serde(default = "default_describe_timeout")]
    pub describe_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_max_import_bytes")]
    pub max_import_bytes: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("projects"),
            data_dir: None,
            listen_port: default_listen_port(),
            port_bases: PortBases::default(),
            port_scan_attempts: default_port_scan_attempts(),
            describe_timeout_secs: default_describe_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            grace_period_secs: default_grace_period(),
            liveness_interval_secs: default_liveness_interval(),
            install_timeout_secs: default_install_timeout(),
            max_import_bytes: default_max_import_bytes(),
        }
    }
}

impl GlobalConfig {
    /// Load the daemon config, falling back to defaults when no file exists.
    ///
    /// `FLEETD_PROJECTS_ROOT` overrides the configured projects root.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(root) = std::env::var("FLEETD_PROJECTS_ROOT") {
            config.projects_root = PathBuf::from(root);
        }
        Ok(config)
    }

    /// Path to the daemon's own config file.
    pub fn path() -> PathBuf {
        directories::ProjectDirs::from("dev", "fleetd", "fleetd").map_or_else(
            || PathBuf::from("fleetd.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Effective data directory for staging, backups, and persisted state.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "fleetd", "fleetd").map_or_else(
            || PathBuf::from(".fleetd"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir().join("staging")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }
}

/// The document a project's `fleet-config --describe` invocation must print.
///
/// Missing fields are tolerated (the registry fills them from fallback
/// defaults); unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescribeOutput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(rename = "type", default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub backend_port: Option<u16>,
    #[serde(default)]
    pub websocket_port: Option<u16>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub dev_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
}
