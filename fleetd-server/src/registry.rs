use anyhow::{Context, Result};
use fleetd_core::config::{DescribeOutput, GlobalConfig, CONFIG_ENTRYPOINT, DESCRIBE_FLAG};
use fleetd_core::descriptor::{
    default_port_offset, display_name_from, CommandSet, ConfigSource, DeclaredPorts,
    ProjectDescriptor, ProjectType,
};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Scans the projects root one level deep and produces the full descriptor
/// set. A rescan is a pure function of filesystem state: callers diff the
/// result against the previous set to preserve live port/process state.
pub async fn scan(config: &GlobalConfig) -> Result<Vec<ProjectDescriptor>> {
    let root = &config.projects_root;
    if !root.exists() {
        warn!("projects root {} does not exist", root.display());
        return Ok(Vec::new());
    }

    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("failed to read projects root {}", root.display()))?;

    let mut descriptors = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        // The marker file is what qualifies a directory as a project.
        if !path.join(CONFIG_ENTRYPOINT).exists() {
            debug!("{} has no {}, ignoring", path.display(), CONFIG_ENTRYPOINT);
            continue;
        }
        descriptors.push(load_project(config, &name, &path).await);
    }

    // read_dir order is filesystem-dependent; keep the set deterministic.
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    info!("discovered {} projects under {}", descriptors.len(), root.display());
    Ok(descriptors)
}

/// Builds the descriptor for one project directory, preferring the declared
/// config and falling back to synthesized defaults when the entry point
/// fails, hangs, or prints garbage.
async fn load_project(config: &GlobalConfig, name: &str, path: &Path) -> ProjectDescriptor {
    match describe(config, path).await {
        Ok(output) => declared_descriptor(config, name, path, output),
        Err(e) => {
            warn!("config script failed for {}: {e:#}, using fallback defaults", name);
            fallback_descriptor(config, name, path)
        }
    }
}

/// Runs `./fleet-config --describe` and parses its JSON output. Bounded by
/// the configured timeout so a hung script degrades to fallback defaults.
async fn describe(config: &GlobalConfig, path: &Path) -> Result<DescribeOutput> {
    let entrypoint = path.join(CONFIG_ENTRYPOINT);
    let timeout = Duration::from_secs(config.describe_timeout_secs);

    let output = tokio::time::timeout(
        timeout,
        Command::new(&entrypoint)
            .arg(DESCRIBE_FLAG)
            .current_dir(path)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("{} timed out after {timeout:?}", entrypoint.display()))?
    .with_context(|| format!("failed to run {}", entrypoint.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}",
            entrypoint.display(),
            output.status.code().unwrap_or(-1)
        );
    }

    serde_json::from_slice(&output.stdout)
        .with_context(|| format!("unparsable describe output from {}", entrypoint.display()))
}

fn declared_descriptor(
    config: &GlobalConfig,
    dir_name: &str,
    path: &Path,
    output: DescribeOutput,
) -> ProjectDescriptor {
    // The directory name stays the identity even when the script declares a
    // prettier one, so rescans and imports agree on the key.
    let name = dir_name.to_string();
    let display_name = output
        .display_name
        .or(output.name)
        .unwrap_or_else(|| display_name_from(dir_name));
    let project_type = output
        .project_type
        .as_deref()
        .map(parse_project_type)
        .unwrap_or_else(|| infer_project_type(path));

    let desc = ProjectDescriptor {
        display_name,
        project_type,
        root_path: path.to_path_buf(),
        config_source: ConfigSource::Declared,
        commands: CommandSet {
            install: output.install_command.filter(|c| !c.is_empty()),
            dev: output.dev_command.filter(|c| !c.is_empty()),
            build: output.build_command.filter(|c| !c.is_empty()),
        },
        declared_ports: DeclaredPorts {
            frontend: output.port,
            backend: output.backend_port,
            websocket: output.websocket_port,
        },
        name,
    };
    with_default_ports(desc, config)
}

/// Synthesized defaults for a project whose entry point is unusable.
fn fallback_descriptor(config: &GlobalConfig, name: &str, path: &Path) -> ProjectDescriptor {
    let project_type = infer_project_type(path);
    let commands = if project_type.is_node() {
        CommandSet {
            install: Some("npm install".to_string()),
            dev: Some("npm run dev".to_string()),
            build: Some("npm run build".to_string()),
        }
    } else {
        CommandSet::default()
    };

    let desc = ProjectDescriptor {
        name: name.to_string(),
        display_name: display_name_from(name),
        project_type,
        root_path: path.to_path_buf(),
        config_source: ConfigSource::Fallback,
        commands,
        declared_ports: DeclaredPorts::default(),
    };
    with_default_ports(desc, config)
}

fn parse_project_type(raw: &str) -> ProjectType {
    match raw.to_ascii_lowercase().as_str() {
        "static" | "html" => ProjectType::Static,
        "react" | "nextjs" => ProjectType::React,
        "vue" => ProjectType::Vue,
        "angular" => ProjectType::Angular,
        "node" | "nodejs" | "node-generic" => ProjectType::NodeGeneric,
        _ => ProjectType::Other,
    }
}

/// Infers the project type from the directory contents: a package manifest
/// keyed by its framework dependency, else a plain markup entry point.
fn infer_project_type(path: &Path) -> ProjectType {
    let manifest = path.join("package.json");
    if manifest.exists() {
        let deps = std::fs::read_to_string(&manifest)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .map(|json| {
                let mut names: Vec<String> = Vec::new();
                for key in ["dependencies", "devDependencies"] {
                    if let Some(map) = json.get(key).and_then(|v| v.as_object()) {
                        names.extend(map.keys().cloned());
                    }
                }
                names
            })
            .unwrap_or_default();

        if deps.iter().any(|d| d == "react" || d == "next") {
            return ProjectType::React;
        }
        if deps.iter().any(|d| d == "vue" || d == "nuxt") {
            return ProjectType::Vue;
        }
        if deps.iter().any(|d| d.starts_with("@angular/")) {
            return ProjectType::Angular;
        }
        return ProjectType::NodeGeneric;
    }
    if path.join("index.html").exists() {
        return ProjectType::Static;
    }
    ProjectType::Other
}

/// Fills absent preferred ports with `component base + name-hash offset` so
/// unconfigured projects spread across the probe range instead of all piling
/// onto the base port.
fn with_default_ports(mut desc: ProjectDescriptor, config: &GlobalConfig) -> ProjectDescriptor {
    let offset = default_port_offset(&desc.name);
    if desc.declared_ports.frontend.is_none() {
        desc.declared_ports.frontend = Some(config.port_bases.frontend + offset);
    }
    if desc.declared_ports.backend.is_none() {
        desc.declared_ports.backend = Some(config.port_bases.backend + offset);
    }
    if desc.declared_ports.websocket.is_none() {
        desc.declared_ports.websocket = Some(config.port_bases.websocket + offset);
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn test_config(root: PathBuf) -> GlobalConfig {
        GlobalConfig {
            projects_root: root,
            describe_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn write_entrypoint(dir: &Path, body: &str) {
        let path = dir.join(CONFIG_ENTRYPOINT);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    fn describe_script(json: &str) -> String {
        format!("#!/bin/sh\nif [ \"$1\" = \"--describe\" ]; then\n  cat <<'EOF'\n{json}\nEOF\nfi\n")
    }

    #[tokio::test]
    async fn declared_config_is_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("chat_console");
        std::fs::create_dir(&dir).unwrap();
        write_entrypoint(
            &dir,
            &describe_script(
                r#"{"name": "chat_console", "display_name": "Chat Console", "type": "react", "port": 3100, "dev_command": "npm run dev", "install_command": "npm ci"}"#,
            ),
        );

        let config = test_config(tmp.path().to_path_buf());
        let set = scan(&config).await.unwrap();
        assert_eq!(set.len(), 1);
        let desc = &set[0];
        assert_eq!(desc.name, "chat_console");
        assert_eq!(desc.display_name, "Chat Console");
        assert_eq!(desc.config_source, ConfigSource::Declared);
        assert_eq!(desc.project_type, ProjectType::React);
        assert_eq!(desc.declared_ports.frontend, Some(3100));
        assert_eq!(desc.commands.dev.as_deref(), Some("npm run dev"));
        // Unset component ports are filled with deterministic defaults.
        assert!(desc.declared_ports.backend.is_some());
    }

    #[tokio::test]
    async fn failing_script_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("broken");
        std::fs::create_dir(&dir).unwrap();
        write_entrypoint(&dir, "#!/bin/sh\nexit 3\n");
        std::fs::write(dir.join("index.html"), "<html></html>").unwrap();

        let config = test_config(tmp.path().to_path_buf());
        let set = scan(&config).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].config_source, ConfigSource::Fallback);
        assert_eq!(set[0].project_type, ProjectType::Static);
        assert!(set[0].commands.dev.is_none());
    }

    #[tokio::test]
    async fn garbage_output_falls_back_with_node_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("webapp");
        std::fs::create_dir(&dir).unwrap();
        write_entrypoint(&dir, "#!/bin/sh\necho not json\n");
        std::fs::write(
            dir.join("package.json"),
            r#"{"dependencies": {"vue": "^3.4.0"}}"#,
        )
        .unwrap();

        let config = test_config(tmp.path().to_path_buf());
        let set = scan(&config).await.unwrap();
        assert_eq!(set[0].config_source, ConfigSource::Fallback);
        assert_eq!(set[0].project_type, ProjectType::Vue);
        assert_eq!(set[0].commands.install.as_deref(), Some("npm install"));
    }

    #[tokio::test]
    async fn unmarked_and_hidden_directories_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("no_marker")).unwrap();
        std::fs::create_dir(tmp.path().join(".hidden")).unwrap();
        write_entrypoint(&tmp.path().join(".hidden"), "#!/bin/sh\necho '{}'\n");

        let config = test_config(tmp.path().to_path_buf());
        let set = scan(&config).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn rescan_is_idempotent_without_filesystem_change() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("demo");
        std::fs::create_dir(&dir).unwrap();
        write_entrypoint(&dir, &describe_script(r#"{"name": "demo", "port": 3210}"#));

        let config = test_config(tmp.path().to_path_buf());
        let first = scan(&config).await.unwrap();
        let second = scan(&config).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn hanging_script_is_bounded_by_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sleeper");
        std::fs::create_dir(&dir).unwrap();
        write_entrypoint(&dir, "#!/bin/sh\nsleep 60\n");

        let mut config = test_config(tmp.path().to_path_buf());
        config.describe_timeout_secs = 1;
        let started = std::time::Instant::now();
        let set = scan(&config).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(set[0].config_source, ConfigSource::Fallback);
    }
}
