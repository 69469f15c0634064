use fleetd_core::config::GlobalConfig;
use fleetd_core::descriptor::{Component, ProjectDescriptor};
use fleetd_core::error::FleetError;
use fleetd_core::ipc::{BatchOutcome, ComponentStatusView, PortTableRow, ProjectStatusView};
use fleetd_core::state::{FleetState, PersistedProject, ProcessState};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::ports::{ComponentId, PortTable};
use crate::registry;
use crate::state::StateManager;
use crate::transport::archive::{self, ImportOutcome};

const OUTPUT_TAIL_LINES: usize = 50;

/// One registry entry: the descriptor plus the orphan flag for projects
/// whose directory disappeared while a process may still be alive.
pub struct ProjectEntry {
    pub descriptor: ProjectDescriptor,
    pub orphaned: bool,
}

/// Live view of one supervised `(project, component)` process.
pub struct ComponentRuntime {
    pub state: ProcessState,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    /// Set by `stop` before termination so the liveness monitor does not
    /// misread the requested exit as a crash.
    pub stop_requested: bool,
    pub output_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ComponentRuntime {
    fn new() -> Self {
        Self {
            state: ProcessState::Stopped,
            child: None,
            pid: None,
            started_at: None,
            exit_code: None,
            last_error: None,
            stop_requested: false,
            output_tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

/// The daemon's central object: registry view, port table, and the
/// per-project lifecycle state machines.
///
/// Lock order, where several are held together: projects → ports → runtime.
/// Per-project lifecycle transitions serialize through `locks`; the port
/// table and runtime map have their own short-lived locks. Process
/// spawn/kill always happens with no table lock held.
#[derive(Clone)]
pub struct Fleet {
    pub(crate) config: Arc<GlobalConfig>,
    pub(crate) projects: Arc<RwLock<BTreeMap<String, ProjectEntry>>>,
    pub(crate) ports: Arc<Mutex<PortTable>>,
    pub(crate) runtime: Arc<Mutex<HashMap<ComponentId, ComponentRuntime>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    state: Arc<StateManager>,
}

impl Fleet {
    pub fn new(config: GlobalConfig) -> anyhow::Result<Self> {
        let state = if config.data_dir.is_some() {
            StateManager::with_path(config.data_dir().join("state.json"))
        } else {
            StateManager::new()?
        };
        Ok(Self::with_state(config, state))
    }

    pub fn with_state(config: GlobalConfig, state: StateManager) -> Self {
        Self {
            config: Arc::new(config),
            projects: Arc::new(RwLock::new(BTreeMap::new())),
            ports: Arc::new(Mutex::new(PortTable::new())),
            runtime: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// The per-project mutual-exclusion lock. At most one in-flight
    /// start/stop/restart per project; a stop issued during a start simply
    /// queues behind it (FIFO, no preemption).
    async fn project_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads persisted state and re-adopts processes that survived the
    /// daemon restart. All `running` flags come up false and only the
    /// pid reconciliation turns them back on.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let state = match self.state.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!("could not load persisted state, starting fresh: {e:#}");
                return Ok(());
            }
        };

        info!("restoring state: {} projects", state.projects.len());
        {
            let mut projects = self.projects.write().await;
            let mut ports = self.ports.lock().await;
            for persisted in state.projects {
                let name = persisted.descriptor.name.clone();
                for (component, row) in persisted.assignments {
                    ports.adopt(&name, component, row);
                }
                projects.insert(
                    name,
                    ProjectEntry {
                        descriptor: persisted.descriptor,
                        orphaned: false,
                    },
                );
            }
        }

        self.reconcile_persisted_pids().await;
        Ok(())
    }

    /// Re-marks rows whose persisted pid is still alive as running and
    /// creates Running runtime entries for them. Stop works on these via
    /// process-group signals even without a child handle.
    pub(crate) async fn reconcile_persisted_pids(&self) {
        let adopted = {
            let mut ports = self.ports.lock().await;
            ports.reconcile_running(fleetd_utils::process::is_alive)
        };
        if adopted.is_empty() {
            return;
        }
        let mut runtime = self.runtime.lock().await;
        for ((name, component), pid, port) in &adopted {
            info!(
                "re-adopted {}/{} (pid {}, port {})",
                name, component, pid, port
            );
            let rt = runtime
                .entry((name.clone(), *component))
                .or_insert_with(ComponentRuntime::new);
            rt.state = ProcessState::Running;
            rt.pid = Some(*pid);
            rt.child = None;
            rt.stop_requested = false;
        }
    }

    /// Rescans the projects root and replaces the descriptor set wholesale.
    /// Projects still present keep their live assignments and runtime
    /// state untouched; removed projects with live processes are flagged
    /// orphaned instead of being killed.
    pub async fn rescan(&self) -> anyhow::Result<()> {
        let scanned = registry::scan(&self.config).await?;
        let new_names: HashSet<String> = scanned.iter().map(|d| d.name.clone()).collect();

        {
            let mut projects = self.projects.write().await;
            let mut ports = self.ports.lock().await;

            let mut removed = Vec::new();
            for (name, entry) in projects.iter_mut() {
                if new_names.contains(name) {
                    continue;
                }
                if ports.has_running(name) {
                    if !entry.orphaned {
                        warn!("project {} disappeared with live processes, flagging orphaned", name);
                    }
                    entry.orphaned = true;
                } else {
                    removed.push(name.clone());
                }
            }

            for name in &removed {
                projects.remove(name);
                ports.forget_project(name);
            }
            if !removed.is_empty() {
                let mut runtime = self.runtime.lock().await;
                runtime.retain(|(name, _), _| !removed.contains(name));
            }

            for descriptor in scanned {
                projects.insert(
                    descriptor.name.clone(),
                    ProjectEntry {
                        descriptor,
                        orphaned: false,
                    },
                );
            }
        }

        self.persist().await;
        Ok(())
    }

    pub async fn start(&self, name: &str, component: Component) -> Result<(), FleetError> {
        let lock = self.project_lock(name).await;
        let _guard = lock.lock().await;
        self.locked_start(name, component).await
    }

    pub async fn stop(&self, name: &str, component: Component) -> Result<(), FleetError> {
        let lock = self.project_lock(name).await;
        let _guard = lock.lock().await;
        self.locked_stop(name, component).await
    }

    /// Stop followed by start under a single lock acquisition, so no
    /// external start/stop can interleave.
    pub async fn restart(&self, name: &str, component: Component) -> Result<(), FleetError> {
        let lock = self.project_lock(name).await;
        let _guard = lock.lock().await;
        self.locked_stop(name, component).await?;
        self.locked_start(name, component).await
    }

    async fn locked_start(&self, name: &str, component: Component) -> Result<(), FleetError> {
        let key: ComponentId = (name.to_string(), component);

        let descriptor = {
            let projects = self.projects.read().await;
            projects
                .get(name)
                .map(|entry| entry.descriptor.clone())
                .ok_or_else(|| FleetError::ProjectNotFound(name.to_string()))?
        };

        {
            let runtime = self.runtime.lock().await;
            if let Some(rt) = runtime.get(&key) {
                if matches!(rt.state, ProcessState::Running | ProcessState::Starting) {
                    info!("{}/{} is already {}", name, component, rt.state);
                    return Ok(());
                }
            }
        }

        // A component in Error may still own a live process (a slow starter
        // that missed its probe window); reap it first so the same
        // (project, component) never has two live processes.
        let leftover = {
            let runtime = self.runtime.lock().await;
            runtime
                .get(&key)
                .map(|rt| rt.child.is_some() || rt.pid.is_some())
                .unwrap_or(false)
        };
        if leftover {
            self.locked_stop(name, component).await?;
        }

        let dev_command = descriptor.commands.dev.clone().ok_or_else(|| {
            FleetError::SpawnFailure {
                project: name.to_string(),
                component,
                reason: "no dev command configured".to_string(),
            }
        })?;

        let tail = {
            let mut runtime = self.runtime.lock().await;
            let rt = runtime.entry(key.clone()).or_insert_with(ComponentRuntime::new);
            rt.state = ProcessState::Starting;
            rt.stop_requested = false;
            rt.exit_code = None;
            rt.last_error = None;
            rt.output_tail = Arc::new(Mutex::new(VecDeque::new()));
            rt.output_tail.clone()
        };

        let port = {
            let mut ports = self.ports.lock().await;
            ports.allocate(&descriptor, component, &self.config)
        };
        let port = match port {
            Ok(port) => port,
            Err(e) => {
                self.mark_error(&key, e.to_string()).await;
                self.persist().await;
                return Err(e);
            }
        };

        self.maybe_install(&descriptor).await;

        info!(
            "starting {}/{} on port {}: {}",
            name, component, port, dev_command
        );
        let envs = vec![
            ("PORT".to_string(), port.to_string()),
            ("FLEETD_COMPONENT".to_string(), component.to_string()),
        ];
        let mut child =
            match fleetd_utils::process::spawn_shell(&dev_command, &descriptor.root_path, &envs) {
                Ok(child) => child,
                Err(e) => {
                    {
                        let mut ports = self.ports.lock().await;
                        ports.abort(name, component);
                    }
                    let reason = format!("{e:#}");
                    self.mark_error(&key, reason.clone()).await;
                    self.persist().await;
                    return Err(FleetError::SpawnFailure {
                        project: name.to_string(),
                        component,
                        reason,
                    });
                }
            };

        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            spawn_tail_reader(tail.clone(), stdout, format!("{name}/{component}"));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_tail_reader(tail.clone(), stderr, format!("{name}/{component}"));
        }

        {
            let mut ports = self.ports.lock().await;
            ports.commit_running(name, component, pid);
        }
        {
            let mut runtime = self.runtime.lock().await;
            if let Some(rt) = runtime.get_mut(&key) {
                rt.child = Some(child);
                rt.pid = Some(pid);
            }
        }
        self.persist().await;

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        if fleetd_utils::probe::wait_http_ready(port, timeout).await {
            let mut runtime = self.runtime.lock().await;
            if let Some(rt) = runtime.get_mut(&key) {
                rt.state = ProcessState::Running;
                rt.started_at = Some(now_unix());
            }
            drop(runtime);
            self.persist().await;
            info!("{}/{} is running on port {}", name, component, port);
            return Ok(());
        }

        // Probe timed out. If the process already died, record its exit
        // code and free the port; a slow starter is left alive for the
        // operator to inspect or stop.
        let process_died = {
            let mut runtime = self.runtime.lock().await;
            let mut died = false;
            if let Some(rt) = runtime.get_mut(&key) {
                if let Some(child) = rt.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        rt.exit_code = status.code();
                        rt.child = None;
                        rt.pid = None;
                        died = true;
                    }
                }
                rt.state = ProcessState::Error;
                let tail_lines: Vec<String> = tail.lock().await.iter().cloned().collect();
                rt.last_error = Some(format!(
                    "not reachable on port {} within {}s{}{}",
                    port,
                    self.config.probe_timeout_secs,
                    rt.exit_code
                        .map(|c| format!(" (exited with code {c})"))
                        .unwrap_or_default(),
                    if tail_lines.is_empty() {
                        String::new()
                    } else {
                        format!("; last output: {}", tail_lines.join(" | "))
                    }
                ));
            }
            died
        };
        if process_died {
            let mut ports = self.ports.lock().await;
            ports.release(name, component);
        }
        self.persist().await;
        Err(FleetError::ProbeTimeout {
            project: name.to_string(),
            component,
            port,
            timeout_secs: self.config.probe_timeout_secs,
        })
    }

    async fn locked_stop(&self, name: &str, component: Component) -> Result<(), FleetError> {
        let key: ComponentId = (name.to_string(), component);

        let (child, pid) = {
            let mut runtime = self.runtime.lock().await;
            let Some(rt) = runtime.get_mut(&key) else {
                return Ok(());
            };
            if rt.state == ProcessState::Stopped {
                return Ok(());
            }
            rt.stop_requested = true;
            rt.state = ProcessState::Stopping;
            (rt.child.take(), rt.pid.take())
        };

        let grace = Duration::from_secs(self.config.grace_period_secs);
        let label = format!("{name}/{component}");
        if let Some(mut child) = child {
            fleetd_utils::process::terminate_child(&mut child, &label, grace).await;
        } else if let Some(pid) = pid {
            if fleetd_utils::process::is_alive(pid) {
                fleetd_utils::process::terminate_pid(pid, &label, grace).await;
            }
        }

        {
            let mut ports = self.ports.lock().await;
            ports.release(name, component);
        }
        {
            let mut runtime = self.runtime.lock().await;
            if let Some(rt) = runtime.get_mut(&key) {
                rt.state = ProcessState::Stopped;
                rt.started_at = None;
            }
        }
        self.persist().await;
        info!("stopped {}", label);
        Ok(())
    }

    async fn mark_error(&self, key: &ComponentId, reason: String) {
        let mut runtime = self.runtime.lock().await;
        if let Some(rt) = runtime.get_mut(key) {
            rt.state = ProcessState::Error;
            rt.last_error = Some(reason);
        }
    }

    /// Runs the project's install command when a node project is missing
    /// its dependencies. Failure is logged but never blocks the start; the
    /// dev command gets to produce its own, more specific error.
    async fn maybe_install(&self, descriptor: &ProjectDescriptor) {
        let Some(install) = descriptor.commands.install.as_deref() else {
            return;
        };
        if !needs_install(&descriptor.root_path) {
            return;
        }

        info!("installing dependencies for {}: {}", descriptor.name, install);
        let timeout = Duration::from_secs(self.config.install_timeout_secs);
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(install)
                .current_dir(&descriptor.root_path)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                info!("dependency install for {} succeeded", descriptor.name);
            }
            Ok(Ok(output)) => {
                warn!(
                    "dependency install for {} exited with {}, continuing",
                    descriptor.name,
                    output.status.code().unwrap_or(-1)
                );
            }
            Ok(Err(e)) => {
                warn!("dependency install for {} failed: {}, continuing", descriptor.name, e);
            }
            Err(_) => {
                warn!(
                    "dependency install for {} timed out after {:?}, continuing",
                    descriptor.name, timeout
                );
            }
        }
    }

    /// Starts the frontend component of every project. One task per
    /// project; a single failure never aborts the others.
    pub async fn start_all(&self) -> Vec<BatchOutcome> {
        self.for_each_project(|fleet, name| async move {
            fleet.start(&name, Component::Frontend).await
        })
        .await
    }

    /// Stops every component of every project.
    pub async fn stop_all(&self) -> Vec<BatchOutcome> {
        self.for_each_project(|fleet, name| async move {
            for component in Component::ALL {
                fleet.stop(&name, component).await?;
            }
            Ok(())
        })
        .await
    }

    async fn for_each_project<F, Fut>(&self, op: F) -> Vec<BatchOutcome>
    where
        F: Fn(Fleet, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), FleetError>> + Send + 'static,
    {
        let names: Vec<String> = self.projects.read().await.keys().cloned().collect();
        let handles: Vec<_> = names
            .into_iter()
            .map(|name| {
                let task = op(self.clone(), name.clone());
                (name, tokio::spawn(task))
            })
            .collect();

        futures::future::join_all(handles.into_iter().map(|(project, handle)| async move {
            match handle.await {
                Ok(Ok(())) => BatchOutcome {
                    project,
                    ok: true,
                    error: None,
                },
                Ok(Err(e)) => BatchOutcome {
                    project,
                    ok: false,
                    error: Some(e.to_string()),
                },
                Err(e) => BatchOutcome {
                    project,
                    ok: false,
                    error: Some(format!("task panicked: {e}")),
                },
            }
        }))
        .await
    }

    /// Imports a project archive and triggers a rescan so the new
    /// descriptor appears through the normal flow.
    pub async fn import_archive(&self, bytes: &[u8]) -> Result<ImportOutcome, FleetError> {
        let outcome = archive::import(&self.config, bytes)?;
        if let Err(e) = self.rescan().await {
            error!("rescan after import failed: {e:#}");
        }
        Ok(outcome)
    }

    pub async fn list(&self) -> Vec<ProjectStatusView> {
        let projects = self.projects.read().await;
        let ports = self.ports.lock().await;
        let runtime = self.runtime.lock().await;

        let mut views = Vec::new();
        for (name, entry) in projects.iter() {
            let mut components = BTreeMap::new();
            for component in Component::ALL {
                let assignment = ports.assignment(name, component);
                let rt = runtime.get(&(name.clone(), component));
                let output_tail = match rt {
                    Some(rt) => rt.output_tail.lock().await.iter().cloned().collect(),
                    None => Vec::new(),
                };
                components.insert(
                    component,
                    ComponentStatusView {
                        state: rt.map(|r| r.state).unwrap_or_default(),
                        port: assignment.map(|a| a.port),
                        pid: assignment.and_then(|a| a.pid),
                        running: assignment.map(|a| a.running).unwrap_or(false),
                        started_at: rt.and_then(|r| r.started_at),
                        last_error: rt.and_then(|r| r.last_error.clone()),
                        output_tail,
                    },
                );
            }
            views.push(ProjectStatusView {
                name: name.clone(),
                display_name: entry.descriptor.display_name.clone(),
                project_type: entry.descriptor.project_type,
                config_source: entry.descriptor.config_source,
                root_path: entry.descriptor.root_path.clone(),
                orphaned: entry.orphaned,
                components,
            });
        }
        views
    }

    pub async fn port_table(&self) -> Vec<PortTableRow> {
        self.ports.lock().await.rows()
    }

    pub(crate) async fn persist(&self) {
        let state = {
            let projects = self.projects.read().await;
            let ports = self.ports.lock().await;
            FleetState {
                projects: projects
                    .values()
                    .map(|entry| PersistedProject {
                        descriptor: entry.descriptor.clone(),
                        assignments: ports.project_rows(&entry.descriptor.name),
                    })
                    .collect(),
            }
        };
        if let Err(e) = self.state.save(&state).await {
            error!("failed to persist state: {}", e);
        }
    }
}

fn now_unix() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn needs_install(root: &Path) -> bool {
    if !root.join("package.json").exists() {
        return false;
    }
    match std::fs::read_dir(root.join("node_modules")) {
        // A node_modules with fewer than a handful of entries is either
        // fresh or a broken install; both warrant a reinstall.
        Ok(entries) => entries.take(3).count() < 3,
        Err(_) => true,
    }
}

fn spawn_tail_reader(
    tail: Arc<Mutex<VecDeque<String>>>,
    stream: impl AsyncRead + Unpin + Send + 'static,
    label: String,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", label, line);
            let mut tail = tail.lock().await;
            if tail.len() >= OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
}
