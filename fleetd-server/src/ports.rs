use fleetd_core::config::GlobalConfig;
use fleetd_core::descriptor::{Component, ProjectDescriptor};
use fleetd_core::error::FleetError;
use fleetd_core::ipc::PortTableRow;
use fleetd_core::state::PortAssignment;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Key of one port-table row.
pub type ComponentId = (String, Component);

/// The system-wide port assignment table.
///
/// Lives behind a single lock in [`crate::manager::Fleet`]; critical
/// sections stay short — process spawn/kill never happens while the table
/// is held. Invariant: among rows with `running = true`, port values are
/// pairwise distinct. Non-running rows keep their last port as the sticky
/// reuse hint for the next start of the same component.
#[derive(Debug, Default)]
pub struct PortTable {
    rows: BTreeMap<ComponentId, PortAssignment>,
    /// Ports handed out by `allocate` whose start has not yet committed or
    /// aborted. Keeps two concurrent starts of different projects from
    /// being handed the same port during the spawn window.
    in_flight: HashSet<u16>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assignment(&self, project: &str, component: Component) -> Option<PortAssignment> {
        self.rows.get(&(project.to_string(), component)).copied()
    }

    /// Restores a persisted row. `running` is always seeded false here; the
    /// liveness monitor re-adopts rows whose pid is still alive.
    pub fn adopt(&mut self, project: &str, component: Component, row: PortAssignment) {
        self.rows.insert(
            (project.to_string(), component),
            PortAssignment {
                port: row.port,
                pid: row.pid,
                running: false,
            },
        );
    }

    fn taken(&self, port: u16) -> bool {
        self.in_flight.contains(&port) || self.rows.values().any(|r| r.running && r.port == port)
    }

    fn candidate_free(&self, port: u16) -> bool {
        !self.taken(port) && fleetd_utils::net::port_is_bindable(port)
    }

    /// Resolves a concrete port for `(descriptor.name, component)`.
    ///
    /// Resolution order: the previous assignment for this pair if currently
    /// free, else the project's declared port if free, else a linear probe
    /// from the declared port (or the component base) capped at
    /// `port_scan_attempts`. The returned port is reserved until the caller
    /// commits or aborts the start.
    pub fn allocate(
        &mut self,
        descriptor: &ProjectDescriptor,
        component: Component,
        config: &GlobalConfig,
    ) -> Result<u16, FleetError> {
        let key = (descriptor.name.clone(), component);

        if let Some(previous) = self.rows.get(&key) {
            if !previous.running && self.candidate_free(previous.port) {
                let port = previous.port;
                return self.reserve(key, port);
            }
        }

        let declared = descriptor
            .declared_ports
            .get(component)
            .filter(|&p| {
                if p >= 1024 {
                    true
                } else {
                    warn!(
                        "{}/{} declares privileged port {}, ignoring",
                        descriptor.name, component, p
                    );
                    false
                }
            });

        if let Some(port) = declared {
            if self.candidate_free(port) {
                return self.reserve(key, port);
            }
        }

        let base = config.port_bases.get(component);
        let start = declared.unwrap_or(base);
        for attempt in 0..config.port_scan_attempts {
            let Some(port) = start.checked_add(attempt as u16) else {
                break;
            };
            if self.candidate_free(port) {
                if port != start {
                    info!(
                        "port {} busy, assigned {} to {}/{}",
                        start, port, descriptor.name, component
                    );
                }
                return self.reserve(key, port);
            }
        }

        Err(FleetError::PortExhausted {
            project: descriptor.name.clone(),
            component,
            base: start,
            attempts: config.port_scan_attempts,
        })
    }

    fn reserve(&mut self, key: ComponentId, port: u16) -> Result<u16, FleetError> {
        // Uniqueness is enforced before the row is committed, never after.
        if self.taken(port) {
            return Err(FleetError::PortExhausted {
                project: key.0,
                component: key.1,
                base: port,
                attempts: 0,
            });
        }
        self.in_flight.insert(port);
        self.rows.insert(key, PortAssignment::reserved(port));
        Ok(port)
    }

    /// Marks a reserved port as backing a live process.
    pub fn commit_running(&mut self, project: &str, component: Component, pid: u32) {
        if let Some(row) = self.rows.get_mut(&(project.to_string(), component)) {
            self.in_flight.remove(&row.port);
            row.pid = Some(pid);
            row.running = true;
        }
    }

    /// Cancels a reservation after a failed start. The row stays behind as
    /// the sticky hint.
    pub fn abort(&mut self, project: &str, component: Component) {
        if let Some(row) = self.rows.get_mut(&(project.to_string(), component)) {
            self.in_flight.remove(&row.port);
            row.pid = None;
            row.running = false;
        }
    }

    /// Clears `running`/`pid` but retains the port as the reuse hint, which
    /// gives components sticky ports across restarts without static config.
    pub fn release(&mut self, project: &str, component: Component) {
        if let Some(row) = self.rows.get_mut(&(project.to_string(), component)) {
            self.in_flight.remove(&row.port);
            row.pid = None;
            row.running = false;
        }
    }

    /// Drops every row of a project. Used when a non-running project
    /// disappears from the projects root.
    pub fn forget_project(&mut self, project: &str) {
        let removed: Vec<u16> = self
            .rows
            .iter()
            .filter(|((name, _), _)| name == project)
            .map(|(_, row)| row.port)
            .collect();
        self.rows.retain(|(name, _), _| name != project);
        for port in removed {
            self.in_flight.remove(&port);
        }
    }

    /// Boot-time reconciliation: rows whose persisted pid still answers a
    /// signal-0 probe become running again; dead pids are cleared. Returns
    /// the re-adopted rows.
    pub fn reconcile_running(
        &mut self,
        alive: impl Fn(u32) -> bool,
    ) -> Vec<(ComponentId, u32, u16)> {
        let mut adopted = Vec::new();
        for ((name, component), row) in self.rows.iter_mut() {
            match row.pid {
                Some(pid) if alive(pid) => {
                    row.running = true;
                    adopted.push(((name.clone(), *component), pid, row.port));
                }
                Some(_) => {
                    row.pid = None;
                    row.running = false;
                }
                None => {}
            }
        }
        adopted
    }

    pub fn has_running(&self, project: &str) -> bool {
        self.rows
            .iter()
            .any(|((name, _), row)| name == project && row.running)
    }

    pub fn rows(&self) -> Vec<PortTableRow> {
        self.rows
            .iter()
            .map(|((project, component), row)| PortTableRow {
                project: project.clone(),
                component: *component,
                port: row.port,
                pid: row.pid,
                running: row.running,
            })
            .collect()
    }

    pub fn project_rows(&self, project: &str) -> BTreeMap<Component, PortAssignment> {
        self.rows
            .iter()
            .filter(|((name, _), _)| name == project)
            .map(|((_, component), row)| (*component, *row))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::descriptor::{CommandSet, ConfigSource, DeclaredPorts, ProjectType};
    use std::path::PathBuf;

    fn descriptor(name: &str, frontend_port: Option<u16>) -> ProjectDescriptor {
        ProjectDescriptor {
            name: name.to_string(),
            display_name: name.to_string(),
            project_type: ProjectType::Static,
            root_path: PathBuf::from("/tmp").join(name),
            config_source: ConfigSource::Fallback,
            commands: CommandSet::default(),
            declared_ports: DeclaredPorts {
                frontend: frontend_port,
                ..Default::default()
            },
        }
    }

    fn config() -> GlobalConfig {
        GlobalConfig {
            projects_root: PathBuf::from("/tmp"),
            ..Default::default()
        }
    }

    /// Picks a port that is currently bindable, high enough to dodge the
    /// fixture's own listeners.
    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn declared_port_is_used_when_free() {
        let mut table = PortTable::new();
        let port = free_port();
        let desc = descriptor("demo", Some(port));
        let got = table.allocate(&desc, Component::Frontend, &config()).unwrap();
        assert_eq!(got, port);
    }

    #[test]
    fn busy_declared_port_probes_upward() {
        let mut table = PortTable::new();
        let config = config();

        // Another project is already running on the declared port.
        let wanted = free_port();
        let other = descriptor("other", Some(wanted));
        let got = table.allocate(&other, Component::Frontend, &config).unwrap();
        assert_eq!(got, wanted);
        table.commit_running("other", Component::Frontend, 1111);

        let demo = descriptor("demo", Some(wanted));
        let assigned = table.allocate(&demo, Component::Frontend, &config).unwrap();
        assert_ne!(assigned, wanted);
        assert!(assigned > wanted);
    }

    #[test]
    fn os_occupied_declared_port_is_skipped_and_replacement_stays_sticky() {
        // A second, unrelated process (here: our own listener) holds the
        // declared port at the OS level; it never appears in the table.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let wanted = listener.local_addr().unwrap().port();

        let mut table = PortTable::new();
        let desc = descriptor("demo", Some(wanted));
        let got = table.allocate(&desc, Component::Frontend, &config()).unwrap();
        assert!(got > wanted);

        // After a stop, the port actually assigned (not the declared one)
        // is the one reused.
        table.commit_running("demo", Component::Frontend, 7);
        table.release("demo", Component::Frontend);
        let again = table.allocate(&desc, Component::Frontend, &config()).unwrap();
        assert_eq!(again, got);
        drop(listener);
    }

    #[test]
    fn released_port_is_sticky_across_restarts() {
        let mut table = PortTable::new();
        let config = config();
        let port = free_port();
        let desc = descriptor("demo", Some(port));

        let first = table.allocate(&desc, Component::Frontend, &config).unwrap();
        table.commit_running("demo", Component::Frontend, 42);
        table.release("demo", Component::Frontend);

        // Even with the declared port changed, the previous assignment wins.
        let desc2 = descriptor("demo", None);
        let second = table.allocate(&desc2, Component::Frontend, &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn running_rows_never_share_a_port() {
        let mut table = PortTable::new();
        let config = config();
        let port = free_port();

        let a = descriptor("alpha", Some(port));
        let b = descriptor("beta", Some(port));
        let pa = table.allocate(&a, Component::Frontend, &config).unwrap();
        // Reservation alone must already repel the second allocation.
        let pb = table.allocate(&b, Component::Frontend, &config).unwrap();
        assert_ne!(pa, pb);

        table.commit_running("alpha", Component::Frontend, 1);
        table.commit_running("beta", Component::Frontend, 2);
        let running: Vec<u16> = table
            .rows()
            .into_iter()
            .filter(|r| r.running)
            .map(|r| r.port)
            .collect();
        let unique: std::collections::HashSet<u16> = running.iter().copied().collect();
        assert_eq!(running.len(), unique.len());
    }

    #[test]
    fn aborted_reservation_is_reusable() {
        let mut table = PortTable::new();
        let config = config();
        let port = free_port();

        let a = descriptor("alpha", Some(port));
        assert_eq!(table.allocate(&a, Component::Frontend, &config).unwrap(), port);
        table.abort("alpha", Component::Frontend);

        let b = descriptor("beta", Some(port));
        assert_eq!(table.allocate(&b, Component::Frontend, &config).unwrap(), port);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut table = PortTable::new();
        let mut config = config();
        config.port_scan_attempts = 1;

        let port = free_port();
        let a = descriptor("alpha", Some(port));
        table.allocate(&a, Component::Frontend, &config).unwrap();
        table.commit_running("alpha", Component::Frontend, 1);

        let b = descriptor("beta", Some(port));
        // One attempt, and the only candidate is taken.
        let err = table.allocate(&b, Component::Frontend, &config).unwrap_err();
        assert!(matches!(err, FleetError::PortExhausted { .. }));
    }
}
