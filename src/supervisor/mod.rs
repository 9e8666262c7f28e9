//! Tunnel supervision: the authoritative state owner and its lifecycle
//! operations. All mutation of the registry, the live-task map, the
//! in-flight probe map and the scheduler table goes through the
//! [`TunnelSupervisor`]; the display only ever sees snapshots.

pub mod reconcile;
pub mod runner;
pub mod scheduler;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::registry::{Disabled, TunnelRegistry, TunnelRow, TunnelSpec};

/// Delay before the scheduler's first tick, giving tunnels time to
/// establish before probing begins.
pub const SCHEDULER_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Period of the scheduler tick. Countdowns are expressed in these ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for cancelled tasks to acknowledge.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running tunnel-process task plus the child's pid once it is known.
/// The task owns the child; aborting the task kills the child via
/// kill-on-drop, so the handle is the only thing to manage.
pub(crate) struct TunnelHandle {
    task: JoinHandle<()>,
    pid: Arc<OnceLock<u32>>,
}

impl TunnelHandle {
    /// A finished task counts as absent for every lifecycle decision.
    pub(crate) fn is_live(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the child to exit, cancel the task and wait for the
    /// cancellation to be acknowledged.
    async fn terminate(self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.get() {
            signal_term(*pid);
        }
        self.task.abort();
        // A JoinError here is the cancellation being acknowledged.
        let _ = self.task.await;
    }
}

/// Ask the child politely first; kill-on-drop covers the rest.
#[cfg(unix)]
fn signal_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM for pid {} failed: {}", pid, e);
    }
}

/// Owns every piece of supervised state. Runs inside a current-thread
/// runtime, so tasks only interleave at awaits; none of the locks below
/// is ever held across one.
pub struct TunnelSupervisor {
    registry: Mutex<TunnelRegistry>,
    tunnel_tasks: Mutex<HashMap<String, TunnelHandle>>,
    probe_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    scheduler_table: Mutex<HashMap<String, u64>>,
    colors: Mutex<BTreeMap<String, i32>>,
    shutting_down: AtomicBool,
}

impl TunnelSupervisor {
    pub fn new(config: Config) -> Arc<Self> {
        // Tunnels with a test command start with their probe due now.
        let scheduler_table = config
            .tunnels
            .values()
            .filter(|spec| spec.has_probe())
            .map(|spec| (spec.name.clone(), 0))
            .collect();

        Arc::new(Self {
            registry: Mutex::new(TunnelRegistry::from_specs(config.tunnels.into_values())),
            tunnel_tasks: Mutex::new(HashMap::new()),
            probe_tasks: Mutex::new(HashMap::new()),
            scheduler_table: Mutex::new(scheduler_table),
            colors: Mutex::new(config.colors),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start every auto-start tunnel in the registry, yielding between
    /// spawns so one failing launch cannot stall the batch.
    pub async fn start_all(&self) {
        let specs: Vec<TunnelSpec> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.iter().map(|(_, entry)| entry.spec.clone()).collect()
        };

        for spec in specs {
            if !spec.auto_start {
                info!("tunnel {} configured with auto_start = false", spec.name);
                let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = registry.get_mut(&spec.name) {
                    entry.status.disabled = Disabled::Manual;
                }
                drop(registry);
                continue;
            }
            self.start_tunnel(&spec.name, &spec.command);
            tokio::task::yield_now().await;
        }
    }

    /// Register and launch the process task for `name`. A live handle for
    /// the same name is never replaced; a finished one is.
    pub(crate) fn start_tunnel(&self, name: &str, command: &str) {
        let mut tasks = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if tasks.get(name).is_some_and(TunnelHandle::is_live) {
            debug!("tunnel {} already has a live process", name);
            return;
        }

        info!("starting tunnel {}: {}", name, command);
        let pid = Arc::new(OnceLock::new());
        let task = tokio::spawn(run_tunnel(
            name.to_string(),
            command.to_string(),
            Arc::clone(&pid),
        ));
        tasks.insert(name.to_string(), TunnelHandle { task, pid });
    }

    /// Cancel the running process task for `name`, if any, and reset its
    /// visible status. The old handle's cancellation is acknowledged
    /// before this returns; stopping an already-stopped tunnel is a no-op.
    pub async fn stop(&self, name: &str) {
        let handle = {
            let mut tasks = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(name)
        };
        let Some(handle) = handle else {
            return;
        };

        info!("stopping tunnel {}", name);
        handle.terminate().await;

        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = registry.get_mut(name) {
            entry.status.clear();
        }
    }

    /// Stop then start `name` from its current spec. Unknown names are a
    /// no-op, not an error.
    pub async fn restart(&self, name: &str) {
        let command = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.get(name).map(|entry| entry.spec.command.clone())
        };
        let Some(command) = command else {
            return;
        };
        self.stop(name).await;
        self.start_tunnel(name, &command);
    }

    /// Flip `name` between running and manually disabled. This is the only
    /// path that sets or clears the manual disable.
    pub async fn toggle(&self, name: &str) {
        let live = {
            let tasks = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.get(name).is_some_and(TunnelHandle::is_live)
        };

        if live {
            // Mark first so the revive pass cannot resurrect the tunnel
            // while the stop is still being acknowledged.
            {
                let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                let Some(entry) = registry.get_mut(name) else {
                    return;
                };
                entry.status.disabled = Disabled::Manual;
            }
            self.cancel_probe(name);
            self.stop(name).await;
            info!("tunnel {} disabled", name);
        } else {
            let spec = {
                let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
                let Some(entry) = registry.get_mut(name) else {
                    return;
                };
                entry.status.disabled = Disabled::No;
                entry.spec.clone()
            };
            // Probe right away now that it is back under management.
            if spec.has_probe() {
                let mut table = self
                    .scheduler_table
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                table.insert(name.to_string(), 0);
            }
            self.start_tunnel(name, &spec.command);
            info!("tunnel {} enabled", name);
        }
    }

    /// Ask for an immediate probe. Ignored for manually disabled tunnels
    /// and for tunnels without a test command.
    pub fn force_test(&self, name: &str) {
        {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = registry.get(name) else {
                return;
            };
            if entry.status.disabled.is_manual() || !entry.spec.has_probe() {
                return;
            }
        }
        let mut table = self
            .scheduler_table
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(countdown) = table.get_mut(name) {
            debug!("forcing probe for {}", name);
            *countdown = 0;
        }
    }

    /// Abort the in-flight probe for `name`, if any.
    pub(crate) fn cancel_probe(&self, name: &str) {
        let probe = {
            let mut probes = self.probe_tasks.lock().unwrap_or_else(|e| e.into_inner());
            probes.remove(name)
        };
        if let Some(probe) = probe {
            debug!("cancelling in-flight probe for {}", name);
            probe.abort();
        }
    }

    /// Read-only rows for the display, in stable name order.
    pub fn snapshot(&self) -> Vec<TunnelRow> {
        let tasks = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .map(|(name, entry)| TunnelRow {
                name: name.clone(),
                address: entry.spec.address.clone(),
                port: entry.spec.port,
                health: entry.status.health,
                stdout: entry.status.stdout.clone(),
                stderr: entry.status.stderr.clone(),
                disabled: entry.status.disabled.is_manual(),
                live: tasks.get(name).is_some_and(TunnelHandle::is_live),
            })
            .collect()
    }

    /// Current color table, refreshed on config reload.
    pub fn colors(&self) -> BTreeMap<String, i32> {
        self.colors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_colors(&self, colors: BTreeMap<String, i32>) {
        *self.colors.lock().unwrap_or_else(|e| e.into_inner()) = colors;
    }

    /// Stop scheduling, cancel every outstanding task and give the
    /// cancellations a moment to be acknowledged. The flag is raised
    /// first so the tick loop stops launching probes even before its own
    /// cancellation lands.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let probes: Vec<(String, JoinHandle<()>)> = {
            let mut map = self.probe_tasks.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        let tunnels: Vec<(String, TunnelHandle)> = {
            let mut map = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().collect()
        };
        if probes.is_empty() && tunnels.is_empty() {
            return;
        }

        info!(
            "shutting down: cancelling {} tunnels, {} probes",
            tunnels.len(),
            probes.len()
        );
        let drain = async {
            for (_, probe) in probes {
                probe.abort();
                let _ = probe.await;
            }
            for (_, handle) in tunnels {
                handle.terminate().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown drain timed out");
        }
    }
}

/// The tunnel process task: spawn the command, record its pid and wait
/// for it to exit. A launch failure is surfaced through logging and the
/// tunnel's never-advancing status, not by tearing anything else down.
async fn run_tunnel(name: String, command: String, pid: Arc<OnceLock<u32>>) {
    let child = match runner::spawn_command(&command) {
        Ok(child) => child,
        Err(e) => {
            warn!("tunnel {} failed to launch: {}", name, e);
            return;
        }
    };
    if let Some(id) = child.id() {
        let _ = pid.set(id);
    }

    match child.wait_with_output().await {
        Ok(output) => {
            info!("tunnel {} process exited ({})", name, output.status);
            if !output.stderr.is_empty() {
                debug!(
                    "tunnel {} stderr: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                );
            }
        }
        Err(e) => warn!("tunnel {} wait failed: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_with(config: &str) -> Arc<TunnelSupervisor> {
        TunnelSupervisor::new(Config::parse(config).unwrap())
    }

    const TWO_TUNNELS: &str = r#"
[tunnel.alpha]
address = "127.0.0.1"
port = 1111
command = "sleep 30"
test_command = "echo ok"
test_command_result = "ok"
test_interval = 5
test_timeout = 2

[tunnel.beta]
address = "127.0.0.1"
port = 2222
command = "sleep 30"
"#;

    #[tokio::test]
    async fn start_all_registers_one_live_handle_per_tunnel() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        let rows = sup.snapshot();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.live));

        let tasks = sup.tunnel_tasks.lock().unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn stop_clears_status_and_handle() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        sup.stop("alpha").await;
        let rows = sup.snapshot();
        let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
        assert!(!alpha.live);
        assert_eq!(alpha.stdout, crate::registry::OUTPUT_PLACEHOLDER);

        // already stopped: a second stop is a no-op
        sup.stop("alpha").await;
        // unknown names are ignored
        sup.stop("nonexistent").await;
    }

    #[tokio::test]
    async fn restart_leaves_exactly_one_live_handle() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        sup.restart("alpha").await;
        let tasks = sup.tunnel_tasks.lock().unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.get("alpha").unwrap().is_live());
    }

    #[tokio::test]
    async fn restart_of_unknown_name_is_a_noop() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.restart("nonexistent").await;
        assert!(sup.tunnel_tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn toggle_pair_returns_to_running_state() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        sup.toggle("alpha").await;
        {
            let rows = sup.snapshot();
            let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
            assert!(!alpha.live);
            assert!(alpha.disabled);
        }

        sup.toggle("alpha").await;
        let rows = sup.snapshot();
        let alpha = rows.iter().find(|row| row.name == "alpha").unwrap();
        assert!(alpha.live);
        assert!(!alpha.disabled);
    }

    #[tokio::test]
    async fn toggle_on_resets_the_countdown() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;
        sup.toggle("alpha").await;

        {
            let mut table = sup.scheduler_table.lock().unwrap();
            table.insert("alpha".to_string(), 4);
        }
        sup.toggle("alpha").await;
        assert_eq!(sup.scheduler_table.lock().unwrap()["alpha"], 0);
    }

    #[tokio::test]
    async fn force_test_is_ignored_while_disabled() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;
        sup.toggle("alpha").await;

        {
            let mut table = sup.scheduler_table.lock().unwrap();
            table.insert("alpha".to_string(), 3);
        }
        sup.force_test("alpha");
        assert_eq!(sup.scheduler_table.lock().unwrap()["alpha"], 3);
    }

    #[tokio::test]
    async fn force_test_zeroes_the_countdown() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        {
            let mut table = sup.scheduler_table.lock().unwrap();
            table.insert("alpha".to_string(), 3);
        }
        sup.force_test("alpha");
        assert_eq!(sup.scheduler_table.lock().unwrap()["alpha"], 0);

        // beta has no test command and no scheduler entry
        sup.force_test("beta");
        assert!(!sup.scheduler_table.lock().unwrap().contains_key("beta"));
    }

    #[tokio::test]
    async fn auto_start_false_begins_manually_disabled() {
        let sup = supervisor_with(
            r#"
[tunnel.idle]
address = "127.0.0.1"
port = 3333
command = "sleep 30"
auto_start = false
"#,
        );
        sup.start_all().await;

        let rows = sup.snapshot();
        assert!(!rows[0].live);
        assert!(rows[0].disabled);

        // toggle brings it under management
        sup.toggle("idle").await;
        let rows = sup.snapshot();
        assert!(rows[0].live);
        assert!(!rows[0].disabled);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let sup = supervisor_with(TWO_TUNNELS);
        sup.start_all().await;

        sup.shutdown().await;
        assert!(sup.is_shutting_down());
        assert!(sup.tunnel_tasks.lock().unwrap().is_empty());
        assert!(sup.probe_tasks.lock().unwrap().is_empty());
    }
}
