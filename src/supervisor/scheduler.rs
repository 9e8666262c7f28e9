//! The periodic control loop: revive exited tunnels, then launch the
//! probes that are due. One tick runs both passes, revival first.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{runner, TunnelHandle, TunnelSupervisor, SCHEDULER_STARTUP_DELAY, TICK_INTERVAL};
use crate::registry::{TunnelHealth, OUTPUT_PLACEHOLDER, TIMEOUT_PLACEHOLDER};

/// Everything a probe task needs, detached from the shared maps.
#[derive(Debug, Clone)]
struct ProbeJob {
    name: String,
    test_command: String,
    expected: String,
    timeout: Duration,
}

/// Drive the supervisor's tick until shutdown is observed. The shutdown
/// flag is checked before any scheduling work on every iteration, so no
/// new probe launches once shutdown has begun, even while probes already
/// in flight are still draining.
pub async fn run(supervisor: Arc<TunnelSupervisor>) {
    tokio::time::sleep(SCHEDULER_STARTUP_DELAY).await;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if supervisor.is_shutting_down() {
            info!("scheduler stopping");
            return;
        }
        supervisor.tick_once().await;
    }
}

impl TunnelSupervisor {
    /// One scheduler step: the revive pass, then the probe pass. Public
    /// so embedders and tests can drive the schedule without the timer.
    pub async fn tick_once(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        self.revive_exited().await;
        self.launch_due_probes();
    }

    /// Restart every enabled tunnel whose process task has ended, whether
    /// it was never started or exited on its own. Manually disabled
    /// tunnels are exempt.
    pub(crate) async fn revive_exited(&self) {
        let dead: Vec<(String, String)> = {
            let tasks = self.tunnel_tasks.lock().unwrap_or_else(|e| e.into_inner());
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .iter()
                .filter(|(name, entry)| {
                    !entry.status.disabled.is_manual()
                        && !tasks.get(*name).is_some_and(TunnelHandle::is_live)
                })
                .map(|(name, entry)| (name.clone(), entry.spec.command.clone()))
                .collect()
        };

        for (name, command) in dead {
            info!("reviving tunnel {}", name);
            self.start_tunnel(&name, &command);
            tokio::task::yield_now().await;
        }
    }

    /// Apply the countdown rules and spawn a probe for every due tunnel.
    /// A countdown resets the moment its probe launches; it governs the
    /// probe's period, not its spacing after completion, and it never
    /// runs below zero.
    pub(crate) fn launch_due_probes(self: &Arc<Self>) {
        let mut due: Vec<ProbeJob> = Vec::new();
        {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let mut probes = self.probe_tasks.lock().unwrap_or_else(|e| e.into_inner());
            probes.retain(|_, task| !task.is_finished());
            let mut table = self
                .scheduler_table
                .lock()
                .unwrap_or_else(|e| e.into_inner());

            for (name, countdown) in table.iter_mut() {
                let Some(entry) = registry.get(name) else {
                    continue;
                };
                if entry.status.disabled.is_manual() {
                    continue;
                }
                if *countdown == 0 && !probes.contains_key(name) {
                    due.push(ProbeJob {
                        name: name.clone(),
                        test_command: entry.spec.test_command.clone(),
                        expected: entry.spec.test_command_result.clone(),
                        timeout: Duration::from_secs(entry.spec.test_timeout),
                    });
                    *countdown = entry.spec.test_interval;
                } else if *countdown > 0 {
                    *countdown -= 1;
                } else {
                    // still due, but a probe from the previous period is
                    // in flight; keep the schedule from drifting
                    *countdown = entry.spec.test_interval;
                }
            }
        }

        for job in due {
            debug!("launching probe for {}", job.name);
            let name = job.name.clone();
            let task = tokio::spawn(run_probe(Arc::clone(self), job));
            self.probe_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name, task);
        }
    }
}

/// Run one probe bounded by its deadline and record the verdict. The
/// in-flight marker is cleared on every path, so a stuck probe can never
/// block future probes for the same tunnel.
async fn run_probe(supervisor: Arc<TunnelSupervisor>, job: ProbeJob) {
    let outcome = tokio::time::timeout(job.timeout, runner::run_command(&job.test_command)).await;

    {
        let mut registry = supervisor
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = registry.get_mut(&job.name) {
            match outcome {
                Ok(Ok(output)) => {
                    let stdout = trim_probe_output(&output.stdout);
                    let stderr = trim_probe_output(&output.stderr);
                    entry.status.health = if stdout == job.expected {
                        TunnelHealth::Up
                    } else {
                        TunnelHealth::Down
                    };
                    entry.status.stdout = stdout.to_string();
                    entry.status.stderr = stderr.to_string();
                }
                Ok(Err(e)) => {
                    warn!("probe for {} failed to run: {}", job.name, e);
                    entry.status.health = TunnelHealth::Down;
                    entry.status.stdout = OUTPUT_PLACEHOLDER.to_string();
                    entry.status.stderr = e.to_string();
                }
                Err(_) => {
                    info!("probe for {} timed out", job.name);
                    entry.status.health = TunnelHealth::Timeout;
                    entry.status.stdout = TIMEOUT_PLACEHOLDER.to_string();
                    entry.status.stderr = TIMEOUT_PLACEHOLDER.to_string();
                }
            }
        }
    }

    supervisor
        .probe_tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&job.name);
}

/// Probe output usually carries a trailing newline, and quoted results
/// keep their quotes; neither should defeat an exact match.
fn trim_probe_output(raw: &str) -> &str {
    raw.trim_matches('\n').trim_matches('"')
}
