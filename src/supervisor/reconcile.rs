//! Config-reload reconciliation: diff a freshly parsed configuration
//! against live state and apply the minimal set of start/replace/remove
//! operations, preserving running tunnels whose endpoint is unchanged.

use std::sync::Arc;

use tracing::{debug, info};

use super::TunnelSupervisor;
use crate::config::Config;
use crate::registry::{Disabled, TunnelSpec};

/// Apply a freshly parsed configuration. Additions first, then in-place
/// changes, then removals; each tunnel's multi-step update runs as one
/// uninterrupted sequence apart from the await on its own old process.
pub async fn apply(supervisor: &Arc<TunnelSupervisor>, config: Config) {
    supervisor.set_colors(config.colors);
    let new_specs = config.tunnels;

    let added: Vec<TunnelSpec> = {
        let registry = supervisor
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        new_specs
            .values()
            .filter(|spec| !registry.contains(&spec.name))
            .cloned()
            .collect()
    };
    for spec in added {
        supervisor.add_tunnel(spec).await;
    }

    let changed: Vec<(TunnelSpec, bool)> = {
        let registry = supervisor
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        new_specs
            .values()
            .filter_map(|spec| {
                let entry = registry.get(&spec.name)?;
                if entry.spec == *spec {
                    return None;
                }
                Some((spec.clone(), entry.spec.endpoint_differs(spec)))
            })
            .collect()
    };
    for (spec, endpoint_changed) in changed {
        if endpoint_changed {
            supervisor.replace_tunnel(spec).await;
        } else {
            supervisor.update_probe_settings(spec);
        }
    }

    let removed: Vec<String> = {
        let registry = supervisor
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        registry
            .names()
            .into_iter()
            .filter(|name| !new_specs.contains_key(name))
            .collect()
    };
    for name in removed {
        supervisor.remove_tunnel(&name).await;
    }
}

impl TunnelSupervisor {
    /// Register a tunnel that appeared in the config, start it (honoring
    /// `auto_start`) and make its first probe due immediately.
    async fn add_tunnel(&self, spec: TunnelSpec) {
        info!("config added tunnel {}", spec.name);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.insert(spec.clone());
            if !spec.auto_start {
                if let Some(entry) = registry.get_mut(&spec.name) {
                    entry.status.disabled = Disabled::Manual;
                }
            }
        }
        self.sync_schedule(&spec);
        if spec.auto_start {
            self.start_tunnel(&spec.name, &spec.command);
        }
        tokio::task::yield_now().await;
    }

    /// Swap a tunnel whose endpoint changed: install the new spec with a
    /// fresh status, fully stop the old process, then start the new one.
    /// Installing the spec first means a revive pass landing inside the
    /// stop's await already launches the new command, never the old one.
    async fn replace_tunnel(&self, spec: TunnelSpec) {
        info!("config changed tunnel {}, replacing its process", spec.name);
        self.cancel_probe(&spec.name);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.insert(spec.clone());
        }
        self.sync_schedule(&spec);
        self.stop(&spec.name).await;
        self.start_tunnel(&spec.name, &spec.command);
        tokio::task::yield_now().await;
    }

    /// Only the probe settings changed: install the new spec without
    /// touching the running process, and probe again right away.
    fn update_probe_settings(&self, spec: TunnelSpec) {
        debug!("config updated probe settings for {}", spec.name);
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = registry.get_mut(&spec.name) {
                entry.spec = spec.clone();
            }
        }
        self.sync_schedule(&spec);
    }

    /// Stop and forget a tunnel that vanished from the config, together
    /// with its probe and scheduler entry.
    async fn remove_tunnel(&self, name: &str) {
        info!("config removed tunnel {}", name);
        self.cancel_probe(name);
        self.stop(name).await;
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.remove(name);
        }
        let mut table = self
            .scheduler_table
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        table.remove(name);
    }

    /// Make the scheduler entry mirror the spec: due now if the tunnel
    /// probes, absent if it does not.
    fn sync_schedule(&self, spec: &TunnelSpec) {
        let mut table = self
            .scheduler_table
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if spec.has_probe() {
            table.insert(spec.name.clone(), 0);
        } else {
            table.remove(&spec.name);
        }
    }
}
