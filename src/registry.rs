//! Tunnel data model: specs, live status and the name-keyed registry.

use std::collections::BTreeMap;
use std::fmt;

/// Output shown for a tunnel whose probe has never run, or after a stop.
pub const OUTPUT_PLACEHOLDER: &str = "n/a";

/// Output shown after a probe exceeded its deadline.
pub const TIMEOUT_PLACEHOLDER: &str = "-";

/// Immutable description of one tunnel, as loaded from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub command: String,
    pub test_command: String,
    pub test_command_result: String,
    /// Seconds between probes.
    pub test_interval: u64,
    /// Probe deadline in seconds.
    pub test_timeout: u64,
    /// When false, the tunnel starts out manually disabled.
    pub auto_start: bool,
}

impl TunnelSpec {
    /// Whether this tunnel participates in periodic probing.
    pub fn has_probe(&self) -> bool {
        !self.test_command.is_empty()
    }

    /// Whether switching to `other` requires the running process to be
    /// replaced. Probe settings are deliberately not part of this check;
    /// they can change under a running tunnel.
    pub fn endpoint_differs(&self, other: &TunnelSpec) -> bool {
        self.command != other.command || self.port != other.port || self.address != other.address
    }
}

/// Probe verdict for one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelHealth {
    #[default]
    Unknown,
    Up,
    Down,
    Timeout,
}

impl TunnelHealth {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "UNKWN",
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Timeout => "TMOUT",
        }
    }
}

impl fmt::Display for TunnelHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a tunnel is exempt from automatic management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disabled {
    #[default]
    No,
    /// Suppresses both auto-revival and auto-testing. Only the toggle
    /// action sets or clears this.
    Manual,
}

impl Disabled {
    pub fn is_manual(self) -> bool {
        self == Self::Manual
    }
}

/// Mutable per-tunnel state owned by the registry.
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub health: TunnelHealth,
    pub stdout: String,
    pub stderr: String,
    pub disabled: Disabled,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            health: TunnelHealth::Unknown,
            stdout: OUTPUT_PLACEHOLDER.to_string(),
            stderr: OUTPUT_PLACEHOLDER.to_string(),
            disabled: Disabled::No,
        }
    }
}

impl TunnelStatus {
    /// Reset to the never-probed state. Leaves the disable flag alone.
    pub fn clear(&mut self) {
        self.health = TunnelHealth::Unknown;
        self.stdout = OUTPUT_PLACEHOLDER.to_string();
        self.stderr = OUTPUT_PLACEHOLDER.to_string();
    }
}

/// A spec and its status; the pair is created and destroyed together.
#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub spec: TunnelSpec,
    pub status: TunnelStatus,
}

impl TunnelEntry {
    pub fn new(spec: TunnelSpec) -> Self {
        Self {
            spec,
            status: TunnelStatus::default(),
        }
    }
}

/// Authoritative name-keyed map of tunnels. Iteration order is stable
/// (sorted by name) so the display never shuffles rows.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    entries: BTreeMap<String, TunnelEntry>,
}

impl TunnelRegistry {
    pub fn from_specs(specs: impl IntoIterator<Item = TunnelSpec>) -> Self {
        let entries = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), TunnelEntry::new(spec)))
            .collect();
        Self { entries }
    }

    /// Insert a tunnel with a fresh status, replacing any previous entry
    /// for the same name wholesale.
    pub fn insert(&mut self, spec: TunnelSpec) {
        self.entries
            .insert(spec.name.clone(), TunnelEntry::new(spec));
    }

    pub fn remove(&mut self, name: &str) -> Option<TunnelEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TunnelEntry> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TunnelEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TunnelEntry)> {
        self.entries.iter()
    }
}

/// Read-only view of one tunnel, sufficient for the display layer to
/// render a row without touching mutable core state.
#[derive(Debug, Clone)]
pub struct TunnelRow {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub health: TunnelHealth,
    pub stdout: String,
    pub stderr: String,
    pub disabled: bool,
    /// Whether a running process handle currently exists for this tunnel.
    pub live: bool,
}
