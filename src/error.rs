//! Application error types.

use std::fmt;

/// Classifies every failure the supervisor can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Configuration file missing, unreadable or invalid
    Config,
    /// File system error
    Io,
    /// Process spawn or wait error
    Process,
    /// An action referenced a tunnel that is not in the registry
    TunnelNotFound,
    /// General error
    Other,
}

/// Application error carrying a kind and a human-readable detail.
#[derive(Debug)]
pub struct AppError {
    kind: ErrorKind,
    detail: String,
}

impl AppError {
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn tunnel_not_found(name: &str) -> Self {
        Self::with_detail(ErrorKind::TunnelNotFound, name.to_string())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.detail)
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
