//! Core library behind the `tunneltop` binary: tunnel supervision, the
//! health-check scheduler, config reconciliation and the terminal view.

pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod supervisor;
pub mod ui;

pub use error::{AppError, ErrorKind, Result};
