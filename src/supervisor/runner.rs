//! Subprocess execution for tunnel and probe commands.

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{AppError, Result};

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Split a command line on whitespace and spawn it with both output
/// streams piped. The child is killed when the owning future is dropped
/// (task abort, an enclosing timeout), so a cancelled caller never leaks
/// the process.
pub(crate) fn spawn_command(command_line: &str) -> Result<Child> {
    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| AppError::process("empty command line"))?;

    let mut cmd = Command::new(program);
    cmd.args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
        .map_err(|e| AppError::process(format!("failed to spawn {}: {}", program, e)))
}

/// Run a command to completion, buffering both output streams fully.
/// No retries happen here; that is the caller's policy.
pub async fn run_command(command_line: &str) -> Result<CommandOutput> {
    let child = spawn_command(command_line)?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| AppError::process(format!("failed to wait for {}: {}", command_line, e)))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        success: output.status.success(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn captures_stdout() {
        let output = run_command("echo hello").await.unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "");
        assert!(output.success);
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let output = run_command("false").await.unwrap();
        assert!(!output.success);
    }

    #[tokio::test]
    async fn empty_command_line_is_an_error() {
        let err = run_command("   ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
    }

    #[tokio::test]
    async fn unknown_program_is_an_error() {
        let err = run_command("definitely-not-a-real-binary-1234").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
    }

    #[tokio::test]
    async fn timeout_drops_and_kills_the_child() {
        let started = Instant::now();
        let result =
            tokio::time::timeout(Duration::from_millis(200), run_command("sleep 30")).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
