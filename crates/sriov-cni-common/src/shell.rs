//! Shell command execution utilities.
//!
//! This module provides shell command execution with proper quoting to
//! prevent command injection through interface names or device paths, and
//! a direct (no shell) runner used for executables that take their input on
//! stdin, such as IPAM plugins.
//!
//! Commands inherit the network namespace of the calling thread, so a
//! command spawned while the thread is switched into a container namespace
//! runs inside that namespace.
//!
//! # Example
//!
//! ```ignore
//! use sriov_cni_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("net0"));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{SriovError, SriovResult};

/// Path to the `ip` command for network interface configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `sh` shell used to run composed command lines.
pub const SH_CMD: &str = "/bin/sh";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and every character with a special
/// meaning inside double quotes is escaped.
///
/// # Example
///
/// ```
/// use sriov_cni_common::shell::shellquote;
///
/// assert_eq!(shellquote("net0"), "\"net0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Executes a shell command line through `/bin/sh -c`.
///
/// Returns `Err` only if the command could not be spawned; a non-zero exit
/// is reported through [`ExecResult::success`].
pub async fn exec(cmd: &str) -> SriovResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new(SH_CMD)
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SriovError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult::from_output(output);

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
///
/// Returns the trimmed stdout on success.
pub async fn exec_or_throw(cmd: &str) -> SriovResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(SriovError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Runs an executable directly, feeding `input` on stdin.
///
/// The child starts with the caller's environment plus `envs`. No shell is
/// involved, so arguments need no quoting.
pub async fn run<I, K, V>(program: &Path, envs: I, input: &[u8]) -> SriovResult<ExecResult>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<std::ffi::OsStr>,
    V: AsRef<std::ffi::OsStr>,
{
    let command = program.display().to_string();
    tracing::debug!(program = %command, "Running executable");

    let spawn_err = |e| SriovError::ShellExec {
        command: command.clone(),
        source: e,
    };

    let mut child = Command::new(program)
        .envs(envs)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await.map_err(spawn_err)?;
        // Closing stdin lets the child see EOF.
        drop(stdin);
    }

    let output = child.wait_with_output().await.map_err(spawn_err)?;
    let result = ExecResult::from_output(output);

    if !result.success() {
        tracing::warn!(
            program = %command,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Executable failed"
        );
    }

    Ok(result)
}
