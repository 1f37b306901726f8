//! Remote execution channel.
//!
//! One blocking call per remote command: spawn the `ssh` binary, pump
//! stdout/stderr line by line so long provisioning steps stay observable,
//! return the exit status. Script bodies are piped to the remote shell's
//! stdin as opaque blobs — they are never interpolated into an argument
//! vector, so nothing in a script needs quoting.
//!
//! Transport failures (cannot establish or keep the connection) are a
//! distinct error from the remote command exiting non-zero; callers retry
//! the former by re-invocation and treat the latter as a hard failure.

use crate::error::{BerthError, Result};
use crate::host::Host;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// Override for the transport program, e.g. an ssh wrapper. Primarily for
/// test harnesses; the contract is "speaks the ssh CLI".
pub const SSH_PROGRAM_ENV: &str = "BERTH_SSH";

/// ssh reserves exit status 255 for its own failures; remote commands that
/// exit 255 themselves are indistinguishable by design.
const SSH_TRANSPORT_EXIT: i32 = 255;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last few stderr lines, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(3);
        lines[start..].join("; ")
    }

    /// Map a non-zero exit to a hard `RemoteCommand` failure.
    pub fn require_success(self, command: &str) -> Result<ExecOutput> {
        if self.success() {
            return Ok(self);
        }
        let tail = self.stderr_tail();
        let detail = if tail.is_empty() {
            String::new()
        } else {
            format!(": {tail}")
        };
        Err(BerthError::RemoteCommand {
            command: command.to_string(),
            exit_code: self.exit_code,
            detail,
        })
    }
}

// ---------------------------------------------------------------------------
// Channel trait
// ---------------------------------------------------------------------------

/// The seam between the convergence engine and the wire. Implementations
/// must block until the remote command exits or the transport gives up.
pub trait Channel {
    /// Run `command` remotely, optionally feeding `stdin`, forwarding each
    /// output line to `sink` as it arrives.
    fn run_streaming(
        &self,
        command: &str,
        stdin: Option<&str>,
        sink: &mut dyn FnMut(StreamKind, &str),
    ) -> Result<ExecOutput>;

    fn run(&self, command: &str) -> Result<ExecOutput> {
        self.run_streaming(command, None, &mut |_, _| {})
    }

    /// Upload `script` as an opaque blob and execute it with `sh -s`.
    fn run_script(&self, script: &str) -> Result<ExecOutput> {
        self.run_streaming("sh -s", Some(script), &mut |_, _| {})
    }

    fn run_script_streaming(
        &self,
        script: &str,
        sink: &mut dyn FnMut(StreamKind, &str),
    ) -> Result<ExecOutput> {
        self.run_streaming("sh -s", Some(script), sink)
    }
}

// ---------------------------------------------------------------------------
// SshChannel
// ---------------------------------------------------------------------------

pub struct SshChannel {
    program: PathBuf,
    target: String,
    address: String,
    identity: PathBuf,
    connect_timeout: Duration,
}

impl SshChannel {
    /// Resolve the ssh binary (`BERTH_SSH` override, then PATH) and bind it
    /// to `host`.
    pub fn new(host: &Host, connect_timeout: Duration) -> Result<Self> {
        let program = match std::env::var_os(SSH_PROGRAM_ENV) {
            Some(p) => PathBuf::from(p),
            None => which::which("ssh").map_err(|_| BerthError::SshNotInstalled)?,
        };
        Ok(Self::with_program(program, host, connect_timeout))
    }

    /// Bind an explicit transport program. Used by tests and wrappers.
    pub fn with_program(program: PathBuf, host: &Host, connect_timeout: Duration) -> Self {
        Self {
            program,
            target: host.target(),
            address: host.address.clone(),
            identity: host.identity.clone(),
            connect_timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            "ServerAliveInterval=15".into(),
            "-o".into(),
            "ServerAliveCountMax=2".into(),
            "-i".into(),
            self.identity.to_string_lossy().into_owned(),
        ]
    }

    fn transport_err(&self, message: impl Into<String>) -> BerthError {
        BerthError::Transport {
            host: self.address.clone(),
            message: message.into(),
        }
    }
}

impl Channel for SshChannel {
    fn run_streaming(
        &self,
        command: &str,
        stdin: Option<&str>,
        sink: &mut dyn FnMut(StreamKind, &str),
    ) -> Result<ExecOutput> {
        debug!(host = %self.target, %command, "remote exec");

        let mut cmd = Command::new(&self.program);
        cmd.args(self.base_args());
        cmd.arg(&self.target);
        cmd.arg("--");
        cmd.arg(command);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| self.transport_err(format!("failed to spawn ssh: {e}")))?;

        if let Some(body) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(body.as_bytes())
                    .map_err(|e| self.transport_err(format!("failed to upload script: {e}")))?;
                // Dropping the pipe closes the remote shell's stdin.
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_err("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.transport_err("failed to capture stderr"))?;

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        let (tx, rx) = mpsc::channel::<(StreamKind, String)>();
        std::thread::scope(|s| {
            let tx_out = tx.clone();
            s.spawn(move || pump_lines(stdout, StreamKind::Stdout, tx_out));
            s.spawn(move || pump_lines(stderr, StreamKind::Stderr, tx));

            for (kind, line) in rx {
                sink(kind, &line);
                let buf = match kind {
                    StreamKind::Stdout => &mut stdout_buf,
                    StreamKind::Stderr => &mut stderr_buf,
                };
                buf.push_str(&line);
                buf.push('\n');
            }
        });

        let status = child
            .wait()
            .map_err(|e| self.transport_err(format!("wait failed: {e}")))?;
        let exit_code = status.code().unwrap_or(-1);

        let output = ExecOutput {
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
        };

        if exit_code == SSH_TRANSPORT_EXIT {
            let tail = output.stderr_tail();
            let message = if tail.is_empty() {
                "connection failed".to_string()
            } else {
                tail
            };
            return Err(self.transport_err(message));
        }

        Ok(output)
    }
}

fn pump_lines(stream: impl std::io::Read, kind: StreamKind, tx: mpsc::Sender<(StreamKind, String)>) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tx.send((kind, line)).is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
