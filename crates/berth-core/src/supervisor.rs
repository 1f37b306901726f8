//! Service supervisor adapter.
//!
//! Thin idempotent layer over the host's systemd: register a unit, enable
//! it, drive start/stop/restart, read state, tail the journal. Crash
//! recovery is declared in the unit (`Restart=always` with a fixed backoff),
//! not re-implemented here. Mutating calls on an already-converged unit are
//! no-ops that report success.
//!
//! Privileged operations run through `sudo -n`, so the remote user needs
//! passwordless sudo for systemctl and unit installation.

use crate::channel::Channel;
use crate::config::DesiredState;
use crate::error::{BerthError, Result};
use crate::paths::{self, shell_quote};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

// ---------------------------------------------------------------------------
// UnitState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Absent,
    Inactive,
    Active,
    Failed,
}

impl UnitState {
    /// Map a `systemctl is-active` word onto the model. `registered` comes
    /// from a separate unit-file check: an unregistered unit is `Absent` no
    /// matter what systemctl says about the name.
    pub fn from_systemctl(word: &str, registered: bool) -> Self {
        if !registered {
            return UnitState::Absent;
        }
        match word {
            "active" => UnitState::Active,
            "failed" => UnitState::Failed,
            _ => UnitState::Inactive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Absent => "absent",
            UnitState::Inactive => "inactive",
            UnitState::Active => "active",
            UnitState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceUnit
// ---------------------------------------------------------------------------

/// Everything needed to render and install the systemd unit.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceUnit {
    pub name: String,
    pub user: String,
    pub working_dir: String,
    pub env_file: String,
    pub exec_start: String,
}

impl ServiceUnit {
    pub fn from_desired(desired: &DesiredState) -> Result<Self> {
        paths::validate_service_name(&desired.service_name)?;
        let root = &desired.deploy_root;
        Ok(Self {
            name: desired.service_name.clone(),
            user: desired.remote_user.clone(),
            working_dir: root.clone(),
            env_file: paths::env_file(root),
            exec_start: format!("{} {root}/{}", paths::venv_python(root), desired.entrypoint),
        })
    }

    pub fn unit_path(&self) -> String {
        paths::unit_file(&self.name)
    }

    /// Render the unit file. Logs go to the journal via systemd's default
    /// stdout/stderr handling.
    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description={name} (deployed by berth)\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             WorkingDirectory={dir}\n\
             EnvironmentFile={env}\n\
             ExecStart={exec}\n\
             Restart=always\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            name = self.name,
            user = self.user,
            dir = self.working_dir,
            env = self.env_file,
            exec = self.exec_start,
        )
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor<'a> {
    channel: &'a dyn Channel,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(channel: &'a dyn Channel) -> Self {
        Self {
            channel,
            wait_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_wait(mut self, timeout: Duration, poll: Duration) -> Self {
        self.wait_timeout = timeout;
        self.poll_interval = poll;
        self
    }

    pub fn status(&self, name: &str) -> Result<UnitState> {
        let script = format!(
            "if [ -f {unit} ]; then echo registered; else echo unregistered; fi\n\
             state=\"$(systemctl is-active {name} 2>/dev/null)\" || true\n\
             echo \"state=${{state:-unknown}}\"\n",
            unit = shell_quote(&paths::unit_file(name)),
            name = shell_quote(name),
        );
        let out = self
            .channel
            .run_script(&script)?
            .require_success("unit status probe")?;
        let registered = out.stdout.lines().any(|l| l.trim() == "registered");
        let word = out
            .stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix("state="))
            .unwrap_or("unknown");
        Ok(UnitState::from_systemctl(word, registered))
    }

    /// Install the unit file if it differs from what is on the host, then
    /// reload systemd. Returns whether anything changed.
    pub fn register(&self, unit: &ServiceUnit) -> Result<bool> {
        let text = unit.render();
        let path = shell_quote(&unit.unit_path());
        let script = format!(
            "set -e\n\
             tmp=\"$(mktemp)\"\n\
             cat > \"$tmp\" <<'BERTH_UNIT'\n\
             {text}BERTH_UNIT\n\
             if cmp -s \"$tmp\" {path} 2>/dev/null; then\n\
             rm -f \"$tmp\"\n\
             echo unchanged\n\
             else\n\
             sudo -n mv \"$tmp\" {path}\n\
             sudo -n chown root:root {path}\n\
             sudo -n chmod 644 {path}\n\
             sudo -n systemctl daemon-reload\n\
             echo installed\n\
             fi\n",
        );
        let out = self
            .channel
            .run_script(&script)?
            .require_success("unit install")?;
        Ok(out.stdout.lines().any(|l| l.trim() == "installed"))
    }

    /// Idempotent enable. Returns whether the unit was newly enabled.
    pub fn enable(&self, name: &str) -> Result<bool> {
        let command = format!("sudo -n systemctl enable {}", shell_quote(name));
        let out = self.channel.run(&command)?.require_success(&command)?;
        // systemctl reports symlink creation only the first time.
        Ok(out.stderr.contains("Created symlink") || out.stdout.contains("Created symlink"))
    }

    /// Idempotent start: a unit that is already active is left alone.
    pub fn start(&self, name: &str) -> Result<bool> {
        if self.status(name)? == UnitState::Active {
            debug!(unit = name, "already active");
            return Ok(false);
        }
        let command = format!("sudo -n systemctl start {}", shell_quote(name));
        self.channel.run(&command)?.require_success(&command)?;
        self.wait_for(name, UnitState::Active)?;
        Ok(true)
    }

    /// Idempotent stop.
    pub fn stop(&self, name: &str) -> Result<bool> {
        match self.status(name)? {
            UnitState::Active | UnitState::Failed => {}
            UnitState::Inactive | UnitState::Absent => return Ok(false),
        }
        let command = format!("sudo -n systemctl stop {}", shell_quote(name));
        self.channel.run(&command)?.require_success(&command)?;
        self.wait_for(name, UnitState::Inactive)?;
        Ok(true)
    }

    /// Always transitions through stop→start, whatever the prior state.
    pub fn restart(&self, name: &str) -> Result<()> {
        let command = format!("sudo -n systemctl restart {}", shell_quote(name));
        self.channel.run(&command)?.require_success(&command)?;
        self.wait_for(name, UnitState::Active)
    }

    /// Tail the last `lines` of the unit's journal. In follow mode the call
    /// keeps streaming until the connection drops, and the caller re-invokes
    /// to reconnect.
    pub fn tail_logs(
        &self,
        name: &str,
        lines: u32,
        follow: bool,
        sink: &mut dyn FnMut(crate::channel::StreamKind, &str),
    ) -> Result<()> {
        let mut command = format!(
            "journalctl -u {} --no-pager -o short-iso -n {lines}",
            shell_quote(name)
        );
        if follow {
            command.push_str(" -f");
        }
        self.channel
            .run_streaming(&command, None, sink)?
            .require_success(&command)?;
        Ok(())
    }

    fn wait_for(&self, name: &str, wanted: UnitState) -> Result<()> {
        let start = Instant::now();
        loop {
            let state = self.status(name)?;
            if state == wanted {
                return Ok(());
            }
            if start.elapsed() >= self.wait_timeout {
                return Err(BerthError::Supervisor {
                    unit: name.to_string(),
                    wanted: wanted.as_str().to_string(),
                    last: state.as_str().to_string(),
                    waited_secs: self.wait_timeout.as_secs(),
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
