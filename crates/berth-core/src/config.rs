//! Desired-state descriptor.
//!
//! Loaded from `berth.yaml` when present, every field defaulted, flag and
//! environment overrides applied on top by the CLI. There is no hidden
//! process-wide state: the default source repository is the documented
//! constant below, nothing else.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Repository the bot is deployed from when no override is given.
pub const DEFAULT_SOURCE_URL: &str = "https://github.com/berth-dev/chatbot.git";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_DEPLOY_ROOT: &str = "/opt/chatbot";
pub const DEFAULT_SERVICE_NAME: &str = "chatbot";
pub const DEFAULT_ENTRYPOINT: &str = "bot.py";
pub const DEFAULT_REMOTE_USER: &str = "ubuntu";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const CONFIG_FILE: &str = "berth.yaml";

// ---------------------------------------------------------------------------
// DesiredState
// ---------------------------------------------------------------------------

/// What the target host should look like after convergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredState {
    /// Version-control URL the deployment is cloned from.
    #[serde(default = "default_source_url")]
    pub source_url: String,

    /// Branch or tag to converge the checkout to.
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Deployment root on the host.
    #[serde(default = "default_deploy_root")]
    pub deploy_root: String,

    /// systemd unit name the bot runs under.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Entry-point script, relative to the deployment root.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    /// Remote login user.
    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    /// Whether convergence should leave the unit running.
    #[serde(default = "default_should_run")]
    pub should_run: bool,

    /// Transport connect timeout for probes and commands.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// `Name` tag used for the optional cloud instance address lookup.
    #[serde(default = "default_service_name")]
    pub instance_tag: String,

    /// Private key path. `None` falls back to `~/.ssh/id_ed25519` then
    /// `~/.ssh/id_rsa` at resolution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,
}

fn default_source_url() -> String {
    DEFAULT_SOURCE_URL.to_string()
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

fn default_deploy_root() -> String {
    DEFAULT_DEPLOY_ROOT.to_string()
}

fn default_service_name() -> String {
    DEFAULT_SERVICE_NAME.to_string()
}

fn default_entrypoint() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

fn default_remote_user() -> String {
    DEFAULT_REMOTE_USER.to_string()
}

fn default_should_run() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            source_url: default_source_url(),
            revision: default_revision(),
            deploy_root: default_deploy_root(),
            service_name: default_service_name(),
            entrypoint: default_entrypoint(),
            remote_user: default_remote_user(),
            should_run: default_should_run(),
            connect_timeout_secs: default_connect_timeout(),
            instance_tag: default_service_name(),
            identity: None,
        }
    }
}

impl DesiredState {
    /// Load from `dir/berth.yaml`, or return defaults when the file is absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Apply CLI/env overrides. `None` leaves the configured value alone.
    pub fn with_overrides(
        mut self,
        source_url: Option<String>,
        revision: Option<String>,
        identity: Option<PathBuf>,
    ) -> Self {
        if let Some(url) = source_url {
            self.source_url = url;
        }
        if let Some(rev) = revision {
            self.revision = rev;
        }
        if let Some(id) = identity {
            self.identity = Some(id);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
