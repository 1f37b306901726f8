//! State discovery.
//!
//! `discover` is read-only and safe to call repeatedly: it inspects the
//! local credential, probes the host, and reports what it finds as a
//! `StateSnapshot`. Remote facts are gathered by one uploaded script that
//! prints `key=value` lines and always exits 0; any field the script could
//! not determine is simply missing from the output and stays `Unknown` in
//! the snapshot. A transport failure marks the host unreachable and leaves
//! every remote field unknown — discovery never aborts, and never retries.

use crate::channel::Channel;
use crate::config::DesiredState;
use crate::host::{probe_credential, CredentialState, Host, Reachability};
use crate::paths::{self, shell_quote};
use crate::secrets::{SecretsState, SENTINEL};
use crate::supervisor::UnitState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// A fact that an individual probe may have failed to establish.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Probe<T> {
    Known(T),
    /// Serializes as `null`.
    Unknown,
}

impl<T> Probe<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Probe::Known(v) => Some(v),
            Probe::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Probe::Unknown)
    }
}

// ---------------------------------------------------------------------------
// Snapshot fields
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentProbe {
    Absent,
    Present { revision: String, dirty: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepsProbe {
    pub venv_present: bool,
    /// Fingerprint recorded by the last dependency build, if any.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecretsProbe {
    pub state: SecretsState,
    /// Key names only — values never leave the host.
    pub key_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitProbe {
    pub registered: bool,
    pub enabled: bool,
    pub state: UnitState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub host: String,
    pub taken_at: DateTime<Utc>,
    /// Key file the credential probe looked at.
    pub identity: PathBuf,
    pub credential: CredentialState,
    pub reachability: Reachability,
    pub deployment: Probe<DeploymentProbe>,
    pub dependencies: Probe<DepsProbe>,
    pub secrets: Probe<SecretsProbe>,
    pub unit: Probe<UnitProbe>,
}

impl StateSnapshot {
    pub fn unknown(host: &str, identity: &Path, credential: CredentialState) -> Self {
        Self {
            host: host.to_string(),
            taken_at: Utc::now(),
            identity: identity.to_path_buf(),
            credential,
            reachability: Reachability::Unknown,
            deployment: Probe::Unknown,
            dependencies: Probe::Unknown,
            secrets: Probe::Unknown,
            unit: Probe::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// discover
// ---------------------------------------------------------------------------

pub fn discover(host: &Host, desired: &DesiredState, channel: &dyn Channel) -> StateSnapshot {
    let credential = probe_credential(&host.identity);
    let mut snap = StateSnapshot::unknown(&host.address, &host.identity, credential);

    // Without a usable key the transport cannot authenticate; skip the
    // remote probes instead of reporting a misleading "unreachable".
    if credential == CredentialState::Missing {
        return snap;
    }

    match channel.run_script(&probe_script(desired)) {
        Err(e) => {
            debug!(host = %host.address, error = %e, "reachability probe failed");
            snap.reachability = Reachability::Unreachable;
        }
        Ok(out) => {
            snap.reachability = Reachability::Reachable;
            parse_probe_output(&out.stdout, &mut snap);
        }
    }
    snap
}

/// The single remote probe. Prints `key=value` lines and exits 0 even when
/// individual facts are missing, so one bad probe never hides the others.
fn probe_script(desired: &DesiredState) -> String {
    let root = shell_quote(&desired.deploy_root);
    let unit_file = shell_quote(&paths::unit_file(&desired.service_name));
    let name = shell_quote(&desired.service_name);
    format!(
        "root={root}\n\
         if [ -d \"$root/.git\" ]; then\n\
         echo deployment=present\n\
         echo \"revision=$(git -C \"$root\" rev-parse HEAD 2>/dev/null || echo unknown)\"\n\
         if [ -n \"$(git -C \"$root\" status --porcelain 2>/dev/null)\" ]; then echo dirty=1; else echo dirty=0; fi\n\
         else\n\
         echo deployment=absent\n\
         fi\n\
         if [ -x \"$root/{venv}/bin/python\" ]; then echo venv=present; else echo venv=absent; fi\n\
         if [ -f \"$root/{fp}\" ]; then echo \"fingerprint=$(cat \"$root/{fp}\")\"; fi\n\
         if [ -f \"$root/{env}\" ]; then\n\
         if grep -q {sentinel} \"$root/{env}\"; then echo secrets=placeholder; else echo secrets=configured; fi\n\
         echo \"secret_keys=$(sed -n 's/^\\([A-Za-z_][A-Za-z0-9_]*\\)=.*/\\1/p' \"$root/{env}\" | paste -sd, -)\"\n\
         else\n\
         echo secrets=missing\n\
         fi\n\
         if [ -f {unit_file} ]; then echo unit=registered; else echo unit=absent; fi\n\
         enabled=\"$(systemctl is-enabled {name} 2>/dev/null)\" || true\n\
         echo \"unit_enabled=${{enabled:-unknown}}\"\n\
         state=\"$(systemctl is-active {name} 2>/dev/null)\" || true\n\
         echo \"unit_state=${{state:-unknown}}\"\n\
         exit 0\n",
        venv = paths::VENV_DIR,
        fp = paths::FINGERPRINT_FILE,
        env = paths::ENV_FILE,
        sentinel = SENTINEL,
    )
}

pub(crate) fn parse_probe_output(stdout: &str, snap: &mut StateSnapshot) {
    let get = |wanted: &str| -> Option<String> {
        stdout.lines().find_map(|l| {
            l.trim()
                .strip_prefix(wanted)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|v| v.to_string())
        })
    };

    match get("deployment").as_deref() {
        Some("present") => {
            let revision = get("revision").unwrap_or_else(|| "unknown".into());
            let dirty = get("dirty").as_deref() == Some("1");
            snap.deployment = Probe::Known(DeploymentProbe::Present { revision, dirty });
        }
        Some("absent") => snap.deployment = Probe::Known(DeploymentProbe::Absent),
        _ => {}
    }

    if let Some(venv) = get("venv") {
        snap.dependencies = Probe::Known(DepsProbe {
            venv_present: venv == "present",
            fingerprint: get("fingerprint").filter(|f| !f.is_empty()),
        });
    }

    if let Some(state) = get("secrets") {
        let state = match state.as_str() {
            "placeholder" => SecretsState::Placeholder,
            "configured" => SecretsState::Configured,
            _ => SecretsState::Missing,
        };
        let key_names = get("secret_keys")
            .map(|keys| {
                keys.split(',')
                    .filter(|k| !k.is_empty())
                    .map(|k| k.to_string())
                    .collect()
            })
            .unwrap_or_default();
        snap.secrets = Probe::Known(SecretsProbe { state, key_names });
    }

    if let Some(unit) = get("unit") {
        let registered = unit == "registered";
        let enabled = get("unit_enabled").as_deref() == Some("enabled");
        let word = get("unit_state").unwrap_or_else(|| "unknown".into());
        snap.unit = Probe::Known(UnitProbe {
            registered,
            enabled,
            state: UnitState::from_systemctl(&word, registered),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ExecOutput;
    use crate::testutil::ScriptedChannel;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn converged_probe_output() -> &'static str {
        "deployment=present\n\
         revision=7d9f2c1a\n\
         dirty=0\n\
         venv=present\n\
         fingerprint=abc123\n\
         secrets=configured\n\
         secret_keys=TELEGRAM_BOT_TOKEN,OPENAI_API_KEY\n\
         unit=registered\n\
         unit_enabled=enabled\n\
         unit_state=active\n"
    }

    #[test]
    fn parse_converged_host() {
        let mut snap = StateSnapshot::unknown("h", Path::new("/k"), CredentialState::Present);
        parse_probe_output(converged_probe_output(), &mut snap);

        assert_eq!(
            snap.deployment,
            Probe::Known(DeploymentProbe::Present {
                revision: "7d9f2c1a".into(),
                dirty: false
            })
        );
        let deps = snap.dependencies.known().unwrap();
        assert!(deps.venv_present);
        assert_eq!(deps.fingerprint.as_deref(), Some("abc123"));
        let secrets = snap.secrets.known().unwrap();
        assert_eq!(secrets.state, SecretsState::Configured);
        assert_eq!(secrets.key_names.len(), 2);
        let unit = snap.unit.known().unwrap();
        assert!(unit.registered && unit.enabled);
        assert_eq!(unit.state, UnitState::Active);
    }

    #[test]
    fn parse_fresh_host() {
        let mut snap = StateSnapshot::unknown("h", Path::new("/k"), CredentialState::Present);
        parse_probe_output(
            "deployment=absent\nvenv=absent\nsecrets=missing\nunit=absent\n\
             unit_enabled=unknown\nunit_state=unknown\n",
            &mut snap,
        );
        assert_eq!(snap.deployment, Probe::Known(DeploymentProbe::Absent));
        assert!(!snap.dependencies.known().unwrap().venv_present);
        assert_eq!(
            snap.secrets.known().unwrap().state,
            SecretsState::Missing
        );
        assert_eq!(snap.unit.known().unwrap().state, UnitState::Absent);
    }

    #[test]
    fn parse_partial_output_leaves_rest_unknown() {
        let mut snap = StateSnapshot::unknown("h", Path::new("/k"), CredentialState::Present);
        parse_probe_output("deployment=absent\n", &mut snap);
        assert_eq!(snap.deployment, Probe::Known(DeploymentProbe::Absent));
        assert!(snap.dependencies.is_unknown());
        assert!(snap.secrets.is_unknown());
        assert!(snap.unit.is_unknown());
    }

    #[test]
    fn parse_dirty_tree() {
        let mut snap = StateSnapshot::unknown("h", Path::new("/k"), CredentialState::Present);
        parse_probe_output("deployment=present\nrevision=abc\ndirty=1\n", &mut snap);
        assert_eq!(
            snap.deployment,
            Probe::Known(DeploymentProbe::Present {
                revision: "abc".into(),
                dirty: true
            })
        );
    }

    #[cfg(unix)]
    fn host_with_key(dir: &TempDir) -> Host {
        use std::os::unix::fs::PermissionsExt;
        let key = dir.path().join("id_ed25519");
        std::fs::write(&key, b"key").unwrap();
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).unwrap();
        Host::new("bot.example.com", "ubuntu", key)
    }

    #[cfg(unix)]
    #[test]
    fn discover_unreachable_host_keeps_fields_unknown() {
        let dir = TempDir::new().unwrap();
        let host = host_with_key(&dir);
        let ch = ScriptedChannel::new().on("exit 0", ExecOutput::failed(255, "timed out"));
        let snap = discover(&host, &DesiredState::default(), &ch);
        assert_eq!(snap.credential, CredentialState::Present);
        assert_eq!(snap.reachability, Reachability::Unreachable);
        assert!(snap.deployment.is_unknown());
        assert!(snap.unit.is_unknown());
    }

    #[cfg(unix)]
    #[test]
    fn discover_reachable_host_parses_fields() {
        let dir = TempDir::new().unwrap();
        let host = host_with_key(&dir);
        let ch = ScriptedChannel::new().on("exit 0", ExecOutput::ok(converged_probe_output()));
        let snap = discover(&host, &DesiredState::default(), &ch);
        assert_eq!(snap.reachability, Reachability::Reachable);
        assert_eq!(snap.unit.known().unwrap().state, UnitState::Active);
    }

    #[test]
    fn discover_without_credential_makes_no_remote_calls() {
        let host = Host::new("bot.example.com", "ubuntu", PathBuf::from("/no/such/key"));
        let ch = ScriptedChannel::new();
        let snap = discover(&host, &DesiredState::default(), &ch);
        assert_eq!(snap.credential, CredentialState::Missing);
        assert_eq!(snap.reachability, Reachability::Unknown);
        assert_eq!(ch.call_count(), 0);
    }

    #[test]
    fn probe_script_mentions_every_fact() {
        let script = probe_script(&DesiredState::default());
        for needle in [
            "deployment=",
            "revision=",
            "dirty=",
            "venv=",
            "fingerprint=",
            "secrets=",
            "unit=",
            "unit_enabled=",
            "unit_state=",
            "exit 0",
        ] {
            assert!(script.contains(needle), "probe script missing {needle}");
        }
        assert!(script.contains("'/opt/chatbot'"));
    }
}
