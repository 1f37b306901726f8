//! Convergence engine.
//!
//! Executes an ordered, idempotent step list that closes the gap between a
//! discovered snapshot and the desired state. Every step is a no-op when
//! the host already satisfies it; the engine halts at the first hard
//! failure and returns the partial report, so a fixed-up re-invocation
//! picks up where the last run stopped without repeating earlier effects.
//!
//! Two runs against the same host at the same time are unsupported: the
//! steps are individually idempotent but nothing arbitrates between
//! interleaved writers.

use crate::channel::{Channel, ExecOutput};
use crate::config::DesiredState;
use crate::discovery::{DeploymentProbe, StateSnapshot};
use crate::error::{BerthError, Result};
use crate::host::{CredentialState, Reachability};
use crate::paths::{self, shell_quote};
use crate::secrets;
use crate::supervisor::{ServiceUnit, Supervisor};
use serde::{Serialize, Serializer};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Proof that the operator resolved the go/no-go decision before the engine
/// was invoked. Constructed explicitly by the caller — the engine never
/// prompts.
#[derive(Debug, Clone, Copy)]
pub struct Confirmation(());

impl Confirmation {
    pub fn confirmed() -> Self {
        Self(())
    }
}

// ---------------------------------------------------------------------------
// Steps and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    Credential,
    Reachability,
    SyncSource,
    SyncDeps,
    EnsureSecrets,
    RegisterUnit,
    StartUnit,
    RestartUnit,
}

impl StepId {
    pub fn as_str(self) -> &'static str {
        match self {
            StepId::Credential => "credential",
            StepId::Reachability => "reachability",
            StepId::SyncSource => "sync-source",
            StepId::SyncDeps => "sync-deps",
            StepId::EnsureSecrets => "ensure-secrets",
            StepId::RegisterUnit => "register-unit",
            StepId::StartUnit => "start-unit",
            StepId::RestartUnit => "restart-unit",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not reached — an earlier step failed first.
    Pending,
    /// Already satisfied, nothing executed.
    Skipped,
    Performed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Skipped => "skipped",
            StepStatus::Performed => "performed",
            StepStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: StepId,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of a whole run: one record per planned step, plus the error that
/// stopped it, if any. Completed, skipped, failed, and pending steps are all
/// visible so re-invocation is informed rather than blind.
#[derive(Debug, Serialize)]
pub struct ConvergenceReport {
    pub steps: Vec<StepRecord>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<BerthError>,
}

fn serialize_error<S: Serializer>(
    error: &Option<BerthError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ConvergenceReport {
    pub fn converged(&self) -> bool {
        self.error.is_none()
    }

    pub fn status_of(&self, id: StepId) -> Option<StepStatus> {
        self.steps.iter().find(|s| s.id == id).map(|s| s.status)
    }

    pub fn performed(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Performed)
            .map(|s| s.id)
            .collect()
    }
}

struct StepOutcome {
    status: StepStatus,
    detail: String,
}

impl StepOutcome {
    fn performed(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Performed,
            detail: detail.into(),
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

pub(crate) const PROVISION_PLAN: &[StepId] = &[
    StepId::Credential,
    StepId::Reachability,
    StepId::SyncSource,
    StepId::SyncDeps,
    StepId::EnsureSecrets,
    StepId::RegisterUnit,
    StepId::StartUnit,
];

/// Restricted pass for the already-provisioned case: code sync, dependency
/// sync, unit registration, then an unconditional restart.
pub(crate) const UPDATE_PLAN: &[StepId] = &[
    StepId::Credential,
    StepId::Reachability,
    StepId::SyncSource,
    StepId::SyncDeps,
    StepId::RegisterUnit,
    StepId::RestartUnit,
];

/// Full convergence: provision a host from any state.
pub fn converge(
    channel: &dyn Channel,
    snapshot: &StateSnapshot,
    desired: &DesiredState,
    _confirmation: Confirmation,
) -> ConvergenceReport {
    run_plan(channel, snapshot, desired, PROVISION_PLAN)
}

pub(crate) fn run_plan(
    channel: &dyn Channel,
    snapshot: &StateSnapshot,
    desired: &DesiredState,
    plan: &[StepId],
) -> ConvergenceReport {
    let mut steps: Vec<StepRecord> = plan
        .iter()
        .map(|id| StepRecord {
            id: *id,
            status: StepStatus::Pending,
            detail: None,
        })
        .collect();

    let mut ctx = StepCtx {
        channel,
        snapshot,
        desired,
        deps_ready: false,
        secrets_ready: false,
    };

    for (i, id) in plan.iter().enumerate() {
        match run_step(*id, &mut ctx) {
            Ok(outcome) => {
                info!(step = %id, status = ?outcome.status, detail = %outcome.detail);
                steps[i].status = outcome.status;
                steps[i].detail = Some(outcome.detail);
            }
            Err(e) => {
                steps[i].status = StepStatus::Failed;
                steps[i].detail = Some(e.to_string());
                return ConvergenceReport {
                    steps,
                    error: Some(e),
                };
            }
        }
    }

    ConvergenceReport { steps, error: None }
}

// ---------------------------------------------------------------------------
// Step context and dispatch
// ---------------------------------------------------------------------------

struct StepCtx<'a> {
    channel: &'a dyn Channel,
    snapshot: &'a StateSnapshot,
    desired: &'a DesiredState,
    /// Set once the sync-deps step has guaranteed a built environment.
    deps_ready: bool,
    /// Set once the ensure-secrets step has guaranteed presence.
    secrets_ready: bool,
}

impl StepCtx<'_> {
    /// Run a step script, surfacing remote output incrementally so long
    /// steps (clone, pip install) stay observable under RUST_LOG=debug.
    fn run_script(&self, script: &str, context: &str) -> Result<ExecOutput> {
        self.channel
            .run_script_streaming(script, &mut |kind, line| {
                debug!(stream = ?kind, "{line}");
            })?
            .require_success(context)
    }
}

fn run_step(id: StepId, ctx: &mut StepCtx) -> Result<StepOutcome> {
    match id {
        StepId::Credential => step_credential(ctx),
        StepId::Reachability => step_reachability(ctx),
        StepId::SyncSource => step_sync_source(ctx),
        StepId::SyncDeps => step_sync_deps(ctx),
        StepId::EnsureSecrets => step_ensure_secrets(ctx),
        StepId::RegisterUnit => step_register_unit(ctx),
        StepId::StartUnit => step_start_unit(ctx),
        StepId::RestartUnit => step_restart_unit(ctx),
    }
}

/// Step 1: credential material must exist locally before anything touches
/// the wire. A miss is blocking — no remote action is attempted.
fn step_credential(ctx: &mut StepCtx) -> Result<StepOutcome> {
    match ctx.snapshot.credential {
        CredentialState::Present => Ok(StepOutcome::skipped("key present")),
        CredentialState::Missing => {
            Err(BerthError::CredentialMissing(ctx.snapshot.identity.clone()))
        }
        CredentialState::LaxPermissions => Err(BerthError::CredentialPermissions(
            ctx.snapshot.identity.clone(),
        )),
    }
}

/// Step 2: the host must answer. An unreachable host is reported, never
/// silently retried — the operator re-invokes once connectivity is fixed.
fn step_reachability(ctx: &mut StepCtx) -> Result<StepOutcome> {
    match ctx.snapshot.reachability {
        Reachability::Reachable => Ok(StepOutcome::skipped("reachable")),
        Reachability::Unreachable => Err(BerthError::Transport {
            host: ctx.snapshot.host.clone(),
            message: "host unreachable; fix connectivity (security group, boot) and re-run".into(),
        }),
        Reachability::Unknown => {
            ctx.channel.run("true")?.require_success("true")?;
            Ok(StepOutcome::performed("probed reachable"))
        }
    }
}

/// Step 3: deployment root at the target revision. Clone when absent,
/// fetch-and-reset when stale; a dirty tree is the operator's to resolve.
fn step_sync_source(ctx: &mut StepCtx) -> Result<StepOutcome> {
    let probe = match ctx.snapshot.deployment.known() {
        Some(p) => p.clone(),
        None => probe_deployment(ctx)?,
    };
    match probe {
        DeploymentProbe::Present { dirty: true, .. } => Err(BerthError::DirtyWorkingTree(
            ctx.desired.deploy_root.clone(),
        )),
        DeploymentProbe::Present { .. } => {
            let script = fetch_reset_script(ctx.desired);
            let out = ctx.run_script(&script, "git fetch/reset")?;
            if out.stdout.lines().any(|l| l.trim() == "sync=updated") {
                Ok(StepOutcome::performed(format!(
                    "reset to {}",
                    ctx.desired.revision
                )))
            } else {
                Ok(StepOutcome::skipped(format!(
                    "already at {}",
                    ctx.desired.revision
                )))
            }
        }
        DeploymentProbe::Absent => {
            let script = clone_script(ctx.desired);
            ctx.run_script(&script, "git clone")?;
            Ok(StepOutcome::performed(format!(
                "cloned {} at {}",
                ctx.desired.source_url, ctx.desired.revision
            )))
        }
    }
}

/// Step 4: dependency environment synchronized to the manifest. The remote
/// script owns the fingerprint comparison so one round trip decides
/// rebuild-or-skip.
fn step_sync_deps(ctx: &mut StepCtx) -> Result<StepOutcome> {
    let script = deps_script(&ctx.desired.deploy_root);
    let out = ctx.run_script(&script, "dependency sync")?;
    ctx.deps_ready = true;
    if out.stdout.lines().any(|l| l.trim() == "deps=rebuilt") {
        Ok(StepOutcome::performed("dependencies rebuilt"))
    } else {
        Ok(StepOutcome::skipped("manifest fingerprint unchanged"))
    }
}

/// Step 5: the secret set exists. Created once as a placeholder; an existing
/// file is the operator's property and is never rewritten, malformed or not.
fn step_ensure_secrets(ctx: &mut StepCtx) -> Result<StepOutcome> {
    let script = ensure_secrets_script(&ctx.desired.deploy_root);
    let out = ctx.run_script(&script, "secret set check")?;
    ctx.secrets_ready = true;
    if out.stdout.lines().any(|l| l.trim() == "secrets=created") {
        Ok(StepOutcome::performed(
            "placeholder written; fill in real values",
        ))
    } else {
        Ok(StepOutcome::skipped("existing file left untouched"))
    }
}

/// Step 6: the unit is registered and enabled.
fn step_register_unit(ctx: &mut StepCtx) -> Result<StepOutcome> {
    let unit = ServiceUnit::from_desired(ctx.desired)?;
    let supervisor = Supervisor::new(ctx.channel);
    let installed = supervisor.register(&unit)?;
    let enabled = supervisor.enable(&unit.name)?;
    if installed || enabled {
        Ok(StepOutcome::performed(if installed {
            "unit installed and enabled"
        } else {
            "unit enabled"
        }))
    } else {
        Ok(StepOutcome::skipped("unit unchanged and enabled"))
    }
}

/// Step 7: start if the desired state says the service should run;
/// otherwise the current run state is left untouched.
fn step_start_unit(ctx: &mut StepCtx) -> Result<StepOutcome> {
    if !ctx.desired.should_run {
        return Ok(StepOutcome::skipped("desired state leaves unit as-is"));
    }
    verify_start_invariant(ctx)?;
    let supervisor = Supervisor::new(ctx.channel);
    if supervisor.start(&ctx.desired.service_name)? {
        Ok(StepOutcome::performed("started"))
    } else {
        Ok(StepOutcome::skipped("already active"))
    }
}

/// Update-flow tail: restart whether or not anything changed.
fn step_restart_unit(ctx: &mut StepCtx) -> Result<StepOutcome> {
    verify_start_invariant(ctx)?;
    Supervisor::new(ctx.channel).restart(&ctx.desired.service_name)?;
    Ok(StepOutcome::performed("restarted"))
}

/// A unit may only be started when its deployment has a built dependency
/// environment and a present secret set.
fn verify_start_invariant(ctx: &StepCtx) -> Result<()> {
    let unit = ctx.desired.service_name.clone();

    let deps_ok = ctx.deps_ready
        || ctx
            .snapshot
            .dependencies
            .known()
            .is_some_and(|d| d.venv_present);
    if !deps_ok {
        return Err(BerthError::StartPrecondition {
            unit,
            reason: "dependency environment is not built".into(),
        });
    }

    if ctx.secrets_ready {
        return Ok(());
    }
    match ctx.snapshot.secrets.known() {
        Some(probe) if probe.state.is_present() => Ok(()),
        Some(_) => Err(BerthError::StartPrecondition {
            unit,
            reason: "secret set is missing".into(),
        }),
        None => {
            let command = format!(
                "test -f {}",
                shell_quote(&paths::env_file(&ctx.desired.deploy_root))
            );
            if ctx.channel.run(&command)?.success() {
                Ok(())
            } else {
                Err(BerthError::StartPrecondition {
                    unit,
                    reason: "secret set is missing".into(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote scripts
// ---------------------------------------------------------------------------

/// Re-probe the deployment when discovery could not establish it.
fn probe_deployment(ctx: &StepCtx) -> Result<DeploymentProbe> {
    let root = shell_quote(&ctx.desired.deploy_root);
    let script = format!(
        "if [ -d {root}/.git ]; then\n\
         echo checkout=present\n\
         if [ -n \"$(git -C {root} status --porcelain 2>/dev/null)\" ]; then echo checkout_dirty=1; fi\n\
         else\n\
         echo checkout=absent\n\
         fi\n\
         exit 0\n"
    );
    let out = ctx.run_script(&script, "deployment probe")?;
    if out.stdout.lines().any(|l| l.trim() == "checkout=present") {
        Ok(DeploymentProbe::Present {
            revision: "unknown".into(),
            dirty: out
                .stdout
                .lines()
                .any(|l| l.trim() == "checkout_dirty=1"),
        })
    } else {
        Ok(DeploymentProbe::Absent)
    }
}

fn clone_script(desired: &DesiredState) -> String {
    let root = shell_quote(&desired.deploy_root);
    let url = shell_quote(&desired.source_url);
    let rev = shell_quote(&desired.revision);
    format!(
        "set -e\n\
         sudo -n mkdir -p {root}\n\
         sudo -n chown \"$(id -un):\" {root}\n\
         git clone {url} {root}\n\
         git -C {root} checkout {rev}\n"
    )
}

fn fetch_reset_script(desired: &DesiredState) -> String {
    let root = shell_quote(&desired.deploy_root);
    let rev = shell_quote(&desired.revision);
    format!(
        "set -e\n\
         cd {root}\n\
         git fetch --tags origin {rev}\n\
         if [ \"$(git rev-parse HEAD)\" = \"$(git rev-parse FETCH_HEAD)\" ]; then\n\
         echo sync=uptodate\n\
         else\n\
         git reset --hard FETCH_HEAD\n\
         echo sync=updated\n\
         fi\n"
    )
}

fn deps_script(deploy_root: &str) -> String {
    let root = shell_quote(deploy_root);
    format!(
        "set -e\n\
         cd {root}\n\
         current=\"$(sha256sum {req} | cut -d' ' -f1)\"\n\
         recorded=\"\"\n\
         [ -f {fp} ] && recorded=\"$(cat {fp})\"\n\
         if [ -x {venv}/bin/python ] && [ \"$current\" = \"$recorded\" ]; then\n\
         echo deps=unchanged\n\
         else\n\
         python3 -m venv {venv}\n\
         {venv}/bin/pip install --quiet --upgrade pip\n\
         {venv}/bin/pip install --quiet -r {req}\n\
         printf '%s\\n' \"$current\" > {fp}\n\
         echo deps=rebuilt\n\
         fi\n",
        req = paths::REQUIREMENTS_FILE,
        fp = paths::FINGERPRINT_FILE,
        venv = paths::VENV_DIR,
    )
}

fn ensure_secrets_script(deploy_root: &str) -> String {
    let root = shell_quote(deploy_root);
    format!(
        "set -e\n\
         cd {root}\n\
         if [ -f {env} ]; then\n\
         echo secrets=kept\n\
         else\n\
         umask 077\n\
         cat > {env} <<'BERTH_ENV'\n\
         {placeholder}BERTH_ENV\n\
         echo secrets=created\n\
         fi\n",
        env = paths::ENV_FILE,
        placeholder = secrets::placeholder(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ExecOutput;
    use crate::discovery::{DepsProbe, Probe, SecretsProbe, UnitProbe};
    use crate::error::ErrorKind;
    use crate::secrets::SecretsState;
    use crate::supervisor::UnitState;
    use crate::testutil::ScriptedChannel;
    use std::path::Path;

    fn desired() -> DesiredState {
        DesiredState::default()
    }

    fn base_snapshot(credential: CredentialState) -> StateSnapshot {
        StateSnapshot::unknown("bot.example.com", Path::new("/keys/id_ed25519"), credential)
    }

    fn fresh_snapshot() -> StateSnapshot {
        let mut snap = base_snapshot(CredentialState::Present);
        snap.reachability = Reachability::Reachable;
        snap.deployment = Probe::Known(DeploymentProbe::Absent);
        snap.dependencies = Probe::Known(DepsProbe {
            venv_present: false,
            fingerprint: None,
        });
        snap.secrets = Probe::Known(SecretsProbe {
            state: SecretsState::Missing,
            key_names: vec![],
        });
        snap.unit = Probe::Known(UnitProbe {
            registered: false,
            enabled: false,
            state: UnitState::Absent,
        });
        snap
    }

    fn converged_snapshot() -> StateSnapshot {
        let mut snap = base_snapshot(CredentialState::Present);
        snap.reachability = Reachability::Reachable;
        snap.deployment = Probe::Known(DeploymentProbe::Present {
            revision: "7d9f2c1a".into(),
            dirty: false,
        });
        snap.dependencies = Probe::Known(DepsProbe {
            venv_present: true,
            fingerprint: Some("abc123".into()),
        });
        snap.secrets = Probe::Known(SecretsProbe {
            state: SecretsState::Configured,
            key_names: vec!["TELEGRAM_BOT_TOKEN".into(), "OPENAI_API_KEY".into()],
        });
        snap.unit = Probe::Known(UnitProbe {
            registered: true,
            enabled: true,
            state: UnitState::Active,
        });
        snap
    }

    fn fresh_host_channel() -> ScriptedChannel {
        ScriptedChannel::new()
            .on("git clone", ExecOutput::ok(""))
            .on("sha256sum", ExecOutput::ok("deps=rebuilt\n"))
            .on("BERTH_ENV", ExecOutput::ok("secrets=created\n"))
            .on("daemon-reload", ExecOutput::ok("installed\n"))
            .on(
                "systemctl enable",
                ExecOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: "Created symlink chatbot.service".into(),
                },
            )
            .on_seq(
                "is-active",
                vec![
                    ExecOutput::ok("registered\nstate=inactive\n"),
                    ExecOutput::ok("registered\nstate=active\n"),
                ],
            )
            .on("systemctl start", ExecOutput::ok(""))
    }

    fn converged_host_channel() -> ScriptedChannel {
        ScriptedChannel::new()
            .on("git fetch", ExecOutput::ok("sync=uptodate\n"))
            .on("sha256sum", ExecOutput::ok("deps=unchanged\n"))
            .on("BERTH_ENV", ExecOutput::ok("secrets=kept\n"))
            .on("daemon-reload", ExecOutput::ok("unchanged\n"))
            .on("systemctl enable", ExecOutput::ok(""))
            .on("is-active", ExecOutput::ok("registered\nstate=active\n"))
    }

    // -- §8 scenario: fresh host ------------------------------------------

    #[test]
    fn fresh_host_provision_performs_every_mutating_step() {
        let ch = fresh_host_channel();
        let report = converge(&ch, &fresh_snapshot(), &desired(), Confirmation::confirmed());

        assert!(report.converged(), "error: {:?}", report.error);
        assert_eq!(
            report.performed(),
            vec![
                StepId::SyncSource,
                StepId::SyncDeps,
                StepId::EnsureSecrets,
                StepId::RegisterUnit,
                StepId::StartUnit,
            ]
        );
        assert_eq!(report.status_of(StepId::Credential), Some(StepStatus::Skipped));
        assert_eq!(
            report.status_of(StepId::Reachability),
            Some(StepStatus::Skipped)
        );
    }

    // -- Idempotence ------------------------------------------------------

    #[test]
    fn second_provision_run_is_all_noops() {
        let ch = converged_host_channel();
        let report = converge(
            &ch,
            &converged_snapshot(),
            &desired(),
            Confirmation::confirmed(),
        );

        assert!(report.converged());
        assert!(report.performed().is_empty(), "{:?}", report.steps);
        assert!(
            !ch.calls().iter().any(|c| c.contains("git clone")),
            "must not re-clone an existing checkout"
        );
        assert!(!ch.calls().iter().any(|c| c.contains("systemctl start")));
    }

    // -- Resumability -----------------------------------------------------

    #[test]
    fn resumed_run_does_not_repeat_completed_steps() {
        // Interrupted after the clone: checkout exists, nothing else does.
        let mut snap = fresh_snapshot();
        snap.deployment = Probe::Known(DeploymentProbe::Present {
            revision: "7d9f2c1a".into(),
            dirty: false,
        });

        let ch = fresh_host_channel().on("git fetch", ExecOutput::ok("sync=uptodate\n"));
        let report = converge(&ch, &snap, &desired(), Confirmation::confirmed());

        assert!(report.converged(), "error: {:?}", report.error);
        assert!(
            !ch.calls().iter().any(|c| c.contains("git clone")),
            "resume must not re-clone"
        );
        assert_eq!(
            report.status_of(StepId::SyncSource),
            Some(StepStatus::Skipped)
        );
        assert_eq!(
            report.status_of(StepId::SyncDeps),
            Some(StepStatus::Performed)
        );
    }

    // -- Precondition gating ----------------------------------------------

    #[test]
    fn missing_credential_attempts_zero_remote_calls() {
        let ch = ScriptedChannel::new();
        let report = converge(
            &ch,
            &base_snapshot(CredentialState::Missing),
            &desired(),
            Confirmation::confirmed(),
        );

        assert_eq!(ch.call_count(), 0);
        let err = report.error.as_ref().unwrap();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(report.status_of(StepId::Credential), Some(StepStatus::Failed));
        assert_eq!(
            report.status_of(StepId::SyncSource),
            Some(StepStatus::Pending)
        );
    }

    #[test]
    fn lax_key_permissions_block_like_a_missing_key() {
        let ch = ScriptedChannel::new();
        let report = converge(
            &ch,
            &base_snapshot(CredentialState::LaxPermissions),
            &desired(),
            Confirmation::confirmed(),
        );
        assert_eq!(ch.call_count(), 0);
        assert_eq!(
            report.error.as_ref().unwrap().kind(),
            ErrorKind::Precondition
        );
    }

    // -- §8 scenario: unreachable host ------------------------------------

    #[test]
    fn unreachable_host_fails_at_reachability_with_no_remote_steps() {
        let mut snap = base_snapshot(CredentialState::Present);
        snap.reachability = Reachability::Unreachable;

        let ch = ScriptedChannel::new();
        let report = converge(&ch, &snap, &desired(), Confirmation::confirmed());

        assert_eq!(ch.call_count(), 0);
        assert_eq!(report.error.as_ref().unwrap().kind(), ErrorKind::Transport);
        assert_eq!(
            report.status_of(StepId::Reachability),
            Some(StepStatus::Failed)
        );
        assert_eq!(
            report.status_of(StepId::SyncSource),
            Some(StepStatus::Pending)
        );
    }

    #[test]
    fn unknown_reachability_is_probed_once() {
        let mut snap = converged_snapshot();
        snap.reachability = Reachability::Unknown;
        let ch = converged_host_channel().on("true", ExecOutput::ok(""));
        let report = converge(&ch, &snap, &desired(), Confirmation::confirmed());
        assert!(report.converged());
        assert_eq!(
            report.status_of(StepId::Reachability),
            Some(StepStatus::Performed)
        );
    }

    // -- Dirty working tree -----------------------------------------------

    #[test]
    fn dirty_tree_is_reported_not_resolved() {
        let mut snap = converged_snapshot();
        snap.deployment = Probe::Known(DeploymentProbe::Present {
            revision: "7d9f2c1a".into(),
            dirty: true,
        });

        let ch = converged_host_channel();
        let report = converge(&ch, &snap, &desired(), Confirmation::confirmed());

        let err = report.error.as_ref().unwrap();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(err.to_string().contains("local modifications"));
        assert!(
            !ch.calls().iter().any(|c| c.contains("reset --hard")),
            "a dirty tree must never be reset"
        );
        assert_eq!(
            report.status_of(StepId::SyncSource),
            Some(StepStatus::Failed)
        );
    }

    // -- Hard remote failure halts with partial progress -------------------

    #[test]
    fn remote_failure_preserves_partial_progress() {
        let ch = ScriptedChannel::new()
            .on("git clone", ExecOutput::ok(""))
            .on(
                "sha256sum",
                ExecOutput::failed(1, "pip: no matching distribution"),
            );
        let report = converge(&ch, &fresh_snapshot(), &desired(), Confirmation::confirmed());

        assert_eq!(
            report.error.as_ref().unwrap().kind(),
            ErrorKind::RemoteCommand
        );
        assert_eq!(
            report.status_of(StepId::SyncSource),
            Some(StepStatus::Performed)
        );
        assert_eq!(report.status_of(StepId::SyncDeps), Some(StepStatus::Failed));
        assert_eq!(
            report.status_of(StepId::EnsureSecrets),
            Some(StepStatus::Pending)
        );
    }

    // -- Desired "not running" leaves run state untouched -------------------

    #[test]
    fn should_run_false_never_issues_a_start() {
        let mut d = desired();
        d.should_run = false;
        let mut snap = converged_snapshot();
        snap.unit = Probe::Known(UnitProbe {
            registered: true,
            enabled: true,
            state: UnitState::Inactive,
        });

        let ch = converged_host_channel();
        let report = converge(&ch, &snap, &d, Confirmation::confirmed());

        assert!(report.converged());
        assert_eq!(report.status_of(StepId::StartUnit), Some(StepStatus::Skipped));
        assert!(!ch.calls().iter().any(|c| c.contains("systemctl start")));
    }

    // -- Start invariant ---------------------------------------------------

    #[test]
    fn restart_is_refused_without_secrets() {
        // The provision plan guarantees secrets via its own step; the update
        // plan has no ensure-secrets step, so the invariant falls back to
        // the snapshot.
        let mut snap = converged_snapshot();
        snap.secrets = Probe::Known(SecretsProbe {
            state: SecretsState::Missing,
            key_names: vec![],
        });
        let ch = converged_host_channel();
        let report = run_plan(&ch, &snap, &desired(), UPDATE_PLAN);
        let err = report.error.as_ref().unwrap();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(err.to_string().contains("secret set"));
        assert!(!ch.calls().iter().any(|c| c.contains("systemctl restart")));
    }

    #[test]
    fn unknown_secrets_are_checked_remotely_before_start() {
        let mut snap = converged_snapshot();
        snap.secrets = Probe::Unknown;
        let ch = converged_host_channel().on("test -f", ExecOutput::ok(""));
        let report = run_plan(&ch, &snap, &desired(), UPDATE_PLAN);
        assert!(report.converged(), "error: {:?}", report.error);
        assert!(ch.calls().iter().any(|c| c.contains("test -f")));
    }

    // -- Script content ----------------------------------------------------

    #[test]
    fn secrets_script_guards_the_existing_file() {
        let script = ensure_secrets_script("/opt/chatbot");
        let guard = script.find("if [ -f .env ]").expect("guard missing");
        let write = script.find("cat > .env").expect("write missing");
        assert!(guard < write, "presence check must precede the write");
        assert!(script.contains("umask 077"));
        assert!(script.contains("TELEGRAM_BOT_TOKEN=__REPLACE_ME__"));
    }

    #[test]
    fn scripts_quote_operator_controlled_values() {
        let mut d = desired();
        d.revision = "v1; rm -rf /".into();
        d.deploy_root = "/opt/chat bot".into();
        let clone = clone_script(&d);
        assert!(clone.contains("'/opt/chat bot'"));
        assert!(clone.contains("'v1; rm -rf /'"));
        let fetch = fetch_reset_script(&d);
        assert!(fetch.contains("'v1; rm -rf /'"));
    }

    #[test]
    fn report_serializes_error_as_message() {
        let ch = ScriptedChannel::new();
        let report = converge(
            &ch,
            &base_snapshot(CredentialState::Missing),
            &desired(),
            Confirmation::confirmed(),
        );
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["error"].as_str().unwrap().contains("credential"));
        assert_eq!(json["steps"][0]["id"], "credential");
        assert_eq!(json["steps"][0]["status"], "failed");
    }
}
