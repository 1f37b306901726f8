pub mod logs;
pub mod provision;
pub mod status;
pub mod update;

use berth_core::channel::SshChannel;
use berth_core::config::DesiredState;
use berth_core::converge::Confirmation;
use berth_core::host::Host;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a subcommand needs: the resolved desired state, the target
/// host, and a bound transport.
pub struct Session {
    pub desired: DesiredState,
    pub host: Host,
    pub channel: SshChannel,
}

pub fn open(
    host_arg: Option<&str>,
    source: Option<String>,
    revision: Option<String>,
    identity: Option<PathBuf>,
) -> anyhow::Result<Session> {
    let cwd = std::env::current_dir()?;
    let desired = DesiredState::load(&cwd)?.with_overrides(source, revision, identity);
    let host = Host::resolve(host_arg, &desired)?;
    let channel = SshChannel::new(&host, Duration::from_secs(desired.connect_timeout_secs))?;
    Ok(Session {
        desired,
        host,
        channel,
    })
}

/// Resolve the operator decision point before the engine is invoked:
/// `--yes` settles it up front, otherwise ask on the terminal.
pub fn confirm(yes: bool, prompt: &str) -> anyhow::Result<Confirmation> {
    if yes {
        return Ok(Confirmation::confirmed());
    }
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    match line.trim() {
        "y" | "Y" | "yes" => Ok(Confirmation::confirmed()),
        _ => anyhow::bail!("aborted by operator"),
    }
}
