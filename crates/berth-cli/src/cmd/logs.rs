use super::Session;
use berth_core::channel::StreamKind;
use berth_core::supervisor::Supervisor;

/// `berth logs` — tail the unit's journal. With `--follow` the stream runs
/// until the connection drops; re-invoke to reconnect.
pub fn run(session: &Session, lines: u32, follow: bool) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(&session.channel);
    supervisor.tail_logs(
        &session.desired.service_name,
        lines,
        follow,
        &mut |kind, line| match kind {
            StreamKind::Stdout => println!("{line}"),
            StreamKind::Stderr => eprintln!("{line}"),
        },
    )?;
    Ok(())
}
