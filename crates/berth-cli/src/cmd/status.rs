use super::Session;
use crate::output;
use berth_core::discovery;

/// `berth status` — read-only snapshot of the host. Partial discovery is
/// still a successful status run; unknown fields print as such.
pub fn run(session: &Session, json: bool) -> anyhow::Result<()> {
    let snapshot = discovery::discover(&session.host, &session.desired, &session.channel);
    if json {
        output::print_json(&snapshot)
    } else {
        output::render_snapshot(&snapshot);
        Ok(())
    }
}
