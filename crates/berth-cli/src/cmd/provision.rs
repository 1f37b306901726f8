use super::Session;
use crate::output;
use berth_core::{converge, discovery};

/// `berth provision` — discover the host's state, then run the full
/// convergence plan against it.
pub fn run(session: &Session, yes: bool, json: bool) -> anyhow::Result<()> {
    let confirmation = super::confirm(
        yes,
        &format!(
            "Provision {} from {} at {}?",
            session.host.address, session.desired.source_url, session.desired.revision
        ),
    )?;

    let snapshot = discovery::discover(&session.host, &session.desired, &session.channel);
    let report = converge::converge(&session.channel, &snapshot, &session.desired, confirmation);

    output::render_report(&report, json)?;
    match report.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
