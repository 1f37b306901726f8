use super::Session;
use crate::output;
use berth_core::{discovery, update};

/// `berth update` — restricted convergence for a provisioned host: sync
/// code and dependencies, ensure the unit is registered, restart.
pub fn run(session: &Session, yes: bool, json: bool) -> anyhow::Result<()> {
    let confirmation = super::confirm(
        yes,
        &format!(
            "Update {} to {} and restart {}?",
            session.host.address, session.desired.revision, session.desired.service_name
        ),
    )?;

    let snapshot = discovery::discover(&session.host, &session.desired, &session.channel);
    let report = update::update(&session.channel, &snapshot, &session.desired, confirmation);

    output::render_report(&report, json)?;
    match report.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
