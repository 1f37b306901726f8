use berth_core::converge::ConvergenceReport;
use berth_core::discovery::{DeploymentProbe, Probe, StateSnapshot};
use berth_core::host::CredentialState;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    // Print header
    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  "));

    // Print separator
    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    // Print rows
    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  "));
    }
}

/// Step-by-step table (or JSON) of a convergence run.
pub fn render_report(report: &ConvergenceReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    let rows = report
        .steps
        .iter()
        .map(|s| {
            vec![
                s.id.to_string(),
                s.status.as_str().to_string(),
                s.detail.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["STEP", "STATUS", "DETAIL"], rows);
    Ok(())
}

/// Human-readable snapshot, one line per probed fact.
pub fn render_snapshot(snap: &StateSnapshot) {
    println!("host:          {}", snap.host);
    let credential = match snap.credential {
        CredentialState::Present => "present".to_string(),
        CredentialState::Missing => "missing".to_string(),
        CredentialState::LaxPermissions => "lax permissions (chmod 600)".to_string(),
    };
    println!(
        "credential:    {credential} ({})",
        snap.identity.display()
    );
    println!("reachability:  {}", snap.reachability.as_str());

    let deployment = match &snap.deployment {
        Probe::Known(DeploymentProbe::Present { revision, dirty }) => {
            let tree = if *dirty { "dirty" } else { "clean" };
            format!("present at {revision} ({tree})")
        }
        Probe::Known(DeploymentProbe::Absent) => "absent".to_string(),
        Probe::Unknown => "unknown".to_string(),
    };
    println!("deployment:    {deployment}");

    let deps = match &snap.dependencies {
        Probe::Known(d) if d.venv_present => match &d.fingerprint {
            Some(fp) => format!("built (fingerprint {fp})"),
            None => "built (no recorded fingerprint)".to_string(),
        },
        Probe::Known(_) => "not built".to_string(),
        Probe::Unknown => "unknown".to_string(),
    };
    println!("dependencies:  {deps}");

    let secrets = match &snap.secrets {
        Probe::Known(s) => {
            let mut text = if s.key_names.is_empty() {
                s.state.as_str().to_string()
            } else {
                format!("{} ({})", s.state.as_str(), s.key_names.join(", "))
            };
            let missing = berth_core::secrets::missing_required(&s.key_names);
            if s.state.is_present() && !missing.is_empty() {
                text.push_str(&format!(" — missing {}", missing.join(", ")));
            }
            text
        }
        Probe::Unknown => "unknown".to_string(),
    };
    println!("secrets:       {secrets}");

    let unit = match &snap.unit {
        Probe::Known(u) => {
            let enabled = if u.enabled { "enabled" } else { "disabled" };
            if u.registered {
                format!("{} (registered, {enabled})", u.state)
            } else {
                u.state.to_string()
            }
        }
        Probe::Unknown => "unknown".to_string(),
    };
    println!("service:       {unit}");
}
