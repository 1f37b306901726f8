//! Remote deployment layout.
//!
//! Everything under the deployment root lives on the target host, so these
//! helpers build plain `String` paths rather than `PathBuf`s — they are
//! interpolated into shell commands, never opened locally.

use crate::error::{BerthError, Result};
use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

/// Secret set file, relative to the deployment root.
pub const ENV_FILE: &str = ".env";
/// Dependency manifest the fingerprint is computed over.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
/// Virtualenv directory, relative to the deployment root.
pub const VENV_DIR: &str = ".venv";
/// Recorded fingerprint of the last dependency build.
pub const FINGERPRINT_FILE: &str = ".berth-fingerprint";

pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn env_file(root: &str) -> String {
    format!("{root}/{ENV_FILE}")
}

pub fn requirements(root: &str) -> String {
    format!("{root}/{REQUIREMENTS_FILE}")
}

pub fn venv_python(root: &str) -> String {
    format!("{root}/{VENV_DIR}/bin/python")
}

pub fn venv_pip(root: &str) -> String {
    format!("{root}/{VENV_DIR}/bin/pip")
}

pub fn fingerprint_file(root: &str) -> String {
    format!("{root}/{FINGERPRINT_FILE}")
}

pub fn unit_file(service_name: &str) -> String {
    format!("{SYSTEMD_UNIT_DIR}/{service_name}.service")
}

// ---------------------------------------------------------------------------
// Shell quoting
// ---------------------------------------------------------------------------

/// Quote `s` for safe interpolation into a POSIX shell command line.
///
/// Script *bodies* travel to the host as opaque stdin blobs and never need
/// this; it exists for the short values (paths, refs, unit names) embedded
/// into those bodies.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

// ---------------------------------------------------------------------------
// Service name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Validate a systemd service name before it is embedded in unit paths and
/// `systemctl` invocations.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(BerthError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(env_file("/opt/chatbot"), "/opt/chatbot/.env");
        assert_eq!(
            venv_python("/opt/chatbot"),
            "/opt/chatbot/.venv/bin/python"
        );
        assert_eq!(
            fingerprint_file("/opt/chatbot"),
            "/opt/chatbot/.berth-fingerprint"
        );
        assert_eq!(unit_file("chatbot"), "/etc/systemd/system/chatbot.service");
    }

    #[test]
    fn quote_plain_string_is_wrapped() {
        assert_eq!(shell_quote("main"), "'main'");
        assert_eq!(shell_quote("/opt/chat bot"), "'/opt/chat bot'");
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_neutralizes_metacharacters() {
        let q = shell_quote("$(rm -rf /); `boom`");
        assert!(q.starts_with('\'') && q.ends_with('\''));
        assert!(!q.contains("''$("));
    }

    #[test]
    fn valid_service_names() {
        for name in ["chatbot", "a", "my-bot-2"] {
            validate_service_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_service_names() {
        for name in ["", "-lead", "trail-", "has space", "UPPER", "a_b"] {
            assert!(validate_service_name(name).is_err(), "expected invalid: {name}");
        }
    }
}
