//! Secret set handling.
//!
//! The secret set is a line-oriented `KEY=VALUE` file at `<root>/.env`,
//! mode 0600, owned by the operator. Convergence guarantees *presence* only:
//! it writes the placeholder below exactly once and never touches the file
//! again, malformed or not. Values never leave the host — discovery reports
//! key names only.

use serde::Serialize;

/// Sentinel value written into the placeholder. Discovery greps for it to
/// tell an untouched placeholder from an operator-configured file.
pub const SENTINEL: &str = "__REPLACE_ME__";

/// Variables the bot refuses to boot without.
pub const REQUIRED_KEYS: &[&str] = &["TELEGRAM_BOT_TOKEN", "OPENAI_API_KEY"];

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsState {
    Missing,
    /// File exists but still carries sentinel values.
    Placeholder,
    /// File exists with operator-provided values.
    Configured,
}

impl SecretsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretsState::Missing => "missing",
            SecretsState::Placeholder => "placeholder",
            SecretsState::Configured => "configured",
        }
    }

    /// Presence is all the start invariant asks for.
    pub fn is_present(&self) -> bool {
        !matches!(self, SecretsState::Missing)
    }
}

// ---------------------------------------------------------------------------
// Placeholder template
// ---------------------------------------------------------------------------

/// Render the placeholder written on first provision.
pub fn placeholder() -> String {
    let mut out = String::from(
        "# Secrets consumed by the bot. Fill in real values, then restart the\n\
         # service. This file is created once and never overwritten.\n",
    );
    for key in REQUIRED_KEYS {
        out.push_str(key);
        out.push('=');
        out.push_str(SENTINEL);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `KEY=VALUE` content and return only the key names.
pub fn parse_key_names(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| l.split_once('=').map(|(k, _)| k.trim().to_string()))
        .collect()
}

/// Required keys absent from `keys`.
pub fn missing_required(keys: &[String]) -> Vec<&'static str> {
    REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|req| !keys.iter().any(|k| k == req))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
