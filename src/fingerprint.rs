//! Stable diagnostic identities and the hidden meta marker that carries them
//!
//! A fingerprint is derived from the parts of a diagnostic that survive a
//! rebase: tool, path, message, severity, rule code and suggestion texts.
//! Line and column numbers are left out on purpose so a finding that moves a
//! few lines between pushes keeps its identity.
//!
//! The marker is an HTML comment appended to every posted body. GitLab does
//! not render it, but it comes back verbatim when the discussions are listed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::diagnostic::Diagnostic;

const MARKER_PREFIX: &str = "<!-- __lintkeeper__:";
const MARKER_SUFFIX: &str = " -->";

/// Digest bytes kept in a fingerprint (16 hex characters).
const FINGERPRINT_BYTES: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("diagnostic has no location path")]
    MissingPath,
    #[error("diagnostic in {0} has an empty message")]
    MissingMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Fingerprint {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of `diagnostic` as reported by `tool_name`.
pub fn fingerprint(
    diagnostic: &Diagnostic,
    tool_name: &str,
) -> Result<Fingerprint, FingerprintError> {
    let path = diagnostic.location.path.as_str();
    if path.trim().is_empty() {
        return Err(FingerprintError::MissingPath);
    }
    if diagnostic.message.trim().is_empty() {
        return Err(FingerprintError::MissingMessage(path.to_string()));
    }

    let mut hasher = Sha256::new();
    write_field(&mut hasher, tool_name);
    write_field(&mut hasher, path);
    write_field(&mut hasher, &diagnostic.message);
    write_field(&mut hasher, diagnostic.severity.as_str());
    write_field(
        &mut hasher,
        diagnostic
            .code
            .as_ref()
            .map(|code| code.value.as_str())
            .unwrap_or(""),
    );
    hasher.update((diagnostic.suggestions.len() as u64).to_le_bytes());
    for suggestion in &diagnostic.suggestions {
        write_field(&mut hasher, &suggestion.text);
    }

    let digest = hasher.finalize();
    Ok(Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES])))
}

// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn write_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Identity decoded from a posted comment body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaMarker {
    pub fingerprint: Fingerprint,
    pub source_name: String,
}

/// Build the hidden marker line for a comment body.
pub fn encode_marker(fingerprint: &Fingerprint, tool_name: &str) -> String {
    let payload = serde_json::json!({
        "fingerprint": fingerprint.as_str(),
        "source_name": tool_name,
    })
    .to_string();
    format!("{}{}{}", MARKER_PREFIX, STANDARD.encode(payload), MARKER_SUFFIX)
}

/// Extract the marker from a posted body.
///
/// Returns `None` when the body carries no marker or only malformed ones;
/// callers then fall back to comparing the literal body text.
pub fn decode_marker(body: &str) -> Option<MetaMarker> {
    body.lines().rev().find_map(|line| {
        let payload = line
            .trim()
            .strip_prefix(MARKER_PREFIX)?
            .strip_suffix(MARKER_SUFFIX)?;
        let bytes = STANDARD.decode(payload.trim()).ok()?;
        let marker: MetaMarker = serde_json::from_slice(&bytes).ok()?;
        (!marker.fingerprint.is_empty()).then_some(marker)
    })
}
