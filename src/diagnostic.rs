//! Diagnostic data handed over by analysis tools
//!
//! The shape follows the rdjson diagnostic layout many linters can emit.
//! Diff mapping happens upstream: by the time a [`Comment`] reaches this
//! crate it already knows whether it lands on a line of the current diff.

use serde::{Deserialize, Serialize};

/// 1-based line/column position. Zero means "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl Position {
    pub fn line(line: u32) -> Self {
        Self { line, column: 0 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    #[serde(default)]
    pub start: Option<Position>,
    #[serde(default)]
    pub end: Option<Position>,
}

impl Range {
    /// Range covering whole lines `start..=end`.
    pub fn lines(start: u32, end: u32) -> Self {
        Self {
            start: Some(Position::line(start)),
            end: Some(Position::line(end)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub range: Option<Range>,
}

impl Location {
    /// Start line of the location, or 0 when the tool reported none.
    pub fn start_line(&self) -> u32 {
        self.range
            .and_then(|range| range.start)
            .map(|start| start.line)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    #[serde(alias = "UNKNOWN_SEVERITY")]
    Unknown,
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "UNKNOWN",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }

    /// Emoji badge shown in front of the rendered message.
    pub fn badge(&self) -> Option<&'static str> {
        match self {
            Severity::Unknown => None,
            Severity::Error => Some("🚫"),
            Severity::Warning => Some("⚠️"),
            Severity::Info => Some("📝"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
}

/// Rule identifier, e.g. `SA4006` or `clippy::needless_return`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub value: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Replacement text for the lines covered by `range`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(default)]
    pub range: Option<Range>,
    #[serde(default)]
    pub text: String,
}

impl Suggestion {
    /// Start and end lines, if both ends of the range are present.
    pub fn line_bounds(&self) -> Option<(u32, u32)> {
        let range = self.range?;
        Some((range.start?.line, range.end?.line))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub code: Option<Code>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

/// A diagnostic together with the diff-mapping facts needed to anchor it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub diagnostic: Diagnostic,
    /// Tool that produced the finding; falls back to `diagnostic.source.name`.
    #[serde(default)]
    pub tool_name: String,
    /// Whether the start line is one of the lines changed by the merge request.
    #[serde(default)]
    pub in_diff_file: bool,
    /// Path before a rename or move, when the file was renamed.
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub old_line: Option<u32>,
}

impl Comment {
    pub fn path(&self) -> &str {
        &self.diagnostic.location.path
    }

    pub fn line(&self) -> u32 {
        self.diagnostic.location.start_line()
    }

    /// Name shown in the rendered comment.
    pub fn display_tool_name(&self) -> &str {
        if !self.tool_name.is_empty() {
            return &self.tool_name;
        }
        self.diagnostic
            .source
            .as_ref()
            .map(|source| source.name.as_str())
            .unwrap_or("")
    }
}
