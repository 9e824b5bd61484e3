//! JSON Lines reader for findings
//!
//! One serialized [`Comment`] per line. Blank lines are skipped.

use anyhow::{Context, Result};
use std::io::BufRead;

use crate::diagnostic::Comment;

/// Read every comment from `reader`. Comments without a `tool_name` get
/// `default_tool` so that the rendered header matches the marker owner.
pub fn read_comments<R: BufRead>(reader: R, default_tool: &str) -> Result<Vec<Comment>> {
    let mut comments = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("Failed to read input line {}", line_no))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut comment: Comment = serde_json::from_str(trimmed)
            .with_context(|| format!("Malformed comment on input line {}", line_no))?;
        if comment.tool_name.is_empty() {
            comment.tool_name = default_tool.to_string();
        }
        comments.push(comment);
    }
    Ok(comments)
}
