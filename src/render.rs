//! Markdown bodies for review comments
//!
//! GitLab suggestion syntax:
//! https://docs.gitlab.com/ee/user/project/merge_requests/reviews/suggestions.html

use thiserror::Error;
use tracing::warn;

use crate::diagnostic::{Comment, Suggestion};
use crate::fingerprint::{encode_marker, Fingerprint};

const INVALID_SUGGESTION_PRE: &str = "<details><summary>lintkeeper suggestion error</summary>";
const INVALID_SUGGESTION_POST: &str = "</details>";

/// GitLab needs at least three backticks to open a fenced block.
const MIN_FENCE_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SuggestionError {
    #[error("suggestion range {start}..{end} ends before it starts")]
    Reversed { start: u32, end: u32 },
    #[error("suggestion range {start}..{end} does not cover commented line {line}")]
    OutsideComment { start: u32, end: u32, line: u32 },
}

/// Human-visible part of the comment: severity badge, tool, rule code, message.
pub fn render(comment: &Comment) -> String {
    let diagnostic = &comment.diagnostic;
    let mut out = String::new();

    if let Some(badge) = diagnostic.severity.badge() {
        out.push_str(badge);
        out.push(' ');
    }

    let tool = comment.display_tool_name();
    if !tool.is_empty() {
        out.push_str(&format!("**[{}]** ", tool));
    }

    if let Some(code) = diagnostic.code.as_ref().filter(|code| !code.value.is_empty()) {
        match code.url.as_deref().filter(|url| !url.is_empty()) {
            Some(url) => out.push_str(&format!("[`{}`]({}) ", code.value, url)),
            None => out.push_str(&format!("`{}` ", code.value)),
        }
    }

    out.push_str(&diagnostic.message);
    out
}

/// Suggestion blocks for every well-formed suggested edit, one per line group.
///
/// Suggestions without a start or end are skipped. A suggestion whose range
/// cannot be expressed relative to the commented line is replaced by a
/// collapsed error block; the remaining suggestions are still rendered.
pub fn render_suggestions(comment: &Comment) -> String {
    let line = comment.line();
    let mut out = String::new();

    for suggestion in &comment.diagnostic.suggestions {
        let Some((start, end)) = suggestion.line_bounds() else {
            continue;
        };
        match suggestion_block(line, start, end, suggestion) {
            Ok(block) => {
                out.push_str(&block);
                out.push('\n');
            }
            Err(err) => {
                warn!(path = comment.path(), line, error = %err, "invalid suggestion");
                out.push_str(INVALID_SUGGESTION_PRE);
                out.push_str(&err.to_string());
                out.push_str(INVALID_SUGGESTION_POST);
                out.push('\n');
            }
        }
    }

    out
}

/// Body as it was posted before meta markers existed. Used to match legacy
/// comments by exact text.
pub fn legacy_body(comment: &Comment) -> String {
    let mut body = render(comment);
    let suggestions = render_suggestions(comment);
    if !suggestions.is_empty() {
        body.push_str("\n\n");
        body.push_str(&suggestions);
    }
    body
}

/// Final body: a rendered [`legacy_body`] followed by the hidden meta marker.
pub fn with_marker(mut body: String, fingerprint: &Fingerprint, tool_name: &str) -> String {
    body.push('\n');
    body.push_str(&encode_marker(fingerprint, tool_name));
    body
}

fn suggestion_block(
    line: u32,
    start: u32,
    end: u32,
    suggestion: &Suggestion,
) -> Result<String, SuggestionError> {
    if end < start {
        return Err(SuggestionError::Reversed { start, end });
    }
    if line < start || line > end {
        return Err(SuggestionError::OutsideComment { start, end, line });
    }

    let text = suggestion.text.as_str();
    let fence = "`".repeat(code_fence_length(text));
    let header = format!("suggestion:-{}+{}", line - start, end - line);

    let mut block = String::with_capacity(fence.len() * 2 + header.len() + text.len() + 2);
    block.push_str(&fence);
    block.push_str(&header);
    block.push('\n');
    if !text.is_empty() {
        block.push_str(text);
        block.push('\n');
    }
    block.push_str(&fence);
    Ok(block)
}

/// Fence length that cannot be closed by any backtick run inside `text`.
pub fn code_fence_length(text: &str) -> usize {
    (longest_backtick_run(text) + 1).max(MIN_FENCE_LEN)
}

fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for ch in text.chars() {
        if ch == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{Code, Diagnostic, Location, Range, Severity};

    fn comment_with(line: u32, suggestions: Vec<Suggestion>) -> Comment {
        Comment {
            diagnostic: Diagnostic {
                message: "prefer `let` binding".to_string(),
                location: Location {
                    path: "src/main.rs".to_string(),
                    range: Some(Range::lines(line, line)),
                },
                severity: Severity::Error,
                code: Some(Code {
                    value: "E042".to_string(),
                    url: Some("https://lint.example/E042".to_string()),
                }),
                suggestions,
                ..Default::default()
            },
            tool_name: "rustlint".to_string(),
            in_diff_file: true,
            ..Default::default()
        }
    }

    fn suggestion(start: u32, end: u32, text: &str) -> Suggestion {
        Suggestion {
            range: Some(Range::lines(start, end)),
            text: text.to_string(),
        }
    }

    /// Parse the first suggestion block back into (header, text).
    fn parse_block(block: &str) -> (String, String) {
        let mut lines = block.lines();
        let opening = lines.next().unwrap();
        let fence_len = opening.chars().take_while(|c| *c == '`').count();
        let header = opening[fence_len..].to_string();
        let fence = "`".repeat(fence_len);
        let mut body = Vec::new();
        for line in lines {
            if line == fence {
                return (header, body.join("\n"));
            }
            body.push(line);
        }
        panic!("unterminated fence in {block:?}");
    }

    #[test]
    fn test_render_includes_badge_tool_code_and_message() {
        let rendered = render(&comment_with(3, Vec::new()));
        assert_eq!(
            rendered,
            "🚫 **[rustlint]** [`E042`](https://lint.example/E042) prefer `let` binding"
        );
    }

    #[test]
    fn test_render_minimal_diagnostic_is_just_the_message() {
        let comment = Comment {
            diagnostic: Diagnostic {
                message: "hello".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(render(&comment), "hello");
    }

    #[test]
    fn test_fence_length_minimum_and_growth() {
        assert_eq!(code_fence_length("plain"), 3);
        assert_eq!(code_fence_length("a `b` c"), 3);
        assert_eq!(code_fence_length("``"), 3);
        assert_eq!(code_fence_length("```rust\nfn x() {}\n```"), 4);
        assert_eq!(code_fence_length("``````"), 7);
    }

    #[test]
    fn test_fence_outgrows_nested_code_and_round_trips() {
        let text = "```rust\nlet x = 1;\n```\n`````";
        let comment = comment_with(5, vec![suggestion(5, 8, text)]);
        let rendered = render_suggestions(&comment);

        assert!(rendered.starts_with("``````suggestion:-0+3\n"));
        let (header, parsed) = parse_block(&rendered);
        assert_eq!(header, "suggestion:-0+3");
        assert_eq!(parsed, text);
    }

    #[test]
    fn test_suggestion_offsets_relative_to_commented_line() {
        let comment = comment_with(10, vec![suggestion(8, 11, "x")]);
        let rendered = render_suggestions(&comment);
        assert_eq!(rendered, "```suggestion:-2+1\nx\n```\n");
    }

    #[test]
    fn test_empty_suggestion_deletes_lines() {
        let comment = comment_with(4, vec![suggestion(4, 5, "")]);
        let rendered = render_suggestions(&comment);
        assert_eq!(rendered, "```suggestion:-0+1\n```\n");
        let (_, parsed) = parse_block(&rendered);
        assert_eq!(parsed, "");
    }

    #[test]
    fn test_structurally_invalid_suggestion_is_skipped() {
        let missing_end = Suggestion {
            range: Some(Range {
                start: Some(crate::diagnostic::Position::line(4)),
                end: None,
            }),
            text: "dropped".to_string(),
        };
        let missing_range = Suggestion {
            range: None,
            text: "dropped too".to_string(),
        };
        let comment = comment_with(4, vec![missing_end, missing_range]);
        assert_eq!(render_suggestions(&comment), "");
    }

    #[test]
    fn test_bad_range_becomes_inline_error_without_losing_others() {
        let comment = comment_with(
            10,
            vec![
                suggestion(12, 11, "reversed"),
                suggestion(10, 10, "kept"),
                suggestion(20, 21, "elsewhere"),
            ],
        );
        let rendered = render_suggestions(&comment);
        let blocks: Vec<&str> = rendered.lines().collect();

        assert!(blocks[0].starts_with(INVALID_SUGGESTION_PRE));
        assert!(blocks[0].contains("ends before it starts"));
        assert!(rendered.contains("```suggestion:-0+0\nkept\n```"));
        assert!(rendered.contains("does not cover commented line 10"));
        assert!(!rendered.contains("reversed\n"));
    }

    #[test]
    fn test_marked_body_layout() {
        let comment = comment_with(10, vec![suggestion(10, 10, "fixed")]);
        let fp = Fingerprint::from("abc");
        let body = with_marker(legacy_body(&comment), &fp, "rustlint");

        let expected_prefix = format!(
            "{}\n\n```suggestion:-0+0\nfixed\n```\n\n",
            render(&comment)
        );
        assert!(body.starts_with(&expected_prefix));
        assert!(body.ends_with(&encode_marker(&fp, "rustlint")));
        assert_eq!(crate::fingerprint::decode_marker(&body).unwrap().fingerprint, fp);
    }

    #[test]
    fn test_marked_body_without_suggestions() {
        let comment = comment_with(10, Vec::new());
        let fp = Fingerprint::from("abc");
        let body = with_marker(legacy_body(&comment), &fp, "rustlint");
        assert_eq!(
            body,
            format!("{}\n{}", render(&comment), encode_marker(&fp, "rustlint"))
        );
        assert!(body.starts_with(&legacy_body(&comment)));
    }
}
