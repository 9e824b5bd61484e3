//! Remote review model and the API contract the reconciler needs
//!
//! The types deserialize straight from GitLab's discussions payload; other
//! hosts map their own thread listings onto them.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::diagnostic::Comment;

/// Where a note is anchored in the diff. Old fields are set for renamed or
/// removed lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePosition {
    #[serde(default)]
    pub new_path: Option<String>,
    #[serde(default)]
    pub new_line: Option<u32>,
    #[serde(default)]
    pub old_path: Option<String>,
    #[serde(default)]
    pub old_line: Option<u32>,
}

impl NotePosition {
    /// `(path, line)` on the new side of the diff, if the note has one.
    pub fn anchor(&self) -> Option<(&str, u32)> {
        let path = self.new_path.as_deref().filter(|path| !path.is_empty())?;
        let line = self.new_line.filter(|line| *line > 0)?;
        Some((path, line))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub position: Option<NotePosition>,
    #[serde(default)]
    pub resolvable: bool,
    #[serde(default)]
    pub resolved: bool,
}

/// A discussion: ordered notes anchored to one code position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Thread {
    /// A thread is resolved when every resolvable note in it is resolved.
    pub fn is_resolved(&self) -> bool {
        self.notes
            .iter()
            .all(|note| !note.resolvable || note.resolved)
    }
}

/// One page of the thread listing. `next_page` is `None` on the last page.
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub next_page: Option<u32>,
}

/// Revisions a new diff note is positioned against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub start_sha: String,
    pub head_sha: String,
}

/// Code position for a new thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub new_path: String,
    pub new_line: u32,
    pub old_path: Option<String>,
    pub old_line: Option<u32>,
}

impl Anchor {
    pub fn for_comment(comment: &Comment) -> Self {
        // Old side is only meaningful when both halves are known.
        let (old_path, old_line) = match (&comment.old_path, comment.old_line) {
            (Some(path), Some(line)) if !path.is_empty() && line > 0 => {
                (Some(path.clone()), Some(line))
            }
            _ => (None, None),
        };
        Self {
            new_path: comment.path().to_string(),
            new_line: comment.line(),
            old_path,
            old_line,
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.new_path, self.new_line)
    }
}

/// How remote writes become visible to reviewers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Every create/resolve is visible as soon as it is issued.
    Immediate,
    /// Writes are drafts until one bulk publish at the end of the pass.
    #[default]
    Draft,
}

impl FromStr for PublishMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(PublishMode::Immediate),
            "draft" => Ok(PublishMode::Draft),
            other => Err(format!(
                "unknown publish mode '{}' (expected 'immediate' or 'draft')",
                other
            )),
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishMode::Immediate => f.write_str("immediate"),
            PublishMode::Draft => f.write_str("draft"),
        }
    }
}

/// Review operations used by a reconciliation pass.
#[async_trait]
pub trait ReviewApi: Send + Sync {
    /// Fetch one page of threads. `page` is `None` for the first page.
    async fn list_threads(&self, page: Option<u32>) -> Result<ThreadPage>;

    /// Revisions new threads are anchored against.
    async fn diff_refs(&self) -> Result<DiffRefs>;

    /// Open a new thread; returns the remote id of the thread or draft.
    async fn create_thread(&self, body: &str, anchor: &Anchor, refs: &DiffRefs) -> Result<String>;

    /// Mark a thread as resolved, leaving a short note behind.
    async fn resolve_thread(&self, thread: &Thread) -> Result<()>;

    fn publish_mode(&self) -> PublishMode {
        PublishMode::Immediate
    }

    /// Publish every pending draft in one go. Only called in draft mode.
    async fn publish_drafts(&self) -> Result<()> {
        Ok(())
    }
}
