//! In-memory review host
//!
//! Behaves like a small GitLab merge request: listings are paginated,
//! created threads show up in the next listing (after publishing, in draft
//! mode) and resolving flips every resolvable note. Used by the unit tests
//! and the benchmarks.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::diagnostic::{Comment, Diagnostic, Location, Range, Severity};
use crate::fingerprint::{encode_marker, Fingerprint};
use crate::gitlab::RESOLVED_NOTE;
use crate::review::{
    Anchor, DiffRefs, Note, NotePosition, PublishMode, ReviewApi, Thread, ThreadPage,
};

/// A thread created through the fake, as the host received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedThread {
    pub id: String,
    pub body: String,
    pub anchor: Anchor,
    pub refs: DiffRefs,
}

#[derive(Debug, Default)]
struct FakeState {
    threads: Vec<Thread>,
    drafts: Vec<Thread>,
    draft_resolves: Vec<String>,
    created: Vec<CreatedThread>,
    resolved: Vec<String>,
    list_calls: usize,
    diff_ref_calls: usize,
    publish_calls: usize,
    next_id: u64,
}

#[derive(Debug)]
pub struct FakeReviewApi {
    state: Mutex<FakeState>,
    page_size: usize,
    publish_mode: PublishMode,
    fail_listing_at: Option<u32>,
    fail_creates_in: HashSet<String>,
    fail_resolves_of: HashSet<String>,
}

impl Default for FakeReviewApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeReviewApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            page_size: 100,
            publish_mode: PublishMode::Immediate,
            fail_listing_at: None,
            fail_creates_in: HashSet::new(),
            fail_resolves_of: HashSet::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    pub fn with_threads(self, threads: Vec<Thread>) -> Self {
        self.lock().threads.extend(threads);
        self
    }

    /// Make listing of `page` (1-based) fail.
    pub fn fail_listing_at(mut self, page: u32) -> Self {
        self.fail_listing_at = Some(page);
        self
    }

    /// Make thread creation fail for anchors in `path`.
    pub fn fail_creates_in(mut self, path: &str) -> Self {
        self.fail_creates_in.insert(path.to_string());
        self
    }

    pub fn fail_resolves_of(mut self, thread_id: &str) -> Self {
        self.fail_resolves_of.insert(thread_id.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Published threads, as a listing would return them.
    pub fn threads(&self) -> Vec<Thread> {
        self.lock().threads.clone()
    }

    pub fn created(&self) -> Vec<CreatedThread> {
        self.lock().created.clone()
    }

    /// Ids of threads resolved so far, in resolution order.
    pub fn resolved(&self) -> Vec<String> {
        self.lock().resolved.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn diff_ref_calls(&self) -> usize {
        self.lock().diff_ref_calls
    }

    pub fn publish_calls(&self) -> usize {
        self.lock().publish_calls
    }

    pub fn pending_drafts(&self) -> usize {
        let state = self.lock();
        state.drafts.len() + state.draft_resolves.len()
    }
}

fn resolve_in_place(threads: &mut [Thread], thread_id: &str) -> bool {
    let Some(thread) = threads.iter_mut().find(|thread| thread.id == thread_id) else {
        return false;
    };
    for note in &mut thread.notes {
        if note.resolvable {
            note.resolved = true;
        }
    }
    thread.notes.push(Note {
        id: 0,
        body: RESOLVED_NOTE.to_string(),
        position: None,
        resolvable: true,
        resolved: true,
    });
    true
}

#[async_trait]
impl ReviewApi for FakeReviewApi {
    async fn list_threads(&self, page: Option<u32>) -> Result<ThreadPage> {
        let page = page.unwrap_or(1);
        let mut state = self.lock();
        state.list_calls += 1;
        if self.fail_listing_at == Some(page) {
            return Err(anyhow!("listing page {} failed", page));
        }

        let start = (page.max(1) as usize - 1) * self.page_size;
        let threads: Vec<Thread> = state
            .threads
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next_page = (start + self.page_size < state.threads.len()).then_some(page + 1);
        Ok(ThreadPage { threads, next_page })
    }

    async fn diff_refs(&self) -> Result<DiffRefs> {
        self.lock().diff_ref_calls += 1;
        Ok(DiffRefs {
            base_sha: "base".to_string(),
            start_sha: "base".to_string(),
            head_sha: "head".to_string(),
        })
    }

    async fn create_thread(&self, body: &str, anchor: &Anchor, refs: &DiffRefs) -> Result<String> {
        if self.fail_creates_in.contains(&anchor.new_path) {
            return Err(anyhow!("host rejected note on {}", anchor));
        }

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let thread = Thread {
            id: id.clone(),
            notes: vec![Note {
                id: state.next_id,
                body: body.to_string(),
                position: Some(NotePosition {
                    new_path: Some(anchor.new_path.clone()),
                    new_line: Some(anchor.new_line),
                    old_path: anchor.old_path.clone(),
                    old_line: anchor.old_line,
                }),
                resolvable: true,
                resolved: false,
            }],
        };
        match self.publish_mode {
            PublishMode::Immediate => state.threads.push(thread),
            PublishMode::Draft => state.drafts.push(thread),
        }
        state.created.push(CreatedThread {
            id: id.clone(),
            body: body.to_string(),
            anchor: anchor.clone(),
            refs: refs.clone(),
        });
        Ok(id)
    }

    async fn resolve_thread(&self, thread: &Thread) -> Result<()> {
        if self.fail_resolves_of.contains(&thread.id) {
            return Err(anyhow!("host refused to resolve {}", thread.id));
        }

        let mut state = self.lock();
        match self.publish_mode {
            PublishMode::Immediate => {
                if !resolve_in_place(&mut state.threads, &thread.id) {
                    return Err(anyhow!("unknown thread {}", thread.id));
                }
            }
            PublishMode::Draft => state.draft_resolves.push(thread.id.clone()),
        }
        state.resolved.push(thread.id.clone());
        Ok(())
    }

    fn publish_mode(&self) -> PublishMode {
        self.publish_mode
    }

    async fn publish_drafts(&self) -> Result<()> {
        let mut state = self.lock();
        state.publish_calls += 1;
        let drafts = std::mem::take(&mut state.drafts);
        state.threads.extend(drafts);
        let resolves = std::mem::take(&mut state.draft_resolves);
        for id in resolves {
            resolve_in_place(&mut state.threads, &id);
        }
        Ok(())
    }
}

/// Finding on a changed line.
pub fn comment(path: &str, line: u32, message: &str) -> Comment {
    Comment {
        diagnostic: Diagnostic {
            message: message.to_string(),
            location: Location {
                path: path.to_string(),
                range: Some(Range::lines(line, line)),
            },
            severity: Severity::Warning,
            ..Default::default()
        },
        in_diff_file: true,
        ..Default::default()
    }
}

/// Thread whose first note carries a meta marker.
pub fn marker_thread(
    id: &str,
    path: &str,
    line: u32,
    fingerprint: &str,
    tool_name: &str,
    resolved: bool,
) -> Thread {
    let body = format!(
        "posted earlier\n{}",
        encode_marker(&Fingerprint::from(fingerprint), tool_name)
    );
    let mut thread = legacy_thread(id, path, line, &body);
    thread.notes[0].resolved = resolved;
    thread
}

/// Thread whose first note is plain text.
pub fn legacy_thread(id: &str, path: &str, line: u32, body: &str) -> Thread {
    Thread {
        id: id.to_string(),
        notes: vec![Note {
            id: 1,
            body: body.to_string(),
            position: Some(NotePosition {
                new_path: Some(path.to_string()),
                new_line: Some(line),
                ..Default::default()
            }),
            resolvable: true,
            resolved: false,
        }],
    }
}
