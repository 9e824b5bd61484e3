//! Snapshot of what is already posted on the merge request
//!
//! Rebuilt from scratch at the start of every pass so it always reflects the
//! live remote state, never a cached one.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::fingerprint::{decode_marker, Fingerprint};
use crate::review::{ReviewApi, Thread, ThreadPage};

/// What a posted note is recognised by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    /// Notes carrying a meta marker.
    Fingerprint(Fingerprint),
    /// Legacy and human notes, matched by their literal text.
    Body(String),
}

/// Identities seen on the remote, keyed by `(path, line)`.
#[derive(Debug, Default)]
pub struct PostedComments {
    by_line: HashMap<String, HashMap<u32, HashSet<Identity>>>,
    fingerprints_by_path: HashMap<String, HashSet<Fingerprint>>,
}

impl PostedComments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fingerprint(&mut self, path: &str, line: u32, fingerprint: &Fingerprint) {
        self.insert(path, line, Identity::Fingerprint(fingerprint.clone()));
        self.fingerprints_by_path
            .entry(path.to_string())
            .or_default()
            .insert(fingerprint.clone());
    }

    pub fn add_legacy_body(&mut self, path: &str, line: u32, body: &str) {
        self.insert(path, line, Identity::Body(body.to_string()));
    }

    fn insert(&mut self, path: &str, line: u32, identity: Identity) {
        self.by_line
            .entry(path.to_string())
            .or_default()
            .entry(line)
            .or_default()
            .insert(identity);
    }

    /// Fingerprint seen anywhere in `path`.
    ///
    /// Fingerprints carry no line number, so a hit on another line is the
    /// same finding after the surrounding code moved.
    pub fn contains_fingerprint(&self, path: &str, fingerprint: &Fingerprint) -> bool {
        self.fingerprints_by_path
            .get(path)
            .is_some_and(|fingerprints| fingerprints.contains(fingerprint))
    }

    /// Marker-less note with exactly `body` at `(path, line)`.
    pub fn contains_body(&self, path: &str, line: u32, body: &str) -> bool {
        self.by_line
            .get(path)
            .and_then(|lines| lines.get(&line))
            .is_some_and(|identities| identities.contains(&Identity::Body(body.to_string())))
    }

    /// Fingerprint first, legacy body text second.
    pub fn is_posted(
        &self,
        path: &str,
        line: u32,
        fingerprint: &Fingerprint,
        legacy_body: &str,
    ) -> bool {
        self.contains_fingerprint(path, fingerprint) || self.contains_body(path, line, legacy_body)
    }

    /// Number of distinct `(path, line, identity)` entries.
    pub fn len(&self) -> usize {
        self.by_line
            .values()
            .flat_map(|lines| lines.values())
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pass-scoped view of the remote review.
#[derive(Debug, Default)]
pub struct PostedState {
    pub posted: PostedComments,
    /// This tool's threads by fingerprint. Several threads can share one
    /// fingerprint when a finding was posted more than once. Entries still
    /// here once every current finding has been matched are stale.
    pub outdated: HashMap<Fingerprint, Vec<Arc<Thread>>>,
    pub thread_count: usize,
}

/// List every thread on the review, following next-page cursors until the
/// last page. Any page failure fails the whole listing.
pub async fn list_all_threads(api: &dyn ReviewApi) -> Result<Vec<Thread>> {
    let mut threads = Vec::new();
    let mut page: Option<u32> = None;

    loop {
        let ThreadPage {
            threads: batch,
            next_page,
        } = api
            .list_threads(page)
            .await
            .with_context(|| format!("failed to list threads (page {})", page.unwrap_or(1)))?;
        debug!(page = page.unwrap_or(1), count = batch.len(), "listed threads");
        threads.extend(batch);

        match next_page {
            None => return Ok(threads),
            Some(next) if next <= page.unwrap_or(1) => {
                bail!(
                    "thread listing did not advance (page {} pointed to {})",
                    page.unwrap_or(1),
                    next
                );
            }
            Some(next) => page = Some(next),
        }
    }
}

/// Index a thread listing for `tool_name`.
pub fn index_threads(threads: Vec<Thread>, tool_name: &str) -> PostedState {
    let mut state = PostedState {
        thread_count: threads.len(),
        ..Default::default()
    };

    for thread in threads.into_iter().map(Arc::new) {
        for note in &thread.notes {
            let Some((path, line)) = note.position.as_ref().and_then(|pos| pos.anchor()) else {
                continue;
            };
            if note.body.is_empty() {
                continue;
            }

            match decode_marker(&note.body) {
                Some(marker) => {
                    state.posted.add_fingerprint(path, line, &marker.fingerprint);
                    if marker.source_name == tool_name {
                        state
                            .outdated
                            .entry(marker.fingerprint)
                            .or_default()
                            .push(Arc::clone(&thread));
                    }
                }
                None => state.posted.add_legacy_body(path, line, &note.body),
            }
        }
    }

    state
}

/// Fetch and index the remote threads for one pass.
pub async fn rebuild(api: &dyn ReviewApi, tool_name: &str) -> Result<PostedState> {
    let threads = list_all_threads(api).await?;
    let state = index_threads(threads, tool_name);
    debug!(
        threads = state.thread_count,
        identities = state.posted.len(),
        own_threads = state.outdated.len(),
        "rebuilt posted state"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::encode_marker;
    use crate::testing::{legacy_thread, marker_thread, FakeReviewApi};

    #[test]
    fn test_fingerprint_hit_exact_and_drifted() {
        let mut posted = PostedComments::new();
        let fp = Fingerprint::from("f1");
        posted.add_fingerprint("x.go", 10, &fp);

        assert!(posted.contains_fingerprint("x.go", &fp));
        assert!(posted.is_posted("x.go", 14, &fp, "unrelated body"));
        assert!(!posted.contains_fingerprint("y.go", &fp));
        assert!(!posted.contains_fingerprint("x.go", &Fingerprint::from("f2")));
    }

    #[test]
    fn test_legacy_body_needs_exact_position_and_text() {
        let mut posted = PostedComments::new();
        posted.add_legacy_body("x.go", 10, "old body");

        assert!(posted.contains_body("x.go", 10, "old body"));
        assert!(!posted.contains_body("x.go", 11, "old body"));
        assert!(!posted.contains_body("x.go", 10, "old body "));
        assert_eq!(posted.len(), 1);
    }

    #[test]
    fn test_fingerprint_and_body_identities_never_cross_match() {
        let mut posted = PostedComments::new();
        posted.add_legacy_body("x.go", 10, "abc123");
        posted.add_fingerprint("x.go", 11, &Fingerprint::from("def456"));

        assert!(!posted.contains_fingerprint("x.go", &Fingerprint::from("abc123")));
        assert!(!posted.contains_body("x.go", 11, "def456"));
        assert!(posted.contains_body("x.go", 10, "abc123"));
        assert_eq!(posted.len(), 2);
    }

    #[test]
    fn test_index_keeps_every_thread_sharing_a_fingerprint() {
        let threads = vec![
            marker_thread("open-old", "x.go", 10, "f1", "vet", false),
            marker_thread("resolved-new", "x.go", 10, "f1", "vet", true),
        ];
        let state = index_threads(threads, "vet");

        let ids: Vec<&str> = state.outdated[&Fingerprint::from("f1")]
            .iter()
            .map(|thread| thread.id.as_str())
            .collect();
        assert_eq!(ids, vec!["open-old", "resolved-new"]);
    }

    #[test]
    fn test_index_splits_own_threads_from_others() {
        let threads = vec![
            marker_thread("mine", "x.go", 10, "f1", "vet", false),
            marker_thread("theirs", "x.go", 11, "f2", "golint", false),
            legacy_thread("legacy", "x.go", 12, "looks wrong to me"),
        ];
        let state = index_threads(threads, "vet");

        assert_eq!(state.thread_count, 3);
        assert_eq!(state.outdated.len(), 1);
        assert_eq!(state.outdated[&Fingerprint::from("f1")][0].id, "mine");

        assert!(state.posted.contains_fingerprint("x.go", &Fingerprint::from("f2")));
        assert!(state.posted.contains_body("x.go", 12, "looks wrong to me"));
        assert!(!state
            .posted
            .contains_fingerprint("x.go", &Fingerprint::from("looks wrong to me")));
    }

    #[test]
    fn test_index_skips_unanchored_and_empty_notes() {
        let mut general = legacy_thread("general", "x.go", 1, "overall LGTM");
        general.notes[0].position = None;
        let mut empty = marker_thread("empty", "x.go", 2, "f9", "vet", false);
        empty.notes[0].body.clear();
        let mut zero_line = marker_thread("zero", "x.go", 3, "f8", "vet", false);
        if let Some(pos) = zero_line.notes[0].position.as_mut() {
            pos.new_line = Some(0);
        }

        let state = index_threads(vec![general, empty, zero_line], "vet");
        assert!(state.posted.is_empty());
        assert!(state.outdated.is_empty());
    }

    #[test]
    fn test_index_reads_markers_from_replies_too() {
        let mut thread = legacy_thread("d1", "x.go", 4, "human question");
        let mut reply = thread.notes[0].clone();
        reply.id = 2;
        reply.body = format!("answer\n{}", encode_marker(&Fingerprint::from("f4"), "vet"));
        thread.notes.push(reply);

        let state = index_threads(vec![thread], "vet");
        assert!(state.posted.contains_body("x.go", 4, "human question"));
        assert!(state.outdated.contains_key(&Fingerprint::from("f4")));
    }

    #[tokio::test]
    async fn test_pagination_collects_every_page_in_order() {
        let threads: Vec<Thread> = (0..207)
            .map(|i| legacy_thread(&format!("t{i}"), "x.go", i + 1, "body"))
            .collect();
        let api = FakeReviewApi::new().with_page_size(100).with_threads(threads);

        let listed = list_all_threads(&api).await.unwrap();
        assert_eq!(listed.len(), 207);
        assert_eq!(api.list_calls(), 3);
        for (i, thread) in listed.iter().enumerate() {
            assert_eq!(thread.id, format!("t{i}"));
        }
    }

    #[tokio::test]
    async fn test_page_failure_fails_the_rebuild() {
        let threads: Vec<Thread> = (0..150)
            .map(|i| legacy_thread(&format!("t{i}"), "x.go", i + 1, "body"))
            .collect();
        let api = FakeReviewApi::new()
            .with_page_size(100)
            .with_threads(threads)
            .fail_listing_at(2);

        let err = rebuild(&api, "vet").await.unwrap_err();
        assert!(format!("{err:#}").contains("page 2"));
    }

    #[tokio::test]
    async fn test_empty_review_lists_once() {
        let api = FakeReviewApi::new();
        let state = rebuild(&api, "vet").await.unwrap();
        assert_eq!(state.thread_count, 0);
        assert_eq!(api.list_calls(), 1);
    }
}
