//! Merge request discussion reconciler
//!
//! Findings are buffered with [`DiscussionCommenter::post`] and reconciled in
//! one [`DiscussionCommenter::flush`] pass:
//!
//! 1. list every thread on the merge request and index it
//! 2. classify each finding: dropped, fingerprint-failed, duplicate or new
//! 3. keep this tool's threads whose finding is still reported, resolve the rest
//! 4. run all creates and resolves concurrently, then publish drafts
//!
//! Identity is keyed by fingerprint, so the order findings arrive in does not
//! change the outcome.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::diagnostic::Comment;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::posted::{self, PostedState};
use crate::render;
use crate::review::{Anchor, PublishMode, ReviewApi, Thread};
use crate::task_group::TaskGroup;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to list review threads")]
    ListThreads(#[source] anyhow::Error),
    #[error("failed to fetch diff refs for new threads")]
    DiffRefs(#[source] anyhow::Error),
    #[error("failed to create thread at {target}")]
    Create {
        target: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to resolve thread {thread_id}")]
    Resolve {
        thread_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to publish draft notes")]
    Publish(#[source] anyhow::Error),
}

/// A thread the pass will open.
#[derive(Debug, Clone)]
pub struct PlannedThread {
    pub fingerprint: Fingerprint,
    pub body: String,
    pub anchor: Anchor,
}

/// Everything one pass decided, before any remote write.
#[derive(Debug, Default)]
pub struct Plan {
    pub creates: Vec<PlannedThread>,
    pub resolves: Vec<Arc<Thread>>,
    pub duplicates: usize,
    pub dropped: usize,
    pub fingerprint_failures: usize,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.resolves.is_empty()
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub created: usize,
    pub resolved: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub fingerprint_failures: usize,
}

impl From<&Plan> for FlushSummary {
    fn from(plan: &Plan) -> Self {
        Self {
            created: plan.creates.len(),
            resolved: plan.resolves.len(),
            duplicates: plan.duplicates,
            dropped: plan.dropped,
            fingerprint_failures: plan.fingerprint_failures,
        }
    }
}

/// Decide what a pass has to do, given the remote state at pass start.
pub fn plan_pass(comments: &[Comment], state: PostedState, tool_name: &str) -> Plan {
    let PostedState {
        posted,
        mut outdated,
        ..
    } = state;
    let mut plan = Plan::default();
    let mut scheduled: HashSet<Fingerprint> = HashSet::new();
    let mut still_reported: HashSet<String> = HashSet::new();

    for comment in comments {
        let line = comment.line();
        if !comment.in_diff_file || line == 0 {
            plan.dropped += 1;
            continue;
        }

        let fingerprint = match fingerprint(&comment.diagnostic, tool_name) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!(
                    path = comment.path(),
                    line,
                    error = %err,
                    "failed to calculate fingerprint, skipping"
                );
                plan.fingerprint_failures += 1;
                continue;
            }
        };

        let legacy = render::legacy_body(comment);
        if posted.is_posted(comment.path(), line, &fingerprint, &legacy)
            || scheduled.contains(&fingerprint)
        {
            // The finding still exists, so its threads must stay open.
            if let Some(threads) = outdated.remove(&fingerprint) {
                still_reported.extend(threads.iter().map(|thread| thread.id.clone()));
            }
            debug!(path = comment.path(), line, %fingerprint, "already posted");
            plan.duplicates += 1;
            continue;
        }

        let body = render::with_marker(legacy, &fingerprint, tool_name);
        scheduled.insert(fingerprint.clone());
        plan.creates.push(PlannedThread {
            fingerprint,
            body,
            anchor: Anchor::for_comment(comment),
        });
    }

    let mut stale: Vec<(Fingerprint, Vec<Arc<Thread>>)> = outdated.into_iter().collect();
    stale.sort_by(|a, b| a.0.cmp(&b.0));
    let mut queued: HashSet<String> = HashSet::new();
    for (fingerprint, threads) in stale {
        for thread in threads {
            if thread.is_resolved() || still_reported.contains(&thread.id) {
                continue;
            }
            if !queued.insert(thread.id.clone()) {
                continue;
            }
            debug!(thread = %thread.id, %fingerprint, "finding no longer reported");
            plan.resolves.push(thread);
        }
    }

    plan
}

/// Posts findings as merge request discussions and resolves the ones that
/// went away.
pub struct DiscussionCommenter {
    api: Arc<dyn ReviewApi>,
    tool_name: String,
    max_concurrency: Option<usize>,
    pending: Mutex<Vec<Comment>>,
}

impl DiscussionCommenter {
    pub fn new(api: Arc<dyn ReviewApi>, tool_name: impl Into<String>) -> Self {
        Self {
            api,
            tool_name: tool_name.into(),
            max_concurrency: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Cap the number of remote writes in flight. `None` keeps it unbounded.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Buffer a finding for the next flush.
    pub async fn post(&self, comment: Comment) {
        self.pending.lock().await.push(comment);
    }

    /// Run one reconciliation pass over everything posted since the last one.
    ///
    /// The buffer lock is held for the whole pass, so concurrent flushes run
    /// one after the other and never index a half-written review. The buffer
    /// is emptied whether or not the pass succeeds.
    pub async fn flush(&self) -> Result<FlushSummary, ReconcileError> {
        let mut pending = self.pending.lock().await;
        let comments = std::mem::take(&mut *pending);
        let result = self.reconcile(&comments).await;
        drop(pending);
        result
    }

    async fn reconcile(&self, comments: &[Comment]) -> Result<FlushSummary, ReconcileError> {
        let api = self.api.as_ref();
        let state = posted::rebuild(api, &self.tool_name)
            .await
            .map_err(ReconcileError::ListThreads)?;
        let plan = plan_pass(comments, state, &self.tool_name);
        let summary = FlushSummary::from(&plan);

        if plan.is_empty() {
            info!(
                duplicates = summary.duplicates,
                dropped = summary.dropped,
                "nothing to post or resolve"
            );
            return Ok(summary);
        }

        let refs = if plan.creates.is_empty() {
            None
        } else {
            Some(api.diff_refs().await.map_err(ReconcileError::DiffRefs)?)
        };

        let mut group: TaskGroup<'_, ReconcileError> = TaskGroup::with_limit(self.max_concurrency);
        if let Some(refs) = refs.as_ref() {
            for planned in &plan.creates {
                group.spawn(async move {
                    let id = api
                        .create_thread(&planned.body, &planned.anchor, refs)
                        .await
                        .map_err(|source| ReconcileError::Create {
                            target: planned.anchor.to_string(),
                            source,
                        })?;
                    debug!(id = %id, anchor = %planned.anchor, "created thread");
                    Ok(())
                });
            }
        }
        for thread in &plan.resolves {
            group.spawn(async move {
                api.resolve_thread(thread)
                    .await
                    .map_err(|source| ReconcileError::Resolve {
                        thread_id: thread.id.clone(),
                        source,
                    })?;
                debug!(thread = %thread.id, "resolved thread");
                Ok(())
            });
        }
        group.wait().await?;

        if api.publish_mode() == PublishMode::Draft {
            api.publish_drafts().await.map_err(ReconcileError::Publish)?;
        }

        info!(
            created = summary.created,
            resolved = summary.resolved,
            duplicates = summary.duplicates,
            dropped = summary.dropped,
            "reconciled merge request discussions"
        );
        Ok(summary)
    }
}
