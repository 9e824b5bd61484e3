//! Native GitLab API integration
//!
//! Implements [`ReviewApi`] on top of the merge request discussions and
//! draft notes APIs:
//!
//! - https://docs.gitlab.com/ee/api/discussions.html#merge-requests
//! - https://docs.gitlab.com/ee/api/draft_notes.html

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::Repository;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::review::{Anchor, DiffRefs, PublishMode, ReviewApi, Thread, ThreadPage};

pub const DEFAULT_API_BASE: &str = "https://gitlab.com/api/v4";

/// Body of the reply left on a thread when its finding disappears.
pub const RESOLVED_NOTE: &str = "Issue resolved.";

const PER_PAGE: u32 = 100;
const USER_AGENT: &str = "lintkeeper";

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Sanitize an API error body to prevent credential leakage.
/// Truncates long responses and redacts potential secrets.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "glpat-", // personal access token prefix
        "gloas-", // OAuth application secret prefix
        "glcbt-", // CI/CD job token prefix
    ];

    let truncated = truncate(body, MAX_ERROR_BODY_LEN);

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{}... (truncated)", truncated)
}

/// Percent-encode a path segment (`group/project` becomes `group%2Fproject`).
fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

/// Error payloads come as `{"message": "..."}`, `{"message": {...}}` or
/// `{"error": "..."}` depending on the endpoint.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value.get("message").or_else(|| value.get("error"))?;
    Some(match message {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

// ============================================================================
// Merge Request Reference
// ============================================================================

/// Which merge request a client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestRef {
    /// Numeric project id or `group/project` path.
    pub project: String,
    pub iid: u64,
    /// Commit the findings were computed on.
    pub head_sha: String,
}

/// Extract the project path from a git remote URL hosted on `host`.
///
/// Supports:
/// - git@gitlab.com:group/project.git
/// - https://gitlab.com/group/subgroup/project.git
/// - https://gitlab.com/group/project
pub fn parse_remote_url(url: &str, host: &str) -> Option<String> {
    let ssh_prefix = format!("git@{}:", host);
    let path = if let Some(rest) = url.strip_prefix(&ssh_prefix) {
        rest.to_string()
    } else {
        let parsed = url::Url::parse(url).ok()?;
        if parsed.host_str()? != host {
            return None;
        }
        parsed.path().to_string()
    };

    let path = path.trim_matches('/').trim_end_matches(".git");
    // GitLab projects always live under at least one namespace.
    if path.split('/').filter(|part| !part.is_empty()).count() < 2 {
        return None;
    }
    Some(path.to_string())
}

/// Get the project path from the repository's remotes.
pub fn get_remote_project(repo_path: &Path, host: &str) -> Result<String> {
    let repo = Repository::discover(repo_path).context("Failed to open repository")?;

    // Try common remote names first, then whatever else is configured
    let mut names: Vec<String> = ["origin", "upstream", "gitlab"]
        .iter()
        .map(|name| name.to_string())
        .collect();
    if let Ok(remotes) = repo.remotes() {
        names.extend(remotes.iter().flatten().map(str::to_string));
    }

    for name in names {
        if let Ok(remote) = repo.find_remote(&name) {
            if let Some(project) = remote.url().and_then(|url| parse_remote_url(url, host)) {
                return Ok(project);
            }
        }
    }

    Err(anyhow::anyhow!(
        "No remote pointing to {} found. Pass --project or set CI_MERGE_REQUEST_PROJECT_PATH",
        host
    ))
}

/// Commit id of the repository's HEAD.
pub fn get_head_sha(repo_path: &Path) -> Result<String> {
    let repo = Repository::discover(repo_path).context("Failed to open repository")?;
    let commit = repo
        .head()
        .context("Failed to read HEAD")?
        .peel_to_commit()
        .context("HEAD does not point to a commit")?;
    Ok(commit.id().to_string())
}

// ============================================================================
// Request/Response Payloads
// ============================================================================

#[derive(Serialize)]
struct PositionPayload<'a> {
    position_type: &'static str,
    base_sha: &'a str,
    start_sha: &'a str,
    head_sha: &'a str,
    new_path: &'a str,
    new_line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_line: Option<u32>,
}

impl<'a> PositionPayload<'a> {
    fn new(anchor: &'a Anchor, refs: &'a DiffRefs) -> Self {
        Self {
            position_type: "text",
            base_sha: &refs.base_sha,
            start_sha: &refs.start_sha,
            head_sha: &refs.head_sha,
            new_path: &anchor.new_path,
            new_line: anchor.new_line,
            old_path: anchor.old_path.as_deref(),
            old_line: anchor.old_line,
        }
    }
}

#[derive(Serialize)]
struct CreateDiscussionRequest<'a> {
    body: &'a str,
    position: PositionPayload<'a>,
}

#[derive(Serialize)]
struct CreateNoteRequest<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct CreateDraftNoteRequest<'a> {
    note: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<PositionPayload<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to_discussion_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolve_discussion: Option<bool>,
}

#[derive(Deserialize)]
struct CreatedResponse {
    id: serde_json::Value,
}

impl CreatedResponse {
    fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(id) => id.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct MergeRequestResponse {
    target_project_id: u64,
    target_branch: String,
}

#[derive(Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Deserialize)]
struct BranchCommit {
    id: String,
}

// ============================================================================
// API Client
// ============================================================================

pub struct GitLabClient {
    http: reqwest::Client,
    api_base: String,
    project_segment: String,
    merge_request: MergeRequestRef,
    publish_mode: PublishMode,
}

impl GitLabClient {
    pub fn new(
        api_base: &str,
        token: &str,
        merge_request: MergeRequestRef,
        publish_mode: PublishMode,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let mut token_value = reqwest::header::HeaderValue::from_str(token.trim())
            .context("GitLab token contains invalid header characters")?;
        token_value.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", token_value);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            project_segment: encode_segment(&merge_request.project),
            merge_request,
            publish_mode,
        })
    }

    fn merge_request_url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/merge_requests/{}{}",
            self.api_base, self.project_segment, self.merge_request.iid, suffix
        )
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to send GitLab {} request", operation))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let error_body = resp.text().await.unwrap_or_default();
        if let Some(message) = api_error_message(&error_body) {
            return Err(anyhow::anyhow!(
                "GitLab API error during {} ({}): {}",
                operation,
                status,
                sanitize_error_body(&message)
            ));
        }
        Err(anyhow::anyhow!(
            "GitLab API error during {} ({}): {}",
            operation,
            status,
            sanitize_error_body(&error_body)
        ))
    }

    async fn create_draft_note(&self, request: &CreateDraftNoteRequest<'_>) -> Result<String> {
        let resp = self
            .send(
                "draft note creation",
                self.http.post(self.merge_request_url("/draft_notes")).json(request),
            )
            .await?;
        let created: CreatedResponse = resp
            .json()
            .await
            .context("Failed to parse draft note response")?;
        Ok(created.id_string())
    }
}

#[async_trait]
impl ReviewApi for GitLabClient {
    async fn list_threads(&self, page: Option<u32>) -> Result<ThreadPage> {
        let page = page.unwrap_or(1);
        let resp = self
            .send(
                "discussion listing",
                self.http
                    .get(self.merge_request_url("/discussions"))
                    .query(&[("per_page", PER_PAGE), ("page", page)]),
            )
            .await?;

        // Empty on the last page.
        let next_page = resp
            .headers()
            .get("x-next-page")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u32>().ok());

        let threads: Vec<Thread> = resp
            .json()
            .await
            .context("Failed to parse discussions response")?;
        Ok(ThreadPage { threads, next_page })
    }

    async fn diff_refs(&self) -> Result<DiffRefs> {
        let resp = self
            .send("merge request lookup", self.http.get(self.merge_request_url("")))
            .await?;
        let mr: MergeRequestResponse = resp
            .json()
            .await
            .context("Failed to parse merge request response")?;

        let branch_url = format!(
            "{}/projects/{}/repository/branches/{}",
            self.api_base,
            mr.target_project_id,
            encode_segment(&mr.target_branch)
        );
        let resp = self.send("target branch lookup", self.http.get(branch_url)).await?;
        let branch: BranchResponse = resp
            .json()
            .await
            .context("Failed to parse branch response")?;

        debug!(
            target_branch = %mr.target_branch,
            base = %branch.commit.id,
            head = %self.merge_request.head_sha,
            "resolved diff refs"
        );
        Ok(DiffRefs {
            base_sha: branch.commit.id.clone(),
            start_sha: branch.commit.id,
            head_sha: self.merge_request.head_sha.clone(),
        })
    }

    async fn create_thread(&self, body: &str, anchor: &Anchor, refs: &DiffRefs) -> Result<String> {
        let position = PositionPayload::new(anchor, refs);
        match self.publish_mode {
            PublishMode::Draft => {
                self.create_draft_note(&CreateDraftNoteRequest {
                    note: body,
                    position: Some(position),
                    in_reply_to_discussion_id: None,
                    resolve_discussion: None,
                })
                .await
            }
            PublishMode::Immediate => {
                let resp = self
                    .send(
                        "discussion creation",
                        self.http
                            .post(self.merge_request_url("/discussions"))
                            .json(&CreateDiscussionRequest { body, position }),
                    )
                    .await?;
                let created: CreatedResponse = resp
                    .json()
                    .await
                    .context("Failed to parse discussion response")?;
                Ok(created.id_string())
            }
        }
    }

    async fn resolve_thread(&self, thread: &Thread) -> Result<()> {
        match self.publish_mode {
            PublishMode::Draft => {
                self.create_draft_note(&CreateDraftNoteRequest {
                    note: RESOLVED_NOTE,
                    position: None,
                    in_reply_to_discussion_id: Some(&thread.id),
                    resolve_discussion: Some(true),
                })
                .await?;
            }
            PublishMode::Immediate => {
                let discussion = format!("/discussions/{}", thread.id);
                self.send(
                    "resolve reply",
                    self.http
                        .post(self.merge_request_url(&format!("{}/notes", discussion)))
                        .json(&CreateNoteRequest { body: RESOLVED_NOTE }),
                )
                .await?;
                self.send(
                    "discussion resolution",
                    self.http
                        .put(self.merge_request_url(&discussion))
                        .query(&[("resolved", "true")]),
                )
                .await?;
            }
        }
        Ok(())
    }

    fn publish_mode(&self) -> PublishMode {
        self.publish_mode
    }

    async fn publish_drafts(&self) -> Result<()> {
        self.send(
            "draft note publishing",
            self.http.post(self.merge_request_url("/draft_notes/bulk_publish")),
        )
        .await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
