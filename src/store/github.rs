//! GitHub REST adapter: issues are work items, pull requests are changes.
//!
//! GitHub offers no conditional update on issues, so this adapter reports
//! `supports_conditional_update() == false` and the claim resolver falls
//! back to write-then-verify. Comment and review authorship is whatever
//! account the token belongs to; claim markers carry the worker identity in
//! their text for that reason.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{
    Change, ChangeId, Comment, ItemId, Label, LabelFilter, MergeResult, MergeState, Review,
    Revision, StoreError, Verdict, WorkItem, WorkStore,
};

const PER_PAGE: usize = 100;

fn closes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:closes|fixes|resolves)\s+#(\d+)").expect("valid closes pattern")
    })
}

#[derive(Debug, Clone)]
pub struct GithubSettings {
    pub api_url: String,
    /// `owner/name`
    pub repo: String,
    pub token: String,
    pub base_branch: String,
    pub timeout: Duration,
}

pub struct GithubStore {
    agent: ureq::Agent,
    settings: GithubSettings,
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl GithubStore {
    pub fn new(settings: GithubSettings) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, settings }
    }

    /// Login of the account behind the token.
    pub fn authenticated_login(&self) -> Result<String, StoreError> {
        #[derive(Deserialize)]
        struct Me {
            login: String,
        }
        let url = format!("{}/user", self.settings.api_url.trim_end_matches('/'));
        let me: Me = decode(self.send(Method::Get, &url, None)?)?;
        Ok(me.login)
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.settings.api_url.trim_end_matches('/'),
            self.settings.repo,
            path.trim_start_matches('/')
        )
    }

    fn authorize<B>(&self, req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        req.header("Accept", "application/vnd.github+json")
            .header("Authorization", &format!("Bearer {}", self.settings.token))
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", "peerloop")
    }

    /// Issue one request. Returns the parsed JSON body (`Null` when empty).
    fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value, StoreError> {
        let payload = body.map(Value::to_string).unwrap_or_default();
        let result = match method {
            Method::Get => self.authorize(self.agent.get(url)).call(),
            Method::Delete => self.authorize(self.agent.delete(url)).call(),
            Method::Post => self
                .authorize(self.agent.post(url))
                .header("Content-Type", "application/json")
                .send(payload.as_str()),
            Method::Put => self
                .authorize(self.agent.put(url))
                .header("Content-Type", "application/json")
                .send(payload.as_str()),
            Method::Patch => self
                .authorize(self.agent.patch(url))
                .header("Content-Type", "application/json")
                .send(payload.as_str()),
        };
        let mut response = result.map_err(|e| StoreError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .read_to_string()
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        tracing::trace!(status, url, "github response");
        if !(200..300).contains(&status) {
            return Err(classify(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        decode(self.send(Method::Get, &self.repo_url(path), None)?)
    }

    /// GET every page of a list endpoint.
    fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        let sep = if path.contains('?') { '&' } else { '?' };
        let mut out = Vec::new();
        for page in 1.. {
            let batch: Vec<T> = self.get(&format!("{path}{sep}per_page={PER_PAGE}&page={page}"))?;
            let len = batch.len();
            out.extend(batch);
            if len < PER_PAGE {
                break;
            }
        }
        Ok(out)
    }

    fn write(&self, method: Method, path: &str, body: &Value) -> Result<Value, StoreError> {
        self.send(method, &self.repo_url(path), Some(body))
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, StoreError> {
        let raw: Vec<GhComment> = self.get_all(&format!("issues/{number}/comments"))?;
        Ok(raw.into_iter().map(GhComment::into_comment).collect())
    }

    fn edit_labels(&self, number: u64, add: &[Label], remove: &[Label]) -> Result<(), StoreError> {
        if !add.is_empty() {
            let names: Vec<&str> = add.iter().map(|l| l.as_str()).collect();
            self.write(
                Method::Post,
                &format!("issues/{number}/labels"),
                &json!({ "labels": names }),
            )?;
        }
        for label in remove {
            let url = self.repo_url(&format!("issues/{number}/labels/{}", label.as_str()));
            match self.send(Method::Delete, &url, None) {
                Ok(_) | Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn load_change(&self, pull: GhPull) -> Result<Change, StoreError> {
        let number = pull.number;
        let reviews: Vec<GhReview> = self.get_all(&format!("pulls/{number}/reviews"))?;
        let commits: Vec<GhCommit> = self.get_all(&format!("pulls/{number}/commits"))?;
        let last_commit = commits
            .iter()
            .map(|c| c.commit.committer.date)
            .max()
            .unwrap_or(pull.created_at);
        pull.into_change(reviews, last_commit)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Malformed(e.to_string()))
}

/// Map a non-2xx status onto the store error taxonomy.
fn classify(status: u16, body: &str) -> StoreError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or_else(|| body.chars().take(200).collect());
    match status {
        404 => StoreError::NotFound { kind: "record", id: 0 },
        409 => StoreError::Conflict { kind: "record", id: 0 },
        429 | 500..=599 => StoreError::Transient(format!("{status}: {message}")),
        403 if message.to_lowercase().contains("rate limit") => {
            StoreError::Transient(format!("{status}: {message}"))
        }
        _ => StoreError::Rejected { status, message },
    }
}

/// Work item number referenced by a `Closes #N` line.
pub fn parse_closes(body: &str) -> Option<ItemId> {
    closes_re()
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Issue state change implied by a label edit: `done` closes the issue,
/// taking `done` away reopens it.
fn issue_state_patch(add: &[Label], remove: &[Label]) -> Option<Value> {
    if add.contains(&Label::Done) {
        Some(json!({ "state": "closed", "state_reason": "completed" }))
    } else if remove.contains(&Label::Done) {
        Some(json!({ "state": "open" }))
    } else {
        None
    }
}

fn with_id(err: StoreError, kind: &'static str, id: u64) -> StoreError {
    match err {
        StoreError::NotFound { .. } => StoreError::NotFound { kind, id },
        StoreError::Conflict { .. } => StoreError::Conflict { kind, id },
        other => other,
    }
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

/// Labels outside the protocol vocabulary are ignored.
fn known_labels(labels: &[GhLabel]) -> BTreeSet<Label> {
    labels.iter().filter_map(|l| l.name.parse().ok()).collect()
}

#[derive(Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<GhLabel>,
    assignee: Option<GhUser>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    pull_request: Option<Value>,
}

impl GhIssue {
    fn into_item(self, comments: Vec<Comment>) -> WorkItem {
        let revision = Revision(u64::try_from(self.updated_at.timestamp_millis()).unwrap_or(0));
        WorkItem {
            id: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            labels: known_labels(&self.labels),
            assignee: self.assignee.map(|u| u.login),
            created_at: self.created_at,
            revision,
            comments,
        }
    }
}

#[derive(Deserialize)]
struct GhComment {
    user: Option<GhUser>,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

impl GhComment {
    fn into_comment(self) -> Comment {
        Comment {
            author: self.user.map(|u| u.login).unwrap_or_default(),
            body: self.body.unwrap_or_default(),
            created_at: self.created_at,
        }
    }
}

#[derive(Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    name: String,
}

#[derive(Deserialize)]
struct GhPull {
    number: u64,
    title: String,
    body: Option<String>,
    user: GhUser,
    head: GhRef,
    #[serde(default)]
    labels: Vec<GhLabel>,
    state: String,
    merged_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl GhPull {
    fn into_change(self, reviews: Vec<GhReview>, last_commit: DateTime<Utc>) -> Result<Change, StoreError> {
        let body = self.body.unwrap_or_default();
        let closes = parse_closes(&body).ok_or_else(|| {
            StoreError::Malformed(format!("pull #{} does not reference an issue", self.number))
        })?;
        let state = if self.merged_at.is_some() {
            MergeState::Merged
        } else if self.state == "closed" {
            MergeState::Closed
        } else {
            MergeState::Open
        };
        let reviews = reviews.into_iter().filter_map(GhReview::into_review).collect();
        let mut change = Change {
            id: self.number,
            branch: self.head.name,
            title: self.title,
            body,
            author: self.user.login,
            closes,
            reviews,
            state,
            labels: known_labels(&self.labels),
            created_at: self.created_at,
            last_author_commit_at: last_commit,
        };
        change.refresh_review_state();
        Ok(change)
    }
}

#[derive(Deserialize)]
struct GhReview {
    user: Option<GhUser>,
    state: String,
    body: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
}

impl GhReview {
    /// Only approvals and change requests count; comments and dismissals don't.
    fn into_review(self) -> Option<Review> {
        let verdict = match self.state.as_str() {
            "APPROVED" => Verdict::Approve,
            "CHANGES_REQUESTED" => Verdict::RequestChanges,
            _ => return None,
        };
        Some(Review {
            reviewer: self.user?.login,
            verdict,
            comments: self.body.unwrap_or_default(),
            submitted_at: self.submitted_at?,
        })
    }
}

#[derive(Deserialize)]
struct GhCommitter {
    date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GhCommitInner {
    committer: GhCommitter,
}

#[derive(Deserialize)]
struct GhCommit {
    commit: GhCommitInner,
}

impl WorkStore for GithubStore {
    fn supports_conditional_update(&self) -> bool {
        false
    }

    fn create_item(&self, title: &str, body: &str, labels: &[Label]) -> Result<ItemId, StoreError> {
        let names: Vec<&str> = labels.iter().map(|l| l.as_str()).collect();
        let created: GhIssue = decode(self.write(
            Method::Post,
            "issues",
            &json!({ "title": title, "body": body, "labels": names }),
        )?)?;
        Ok(created.number)
    }

    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        let issue: GhIssue = self
            .get(&format!("issues/{id}"))
            .map_err(|e| with_id(e, "item", id))?;
        if issue.pull_request.is_some() {
            return Err(StoreError::NotFound { kind: "item", id });
        }
        let comments = self.comments(id)?;
        Ok(issue.into_item(comments))
    }

    fn list_items(&self, filter: &LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        // Merged work closes its issue, so `done` lookups must include closed ones.
        let state = if filter.with.contains(&Label::Done) { "all" } else { "open" };
        let mut path = format!("issues?state={state}");
        if !filter.with.is_empty() {
            let names: Vec<&str> = filter.with.iter().map(|l| l.as_str()).collect();
            path.push_str(&format!("&labels={}", names.join(",")));
        }
        let issues: Vec<GhIssue> = self.get_all(&path)?;
        Ok(issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(|issue| issue.into_item(Vec::new()))
            .filter(|item| filter.matches(&item.labels))
            .collect())
    }

    fn update_item_labels(
        &self,
        id: ItemId,
        add: &[Label],
        remove: &[Label],
        _expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        self.edit_labels(id, add, remove)
            .map_err(|e| with_id(e, "item", id))?;
        if let Some(patch) = issue_state_patch(add, remove) {
            self.write(Method::Patch, &format!("issues/{id}"), &patch)
                .map_err(|e| with_id(e, "item", id))?;
        }
        let issue: GhIssue = self.get(&format!("issues/{id}"))?;
        Ok(issue.into_item(Vec::new()).revision)
    }

    fn assign_item(
        &self,
        id: ItemId,
        worker: Option<&str>,
        _expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let assignees: Vec<&str> = worker.into_iter().collect();
        let issue: GhIssue = decode(
            self.write(
                Method::Patch,
                &format!("issues/{id}"),
                &json!({ "assignees": assignees }),
            )
            .map_err(|e| with_id(e, "item", id))?,
        )?;
        Ok(issue.into_item(Vec::new()).revision)
    }

    fn append_comment(&self, id: ItemId, _author: &str, text: &str) -> Result<(), StoreError> {
        self.write(
            Method::Post,
            &format!("issues/{id}/comments"),
            &json!({ "body": text }),
        )
        .map_err(|e| with_id(e, "item", id))?;
        Ok(())
    }

    fn create_change(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        closes: ItemId,
    ) -> Result<ChangeId, StoreError> {
        let body = format!("{body}\n\nCloses #{closes}");
        let created: GhPull = decode(self.write(
            Method::Post,
            "pulls",
            &json!({
                "title": title,
                "head": branch,
                "base": self.settings.base_branch,
                "body": body,
            }),
        )?)?;
        Ok(created.number)
    }

    fn get_change(&self, id: ChangeId) -> Result<Change, StoreError> {
        let pull: GhPull = self
            .get(&format!("pulls/{id}"))
            .map_err(|e| with_id(e, "change", id))?;
        self.load_change(pull)
    }

    fn list_changes(&self, filter: &LabelFilter) -> Result<Vec<Change>, StoreError> {
        let pulls: Vec<GhPull> = self.get_all("pulls?state=open")?;
        pulls
            .into_iter()
            .filter(|p| filter.matches(&known_labels(&p.labels)))
            .filter(|p| p.body.as_deref().and_then(parse_closes).is_some())
            .map(|p| self.load_change(p))
            .collect()
    }

    fn add_review(
        &self,
        change: ChangeId,
        _reviewer: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<(), StoreError> {
        let event = match verdict {
            Verdict::Approve => "APPROVE",
            Verdict::RequestChanges => "REQUEST_CHANGES",
        };
        self.write(
            Method::Post,
            &format!("pulls/{change}/reviews"),
            &json!({ "event": event, "body": comments }),
        )
        .map_err(|e| with_id(e, "change", change))?;
        Ok(())
    }

    fn update_change_labels(
        &self,
        change: ChangeId,
        add: &[Label],
        remove: &[Label],
    ) -> Result<(), StoreError> {
        self.edit_labels(change, add, remove)
            .map_err(|e| with_id(e, "change", change))
    }

    fn merge_change(&self, change: ChangeId) -> Result<MergeResult, StoreError> {
        let pull: GhPull = self
            .get(&format!("pulls/{change}"))
            .map_err(|e| with_id(e, "change", change))?;
        if pull.merged_at.is_some() {
            return Ok(MergeResult::AlreadyMerged);
        }
        if pull.state == "closed" {
            return Ok(MergeResult::NotMergeable);
        }
        match self.write(
            Method::Put,
            &format!("pulls/{change}/merge"),
            &json!({ "merge_method": "squash" }),
        ) {
            Ok(_) => Ok(MergeResult::Merged),
            Err(StoreError::Rejected { status: 405, .. }) => Ok(MergeResult::NotMergeable),
            Err(e) => Err(with_id(e, "change", change)),
        }
    }

    fn close_change(&self, change: ChangeId) -> Result<(), StoreError> {
        self.write(
            Method::Patch,
            &format!("pulls/{change}"),
            &json!({ "state": "closed" }),
        )
        .map_err(|e| with_id(e, "change", change))?;
        Ok(())
    }
}
