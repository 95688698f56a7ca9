//! In-memory forge backed by a JSON recording.
//!
//! A recording holds one or more requests with their commits, comments,
//! labels and bot reactions. Writes mutate the recording, which can then be
//! saved back so the next run sees the result. Diffs and blob lookups are
//! answered from the recorded first-parent ancestry, including commits that
//! were rewritten away by a force-push (kept in `history`).

use crate::core::error::{ForgeError, SignbotError};
use crate::core::forge::{ChangedFile, Comment, Commit, FileChange, Forge, PullRequest};
use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Login the forge attributes the bot's own writes to.
    #[serde(default = "default_bot_login")]
    pub bot_login: String,
    #[serde(default)]
    pub requests: BTreeMap<u64, RecordedRequest>,
    /// Commits no longer part of any request.
    #[serde(default)]
    pub history: Vec<Commit>,
    #[serde(default)]
    pub next_id: u64,
}

impl Default for Recording {
    fn default() -> Self {
        Self {
            bot_login: default_bot_login(),
            requests: BTreeMap::new(),
            history: Vec::new(),
            next_id: 0,
        }
    }
}

fn default_bot_login() -> String {
    "signbot".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedRequest {
    pub pull_request: PullRequest,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub reactions: BTreeMap<u64, BTreeSet<String>>,
}

#[derive(Default)]
pub struct RecordedForge {
    state: Mutex<Recording>,
    /// Per-op outcomes to replay; `None` lets one call through.
    failures: Mutex<BTreeMap<String, VecDeque<Option<ForgeError>>>>,
}

impl RecordedForge {
    pub fn new(recording: Recording) -> Self {
        Self {
            state: Mutex::new(recording),
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, SignbotError> {
        let raw = fs::read_to_string(path)?;
        let recording: Recording = serde_json::from_str(&raw)?;
        Ok(Self::new(recording))
    }

    pub fn save(&self, path: &Path) -> Result<(), SignbotError> {
        let body = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, body)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Recording {
        self.lock().clone()
    }

    pub fn request_numbers(&self) -> Vec<u64> {
        self.lock().requests.keys().copied().collect()
    }

    /// Queue a failure for the next call of `op` (e.g. `"comments"`, `"create_comment"`).
    pub fn inject_failure(&self, op: &str, err: ForgeError) {
        self.fail_after(op, 0, err);
    }

    /// Let `successes` more calls of `op` through, then fail with `err`.
    pub fn fail_after(&self, op: &str, successes: usize, err: ForgeError) {
        if let Ok(mut failures) = self.failures.lock() {
            let queue = failures.entry(op.to_string()).or_default();
            queue.extend(std::iter::repeat_n(None, successes));
            queue.push_back(Some(err));
        }
    }

    pub fn open_request(&self, pull_request: PullRequest, commits: Vec<Commit>) {
        let mut state = self.lock();
        let mut pull_request = pull_request;
        if let Some(last) = commits.last() {
            pull_request.head_sha = last.sha.clone();
        }
        state.requests.insert(
            pull_request.number,
            RecordedRequest {
                pull_request,
                commits,
                comments: Vec::new(),
                labels: BTreeSet::new(),
                reactions: BTreeMap::new(),
            },
        );
    }

    pub fn post_comment(&self, number: u64, author: &str, at: DateTime<Utc>, body: &str) -> u64 {
        let mut state = self.lock();
        let id = next_id(&mut state);
        if let Some(req) = state.requests.get_mut(&number) {
            req.comments.push(Comment {
                id,
                author: author.to_string(),
                created_at: time::truncate_secs(at),
                body: body.to_string(),
            });
        }
        id
    }

    pub fn edit_comment(&self, comment_id: u64, body: &str) {
        let mut state = self.lock();
        for req in state.requests.values_mut() {
            if let Some(c) = req.comments.iter_mut().find(|c| c.id == comment_id) {
                c.body = body.to_string();
            }
        }
    }

    pub fn remove_comment(&self, comment_id: u64) {
        let mut state = self.lock();
        for req in state.requests.values_mut() {
            req.comments.retain(|c| c.id != comment_id);
            req.reactions.remove(&comment_id);
        }
    }

    /// Append commits on top of the current head.
    pub fn push_commits(&self, number: u64, commits: Vec<Commit>) {
        let mut state = self.lock();
        if let Some(req) = state.requests.get_mut(&number) {
            if let Some(last) = commits.last() {
                req.pull_request.head_sha = last.sha.clone();
            }
            req.pull_request.files.clear();
            req.commits.extend(commits);
        }
    }

    /// Replace the whole commit list, keeping the old commits reachable in history.
    pub fn force_push(&self, number: u64, commits: Vec<Commit>) {
        let mut state = self.lock();
        let Some(req) = state.requests.get_mut(&number) else {
            return;
        };
        let old = std::mem::replace(&mut req.commits, commits);
        if let Some(last) = req.commits.last() {
            req.pull_request.head_sha = last.sha.clone();
        }
        req.pull_request.files.clear();
        state.history.extend(old);
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected(&self, op: &str) -> Result<(), ForgeError> {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match failures.get_mut(op).and_then(|q| q.pop_front()) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn with_request<T>(
        &self,
        number: u64,
        f: impl FnOnce(&mut RecordedRequest) -> T,
    ) -> Result<T, ForgeError> {
        let mut state = self.lock();
        state
            .requests
            .get_mut(&number)
            .map(f)
            .ok_or_else(|| ForgeError::NotFound(format!("request #{}", number)))
    }

    fn with_comment<T>(
        &self,
        comment_id: u64,
        f: impl FnOnce(&mut RecordedRequest) -> T,
    ) -> Result<T, ForgeError> {
        let mut state = self.lock();
        state
            .requests
            .values_mut()
            .find(|req| req.comments.iter().any(|c| c.id == comment_id))
            .map(f)
            .ok_or_else(|| ForgeError::NotFound(format!("comment {}", comment_id)))
    }
}

fn next_id(state: &mut Recording) -> u64 {
    if state.next_id == 0 {
        state.next_id = state
            .requests
            .values()
            .flat_map(|r| r.comments.iter().map(|c| c.id))
            .max()
            .unwrap_or(0)
            + 1;
    }
    let id = state.next_id;
    state.next_id += 1;
    id
}

fn find_commit<'r>(state: &'r Recording, sha: &str) -> Option<&'r Commit> {
    state
        .requests
        .values()
        .flat_map(|r| r.commits.iter())
        .chain(state.history.iter())
        .find(|c| c.sha == sha)
}

/// Latest blob per path along the first-parent chain from `head` down to `base` (exclusive).
fn net_changes(
    state: &Recording,
    base: &str,
    head: &str,
) -> Result<BTreeMap<String, Option<String>>, ForgeError> {
    let mut out = BTreeMap::new();
    let mut cursor = head.to_string();
    while cursor != base {
        let commit = find_commit(state, &cursor)
            .ok_or_else(|| ForgeError::NotFound(format!("commit {}", cursor)))?;
        for file in &commit.files {
            out.entry(file.path.clone()).or_insert_with(|| file.blob.clone());
        }
        match commit.parents.first() {
            Some(parent) => cursor = parent.clone(),
            None => break,
        }
    }
    Ok(out)
}

impl Forge for RecordedForge {
    fn pull_request(&self, number: u64) -> Result<PullRequest, ForgeError> {
        self.injected("pull_request")?;
        let state = self.lock();
        let req = state
            .requests
            .get(&number)
            .ok_or_else(|| ForgeError::NotFound(format!("request #{}", number)))?;
        let mut pr = req.pull_request.clone();
        if pr.files.is_empty() {
            if let Ok(changes) = net_changes(&state, &pr.base_sha, &pr.head_sha) {
                pr.files = changes
                    .into_iter()
                    .map(|(path, blob)| ChangedFile { path, blob })
                    .collect();
            }
        }
        Ok(pr)
    }

    fn comments(&self, number: u64) -> Result<Vec<Comment>, ForgeError> {
        self.injected("comments")?;
        self.with_request(number, |req| req.comments.clone())
    }

    fn commits(&self, number: u64) -> Result<Vec<Commit>, ForgeError> {
        self.injected("commits")?;
        self.with_request(number, |req| req.commits.clone())
    }

    fn labels(&self, number: u64) -> Result<BTreeSet<String>, ForgeError> {
        self.injected("labels")?;
        self.with_request(number, |req| req.labels.clone())
    }

    fn reactions(&self, comment_id: u64) -> Result<BTreeSet<String>, ForgeError> {
        self.injected("reactions")?;
        self.with_comment(comment_id, |req| {
            req.reactions.get(&comment_id).cloned().unwrap_or_default()
        })
    }

    fn blob_sha(&self, path: &str, commit: &str) -> Result<Option<String>, ForgeError> {
        self.injected("blob_sha")?;
        let state = self.lock();
        let mut cursor = Some(commit.to_string());
        while let Some(sha) = cursor {
            let Some(c) = find_commit(&state, &sha) else {
                return Ok(None);
            };
            if let Some(file) = c.files.iter().find(|f| f.path == path) {
                return Ok(file.blob.clone());
            }
            cursor = c.parents.first().cloned();
        }
        Ok(None)
    }

    fn diff(&self, base: &str, head: &str) -> Result<BTreeSet<FileChange>, ForgeError> {
        self.injected("diff")?;
        let state = self.lock();
        Ok(net_changes(&state, base, head)?
            .into_iter()
            .map(|(path, blob)| FileChange { path, blob })
            .collect())
    }

    fn create_comment(&self, number: u64, body: &str) -> Result<u64, ForgeError> {
        self.injected("create_comment")?;
        let mut state = self.lock();
        if !state.requests.contains_key(&number) {
            return Err(ForgeError::NotFound(format!("request #{}", number)));
        }
        let id = next_id(&mut state);
        let author = state.bot_login.clone();
        if let Some(req) = state.requests.get_mut(&number) {
            let created_at = req
                .comments
                .iter()
                .map(|c| c.created_at)
                .max()
                .map_or_else(time::now_utc, |latest| latest.max(time::now_utc()));
            req.comments.push(Comment {
                id,
                author,
                created_at,
                body: body.to_string(),
            });
        }
        Ok(id)
    }

    fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), ForgeError> {
        self.injected("update_comment")?;
        self.with_comment(comment_id, |req| {
            if let Some(c) = req.comments.iter_mut().find(|c| c.id == comment_id) {
                c.body = body.to_string();
            }
        })
    }

    fn delete_comment(&self, comment_id: u64) -> Result<(), ForgeError> {
        self.injected("delete_comment")?;
        self.with_comment(comment_id, |req| {
            req.comments.retain(|c| c.id != comment_id);
            req.reactions.remove(&comment_id);
        })
    }

    fn add_label(&self, number: u64, label: &str) -> Result<(), ForgeError> {
        self.injected("add_label")?;
        self.with_request(number, |req| {
            req.labels.insert(label.to_string());
        })
    }

    fn remove_label(&self, number: u64, label: &str) -> Result<(), ForgeError> {
        self.injected("remove_label")?;
        self.with_request(number, |req| {
            req.labels.remove(label);
        })
    }

    fn create_reaction(&self, comment_id: u64, content: &str) -> Result<(), ForgeError> {
        self.injected("create_reaction")?;
        self.with_comment(comment_id, |req| {
            req.reactions
                .entry(comment_id)
                .or_default()
                .insert(content.to_string());
        })
    }

    fn delete_reaction(&self, comment_id: u64, content: &str) -> Result<(), ForgeError> {
        self.injected("delete_reaction")?;
        self.with_comment(comment_id, |req| {
            if let Some(set) = req.reactions.get_mut(&comment_id) {
                set.remove(content);
            }
        })
    }
}
