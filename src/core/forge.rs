//! The forge boundary: what the engine reads from and writes to the hosting service.

use crate::core::error::ForgeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    #[serde(with = "crate::core::time::iso")]
    pub created_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    /// Blob sha of the file at that commit; absent when deleted or unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(with = "crate::core::time::iso")]
    pub committer_date: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub repository: String,
    pub author: String,
    pub base_branch: String,
    pub base_sha: String,
    pub head_sha: String,
    /// Net changed files of the request, as the forge reports them.
    #[serde(default)]
    pub files: Vec<ChangedFile>,
}

/// One `(path, blob)` pair of a `base..head` diff.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub blob: Option<String>,
}

pub trait Forge: Send + Sync {
    fn pull_request(&self, number: u64) -> Result<PullRequest, ForgeError>;
    /// Comments in creation order.
    fn comments(&self, number: u64) -> Result<Vec<Comment>, ForgeError>;
    /// Commits in request order, oldest first.
    fn commits(&self, number: u64) -> Result<Vec<Commit>, ForgeError>;
    fn labels(&self, number: u64) -> Result<BTreeSet<String>, ForgeError>;
    /// Reactions the bot has placed on a comment.
    fn reactions(&self, comment_id: u64) -> Result<BTreeSet<String>, ForgeError>;
    fn blob_sha(&self, path: &str, commit: &str) -> Result<Option<String>, ForgeError>;
    fn diff(&self, base: &str, head: &str) -> Result<BTreeSet<FileChange>, ForgeError>;

    fn create_comment(&self, number: u64, body: &str) -> Result<u64, ForgeError>;
    fn update_comment(&self, comment_id: u64, body: &str) -> Result<(), ForgeError>;
    fn delete_comment(&self, comment_id: u64) -> Result<(), ForgeError>;
    fn add_label(&self, number: u64, label: &str) -> Result<(), ForgeError>;
    fn remove_label(&self, number: u64, label: &str) -> Result<(), ForgeError>;
    fn create_reaction(&self, comment_id: u64, content: &str) -> Result<(), ForgeError>;
    fn delete_reaction(&self, comment_id: u64, content: &str) -> Result<(), ForgeError>;
}
