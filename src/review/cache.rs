//! The bot cache: everything a run derives, in the shape it is persisted.
//!
//! All maps are ordered so that serialising an unchanged cache twice gives
//! byte-identical text. Entries reference each other only through stable
//! keys (`FvKey`, comment id, commit sha).

use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// `<path>::<blob>` or, when the blob is unknown, the bare path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FvKey(String);

impl FvKey {
    pub fn new(path: &str, blob: Option<&str>) -> Self {
        match blob {
            Some(b) if !b.is_empty() => FvKey(format!("{}::{}", path, b)),
            _ => FvKey(path.to_string()),
        }
    }

    pub fn bare(path: &str) -> Self {
        FvKey(path.to_string())
    }

    /// Rebuild a key from its cached text form.
    pub fn parse(raw: &str) -> Self {
        FvKey(raw.to_string())
    }

    pub fn path(&self) -> &str {
        self.0.rsplit_once("::").map_or(self.0.as_str(), |(p, _)| p)
    }

    pub fn blob(&self) -> Option<&str> {
        self.0.rsplit_once("::").map(|(_, b)| b)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a cached comment did. The serialised names are part of the cache format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommentKind {
    #[serde(rename = "+1")]
    Approve,
    #[serde(rename = "-1")]
    Reject,
    #[serde(rename = "assign")]
    Assign,
    #[serde(rename = "unassign")]
    Unassign,
    #[serde(rename = "hold")]
    Hold,
    #[serde(rename = "unhold")]
    Unhold,
    #[serde(rename = "urgent")]
    Urgent,
    #[serde(rename = "test")]
    TestRequest,
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "ignore-tests-rejected")]
    IgnoreTestsRejected,
    #[serde(rename = "test-parameters")]
    TestParameters,
    #[serde(rename = "type")]
    Type,
    #[serde(rename = "backport")]
    Backport,
    #[serde(rename = "+commit-count")]
    CommitCountOverride,
    #[serde(rename = "+file-count")]
    FileCountOverride,
    #[serde(rename = "denied")]
    Denied,
    /// Migrated from the old schema; must be classified again.
    #[serde(rename = "legacy")]
    Legacy,
}

impl CommentKind {
    pub fn is_sign(self) -> bool {
        matches!(self, CommentKind::Approve | CommentKind::Reject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    #[serde(with = "time::iso")]
    pub ts: DateTime<Utc>,
    /// Frozen at first sighting.
    #[serde(default)]
    pub cats: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEntry {
    #[serde(with = "time::iso")]
    pub ts: DateTime<Utc>,
    pub first_line: String,
    pub ctype: CommentKind,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub cats: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fv: BTreeSet<FvKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
}

impl CommentEntry {
    pub fn new(ts: DateTime<Utc>, first_line: &str, ctype: CommentKind) -> Self {
        Self {
            ts,
            first_line: first_line.to_string(),
            ctype,
            cats: BTreeSet::new(),
            fv: BTreeSet::new(),
            user: None,
            locked: false,
            arg: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    #[serde(with = "time::iso")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub fv: BTreeSet<FvKey>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub squashed: bool,
    /// File list came from the old schema and still needs blob lookups.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unresolved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCache {
    #[serde(default)]
    pub emoji: BTreeMap<u64, String>,
    #[serde(default)]
    pub fv: BTreeMap<FvKey, FileVersion>,
    #[serde(default)]
    pub comments: BTreeMap<u64, CommentEntry>,
    #[serde(default)]
    pub commits: BTreeMap<String, CommitEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

impl BotCache {
    pub fn is_empty(&self) -> bool {
        self.emoji.is_empty()
            && self.fv.is_empty()
            && self.comments.is_empty()
            && self.commits.is_empty()
            && self.head.is_none()
    }

    /// Timestamp of the newest commit the request has ever carried.
    pub fn latest_commit_ts(&self) -> Option<DateTime<Utc>> {
        self.commits.values().map(|c| c.ts).max()
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}
