//! Content-addressed file versions and the commit timeline built from them.

use crate::core::error::SignbotError;
use crate::core::forge::{ChangedFile, Commit};
use crate::review::cache::{BotCache, CommitEntry, FileVersion, FvKey};
use crate::review::directory::CategoryDirectory;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Where blob shas come from when the forge did not report them inline.
pub trait BlobSource {
    /// `Ok(None)` when the file has no blob at that commit (deleted, unknown).
    fn blob_sha(&self, path: &str, commit: &str) -> Result<Option<String>, SignbotError>;
}

pub struct FileVersionRegistry<'a> {
    directory: &'a CategoryDirectory,
    blobs: &'a dyn BlobSource,
    memo: FxHashMap<(String, String), FvKey>,
    fresh: BTreeSet<FvKey>,
}

impl<'a> FileVersionRegistry<'a> {
    pub fn new(directory: &'a CategoryDirectory, blobs: &'a dyn BlobSource) -> Self {
        Self {
            directory,
            blobs,
            memo: FxHashMap::default(),
            fresh: BTreeSet::new(),
        }
    }

    /// Key of `path` as of `commit`. Each pair is looked up at most once per run.
    pub fn resolve(&mut self, path: &str, commit: &str) -> Result<FvKey, SignbotError> {
        let memo_key = (path.to_string(), commit.to_string());
        if let Some(key) = self.memo.get(&memo_key) {
            return Ok(key.clone());
        }
        let blob = self.blobs.blob_sha(path, commit)?;
        let key = FvKey::new(path, blob.as_deref());
        self.memo.insert(memo_key, key.clone());
        Ok(key)
    }

    /// Like `resolve`, but trusts a blob the forge already reported.
    pub fn resolve_file(
        &mut self,
        file: &ChangedFile,
        commit: &str,
    ) -> Result<FvKey, SignbotError> {
        match file.blob.as_deref() {
            Some(blob) if !blob.is_empty() => {
                let key = FvKey::new(&file.path, Some(blob));
                self.memo
                    .insert((file.path.clone(), commit.to_string()), key.clone());
                Ok(key)
            }
            _ => self.resolve(&file.path, commit),
        }
    }

    /// Idempotent. An existing entry keeps its timestamp and frozen categories.
    pub fn register(
        &mut self,
        cache: &mut BotCache,
        key: &FvKey,
        first_seen: DateTime<Utc>,
    ) -> bool {
        if cache.fv.contains_key(key) {
            return false;
        }
        let cats = self.directory.categories_for_path(key.path());
        log::debug!("new file version {} -> {:?}", key, cats);
        cache.fv.insert(
            key.clone(),
            FileVersion {
                ts: first_seen,
                cats,
            },
        );
        self.fresh.insert(key.clone());
        true
    }

    /// Record a commit's file versions unless it is already cached and resolved.
    pub fn register_commit(
        &mut self,
        cache: &mut BotCache,
        commit: &Commit,
    ) -> Result<(), SignbotError> {
        let previous = cache.commits.get(&commit.sha);
        if previous.is_some_and(|e| !e.unresolved) {
            return Ok(());
        }
        let ts = previous.map_or(commit.committer_date, |e| e.ts);
        let mut fv = BTreeSet::new();
        for file in &commit.files {
            let key = self.resolve_file(file, &commit.sha)?;
            self.register(cache, &key, ts);
            fv.insert(key);
        }
        cache.commits.insert(
            commit.sha.clone(),
            CommitEntry {
                ts,
                fv,
                squashed: false,
                unresolved: false,
            },
        );
        Ok(())
    }

    /// Keys created during this run.
    pub fn fresh_keys(&self) -> &BTreeSet<FvKey> {
        &self.fresh
    }
}

/// Drop file versions nothing refers to any more.
pub fn prune_unreferenced(cache: &mut BotCache, keep: &BTreeSet<FvKey>) {
    let mut referenced: BTreeSet<FvKey> = keep.clone();
    for commit in cache.commits.values() {
        referenced.extend(commit.fv.iter().cloned());
    }
    for comment in cache.comments.values() {
        referenced.extend(comment.fv.iter().cloned());
    }
    cache.fv.retain(|key, _| referenced.contains(key));
}

/// Commits of the request, current and squashed, in time order.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone)]
struct TimelineEntry {
    ts: DateTime<Utc>,
    position: usize,
    fv: Vec<FvKey>,
}

impl Timeline {
    pub fn build(cache: &BotCache, current: &[Commit]) -> Self {
        let mut entries = Vec::with_capacity(cache.commits.len());
        let mut seen = BTreeSet::new();
        for (position, commit) in current.iter().enumerate() {
            if let Some(entry) = cache.commits.get(&commit.sha) {
                seen.insert(commit.sha.as_str());
                entries.push(TimelineEntry {
                    ts: entry.ts,
                    position,
                    fv: entry.fv.iter().cloned().collect(),
                });
            }
        }
        for (sha, entry) in &cache.commits {
            if entry.squashed && !seen.contains(sha.as_str()) {
                entries.push(TimelineEntry {
                    ts: entry.ts,
                    position: usize::MAX,
                    fv: entry.fv.iter().cloned().collect(),
                });
            }
        }
        entries.sort_by_key(|e| (e.ts, e.position));
        Self { entries }
    }

    /// Latest version of every path among commits no newer than `at`.
    pub fn snapshot(&self, at: DateTime<Utc>) -> BTreeMap<String, FvKey> {
        let mut out = BTreeMap::new();
        for entry in self.entries.iter().take_while(|e| e.ts <= at) {
            for key in &entry.fv {
                out.insert(key.path().to_string(), key.clone());
            }
        }
        out
    }

    pub fn latest_ts(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.ts).max()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
