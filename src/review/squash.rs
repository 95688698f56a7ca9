//! History rewrite detection.
//!
//! When commits the cache knows about disappear from the request, the
//! reconciler compares the net diff of the old head with the net diff of the
//! new head. Equal diffs mean a pure squash and every signature survives.
//! Anything else, including a diff that cannot be computed, sends the changed
//! files back to pending.

use crate::core::error::ForgeError;
use crate::core::forge::{Commit, FileChange};
use crate::review::cache::{BotCache, FvKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

pub trait DiffSource {
    fn diff(&self, base: &str, head: &str) -> Result<BTreeSet<FileChange>, ForgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reconciliation {
    /// Cached commits that are no longer on the request.
    pub missing: Vec<String>,
    /// True when the rewrite kept the net content unchanged.
    pub preserved: bool,
    /// Paths whose content differs across the rewrite.
    pub changed_paths: BTreeSet<String>,
    /// Timestamp the reintroduced versions are moved to.
    pub rewritten_at: Option<DateTime<Utc>>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.missing.is_empty()
    }
}

pub struct SquashReconciler<'a> {
    diffs: &'a dyn DiffSource,
}

impl<'a> SquashReconciler<'a> {
    pub fn new(diffs: &'a dyn DiffSource) -> Self {
        Self { diffs }
    }

    /// Must run after the current commits were registered in `cache`.
    pub fn reconcile(
        &self,
        cache: &mut BotCache,
        base_sha: &str,
        current: &[Commit],
    ) -> Reconciliation {
        let current_shas: BTreeSet<&str> = current.iter().map(|c| c.sha.as_str()).collect();
        let missing: Vec<String> = cache
            .commits
            .iter()
            .filter(|(sha, entry)| !entry.squashed && !current_shas.contains(sha.as_str()))
            .map(|(sha, _)| sha.clone())
            .collect();
        if missing.is_empty() {
            return Reconciliation::default();
        }
        let Some(head) = current.last() else {
            log::warn!("request has no commits; dropping {} cached commits", missing.len());
            for sha in &missing {
                cache.commits.remove(sha);
            }
            return Reconciliation {
                missing,
                ..Reconciliation::default()
            };
        };

        let same = match cache.head.as_deref() {
            Some(old_head) => self.same_net_diff(base_sha, old_head, &head.sha),
            None => {
                log::warn!("no previous head recorded; treating rewrite as a content change");
                Err(BTreeSet::new())
            }
        };

        match same {
            Ok(()) => {
                log::info!("pure squash of {} commits onto {}", missing.len(), head.sha);
                carry_forward(cache, &missing, &head.sha);
                Reconciliation {
                    missing,
                    preserved: true,
                    changed_paths: BTreeSet::new(),
                    rewritten_at: None,
                }
            }
            Err(mut changed_paths) => {
                if changed_paths.is_empty() {
                    changed_paths = missing
                        .iter()
                        .filter_map(|sha| cache.commits.get(sha))
                        .flat_map(|e| e.fv.iter().map(|k| k.path().to_string()))
                        .collect();
                }
                log::info!(
                    "history rewrite changed {} paths; {} commits dropped",
                    changed_paths.len(),
                    missing.len()
                );
                for sha in &missing {
                    cache.commits.remove(sha);
                }
                Reconciliation {
                    missing,
                    preserved: false,
                    changed_paths,
                    rewritten_at: Some(head.committer_date),
                }
            }
        }
    }

    /// `Err` carries the symmetric difference of paths; empty when unknown.
    fn same_net_diff(
        &self,
        base: &str,
        old_head: &str,
        new_head: &str,
    ) -> Result<(), BTreeSet<String>> {
        let before = self.diffs.diff(base, old_head);
        let after = self.diffs.diff(base, new_head);
        match (before, after) {
            (Ok(before), Ok(after)) if before == after => Ok(()),
            (Ok(before), Ok(after)) => Err(before
                .symmetric_difference(&after)
                .map(|c| c.path.clone())
                .collect()),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("squash check failed ({}); treating as content change", e);
                Err(BTreeSet::new())
            }
        }
    }
}

fn carry_forward(cache: &mut BotCache, missing: &[String], head_sha: &str) {
    let mut latest_ts = None;
    let mut carried: Vec<FvKey> = Vec::new();
    for sha in missing {
        if let Some(entry) = cache.commits.get_mut(sha) {
            entry.squashed = true;
            latest_ts = latest_ts.max(Some(entry.ts));
            carried.extend(entry.fv.iter().cloned());
        }
    }
    let Some(head) = cache.commits.get_mut(head_sha) else {
        return;
    };
    if let Some(ts) = latest_ts {
        head.ts = head.ts.min(ts);
    }
    let covered: BTreeSet<String> = head.fv.iter().map(|k| k.path().to_string()).collect();
    head.fv
        .extend(carried.into_iter().filter(|k| !covered.contains(k.path())));
}

/// Move reintroduced versions of changed paths to the rewrite time so earlier
/// signatures no longer cover them. Returns the keys that were moved.
pub fn reset_changed(
    cache: &mut BotCache,
    outcome: &Reconciliation,
    relevant: &BTreeSet<FvKey>,
    fresh: &BTreeSet<FvKey>,
) -> Vec<FvKey> {
    let Some(at) = outcome.rewritten_at else {
        return Vec::new();
    };
    let mut moved = Vec::new();
    for key in relevant {
        if fresh.contains(key) || !outcome.changed_paths.contains(key.path()) {
            continue;
        }
        if let Some(fv) = cache.fv.get_mut(key) {
            if fv.ts < at {
                fv.ts = at;
                moved.push(key.clone());
            }
        }
    }
    moved
}
