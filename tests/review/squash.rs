#[path = "../support/mod.rs"]
mod support;

use signbot::core::error::ForgeError;
use signbot::core::forge::FileChange;
use signbot::review::cache::{BotCache, CommitEntry, FileVersion, FvKey};
use signbot::review::engine::process_request;
use signbot::review::ledger::CategoryState;
use signbot::review::squash::{self, DiffSource, SquashReconciler};
use std::collections::{BTreeMap, BTreeSet};
use support::*;

/// Two commits, each touching one core file, signed off by alice.
fn signed_two_commit_request() -> signbot::core::recorded::RecordedForge {
    let forge = forge_with(vec![
        commit("c1", BASE, 0, &[("Core/a.cc", "b1")]),
        commit("c2", "c1", 5, &[("Core/b.cc", "b2")]),
    ]);
    forge.post_comment(PR, "alice", at(10), "+1");
    forge
}

#[test]
fn test_pure_squash_keeps_signatures() {
    let ctx = context();
    let forge = signed_two_commit_request();
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.verdict.states["core"], CategoryState::Approved);

    forge.force_push(
        PR,
        vec![commit("s1", BASE, 20, &[("Core/a.cc", "b1"), ("Core/b.cc", "b2")])],
    );
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.head, "s1");
    assert_eq!(report.rewrite_preserved, Some(true));
    assert_eq!(report.verdict.states["core"], CategoryState::Approved);
}

#[test]
fn test_rewrite_with_new_content_needs_new_signatures() {
    let ctx = context();
    let forge = signed_two_commit_request();
    process_request(&ctx, &forge, PR, false).unwrap();

    forge.force_push(
        PR,
        vec![commit("s1", BASE, 20, &[("Core/a.cc", "b1"), ("Core/b.cc", "b9")])],
    );
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.rewrite_preserved, Some(false));
    assert_eq!(report.verdict.states["core"], CategoryState::Pending);
}

#[test]
fn test_reintroduced_content_is_reset() {
    let ctx = context();
    let forge = forge_with(vec![commit("c1", BASE, 0, &[("Core/a.cc", "b1")])]);
    forge.post_comment(PR, "alice", at(5), "+1");
    process_request(&ctx, &forge, PR, false).unwrap();

    forge.push_commits(PR, vec![commit("c2", "c1", 10, &[("Core/a.cc", "b2")])]);
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.verdict.states["core"], CategoryState::Pending);

    // Rewritten back to the originally signed content.
    forge.force_push(PR, vec![commit("s1", BASE, 20, &[("Core/a.cc", "b1")])]);
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.rewrite_preserved, Some(false));
    assert_eq!(report.verdict.states["core"], CategoryState::Pending);
}

#[test]
fn test_diff_failure_is_treated_as_a_content_change() {
    let ctx = context();
    let forge = signed_two_commit_request();
    process_request(&ctx, &forge, PR, false).unwrap();

    forge.force_push(
        PR,
        vec![commit("s1", BASE, 20, &[("Core/a.cc", "b1"), ("Core/b.cc", "b2")])],
    );
    forge.inject_failure("diff", ForgeError::Request("diff unavailable".into()));
    let report = process_request(&ctx, &forge, PR, false).unwrap();
    assert_eq!(report.rewrite_preserved, Some(false));
    assert_eq!(report.verdict.states["core"], CategoryState::Pending);
}

struct FixedDiffs(BTreeMap<String, Result<BTreeSet<FileChange>, ForgeError>>);

impl DiffSource for FixedDiffs {
    fn diff(&self, _base: &str, head: &str) -> Result<BTreeSet<FileChange>, ForgeError> {
        self.0
            .get(head)
            .cloned()
            .unwrap_or_else(|| Err(ForgeError::NotFound(head.to_string())))
    }
}

fn change(path: &str, blob: &str) -> FileChange {
    FileChange {
        path: path.to_string(),
        blob: Some(blob.to_string()),
    }
}

fn entry(minute: i64, keys: &[&FvKey]) -> CommitEntry {
    CommitEntry {
        ts: at(minute),
        fv: keys.iter().map(|k| (*k).clone()).collect(),
        squashed: false,
        unresolved: false,
    }
}

#[test]
fn test_carry_forward_marks_and_merges() {
    let a = FvKey::new("Core/a.cc", Some("b1"));
    let b = FvKey::new("Core/b.cc", Some("b2"));
    let mut cache = BotCache::default();
    cache.commits.insert("c1".into(), entry(0, &[&a]));
    cache.commits.insert("c2".into(), entry(5, &[&b]));
    cache.commits.insert("s1".into(), entry(20, &[&a]));
    cache.head = Some("c2".into());

    let same: BTreeSet<FileChange> = [change("Core/a.cc", "b1"), change("Core/b.cc", "b2")].into();
    let diffs = FixedDiffs(BTreeMap::from([
        ("c2".to_string(), Ok(same.clone())),
        ("s1".to_string(), Ok(same)),
    ]));
    let current = vec![commit("s1", BASE, 20, &[])];
    let outcome = SquashReconciler::new(&diffs).reconcile(&mut cache, BASE, &current);

    assert!(outcome.preserved);
    assert_eq!(outcome.missing, vec!["c1".to_string(), "c2".to_string()]);
    assert!(cache.commits["c1"].squashed);
    assert!(cache.commits["c2"].squashed);
    let head = &cache.commits["s1"];
    assert_eq!(head.ts, at(5));
    assert_eq!(head.fv, BTreeSet::from([a, b]));
}

#[test]
fn test_differing_rewrite_drops_missing_commits() {
    let a = FvKey::new("Core/a.cc", Some("b1"));
    let b = FvKey::new("Core/b.cc", Some("b2"));
    let b9 = FvKey::new("Core/b.cc", Some("b9"));
    let mut cache = BotCache::default();
    cache.commits.insert("c1".into(), entry(0, &[&a, &b]));
    cache.commits.insert("s1".into(), entry(20, &[&a, &b9]));
    cache.head = Some("c1".into());
    cache.fv.insert(a.clone(), FileVersion { ts: at(0), cats: BTreeSet::new() });
    cache.fv.insert(b9.clone(), FileVersion { ts: at(20), cats: BTreeSet::new() });

    let diffs = FixedDiffs(BTreeMap::from([
        ("c1".to_string(), Ok([change("Core/a.cc", "b1"), change("Core/b.cc", "b2")].into())),
        ("s1".to_string(), Ok([change("Core/a.cc", "b1"), change("Core/b.cc", "b9")].into())),
    ]));
    let current = vec![commit("s1", BASE, 20, &[])];
    let outcome = SquashReconciler::new(&diffs).reconcile(&mut cache, BASE, &current);

    assert!(!outcome.preserved);
    assert!(!cache.commits.contains_key("c1"));
    assert_eq!(outcome.changed_paths, BTreeSet::from(["Core/b.cc".to_string()]));
    assert_eq!(outcome.rewritten_at, Some(at(20)));

    // Only unchanged paths keep their first-seen time.
    let relevant = BTreeSet::from([a.clone(), b9.clone()]);
    let moved = squash::reset_changed(&mut cache, &outcome, &relevant, &BTreeSet::new());
    assert!(moved.is_empty());
    assert_eq!(cache.fv[&a].ts, at(0));
}

#[test]
fn test_nothing_missing_is_a_noop() {
    let a = FvKey::new("Core/a.cc", Some("b1"));
    let mut cache = BotCache::default();
    cache.commits.insert("c1".into(), entry(0, &[&a]));
    let diffs = FixedDiffs(BTreeMap::new());
    let current = [commit("c1", BASE, 0, &[])];
    let outcome = SquashReconciler::new(&diffs).reconcile(&mut cache, BASE, &current);
    assert!(outcome.is_noop());
    assert!(!cache.commits["c1"].squashed);
}
