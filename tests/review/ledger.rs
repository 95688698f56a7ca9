#[path = "../support/mod.rs"]
mod support;

use signbot::review::cache::{CommentEntry, CommentKind, FileVersion, FvKey};
use signbot::review::ledger::{CategoryState, SignValue, SignatureLedger};
use std::collections::{BTreeMap, BTreeSet};
use support::at;

fn cats(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn sign(minute: i64, approve: bool, categories: &[&str], fv: &[&FvKey]) -> CommentEntry {
    let kind = if approve { CommentKind::Approve } else { CommentKind::Reject };
    let mut entry = CommentEntry::new(at(minute), if approve { "+1" } else { "-1" }, kind);
    entry.cats = cats(categories);
    entry.fv = fv.iter().map(|k| (*k).clone()).collect();
    entry
}

struct Fixture {
    a: FvKey,
    b: FvKey,
    fv: BTreeMap<FvKey, FileVersion>,
}

fn fixture() -> Fixture {
    let a = FvKey::new("Core/a.cc", Some("b1"));
    let b = FvKey::new("DB/b.cc", Some("b2"));
    let mut fv = BTreeMap::new();
    fv.insert(a.clone(), FileVersion { ts: at(0), cats: cats(&["core"]) });
    fv.insert(b.clone(), FileVersion { ts: at(5), cats: cats(&["db"]) });
    Fixture { a, b, fv }
}

fn relevant(f: &Fixture) -> BTreeMap<FvKey, BTreeSet<String>> {
    f.fv.iter().map(|(k, v)| (k.clone(), v.cats.clone())).collect()
}

#[test]
fn test_last_writer_wins() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    comments.insert(1, sign(10, true, &["core"], &[&f.a]));
    comments.insert(2, sign(20, false, &["core"], &[&f.a]));

    let ledger = SignatureLedger::replay(&comments, &f.fv);
    let entry = ledger.entry(&f.a, "core").unwrap();
    assert_eq!(entry.value, SignValue::Rejected);
    assert_eq!(entry.comment_id, 2);
}

#[test]
fn test_replay_orders_by_time_not_id() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    comments.insert(9, sign(10, false, &["core"], &[&f.a]));
    comments.insert(3, sign(20, true, &["core"], &[&f.a]));

    let ledger = SignatureLedger::replay(&comments, &f.fv);
    assert_eq!(ledger.entry(&f.a, "core").unwrap().value, SignValue::Approved);
}

#[test]
fn test_equal_timestamps_break_ties_by_id() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    comments.insert(5, sign(10, true, &["core"], &[&f.a]));
    comments.insert(4, sign(10, false, &["core"], &[&f.a]));

    let ledger = SignatureLedger::replay(&comments, &f.fv);
    assert_eq!(ledger.entry(&f.a, "core").unwrap().comment_id, 5);
}

#[test]
fn test_signature_older_than_version_does_not_count() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    // b was first seen at minute 5.
    comments.insert(1, sign(3, true, &["db"], &[&f.b]));

    let ledger = SignatureLedger::replay(&comments, &f.fv);
    assert!(ledger.entry(&f.b, "db").is_none());
    assert!(ledger.is_empty());
}

#[test]
fn test_non_sign_entries_are_ignored() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    let mut hold = CommentEntry::new(at(10), "hold", CommentKind::Hold);
    hold.cats = cats(&["core"]);
    hold.fv = BTreeSet::from([f.a.clone()]);
    comments.insert(1, hold);

    assert!(SignatureLedger::replay(&comments, &f.fv).is_empty());
}

#[test]
fn test_category_states_follow_priority() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    comments.insert(1, sign(10, true, &["core"], &[&f.a]));
    comments.insert(2, sign(11, false, &["db"], &[&f.b]));
    let ledger = SignatureLedger::replay(&comments, &f.fv);

    let states = ledger.category_states(&relevant(&f), &BTreeSet::new());
    assert_eq!(states["core"], CategoryState::Approved);
    assert_eq!(states["db"], CategoryState::Rejected);
}

#[test]
fn test_global_category_needs_every_version() {
    let f = fixture();
    let mut comments = BTreeMap::new();
    comments.insert(1, sign(10, true, &["tests"], &[&f.a]));
    let global = cats(&["tests"]);

    let ledger = SignatureLedger::replay(&comments, &f.fv);
    assert_eq!(ledger.category_states(&relevant(&f), &global)["tests"], CategoryState::Pending);

    comments.insert(2, sign(12, true, &["tests"], &[&f.b]));
    let ledger = SignatureLedger::replay(&comments, &f.fv);
    assert_eq!(ledger.category_states(&relevant(&f), &global)["tests"], CategoryState::Approved);
}

#[test]
fn test_global_category_without_versions_is_pending() {
    let ledger = SignatureLedger::default();
    let states = ledger.category_states(&BTreeMap::new(), &cats(&["tests", "orp"]));
    assert_eq!(states.len(), 2);
    assert!(states.values().all(|s| *s == CategoryState::Pending));
}
