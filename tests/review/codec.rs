#[path = "../support/mod.rs"]
mod support;

use signbot::core::error::SignbotError;
use signbot::review::cache::{BotCache, CommentEntry, CommentKind, CommitEntry, FileVersion, FvKey};
use signbot::review::codec::{CACHE_MARKER, CacheCodec, CacheWrite};
use std::collections::BTreeSet;
use support::at;

fn sample_cache(comments: u64) -> BotCache {
    let mut cache = BotCache::default();
    let key = FvKey::new("Core/src/a.cc", Some("0123456789abcdef"));
    cache.fv.insert(
        key.clone(),
        FileVersion {
            ts: at(0),
            cats: BTreeSet::from(["core".to_string()]),
        },
    );
    cache.commits.insert(
        "c1".to_string(),
        CommitEntry {
            ts: at(0),
            fv: BTreeSet::from([key.clone()]),
            squashed: false,
            unresolved: false,
        },
    );
    for id in 1..=comments {
        let mut entry = CommentEntry::new(at(id as i64), "+1", CommentKind::Approve);
        entry.cats = BTreeSet::from(["core".to_string()]);
        entry.fv = BTreeSet::from([key.clone()]);
        entry.user = Some(format!("reviewer{}", id));
        cache.comments.insert(id, entry);
        cache.emoji.insert(id, "+1".to_string());
    }
    cache.head = Some("c1".to_string());
    cache
}

#[test]
fn test_small_cache_is_plain_json() {
    let codec = CacheCodec::new(55_000);
    let cache = sample_cache(3);
    let chunks = codec.encode(&cache).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0], CacheCodec::canonical_json(&cache).unwrap());
    assert!(chunks[0].starts_with('{'));

    let decoded = codec.decode(&chunks).unwrap();
    assert_eq!(decoded.cache, cache);
    assert!(decoded.warnings.is_empty());
    assert!(!decoded.migrated);
}

#[test]
fn test_large_cache_is_compressed_and_chunked() {
    let codec = CacheCodec::new(128);
    let cache = sample_cache(200);
    let chunks = codec.encode(&cache).unwrap();
    assert!(chunks.len() > 1);
    assert!(chunks[0].starts_with("b64:"));
    assert!(chunks.iter().all(|c| c.len() <= 128));

    let bodies = codec.bodies(&cache).unwrap();
    assert_eq!(bodies.len(), chunks.len());
    let extracted: Vec<&str> = bodies.iter().filter_map(|b| CacheCodec::extract(b)).collect();
    assert_eq!(extracted, chunks);
    let parts: Vec<_> = bodies.iter().filter_map(|b| CacheCodec::part(b)).collect();
    assert!(parts.iter().all(|p| p.generation == parts[0].generation));
    assert_eq!(parts.last().unwrap().index + 1, parts[0].total);
    assert_eq!(codec.decode_bodies(&bodies).unwrap().cache, cache);
}

#[test]
fn test_canonical_json_is_stable() {
    let cache = sample_cache(5);
    let again: BotCache =
        serde_json::from_str(&CacheCodec::canonical_json(&cache).unwrap()).unwrap();
    assert_eq!(
        CacheCodec::canonical_json(&cache).unwrap(),
        CacheCodec::canonical_json(&again).unwrap()
    );
}

#[test]
fn test_legacy_cache_is_migrated() {
    let legacy = r#"{
        "emoji": {"17": "+1"},
        "signatures": {"17": "c1", "oops": "c1"},
        "commits": {
            "c1": {"time": 1704067200, "files": ["Core/a.cc", "DB/b.cc"], "squashed": false}
        },
        "last_seen_sha": "c1"
    }"#;
    let decoded = CacheCodec::new(55_000).decode(&[legacy]).unwrap();
    assert!(decoded.migrated);
    assert_eq!(decoded.warnings.len(), 1);

    let cache = decoded.cache;
    let commit = &cache.commits["c1"];
    assert!(commit.unresolved);
    assert_eq!(commit.ts, at(0));
    assert!(commit.fv.contains(&FvKey::bare("Core/a.cc")));
    let entry = &cache.comments[&17];
    assert_eq!(entry.ctype, CommentKind::Legacy);
    assert_eq!(entry.arg.as_deref(), Some("c1"));
    assert_eq!(entry.ts, at(0));
    assert_eq!(cache.emoji[&17], "+1");
    assert_eq!(cache.head.as_deref(), Some("c1"));
}

#[test]
fn test_migrated_cache_is_written_in_current_form() {
    let legacy = r#"{
        "signatures": {},
        "commits": {"c1": {"time": "2024-01-01T00:00:00Z", "files": []}}
    }"#;
    let codec = CacheCodec::new(55_000);
    let migrated = codec.decode(&[legacy]).unwrap().cache;
    let reencoded = codec.encode(&migrated).unwrap();
    let decoded = codec.decode(&reencoded).unwrap();
    assert!(!decoded.migrated);
    assert_eq!(decoded.cache, migrated);
}

#[test]
fn test_malformed_entries_are_dropped_with_warnings() {
    let raw = r#"{
        "fv": {},
        "comments": {
            "5": {"ts": "2024-01-01T00:00:00Z", "first_line": "+1", "ctype": "+1"},
            "x": {"ts": "2024-01-01T00:00:00Z", "first_line": "+1", "ctype": "+1"},
            "6": {"ts": "yesterday", "first_line": "+1", "ctype": "+1"},
            "7": {"ts": "2024-01-01T00:00:00Z", "first_line": "?", "ctype": "shrug"}
        },
        "commits": "nonsense"
    }"#;
    let decoded = CacheCodec::new(55_000).decode(&[raw]).unwrap();
    assert_eq!(decoded.cache.comments.len(), 1);
    assert!(decoded.cache.comments.contains_key(&5));
    assert!(decoded.cache.commits.is_empty());
    assert_eq!(decoded.warnings.len(), 4);
}

#[test]
fn test_garbage_payload_is_an_error() {
    let codec = CacheCodec::new(55_000);
    for payload in ["b64:%%%", "{not json", "[1, 2, 3]"] {
        let err = codec.decode(&[payload]).unwrap_err();
        assert!(matches!(err, SignbotError::CodecError(_)), "{}", payload);
    }
}

#[test]
fn test_plan_writes_the_new_generation_before_deleting_the_old() {
    let codec = CacheCodec::new(128);
    let before = codec.bodies(&sample_cache(200)).unwrap();
    let existing: Vec<(u64, String)> = before
        .iter()
        .enumerate()
        .map(|(i, b)| (100 + i as u64, b.clone()))
        .collect();
    assert!(CacheCodec::plan(&existing, &before).is_empty());

    let after = codec.bodies(&sample_cache(201)).unwrap();
    let plan = CacheCodec::plan(&existing, &after);
    let first_delete = plan
        .iter()
        .position(|w| matches!(w, CacheWrite::Delete { .. }))
        .unwrap();
    assert_eq!(first_delete, after.len());
    assert!(plan[..first_delete].iter().all(|w| matches!(w, CacheWrite::Create { .. })));
    assert_eq!(plan.len() - first_delete, existing.len());

    let smaller = codec.bodies(&BotCache::default()).unwrap();
    let plan = CacheCodec::plan(&existing, &smaller);
    assert!(matches!(plan[0], CacheWrite::Create { .. }));
    assert_eq!(plan.len(), existing.len() + 1);
}

#[test]
fn test_interrupted_generation_keeps_the_previous_cache() {
    let codec = CacheCodec::new(128);
    let old = sample_cache(200);
    let new = sample_cache(230);
    let mut thread = codec.bodies(&old).unwrap();
    let next = codec.bodies(&new).unwrap();
    assert!(next.len() > 2);
    thread.extend(next.iter().take(2).cloned());

    let decoded = codec.decode_bodies(&thread).unwrap();
    assert_eq!(decoded.cache, old);
    assert!(decoded.warnings.iter().any(|w| w.contains("incomplete")));

    // Once complete, the newer generation wins even before the old one is gone.
    thread.extend(next.iter().skip(2).cloned());
    let decoded = codec.decode_bodies(&thread).unwrap();
    assert_eq!(decoded.cache, new);
    assert!(decoded.warnings.is_empty());
}

#[test]
fn test_corrupt_part_invalidates_its_generation() {
    let codec = CacheCodec::new(128);
    let mut bodies = codec.bodies(&sample_cache(200)).unwrap();
    bodies[1] = bodies[1].replacen("<!-- bot cache: ", "<!-- bot cache: AAAA", 1);

    let err = codec.decode_bodies(&bodies).unwrap_err();
    assert!(matches!(err, SignbotError::CodecError(ref msg) if msg.contains("digest")));
}

#[test]
fn test_unframed_bodies_still_decode() {
    let codec = CacheCodec::new(55_000);
    let cache = sample_cache(2);
    let json = CacheCodec::canonical_json(&cache).unwrap();
    let body = format!("{}\n<!-- bot cache: {} -->", CACHE_MARKER, json);
    assert_eq!(codec.decode_bodies(&[body]).unwrap().cache, cache);
}
