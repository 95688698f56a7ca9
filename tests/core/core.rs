#[path = "../support/mod.rs"]
mod support;

use signbot::core::broker::ForgeBroker;
use signbot::core::config::{BotConfig, RetryConfig};
use signbot::core::error::{ForgeError, SignbotError};
use signbot::core::forge::{FileChange, Forge};
use signbot::core::recorded::RecordedForge;
use std::fs;
use std::sync::Arc;
use support::*;
use tempfile::tempdir;

fn no_delay(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 0,
        max_delay_ms: 0,
    }
}

#[test]
fn config_loads_from_disk_and_validates() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("signbot.toml");
    fs::write(&path, CONFIG).expect("write config");

    let config = BotConfig::load(&path).expect("config should load");
    assert_eq!(config.bot_login, "signbot");
    assert_eq!(config.categories.len(), 2);
    assert_eq!(config.retry.max_attempts, 3);
    assert!(!config.is_protected("org/project"));

    let missing = BotConfig::load(&tmp.path().join("absent.toml"));
    assert!(matches!(missing, Err(SignbotError::IoError(_))));

    let broken = BotConfig::from_toml_str("bot_login = \"\"");
    assert!(matches!(broken, Err(SignbotError::ConfigError(_))));
    let broken = BotConfig::from_toml_str("[[policy]]\nbranch = \"[\"\n");
    assert!(matches!(broken, Err(SignbotError::ConfigError(_))));
}

#[test]
fn broker_retries_transient_failures_then_succeeds() {
    let forge = forge_with(vec![commit("c1", BASE, 0, &[("Core/a.cc", "b1")])]);
    forge.inject_failure("labels", ForgeError::Timeout("slow".into()));
    forge.inject_failure("labels", ForgeError::RateLimited("busy".into()));

    let broker = ForgeBroker::new(&forge, no_delay(3), false);
    let labels = broker.read("labels", |f| f.labels(PR)).expect("third attempt succeeds");
    assert!(labels.is_empty());
}

#[test]
fn broker_reports_exhausted_and_permanent_failures() {
    let forge = forge_with(vec![commit("c1", BASE, 0, &[])]);
    let broker = ForgeBroker::new(&forge, no_delay(2), false);

    for _ in 0..2 {
        forge.inject_failure("labels", ForgeError::Timeout("slow".into()));
    }
    let err = broker.read("labels", |f| f.labels(PR)).unwrap_err();
    assert!(matches!(
        err,
        SignbotError::RetriesExhausted { attempts: 2, ref op, .. } if op == "labels"
    ));

    forge.inject_failure("labels", ForgeError::Request("forbidden".into()));
    forge.inject_failure("labels", ForgeError::Request("never reached".into()));
    let err = broker.try_read("labels", |f| f.labels(PR)).unwrap_err();
    assert_eq!(err, ForgeError::Request("forbidden".into()));
}

#[test]
fn broker_dry_run_suppresses_and_audits_writes() {
    let forge = forge_with(vec![commit("c1", BASE, 0, &[])]);
    let broker = ForgeBroker::new(&forge, no_delay(1), true);
    assert!(broker.is_dry_run());

    let result = broker
        .write("add_label", "#42", |f| f.add_label(PR, "core-pending"))
        .expect("dry-run write");
    assert!(result.is_none());
    assert!(forge.labels(PR).unwrap().is_empty());

    let events = broker.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].op, "add_label");
    assert_eq!(events[0].status, "skipped");
    assert!(ulid::Ulid::from_string(&events[0].event_id).is_ok());
}

#[test]
fn broker_audits_successful_and_failed_writes() {
    let forge = forge_with(vec![commit("c1", BASE, 0, &[])]);
    let broker = ForgeBroker::new(&forge, no_delay(1), false);

    let id = broker
        .write("create_comment", "#42", |f| f.create_comment(PR, "hello"))
        .expect("write")
        .expect("not dry-run");
    assert_eq!(forge.comments(PR).unwrap()[0].id, id);
    assert_eq!(forge.comments(PR).unwrap()[0].author, BOT);

    forge.inject_failure("delete_comment", ForgeError::Timeout("slow".into()));
    assert!(broker
        .write("delete_comment", "comment", |f| f.delete_comment(id))
        .is_err());

    let statuses: Vec<String> = broker.events().into_iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec!["success".to_string(), "error".to_string()]);
}

#[test]
fn recorded_forge_answers_diffs_and_blobs_from_ancestry() {
    let forge = forge_with(vec![
        commit("c1", BASE, 0, &[("Core/a.cc", "b1"), ("Core/b.cc", "x1")]),
        commit("c2", "c1", 5, &[("Core/a.cc", "b2"), ("Core/b.cc", "")]),
    ]);

    let pr = forge.pull_request(PR).unwrap();
    assert_eq!(pr.head_sha, "c2");
    assert_eq!(pr.files.len(), 2);

    assert_eq!(forge.blob_sha("Core/a.cc", "c2").unwrap().as_deref(), Some("b2"));
    assert_eq!(forge.blob_sha("Core/a.cc", "c1").unwrap().as_deref(), Some("b1"));
    assert_eq!(forge.blob_sha("Core/b.cc", "c2").unwrap(), None);
    assert_eq!(forge.blob_sha("Core/zzz.cc", "c2").unwrap(), None);

    let diff = forge.diff(BASE, "c2").unwrap();
    assert!(diff.contains(&FileChange {
        path: "Core/a.cc".into(),
        blob: Some("b2".into())
    }));
    assert!(diff.contains(&FileChange {
        path: "Core/b.cc".into(),
        blob: None
    }));

    forge.force_push(PR, vec![commit("s1", BASE, 10, &[("Core/a.cc", "b2")])]);
    // Rewritten commits stay reachable.
    assert_eq!(forge.diff(BASE, "c2").unwrap().len(), 2);
    assert_eq!(forge.pull_request(PR).unwrap().files.len(), 1);
    assert!(matches!(forge.diff(BASE, "nope"), Err(ForgeError::NotFound(_))));
}

#[test]
fn recorded_forge_round_trips_through_disk() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("recording.json");

    let forge = forge_with(vec![commit("c1", BASE, 0, &[("Core/a.cc", "b1")])]);
    let id = forge.post_comment(PR, "alice", at(10), "+1");
    forge.create_reaction(id, "+1").unwrap();
    forge.add_label(PR, "core-approved").unwrap();
    forge.save(&path).expect("save");

    let loaded = RecordedForge::load(&path).expect("load");
    assert_eq!(loaded.request_numbers(), vec![PR]);
    let comments = loaded.comments(PR).unwrap();
    assert_eq!(comments[0].created_at, at(10));
    assert!(loaded.reactions(id).unwrap().contains("+1"));
    assert!(loaded.labels(PR).unwrap().contains("core-approved"));
    // Ids continue after the highest recorded one.
    assert!(loaded.post_comment(PR, "bob", at(11), "-1") > id);
}

#[test]
fn recorded_forge_is_shareable_across_threads() {
    let forge = Arc::new(forge_with(vec![commit("c1", BASE, 0, &[])]));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let forge = Arc::clone(&forge);
            std::thread::spawn(move || forge.post_comment(PR, "alice", at(i), "+1"))
        })
        .collect();
    let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}
