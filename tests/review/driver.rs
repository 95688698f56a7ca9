#[path = "../support/mod.rs"]
mod support;

use signbot::core::error::{ForgeError, SignbotError};
use signbot::review::driver::Driver;
use signbot::review::ledger::CategoryState;
use support::*;

const OTHER: u64 = 43;

fn two_requests() -> signbot::core::recorded::RecordedForge {
    let forge = forge_with(vec![commit("c1", BASE, 0, &[("Core/a.cc", "b1")])]);
    forge.open_request(
        pull_request(OTHER),
        vec![commit("d1", BASE, 0, &[("DB/x.cc", "x1")])],
    );
    forge.post_comment(PR, "alice", at(10), "+1");
    forge.post_comment(OTHER, "carol", at(10), "+1");
    forge
}

#[test]
fn test_batch_processes_every_request_once() {
    let ctx = context();
    let forge = two_requests();
    let driver = Driver::new(&ctx, &forge, 4, false);

    let outcomes = driver.run(&[OTHER, PR, OTHER]).unwrap();
    let numbers: Vec<u64> = outcomes.iter().map(|o| o.number).collect();
    assert_eq!(numbers, vec![PR, OTHER]);

    let first = outcomes[0].result.as_ref().unwrap();
    assert_eq!(first.verdict.states["core"], CategoryState::Approved);
    let second = outcomes[1].result.as_ref().unwrap();
    assert_eq!(second.verdict.states["db"], CategoryState::Approved);
    assert!(!second.verdict.states.contains_key("core"));

    let recording = forge.snapshot();
    assert!(recording.requests[&PR].labels.contains("core-approved"));
    assert!(recording.requests[&OTHER].labels.contains("db-approved"));
}

#[test]
fn test_one_failing_request_does_not_stop_the_rest() {
    let ctx = context();
    let forge = two_requests();
    let outcomes = Driver::new(&ctx, &forge, 2, false)
        .run(&[PR, 404, OTHER])
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        if outcome.number == 404 {
            assert!(matches!(
                outcome.result,
                Err(SignbotError::ForgeError(ForgeError::NotFound(_)))
            ));
        } else {
            assert!(outcome.result.is_ok());
        }
    }
}

#[test]
fn test_single_worker_dry_run() {
    let ctx = context();
    let forge = two_requests();
    let outcomes = Driver::new(&ctx, &forge, 0, true)
        .run(&[PR, OTHER])
        .unwrap();
    assert!(outcomes.iter().all(|o| o.result.is_ok()));
    let recording = forge.snapshot();
    assert!(recording.requests.values().all(|r| r.labels.is_empty()));
}
