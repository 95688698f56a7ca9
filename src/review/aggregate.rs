//! Request-level verdict: labels and merge eligibility.
//!
//! Pure functions only. Reading current labels and applying the diff is the
//! caller's job.

use crate::core::config::{self, BotConfig, LimitsConfig};
use crate::core::error::SignbotError;
use crate::review::directory::NEW_PACKAGE_CATEGORY;
use crate::review::ledger::CategoryState;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const TESTS_CATEGORY: &str = "tests";
pub const HOLD_LABEL: &str = "hold";
pub const URGENT_LABEL: &str = "urgent";
pub const BACKPORT_LABEL: &str = "backport";

const STATE_SUFFIXES: [&str; 3] = ["-pending", "-approved", "-rejected"];

#[derive(Debug, Clone)]
struct PolicyRule {
    branch: Regex,
    protected_only: bool,
    pre_checks: BTreeSet<String>,
    required: BTreeSet<String>,
}

/// Required-category rules, compiled once per deployment.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub pre_checks: BTreeSet<String>,
    pub required: BTreeSet<String>,
}

impl PolicyTable {
    pub fn from_config(config: &BotConfig) -> Result<Self, SignbotError> {
        let rules = config
            .policy
            .iter()
            .map(|rule| {
                Ok(PolicyRule {
                    branch: config::compile(&rule.branch, "policy branch")?,
                    protected_only: rule.protected_only,
                    pre_checks: rule.pre_checks.iter().cloned().collect(),
                    required: rule.required.iter().cloned().collect(),
                })
            })
            .collect::<Result<Vec<_>, SignbotError>>()?;
        Ok(Self { rules })
    }

    /// Union of every rule that applies to the target.
    pub fn requirements(&self, base_branch: &str, protected: bool) -> Requirements {
        let mut out = Requirements::default();
        for rule in &self.rules {
            if rule.protected_only && !protected {
                continue;
            }
            if !rule.branch.is_match(base_branch) {
                continue;
            }
            out.pre_checks.extend(rule.pre_checks.iter().cloned());
            out.required.extend(rule.required.iter().cloned());
        }
        out
    }
}

/// What a size limit counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeLimit {
    Commits,
    Files,
}

impl SizeLimit {
    pub fn label(self) -> &'static str {
        match self {
            SizeLimit::Commits => "too-many-commits",
            SizeLimit::Files => "too-many-files",
        }
    }

    /// `(warn, fail)` thresholds.
    pub fn thresholds(self, limits: &LimitsConfig) -> (usize, usize) {
        match self {
            SizeLimit::Commits => (limits.commits_warn, limits.commits_fail),
            SizeLimit::Files => (limits.files_warn, limits.files_fail),
        }
    }

    /// An override lifts the warn level only.
    pub fn blocks(self, count: usize, limits: &LimitsConfig, overridden: bool) -> bool {
        let (warn, fail) = self.thresholds(limits);
        count >= fail || (count >= warn && !overridden)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub pre_checks: BTreeSet<String>,
    /// Every category that must be approved before merging.
    pub required: BTreeSet<String>,
    pub hold: bool,
    pub urgent: bool,
    /// `ignore tests-rejected` issued after the newest commit.
    pub tests_override: bool,
    pub size_blocks: BTreeSet<SizeLimit>,
    /// Informational labels (type labels, `backport`). They never block.
    pub extra_labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
    TestsPending,
    SignaturesPending,
    FullySigned,
}

impl RequestState {
    pub fn label(self) -> &'static str {
        match self {
            RequestState::TestsPending => "tests-pending",
            RequestState::SignaturesPending => "signatures-pending",
            RequestState::FullySigned => "fully-signed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub states: BTreeMap<String, CategoryState>,
    pub labels: BTreeSet<String>,
    pub merge_eligible: bool,
    pub state: RequestState,
}

pub fn aggregate(states: &BTreeMap<String, CategoryState>, policy: &Policy) -> Verdict {
    let mut effective = states.clone();
    for cat in policy.required.iter().chain(policy.pre_checks.iter()) {
        effective.entry(cat.clone()).or_insert(CategoryState::Pending);
    }

    let for_merge = |cat: &str, state: CategoryState| {
        if cat == TESTS_CATEGORY && state == CategoryState::Rejected && policy.tests_override {
            CategoryState::Approved
        } else {
            state
        }
    };
    let all_approved = policy
        .required
        .iter()
        .chain(policy.pre_checks.iter())
        .all(|cat| for_merge(cat, effective[cat]) == CategoryState::Approved);
    let new_package = effective.contains_key(NEW_PACKAGE_CATEGORY);
    let merge_eligible =
        all_approved && !policy.hold && !new_package && policy.size_blocks.is_empty();

    let pre_checks_done = policy
        .pre_checks
        .iter()
        .all(|cat| effective[cat] == CategoryState::Approved);
    let state = if !pre_checks_done {
        RequestState::TestsPending
    } else if merge_eligible {
        RequestState::FullySigned
    } else {
        RequestState::SignaturesPending
    };

    // `tests-pending` doubles as the request state; while it is set no other
    // `tests-*` label may sit next to it.
    let mut labels: BTreeSet<String> = effective
        .iter()
        .filter(|(cat, _)| !(state == RequestState::TestsPending && *cat == TESTS_CATEGORY))
        .map(|(cat, st)| format!("{}-{}", cat, st))
        .collect();
    labels.insert(state.label().to_string());
    if policy.hold {
        labels.insert(HOLD_LABEL.to_string());
    }
    if policy.urgent {
        labels.insert(URGENT_LABEL.to_string());
    }
    labels.extend(policy.size_blocks.iter().map(|l| l.label().to_string()));
    labels.extend(policy.extra_labels.iter().cloned());

    Verdict {
        states: effective,
        labels,
        merge_eligible,
        state,
    }
}

/// Labels the bot owns and may remove. `urgent` is never taken back.
pub fn is_managed_label(
    label: &str,
    categories: &BTreeSet<String>,
    type_labels: &BTreeSet<String>,
) -> bool {
    if label == HOLD_LABEL || label == BACKPORT_LABEL || type_labels.contains(label) {
        return true;
    }
    if [SizeLimit::Commits, SizeLimit::Files].iter().any(|l| l.label() == label) {
        return true;
    }
    if [
        RequestState::TestsPending,
        RequestState::SignaturesPending,
        RequestState::FullySigned,
    ]
    .iter()
    .any(|s| s.label() == label)
    {
        return true;
    }
    STATE_SUFFIXES.iter().any(|suffix| {
        label
            .strip_suffix(suffix)
            .is_some_and(|cat| categories.contains(cat) || cat == NEW_PACKAGE_CATEGORY)
    })
}

/// `(to_add, to_remove)` moving `current` towards `desired`.
pub fn label_diff(
    current: &BTreeSet<String>,
    desired: &BTreeSet<String>,
    categories: &BTreeSet<String>,
    type_labels: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let add = desired.difference(current).cloned().collect();
    let remove = current
        .iter()
        .filter(|l| !desired.contains(*l) && is_managed_label(l, categories, type_labels))
        .cloned()
        .collect();
    (add, remove)
}
