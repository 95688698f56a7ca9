//! Command grammar.
//!
//! Commands are an ordered list of `(pattern, handler)` pairs. The first entry
//! whose pattern matches the command line and whose handler accepts the
//! comment decides its classification. New commands are added by registering
//! another [`CommandSpec`].

use crate::core::config::BotConfig;
use crate::review::aggregate::SizeLimit;
use crate::review::directory::CategoryDirectory;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sign {
        categories: BTreeSet<String>,
        approve: bool,
    },
    /// Bot-posted test outcome for a specific commit.
    CiResult {
        approve: bool,
        tested_sha: String,
    },
    Assign(BTreeSet<String>),
    Unassign(BTreeSet<String>),
    Hold,
    Unhold,
    Urgent,
    TestRequest(TestRequest),
    Abort,
    IgnoreTestsRejected {
        reason: String,
    },
    TestParameters(BTreeMap<String, String>),
    /// One of the configured type labels.
    Type(String),
    /// Backport of another request.
    Backport(u64),
    /// Lift a warning-level size block.
    CountOverride(SizeLimit),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct TestRequest {
    pub verb: String,
    pub workflows: Option<String>,
    pub with: Option<String>,
    pub queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unrecognized {
    /// Ordinary conversation. No reaction, no state change.
    Chatter,
    /// Looked like a command but the author may not issue it.
    Denied { command: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Command(Command),
    Unrecognized(Unrecognized),
}

impl Classification {
    fn denied(command: &'static str, reason: impl Into<String>) -> Self {
        Classification::Unrecognized(Unrecognized::Denied {
            command,
            reason: reason.into(),
        })
    }
}

/// Everything a handler may consult about the comment being classified.
pub struct Invocation<'a> {
    pub author: &'a str,
    pub at: DateTime<Utc>,
    /// Preprocessed, non-blank lines; the first one is the command line.
    pub lines: &'a [String],
    pub is_bot: bool,
    /// Categories the author may sign for at `at`.
    pub authorized: &'a BTreeSet<String>,
    /// Categories the request needs signed at `at`.
    pub signing: &'a BTreeSet<String>,
    pub directory: &'a CategoryDirectory,
    pub config: &'a BotConfig,
    pub request_author: &'a str,
    pub head_sha: &'a str,
}

impl Invocation<'_> {
    fn is_l2(&self) -> bool {
        !self.authorized.is_empty()
    }

    fn is_manager(&self) -> bool {
        contains_login(&self.config.hold_managers, self.author)
    }

    fn is_tester(&self) -> bool {
        contains_login(&self.config.testers, self.author)
    }
}

fn contains_login(list: &[String], login: &str) -> bool {
    list.iter().any(|l| l.eq_ignore_ascii_case(login))
}

/// `None` declines the match so later entries get a chance.
pub type Handler = fn(&Captures<'_>, &Invocation<'_>) -> Option<Classification>;

pub struct CommandSpec {
    pub name: &'static str,
    pub pattern: Regex,
    /// Whether comments by the bot itself may reach this entry.
    pub allow_bot: bool,
    pub handler: Handler,
}

pub struct CommandRegistry {
    specs: Vec<CommandSpec>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self { specs: Vec::new() }
    }

    /// The standard grammar, in priority order.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("test-parameters", r"^test parameters:?$", false, test_parameters);
        registry.register("ci-result", r"^(?P<sign>[+-])1$", true, ci_result);
        registry.register(
            "sign-all",
            r"^(?:(?P<approve>\+1|approved?|sign(?:ed)?)|(?P<reject>-1|reject(?:ed)?))$",
            false,
            sign_all,
        );
        registry.register(
            "count-override",
            r"^\+(?P<what>commit|file)-count$",
            false,
            count_override,
        );
        registry.register(
            "sign-category",
            r"^(?P<sign>[+-])(?P<cat>[a-z][a-z0-9_-]*)$",
            true,
            sign_category,
        );
        registry.register(
            "assign",
            r"^(?P<un>un)?assign (?P<cats>[a-z0-9_-]+(?:,[a-z0-9_-]+)*)$",
            false,
            assign,
        );
        registry.register("hold", r"^(?P<un>un)?hold$", false, hold);
        registry.register("urgent", r"^urgent$", false, urgent);
        registry.register(
            "test",
            concat!(
                r"^(?P<verb>build|test)",
                r"(?: workflows? (?P<workflows>[a-z0-9_.,-]+))?",
                r"(?: with (?P<with>[a-z0-9_#/.,-]+))?",
                r"(?: for (?P<queue>[a-z0-9_/.-]+))?$"
            ),
            false,
            test_request,
        );
        registry.register("abort", r"^abort(?: test)?$", false, abort);
        registry.register(
            "ignore-tests-rejected",
            concat!(
                r"^ignore tests-rejected (?:with )?",
                r"(?P<reason>manual-override|ib-failure|external-failure)$"
            ),
            false,
            ignore_tests_rejected,
        );
        registry.register("type", r"^type (?P<label>[a-z0-9_-]+)$", false, type_label);
        registry.register(
            "backport",
            r"^backport (?:of )?(?:#|https?://github\.com/[^/]+/[^/]+/pull/)(?P<number>\d+)$",
            false,
            backport,
        );
        registry
    }

    /// Append an entry. Patterns here are compile-time constants.
    pub fn register(
        &mut self,
        name: &'static str,
        pattern: &str,
        allow_bot: bool,
        handler: Handler,
    ) {
        self.specs.push(CommandSpec {
            name,
            pattern: Regex::new(pattern).expect("static regex"),
            allow_bot,
            handler,
        });
    }

    pub fn specs(&self) -> &[CommandSpec] {
        &self.specs
    }

    pub fn classify(&self, inv: &Invocation<'_>) -> Classification {
        let Some(first) = inv.lines.first() else {
            return Classification::Unrecognized(Unrecognized::Chatter);
        };
        for spec in &self.specs {
            if inv.is_bot && !spec.allow_bot {
                continue;
            }
            let Some(caps) = spec.pattern.captures(first) else {
                continue;
            };
            if let Some(result) = (spec.handler)(&caps, inv) {
                log::debug!("comment by {} matched {}", inv.author, spec.name);
                return result;
            }
        }
        Classification::Unrecognized(Unrecognized::Chatter)
    }
}

fn test_parameters(_: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_tester() || inv.is_l2()) {
        return Some(Classification::denied("test-parameters", "not a tester"));
    }
    let mut params = BTreeMap::new();
    for line in &inv.lines[1..] {
        let line = line.trim_start_matches(['-', '*', ' ']);
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            return Some(Classification::denied(
                "test-parameters",
                format!("malformed parameter line {:?}", line),
            ));
        };
        params.insert(key.trim().to_string(), value.trim().to_string());
    }
    if params.is_empty() {
        return Some(Classification::denied("test-parameters", "no parameters given"));
    }
    Some(Classification::Command(Command::TestParameters(params)))
}

fn ci_result(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !inv.is_bot {
        return None;
    }
    let approve = &caps["sign"] == "+";
    let tested_sha = inv.lines[1..]
        .iter()
        .find_map(|l| l.strip_prefix("tested at:"))
        .map(|s| s.trim().to_string())?;
    if tested_sha != "unknown" && !tested_sha.eq_ignore_ascii_case(inv.head_sha) {
        log::debug!("ignoring test result for stale commit {}", tested_sha);
        return Some(Classification::Unrecognized(Unrecognized::Chatter));
    }
    Some(Classification::Command(Command::CiResult { approve, tested_sha }))
}

fn sign_all(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    let approve = caps.name("approve").is_some();
    let categories: BTreeSet<String> = inv
        .authorized
        .intersection(inv.signing)
        .cloned()
        .collect();
    if categories.is_empty() {
        return Some(Classification::denied(
            "sign-all",
            "author signs for none of the request's categories",
        ));
    }
    Some(Classification::Command(Command::Sign { categories, approve }))
}

fn sign_category(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    let category = &caps["cat"];
    if !inv.directory.is_known(category) {
        return None;
    }
    if !inv.authorized.contains(category) {
        return Some(Classification::denied(
            "sign-category",
            format!("not authorized for {}", category),
        ));
    }
    Some(Classification::Command(Command::Sign {
        categories: BTreeSet::from([category.to_string()]),
        approve: &caps["sign"] == "+",
    }))
}

fn assign(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_l2() || inv.is_manager()) {
        return Some(Classification::denied("assign", "not a reviewer"));
    }
    let categories: BTreeSet<String> = caps["cats"]
        .split(',')
        .filter(|c| inv.directory.is_known(c))
        .map(str::to_string)
        .collect();
    if categories.is_empty() {
        return Some(Classification::denied("assign", "no known category given"));
    }
    Some(Classification::Command(if caps.name("un").is_some() {
        Command::Unassign(categories)
    } else {
        Command::Assign(categories)
    }))
}

fn hold(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_l2() || inv.is_manager()) {
        return Some(Classification::denied("hold", "not a reviewer or hold manager"));
    }
    Some(Classification::Command(if caps.name("un").is_some() {
        Command::Unhold
    } else {
        Command::Hold
    }))
}

fn urgent(_: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if inv.is_l2() || inv.is_manager() || inv.author.eq_ignore_ascii_case(inv.request_author) {
        return Some(Classification::Command(Command::Urgent));
    }
    Some(Classification::denied("urgent", "not a reviewer or the request author"))
}

fn test_request(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_tester() || inv.is_l2()) {
        return Some(Classification::denied("test", "not a tester"));
    }
    let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());
    Some(Classification::Command(Command::TestRequest(TestRequest {
        verb: caps["verb"].to_string(),
        workflows: group("workflows"),
        with: group("with"),
        queue: group("queue"),
    })))
}

fn abort(_: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_tester() || inv.is_l2()) {
        return Some(Classification::denied("abort", "not a tester"));
    }
    Some(Classification::Command(Command::Abort))
}

fn ignore_tests_rejected(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_l2() || inv.is_manager()) {
        return Some(Classification::denied("ignore-tests-rejected", "not a reviewer"));
    }
    Some(Classification::Command(Command::IgnoreTestsRejected {
        reason: caps["reason"].to_string(),
    }))
}

fn count_override(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !contains_login(&inv.config.count_overriders, inv.author) {
        return Some(Classification::denied("count-override", "may not lift size limits"));
    }
    let limit = match &caps["what"] {
        "commit" => SizeLimit::Commits,
        _ => SizeLimit::Files,
    };
    Some(Classification::Command(Command::CountOverride(limit)))
}

fn type_label(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    let wanted = &caps["label"];
    match inv
        .config
        .type_labels
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(wanted))
    {
        Some(t) => Some(Classification::Command(Command::Type(t.name.clone()))),
        None => Some(Classification::denied("type", format!("unknown type label {}", wanted))),
    }
}

fn backport(caps: &Captures<'_>, inv: &Invocation<'_>) -> Option<Classification> {
    if !(inv.is_l2() || inv.is_manager() || inv.author.eq_ignore_ascii_case(inv.request_author)) {
        return Some(Classification::denied("backport", "not a reviewer or the request author"));
    }
    let number = caps["number"].parse().ok()?;
    Some(Classification::Command(Command::Backport(number)))
}
