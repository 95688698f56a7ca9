//! One invocation for one request.
//!
//! Read everything, compute in memory, write once. All reads happen before
//! the first write, and the cache is persisted last, so a run that fails
//! part-way leaves the previous cache as the durable state.

use crate::core::broker::{ForgeBroker, WriteEvent};
use crate::core::error::{ForgeError, SignbotError};
use crate::core::forge::{Comment, Commit, FileChange, Forge, PullRequest};
use crate::core::time;
use crate::review::aggregate::{
    self, BACKPORT_LABEL, Policy, Requirements, SizeLimit, TESTS_CATEGORY, Verdict,
};
use crate::review::cache::{BotCache, CommentEntry, CommentKind, FvKey};
use crate::review::classifier::RequestScope;
use crate::review::codec::{CacheCodec, CacheWrite};
use crate::review::commands::{Classification, Command, TestRequest, Unrecognized};
use crate::review::context::Context;
use crate::review::directory::CategoryDirectory;
use crate::review::file_versions::{self, BlobSource, FileVersionRegistry, Timeline};
use crate::review::ledger::SignatureLedger;
use crate::review::squash::{self, DiffSource, SquashReconciler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const APPROVE_REACTION: &str = "+1";
const REJECT_REACTION: &str = "-1";

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub number: u64,
    pub head: String,
    pub verdict: Verdict,
    /// Test requests first seen in this run.
    pub test_requests: Vec<TestRequest>,
    pub test_parameters: Vec<BTreeMap<String, String>>,
    pub abort_requested: bool,
    /// Request number given by the newest `backport of #N`.
    pub backport_of: Option<u64>,
    /// `Some(preserved)` when a history rewrite was reconciled.
    pub rewrite_preserved: Option<bool>,
    pub warnings: Vec<String>,
    pub writes: Vec<WriteEvent>,
    /// Short sha256 of the persisted cache text.
    pub cache_fingerprint: String,
}

impl BlobSource for ForgeBroker<'_> {
    fn blob_sha(&self, path: &str, commit: &str) -> Result<Option<String>, SignbotError> {
        match self.read("blob_sha", |f| f.blob_sha(path, commit)) {
            Ok(blob) => Ok(blob),
            Err(SignbotError::ForgeError(ForgeError::NotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl DiffSource for ForgeBroker<'_> {
    fn diff(&self, base: &str, head: &str) -> Result<BTreeSet<FileChange>, ForgeError> {
        self.try_read("diff", |f| f.diff(base, head))
    }
}

#[derive(Debug, Clone)]
struct Hold {
    user: String,
    cats: BTreeSet<String>,
}

/// Effects of the comment pass that are not sign-offs.
#[derive(Debug, Default)]
struct PassState {
    holds: Vec<Hold>,
    urgent: bool,
    tests_override_at: Option<DateTime<Utc>>,
    reactions: BTreeMap<u64, &'static str>,
    test_requests: Vec<TestRequest>,
    test_parameters: Vec<BTreeMap<String, String>>,
    abort_requested: bool,
    type_labels: BTreeSet<String>,
    backport_of: Option<u64>,
    count_overrides: BTreeSet<SizeLimit>,
}

pub fn process_request(
    ctx: &Context,
    forge: &dyn Forge,
    number: u64,
    dry_run: bool,
) -> Result<RunReport, SignbotError> {
    let broker = ForgeBroker::new(forge, ctx.config.retry.clone(), dry_run);

    let pr = broker.read("pull_request", |f| f.pull_request(number))?;
    let thread = broker.read("comments", |f| f.comments(number))?;
    let mut commits = broker.read("commits", |f| f.commits(number))?;
    let labels = broker.read("labels", |f| f.labels(number))?;
    for commit in &mut commits {
        commit.committer_date = time::truncate_secs(commit.committer_date);
    }
    let Some(head_commit) = commits.last().cloned() else {
        return Err(SignbotError::ValidationError(format!(
            "request #{} has no commits",
            number
        )));
    };

    let (mut technical, mut human): (Vec<Comment>, Vec<Comment>) =
        thread.into_iter().partition(|c| {
            ctx.classifier.is_bot(&c.author) && CacheCodec::is_cache_body(&c.body)
        });
    technical.sort_by_key(|c| (c.created_at, c.id));
    for comment in &mut human {
        comment.created_at = time::truncate_secs(comment.created_at);
    }
    human.sort_by_key(|c| (c.created_at, c.id));

    let mut warnings = Vec::new();
    let mut cache = load_cache(ctx, &technical, &mut warnings);

    let relevant = register_history(ctx, &broker, &mut cache, &pr, &commits, &head_commit)?;
    let rewrite_preserved = relevant.rewrite_preserved;
    let relevant_keys = relevant.keys;

    let timeline = Timeline::build(&cache, &commits);
    let newest_commit = timeline.latest_ts();
    if let Some(newest) = newest_commit {
        for entry in cache.comments.values_mut() {
            if newest > entry.ts {
                entry.locked = true;
            }
        }
    }

    let requirements = ctx
        .policy
        .requirements(&pr.base_branch, ctx.config.is_protected(&pr.repository));
    let mut directory = ctx.directory.clone();
    let mut pass = PassState::default();
    {
        let mut walker = CommentPass {
            ctx,
            pr: &pr,
            requirements: &requirements,
            timeline: &timeline,
            relevant: &relevant_keys,
            directory: &mut directory,
            cache: &mut cache,
            pass: &mut pass,
            warnings: &mut warnings,
        };
        walker.run(&human);
    }

    let mut global: BTreeSet<String> = requirements
        .pre_checks
        .union(&requirements.required)
        .cloned()
        .collect();
    global.extend(directory.assigned_categories(DateTime::<Utc>::MAX_UTC));
    let relevant_map: BTreeMap<FvKey, BTreeSet<String>> = relevant_keys
        .iter()
        .map(|k| (k.clone(), cache.fv.get(k).map(|v| v.cats.clone()).unwrap_or_default()))
        .collect();
    let ledger = SignatureLedger::replay(&cache.comments, &cache.fv);
    let states = ledger.category_states(&relevant_map, &global);

    let mut required: BTreeSet<String> = states.keys().cloned().collect();
    required.extend(requirements.required.iter().cloned());
    let mut size_blocks = BTreeSet::new();
    let sizes = [
        (SizeLimit::Commits, commits.len()),
        (SizeLimit::Files, pr.files.len()),
    ];
    for (limit, count) in sizes {
        let overridden = pass.count_overrides.contains(&limit);
        if !limit.blocks(count, &ctx.config.limits, overridden) {
            continue;
        }
        if overridden {
            let msg = format!(
                "{} ({}) is at the hard limit, the override does not apply",
                limit.label(),
                count
            );
            log::warn!("#{}: {}", number, msg);
            warnings.push(msg);
        }
        size_blocks.insert(limit);
    }
    let mut extra_labels = pass.type_labels.clone();
    if pass.backport_of.is_some() {
        extra_labels.insert(BACKPORT_LABEL.to_string());
    }
    let policy = Policy {
        pre_checks: requirements.pre_checks.clone(),
        required,
        hold: !pass.holds.is_empty(),
        urgent: pass.urgent,
        tests_override: pass
            .tests_override_at
            .is_some_and(|at| newest_commit.is_none_or(|c| at > c)),
        size_blocks,
        extra_labels,
    };
    let verdict = aggregate::aggregate(&states, &policy);
    log::info!(
        "#{}: {} (merge eligible: {}) {:?}",
        number,
        verdict.state.label(),
        verdict.merge_eligible,
        verdict.states
    );

    file_versions::prune_unreferenced(&mut cache, &relevant_keys);

    apply_reactions(&broker, &mut cache, &pass.reactions, &human)?;
    apply_labels(&broker, ctx, number, &labels, &verdict)?;
    let cache_fingerprint = persist_cache(ctx, &broker, number, &cache, &technical)?;

    Ok(RunReport {
        number,
        head: head_commit.sha,
        verdict,
        test_requests: pass.test_requests,
        test_parameters: pass.test_parameters,
        abort_requested: pass.abort_requested,
        backport_of: pass.backport_of,
        rewrite_preserved,
        warnings,
        writes: broker.events(),
        cache_fingerprint,
    })
}

/// Decode the cache chunks; an unreadable cache starts over empty.
fn load_cache(ctx: &Context, technical: &[Comment], warnings: &mut Vec<String>) -> BotCache {
    let bodies: Vec<&str> = technical.iter().map(|c| c.body.as_str()).collect();
    match ctx.codec.decode_bodies(&bodies) {
        Ok(decoded) => {
            if decoded.migrated {
                log::info!("migrated cache from the previous schema");
            }
            for w in &decoded.warnings {
                log::warn!("cache: {}", w);
            }
            warnings.extend(decoded.warnings);
            decoded.cache
        }
        Err(e) => {
            log::warn!("unreadable cache, starting fresh: {}", e);
            warnings.push(format!("unreadable cache: {}", e));
            BotCache::default()
        }
    }
}

struct Relevant {
    keys: BTreeSet<FvKey>,
    rewrite_preserved: Option<bool>,
}

/// Register commit and head file versions and reconcile history rewrites.
fn register_history(
    ctx: &Context,
    broker: &ForgeBroker<'_>,
    cache: &mut BotCache,
    pr: &PullRequest,
    commits: &[Commit],
    head_commit: &Commit,
) -> Result<Relevant, SignbotError> {
    let mut registry = FileVersionRegistry::new(&ctx.directory, broker);
    for commit in commits {
        registry.register_commit(cache, commit)?;
    }

    let outcome = SquashReconciler::new(broker).reconcile(cache, &pr.base_sha, commits);

    let head_ts = cache
        .commits
        .get(&head_commit.sha)
        .map_or(head_commit.committer_date, |e| e.ts);
    let mut keys = BTreeSet::new();
    for file in &pr.files {
        let key = registry.resolve_file(file, &head_commit.sha)?;
        registry.register(cache, &key, head_ts);
        keys.insert(key);
    }

    // Squashed or migrated entries may reference versions the table lacks.
    let referenced: Vec<(FvKey, DateTime<Utc>)> = cache
        .commits
        .values()
        .flat_map(|e| e.fv.iter().map(move |k| (k.clone(), e.ts)))
        .collect();
    for (key, ts) in referenced {
        registry.register(cache, &key, ts);
    }

    let moved = squash::reset_changed(cache, &outcome, &keys, registry.fresh_keys());
    if !moved.is_empty() {
        log::info!("{} reintroduced file versions reset to pending", moved.len());
    }

    cache.head = Some(head_commit.sha.clone());
    Ok(Relevant {
        keys,
        rewrite_preserved: (!outcome.is_noop()).then_some(outcome.preserved),
    })
}

struct CommentPass<'r, 'c> {
    ctx: &'c Context,
    pr: &'r PullRequest,
    requirements: &'r Requirements,
    timeline: &'r Timeline,
    relevant: &'r BTreeSet<FvKey>,
    directory: &'r mut CategoryDirectory,
    cache: &'r mut BotCache,
    pass: &'r mut PassState,
    warnings: &'r mut Vec<String>,
}

enum Event<'h> {
    Live(&'h Comment),
    Orphan(u64),
}

impl CommentPass<'_, '_> {
    fn run(&mut self, human: &[Comment]) {
        let live: BTreeSet<u64> = human.iter().map(|c| c.id).collect();
        let mut events: Vec<(DateTime<Utc>, u64, Event<'_>)> = human
            .iter()
            .map(|c| (c.created_at, c.id, Event::Live(c)))
            .collect();
        events.extend(
            self.cache
                .comments
                .iter()
                .filter(|(id, _)| !live.contains(id))
                .map(|(id, e)| (e.ts, *id, Event::Orphan(*id))),
        );
        events.sort_by_key(|(ts, id, _)| (*ts, *id));

        for (_, _, event) in events {
            match event {
                Event::Live(comment) => self.live(comment),
                Event::Orphan(id) => self.orphan(id),
            }
        }
    }

    fn orphan(&mut self, id: u64) {
        let Some(entry) = self.cache.comments.get(&id).cloned() else {
            return;
        };
        if entry.ctype == CommentKind::Legacy {
            let msg = format!("legacy signature {} has no comment any more, dropped", id);
            log::warn!("{}", msg);
            self.warnings.push(msg);
            self.cache.comments.remove(&id);
            self.cache.emoji.remove(&id);
        } else if entry.locked {
            self.apply(&entry);
        } else {
            log::debug!("comment {} deleted, forgetting it", id);
            self.cache.comments.remove(&id);
            self.cache.emoji.remove(&id);
        }
    }

    fn live(&mut self, comment: &Comment) {
        let is_bot = self.ctx.classifier.is_bot(&comment.author);
        let first_line = self.ctx.classifier.first_line(&comment.body);
        if let Some(entry) = self.cache.comments.get(&comment.id).cloned() {
            let reusable = entry.ctype != CommentKind::Legacy
                && (entry.locked || entry.first_line == first_line);
            if reusable {
                self.apply(&entry);
                if !is_bot {
                    self.pass.reactions.insert(comment.id, reaction_for(entry.ctype));
                }
                return;
            }
        }

        let at = comment.created_at;
        let global = self.global_at(at);
        let snapshot = self.timeline.snapshot(at);
        let mut signing = global.clone();
        for key in snapshot.values() {
            if let Some(fv) = self.cache.fv.get(key) {
                signing.extend(fv.cats.iter().cloned());
            }
        }
        let scope = RequestScope {
            directory: &*self.directory,
            config: &self.ctx.config,
            request_author: &self.pr.author,
            head_sha: &self.pr.head_sha,
            signing: &signing,
        };
        let classified = self.ctx.classifier.classify(comment, &scope);

        let mut entry = CommentEntry::new(at, &classified.first_line, CommentKind::Denied);
        entry.user = Some(comment.author.to_lowercase());
        match classified.outcome {
            Classification::Unrecognized(Unrecognized::Chatter) => {
                self.cache.comments.remove(&comment.id);
                return;
            }
            Classification::Unrecognized(Unrecognized::Denied { command, reason }) => {
                log::debug!("comment {} denied ({}): {}", comment.id, command, reason);
            }
            Classification::Command(command) => {
                self.fill(&mut entry, command, &snapshot, &global, &classified.authorized);
            }
        }
        self.apply(&entry);
        if !is_bot {
            self.pass.reactions.insert(comment.id, reaction_for(entry.ctype));
        }
        self.cache.comments.insert(comment.id, entry);
    }

    /// Turn a freshly classified command into its cache entry.
    fn fill(
        &mut self,
        entry: &mut CommentEntry,
        command: Command,
        snapshot: &BTreeMap<String, FvKey>,
        global: &BTreeSet<String>,
        authorized: &BTreeSet<String>,
    ) {
        match command {
            Command::Sign { categories, approve } => {
                entry.ctype = sign_kind(approve);
                entry.fv = snapshot
                    .values()
                    .filter(|key| {
                        let fv_cats = self.cache.fv.get(*key).map(|fv| &fv.cats);
                        categories.iter().any(|c| {
                            global.contains(c) || fv_cats.is_some_and(|cats| cats.contains(c))
                        })
                    })
                    .cloned()
                    .collect();
                entry.cats = categories;
            }
            Command::CiResult { approve, tested_sha } => {
                entry.ctype = sign_kind(approve);
                entry.cats = BTreeSet::from([TESTS_CATEGORY.to_string()]);
                entry.fv = self.relevant.clone();
                entry.arg = Some(tested_sha);
            }
            Command::Assign(cats) => {
                entry.ctype = CommentKind::Assign;
                entry.cats = cats;
            }
            Command::Unassign(cats) => {
                entry.ctype = CommentKind::Unassign;
                entry.cats = cats;
            }
            Command::Hold => {
                entry.ctype = CommentKind::Hold;
                entry.cats = authorized.clone();
            }
            Command::Unhold => {
                entry.ctype = CommentKind::Unhold;
                entry.cats = authorized.clone();
            }
            Command::Urgent => entry.ctype = CommentKind::Urgent,
            Command::TestRequest(request) => {
                entry.ctype = CommentKind::TestRequest;
                self.pass.test_requests.push(request);
            }
            Command::Abort => {
                entry.ctype = CommentKind::Abort;
                self.pass.abort_requested = true;
            }
            Command::IgnoreTestsRejected { reason } => {
                entry.ctype = CommentKind::IgnoreTestsRejected;
                entry.arg = Some(reason);
            }
            Command::TestParameters(params) => {
                entry.ctype = CommentKind::TestParameters;
                self.pass.test_parameters.push(params);
            }
            Command::Type(label) => {
                entry.ctype = CommentKind::Type;
                entry.arg = Some(label);
            }
            Command::Backport(of) => {
                entry.ctype = CommentKind::Backport;
                entry.arg = Some(of.to_string());
            }
            Command::CountOverride(SizeLimit::Commits) => {
                entry.ctype = CommentKind::CommitCountOverride;
            }
            Command::CountOverride(SizeLimit::Files) => {
                entry.ctype = CommentKind::FileCountOverride;
            }
        }
    }

    /// Replay the non-signature effects of an entry.
    fn apply(&mut self, entry: &CommentEntry) {
        let user = entry.user.clone().unwrap_or_default();
        match entry.ctype {
            CommentKind::Assign => self.directory.assign(&entry.cats, entry.ts),
            CommentKind::Unassign => self.directory.unassign(&entry.cats, entry.ts),
            CommentKind::Hold => self.pass.holds.push(Hold {
                user,
                cats: entry.cats.clone(),
            }),
            CommentKind::Unhold => {
                let manager = self
                    .ctx
                    .config
                    .hold_managers
                    .iter()
                    .any(|m| m.eq_ignore_ascii_case(&user));
                if manager {
                    self.pass.holds.clear();
                } else {
                    self.pass
                        .holds
                        .retain(|h| h.user != user && h.cats.is_disjoint(&entry.cats));
                }
            }
            CommentKind::Urgent => self.pass.urgent = true,
            CommentKind::IgnoreTestsRejected => self.pass.tests_override_at = Some(entry.ts),
            CommentKind::Type => {
                if let Some(label) = &entry.arg {
                    self.set_type_label(label);
                }
            }
            CommentKind::Backport => {
                self.pass.backport_of = entry.arg.as_deref().and_then(|n| n.parse().ok());
            }
            CommentKind::CommitCountOverride => {
                self.pass.count_overrides.insert(SizeLimit::Commits);
            }
            CommentKind::FileCountOverride => {
                self.pass.count_overrides.insert(SizeLimit::Files);
            }
            _ => {}
        }
    }

    /// An exclusive type label replaces the previous exclusive one.
    fn set_type_label(&mut self, label: &str) {
        let ctx = self.ctx;
        let types = &ctx.config.type_labels;
        let exclusive = |name: &str| types.iter().any(|t| t.exclusive && t.name == name);
        if exclusive(label) {
            self.pass.type_labels.retain(|l| !exclusive(l));
        }
        self.pass.type_labels.insert(label.to_string());
    }

    fn global_at(&self, at: DateTime<Utc>) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .requirements
            .pre_checks
            .union(&self.requirements.required)
            .cloned()
            .collect();
        out.extend(self.directory.assigned_categories(at));
        out
    }
}

fn sign_kind(approve: bool) -> CommentKind {
    if approve {
        CommentKind::Approve
    } else {
        CommentKind::Reject
    }
}

fn reaction_for(kind: CommentKind) -> &'static str {
    if kind == CommentKind::Denied {
        REJECT_REACTION
    } else {
        APPROVE_REACTION
    }
}

fn apply_reactions(
    broker: &ForgeBroker<'_>,
    cache: &mut BotCache,
    desired: &BTreeMap<u64, &'static str>,
    human: &[Comment],
) -> Result<(), SignbotError> {
    for (&id, &reaction) in desired {
        let previous = cache.emoji.get(&id).cloned();
        if previous.as_deref() == Some(reaction) {
            continue;
        }
        let target = format!("comment {}", id);
        if let Some(old) = previous {
            broker.write("delete_reaction", &target, |f| f.delete_reaction(id, &old))?;
        } else {
            let present = broker
                .try_read("reactions", |f| f.reactions(id))
                .unwrap_or_default();
            if present.contains(reaction) {
                cache.emoji.insert(id, reaction.to_string());
                continue;
            }
        }
        broker.write("create_reaction", &target, |f| f.create_reaction(id, reaction))?;
        cache.emoji.insert(id, reaction.to_string());
    }

    // Comments edited into plain conversation lose their reaction.
    let live: BTreeSet<u64> = human.iter().map(|c| c.id).collect();
    let stale: Vec<(u64, String)> = cache
        .emoji
        .iter()
        .filter(|(id, _)| live.contains(id) && !desired.contains_key(id))
        .map(|(id, r)| (*id, r.clone()))
        .collect();
    for (id, old) in stale {
        broker.write("delete_reaction", &format!("comment {}", id), |f| {
            f.delete_reaction(id, &old)
        })?;
        cache.emoji.remove(&id);
    }
    Ok(())
}

fn apply_labels(
    broker: &ForgeBroker<'_>,
    ctx: &Context,
    number: u64,
    current: &BTreeSet<String>,
    verdict: &Verdict,
) -> Result<(), SignbotError> {
    let mut categories = ctx.directory.known_categories().clone();
    categories.extend(verdict.states.keys().cloned());
    let type_labels: BTreeSet<String> =
        ctx.config.type_labels.iter().map(|t| t.name.clone()).collect();
    let (add, remove) =
        aggregate::label_diff(current, &verdict.labels, &categories, &type_labels);
    let target = format!("#{}", number);
    for label in &remove {
        broker.write("remove_label", &target, |f| f.remove_label(number, label))?;
    }
    for label in &add {
        broker.write("add_label", &target, |f| f.add_label(number, label))?;
    }
    Ok(())
}

/// Write the cache back, touching only the technical comments that changed.
/// The new generation is complete before the old one is deleted.
fn persist_cache(
    ctx: &Context,
    broker: &ForgeBroker<'_>,
    number: u64,
    cache: &BotCache,
    technical: &[Comment],
) -> Result<String, SignbotError> {
    let json = CacheCodec::canonical_json(cache)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let fingerprint: String = format!("{:x}", hasher.finalize()).chars().take(12).collect();

    let existing: Vec<(u64, String)> = technical.iter().map(|c| (c.id, c.body.clone())).collect();
    if cache.is_empty() && existing.is_empty() {
        return Ok(fingerprint);
    }
    let bodies = ctx.codec.bodies(cache)?;
    let writes = CacheCodec::plan(&existing, &bodies);
    if !writes.is_empty() {
        log::info!(
            "#{}: persisting cache {} ({} chunks, {} writes)",
            number,
            fingerprint,
            bodies.len(),
            writes.len()
        );
    }
    for write in writes {
        match write {
            CacheWrite::Update { id, body } => {
                broker.write("update_comment", &format!("comment {}", id), |f| {
                    f.update_comment(id, &body)
                })?;
            }
            CacheWrite::Create { body } => {
                broker.write("create_comment", &format!("#{}", number), |f| {
                    f.create_comment(number, &body)
                })?;
            }
            CacheWrite::Delete { id } => {
                broker.write("delete_comment", &format!("comment {}", id), |f| {
                    f.delete_comment(id)
                })?;
            }
        }
    }
    Ok(fingerprint)
}
