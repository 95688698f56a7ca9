//! Signbot: review sign-off governance for forge pull requests
//!
//! **Signbot keeps no database. The request's comment thread is its storage.**
//!
//! Every invocation reconstructs the complete review state of a request from
//! its ordered comments and commits, decides what changed, and persists an
//! updated snapshot back into the thread, so the next invocation (on any
//! machine, with no local state) resumes where this one stopped.
//!
//! # Core Principles
//!
//! - **Stateless**: All durable state lives in the request thread
//! - **Deterministic**: Comments replay in `(created_at, id)` order
//! - **Content-addressed**: Signatures attach to `(path, blob)` file versions
//! - **Idempotent**: A second run over an unchanged thread writes nothing
//! - **Write-once**: Read everything, compute, then write; the cache goes last
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All forge access routes through `ForgeBroker` for:
//! - Bounded retry with exponential backoff on transient failures
//! - Dry-run suppression of every write
//! - An audit trail of writes returned with each run report
//!
//! ## Review pipeline
//!
//! - `directory`: which categories a path belongs to, who may sign when
//! - `file_versions`: `(path, blob)` versions with frozen categories
//! - `classifier`: comment text to typed commands via an ordered registry
//! - `ledger`: last-writer-wins sign-off per version and category
//! - `squash`: signatures survive force-pushes with an unchanged net diff
//! - `codec`: the cache as chunked, optionally compressed, technical comments
//! - `aggregate`: labels and merge eligibility
//!
//! # Examples
//!
//! ```bash
//! # Process one request from a recorded thread
//! signbot process --config signbot.toml --recording pr.json --request 42
//!
//! # Process everything recorded, four at a time, without writing
//! signbot batch --recording prs.json --jobs 4 --dry-run
//!
//! # Look at the cache the bot left in a thread
//! signbot inspect --recording pr.json --request 42
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: Config, errors, time, the forge boundary and its broker
//! - [`review`]: Everything that turns a thread into a verdict

pub mod core;
pub mod review;

mod cli;

use crate::cli::{Cli, Command};
use crate::core::config::BotConfig;
use crate::core::error::SignbotError;
use crate::core::forge::Forge;
use crate::core::recorded::RecordedForge;
use crate::review::codec::CacheCodec;
use crate::review::context::Context;
use crate::review::driver::Driver;
use crate::review::engine::{self, RunReport};
use clap::Parser;
use colored::Colorize;
use std::path::Path;

pub fn run() -> Result<(), SignbotError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Process { source, request } => {
            let (ctx, forge) = open(&source.config, &source.recording)?;
            let report = engine::process_request(&ctx, &forge, request, source.dry_run)?;
            if !source.dry_run {
                forge.save(&source.recording)?;
            }
            print_report(&report, &source.format)?;
        }
        Command::Batch {
            source,
            jobs,
            requests,
        } => {
            let (ctx, forge) = open(&source.config, &source.recording)?;
            let numbers = if requests.is_empty() {
                forge.request_numbers()
            } else {
                requests
            };
            let outcomes = Driver::new(&ctx, &forge, jobs, source.dry_run).run(&numbers)?;
            if !source.dry_run {
                forge.save(&source.recording)?;
            }
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(report) => print_report(report, &source.format)?,
                    Err(e) => {
                        failed += 1;
                        eprintln!("{} #{}: {}", "✗".bright_red().bold(), outcome.number, e);
                    }
                }
            }
            if failed > 0 {
                return Err(SignbotError::ValidationError(format!(
                    "{} of {} requests failed",
                    failed,
                    outcomes.len()
                )));
            }
        }
        Command::Inspect {
            config,
            recording,
            request,
        } => {
            let (ctx, forge) = open(&config, &recording)?;
            inspect(&ctx, &forge, request)?;
        }
        Command::ValidateConfig { config } => {
            let config = BotConfig::load(&config)?;
            let ctx = Context::new(config)?;
            println!("{} configuration is valid", "✓".bright_green().bold());
            println!("  bot login:   {}", ctx.config.bot_login.bright_white());
            println!("  categories:  {}", ctx.config.categories.len());
            println!("  reviewers:   {}", ctx.config.reviewers.len());
            println!("  policy rules: {}", ctx.config.policy.len());
            let known: Vec<&str> = ctx
                .directory
                .known_categories()
                .iter()
                .map(String::as_str)
                .collect();
            println!("  known:       {}", known.join(", "));
        }
    }
    Ok(())
}

fn open(config: &Path, recording: &Path) -> Result<(Context, RecordedForge), SignbotError> {
    let config = BotConfig::load(config)?;
    let ctx = Context::new(config)?;
    let forge = RecordedForge::load(recording)?;
    Ok((ctx, forge))
}

fn inspect(ctx: &Context, forge: &dyn Forge, number: u64) -> Result<(), SignbotError> {
    let mut technical: Vec<_> = forge
        .comments(number)?
        .into_iter()
        .filter(|c| ctx.classifier.is_bot(&c.author) && CacheCodec::is_cache_body(&c.body))
        .collect();
    technical.sort_by_key(|c| (c.created_at, c.id));
    let bodies: Vec<&str> = technical.iter().map(|c| c.body.as_str()).collect();
    let decoded = ctx.codec.decode_bodies(&bodies)?;
    for warning in &decoded.warnings {
        eprintln!("{} {}", "warning:".bright_yellow().bold(), warning);
    }
    if decoded.migrated {
        eprintln!("{} cache uses the previous schema", "note:".bright_cyan().bold());
    }
    println!("{}", serde_json::to_string_pretty(&decoded.cache)?);
    Ok(())
}

fn print_report(report: &RunReport, format: &str) -> Result<(), SignbotError> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let verdict = &report.verdict;
    let status = if verdict.merge_eligible {
        "MERGEABLE".bright_green().bold()
    } else {
        "BLOCKED".bright_yellow().bold()
    };
    println!(
        "{} #{} @ {} [{}]",
        status,
        report.number,
        report.head.bright_white(),
        verdict.state.label()
    );
    for (category, state) in &verdict.states {
        let state = match state.as_str() {
            "approved" => state.as_str().green(),
            "rejected" => state.as_str().red(),
            other => other.yellow(),
        };
        println!("  {:<24} {}", category, state);
    }
    for request in &report.test_requests {
        println!("  {} {} {:?}", "→".bright_cyan(), request.verb, request.workflows);
    }
    if report.abort_requested {
        println!("  {} abort requested", "→".bright_cyan());
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".bright_yellow(), warning);
    }
    println!(
        "  cache {} ({} writes)",
        report.cache_fingerprint.dimmed(),
        report.writes.len()
    );
    Ok(())
}
