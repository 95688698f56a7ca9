//! Who reviews what.
//!
//! Maps file paths to review categories and users to the categories they may
//! sign for over time. Per-request category assignments are kept as an
//! append-only log of windows so replaying from any earlier instant sees the
//! assignment that applied then.

use crate::core::config::{self, BotConfig};
use crate::core::error::SignbotError;
use crate::core::time;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// Category for files no rule claims. Blocks merging until a rule exists.
pub const NEW_PACKAGE_CATEGORY: &str = "new-package";

#[derive(Debug, Clone)]
struct CategoryRule {
    name: String,
    patterns: Vec<Regex>,
}

/// Half-open validity interval `[start, end)` for a set of categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub categories: BTreeSet<String>,
}

impl Window {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| s <= at) && self.end.is_none_or(|e| at < e)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CategoryDirectory {
    rules: Vec<CategoryRule>,
    reviewers: BTreeMap<String, Vec<Window>>,
    known: BTreeSet<String>,
    assignments: Vec<Window>,
}

impl CategoryDirectory {
    pub fn from_config(config: &BotConfig) -> Result<Self, SignbotError> {
        let mut rules = Vec::with_capacity(config.categories.len());
        for rule in &config.categories {
            let patterns = rule
                .paths
                .iter()
                .map(|p| config::compile(p, &format!("category {}", rule.name)))
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(CategoryRule {
                name: rule.name.clone(),
                patterns,
            });
        }

        let mut reviewers: BTreeMap<String, Vec<Window>> = BTreeMap::new();
        for reviewer in &config.reviewers {
            let start = parse_bound(reviewer.since.as_deref(), &reviewer.login)?;
            let end = parse_bound(reviewer.until.as_deref(), &reviewer.login)?;
            reviewers
                .entry(reviewer.login.to_lowercase())
                .or_default()
                .push(Window {
                    start,
                    end,
                    categories: reviewer.categories.iter().cloned().collect(),
                });
        }

        let mut known = config.known_categories();
        known.insert(NEW_PACKAGE_CATEGORY.to_string());

        Ok(Self {
            rules,
            reviewers,
            known,
            assignments: Vec::new(),
        })
    }

    /// Union of every matching rule; a path nobody claims is a new package.
    pub fn categories_for_path(&self, path: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .rules
            .iter()
            .filter(|rule| rule.patterns.iter().any(|re| re.is_match(path)))
            .map(|rule| rule.name.clone())
            .collect();
        if out.is_empty() {
            out.insert(NEW_PACKAGE_CATEGORY.to_string());
        }
        out
    }

    pub fn authorized_categories(&self, user: &str, at: DateTime<Utc>) -> BTreeSet<String> {
        self.reviewers
            .get(&user.to_lowercase())
            .into_iter()
            .flatten()
            .filter(|w| w.covers(at))
            .flat_map(|w| w.categories.iter().cloned())
            .collect()
    }

    pub fn is_known(&self, category: &str) -> bool {
        self.known.contains(category)
    }

    pub fn known_categories(&self) -> &BTreeSet<String> {
        &self.known
    }

    pub fn assign(&mut self, categories: &BTreeSet<String>, at: DateTime<Utc>) {
        let mut next = self.assigned_categories(at);
        next.extend(categories.iter().cloned());
        self.open_window(next, at);
    }

    pub fn unassign(&mut self, categories: &BTreeSet<String>, at: DateTime<Utc>) {
        let mut next = self.assigned_categories(at);
        next.retain(|c| !categories.contains(c));
        self.open_window(next, at);
    }

    pub fn assigned_categories(&self, at: DateTime<Utc>) -> BTreeSet<String> {
        self.assignments
            .iter()
            .filter(|w| w.covers(at))
            .flat_map(|w| w.categories.iter().cloned())
            .collect()
    }

    pub fn assignment_log(&self) -> &[Window] {
        &self.assignments
    }

    fn open_window(&mut self, categories: BTreeSet<String>, at: DateTime<Utc>) {
        if let Some(open) = self.assignments.iter_mut().rev().find(|w| w.end.is_none()) {
            open.end = Some(at);
        }
        self.assignments.push(Window {
            start: Some(at),
            end: None,
            categories,
        });
    }
}

fn parse_bound(raw: Option<&str>, login: &str) -> Result<Option<DateTime<Utc>>, SignbotError> {
    raw.map(|r| {
        time::parse_iso(r).ok_or_else(|| {
            SignbotError::ConfigError(format!("reviewer {}: bad timestamp {:?}", login, r))
        })
    })
    .transpose()
}
