//! Bot configuration.
//!
//! One TOML file describes everything that is static for a deployment: the
//! bot's own login, which paths belong to which review category, who may sign
//! for a category and when, and which categories a target branch requires.
//!
//! ```toml
//! bot_login = "signbot"
//! hold_managers = ["release-manager"]
//!
//! [[categories]]
//! name = "core"
//! paths = ["^Core/", "^Framework/"]
//!
//! [[reviewers]]
//! login = "alice"
//! categories = ["core"]
//! since = "2020-01-01T00:00:00Z"
//!
//! [[policy]]
//! branch = "^master$"
//! pre_checks = ["code-checks"]
//! required = ["tests", "orp"]
//!
//! [[type_labels]]
//! name = "bug-fix"
//! exclusive = true
//!
//! [limits]
//! commits_warn = 150
//! commits_fail = 240
//! ```

use crate::core::error::SignbotError;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CHUNK_THRESHOLD: usize = 55_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_login: String,
    /// May hold, unhold, assign and mark urgent regardless of category rights.
    pub hold_managers: Vec<String>,
    /// May request and abort test runs.
    pub testers: Vec<String>,
    pub protected_repositories: Vec<String>,
    /// May lift a warning-level commit or file count block.
    pub count_overriders: Vec<String>,
    pub categories: Vec<CategoryRuleConfig>,
    pub reviewers: Vec<ReviewerConfig>,
    pub policy: Vec<PolicyRuleConfig>,
    /// Labels settable with `type <label>`.
    pub type_labels: Vec<TypeLabelConfig>,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            bot_login: "signbot".to_string(),
            hold_managers: Vec::new(),
            testers: Vec::new(),
            protected_repositories: Vec::new(),
            count_overriders: Vec::new(),
            categories: Vec::new(),
            reviewers: Vec::new(),
            policy: Vec::new(),
            type_labels: Vec::new(),
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRuleConfig {
    pub name: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    pub login: String,
    pub categories: Vec<String>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    #[serde(default = "default_branch_pattern")]
    pub branch: String,
    #[serde(default)]
    pub protected_only: bool,
    #[serde(default)]
    pub pre_checks: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_branch_pattern() -> String {
    ".*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeLabelConfig {
    pub name: String,
    /// At most one exclusive type label is set at a time; the newest wins.
    #[serde(default)]
    pub exclusive: bool,
}

/// Request size limits. At `*_warn` the request is blocked until someone in
/// `count_overriders` lifts it; at `*_fail` it stays blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub commits_warn: usize,
    pub commits_fail: usize,
    pub files_warn: usize,
    pub files_fail: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            commits_warn: 150,
            commits_fail: 240,
            files_warn: 1_500,
            files_fail: 3_001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub chunk_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        }
    }
}

/// Bounded exponential backoff for transient forge failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl BotConfig {
    pub fn load(path: &Path) -> Result<Self, SignbotError> {
        let raw = fs::read_to_string(path).map_err(SignbotError::IoError)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SignbotError> {
        let config: BotConfig =
            toml::from_str(raw).map_err(|e| SignbotError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs that would only fail later, mid-run.
    pub fn validate(&self) -> Result<(), SignbotError> {
        if self.bot_login.trim().is_empty() {
            return Err(SignbotError::ConfigError("bot_login is empty".to_string()));
        }
        if self.cache.chunk_threshold == 0 {
            return Err(SignbotError::ConfigError(
                "cache.chunk_threshold must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SignbotError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.limits.commits_warn > self.limits.commits_fail
            || self.limits.files_warn > self.limits.files_fail
        {
            return Err(SignbotError::ConfigError(
                "limits: a warn threshold exceeds its fail threshold".to_string(),
            ));
        }
        for rule in &self.categories {
            for pattern in &rule.paths {
                compile(pattern, &format!("category {}", rule.name))?;
            }
        }
        for rule in &self.policy {
            compile(&rule.branch, "policy branch")?;
        }
        for reviewer in &self.reviewers {
            for raw in reviewer.since.iter().chain(reviewer.until.iter()) {
                if time::parse_iso(raw).is_none() {
                    return Err(SignbotError::ConfigError(format!(
                        "reviewer {}: bad timestamp {:?}",
                        reviewer.login, raw
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_protected(&self, repository: &str) -> bool {
        self.protected_repositories.iter().any(|r| r == repository)
    }

    /// Every category name mentioned anywhere in the config.
    pub fn known_categories(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.categories.iter().map(|c| c.name.clone()).collect();
        for reviewer in &self.reviewers {
            out.extend(reviewer.categories.iter().cloned());
        }
        for rule in &self.policy {
            out.extend(rule.pre_checks.iter().cloned());
            out.extend(rule.required.iter().cloned());
        }
        out
    }
}

pub(crate) fn compile(pattern: &str, what: &str) -> Result<Regex, SignbotError> {
    Regex::new(pattern).map_err(|e| {
        SignbotError::ConfigError(format!("{}: invalid regex {:?}: {}", what, pattern, e))
    })
}
