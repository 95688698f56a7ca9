//! Turns raw comment bodies into commands.

use crate::core::config::BotConfig;
use crate::core::forge::Comment;
use crate::review::commands::{Classification, CommandRegistry, Invocation};
use crate::review::directory::CategoryDirectory;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*,\s*").unwrap());
static PLEASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^please[,:]?\s*").unwrap());

/// Request-level facts a classification depends on.
pub struct RequestScope<'a> {
    pub directory: &'a CategoryDirectory,
    pub config: &'a BotConfig,
    pub request_author: &'a str,
    pub head_sha: &'a str,
    /// Categories the request needs signed at the comment's timestamp.
    pub signing: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub first_line: String,
    /// Categories the author could sign for when the comment was made.
    pub authorized: BTreeSet<String>,
    pub outcome: Classification,
}

pub struct CommentClassifier {
    bot_login: String,
    address: Regex,
    registry: CommandRegistry,
}

impl CommentClassifier {
    pub fn new(bot_login: &str, registry: CommandRegistry) -> Self {
        let login = regex::escape(&bot_login.to_lowercase());
        let address = Regex::new(&format!(r"^@{}[,:]?\s*", login))
            .expect("escaped login is a valid regex");
        Self {
            bot_login: bot_login.to_string(),
            address,
            registry,
        }
    }

    pub fn is_bot(&self, login: &str) -> bool {
        login.eq_ignore_ascii_case(&self.bot_login)
    }

    /// Normalised non-blank lines of a comment body.
    pub fn preprocess(&self, body: &str) -> Vec<String> {
        body.lines()
            .map(|raw| {
                let line = raw.trim().to_lowercase();
                let line = WHITESPACE.replace_all(&line, " ");
                let line = COMMA.replace_all(&line, ",");
                let line = self.address.replace(&line, "");
                PLEASE.replace(&line, "").trim().to_string()
            })
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// First command line of a body, as stored in the cache.
    pub fn first_line(&self, body: &str) -> String {
        self.preprocess(body).into_iter().next().unwrap_or_default()
    }

    pub fn classify(&self, comment: &Comment, scope: &RequestScope<'_>) -> Classified {
        let lines = self.preprocess(&comment.body);
        let authorized = scope
            .directory
            .authorized_categories(&comment.author, comment.created_at);
        let inv = Invocation {
            author: &comment.author,
            at: comment.created_at,
            lines: &lines,
            is_bot: self.is_bot(&comment.author),
            authorized: &authorized,
            signing: scope.signing,
            directory: scope.directory,
            config: scope.config,
            request_author: scope.request_author,
            head_sha: scope.head_sha,
        };
        let outcome = self.registry.classify(&inv);
        Classified {
            first_line: lines.first().cloned().unwrap_or_default(),
            authorized,
            outcome,
        }
    }
}
