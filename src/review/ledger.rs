//! Sign-off ledger.
//!
//! Folds the cached sign comments, oldest first, into a last-writer-wins
//! table keyed by `(file version, category)`, then derives one state per
//! category from the file versions the request currently carries.

use crate::review::cache::{CommentEntry, CommentKind, FileVersion, FvKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryState {
    Pending,
    Approved,
    Rejected,
}

impl CategoryState {
    pub fn as_str(self) -> &'static str {
        match self {
            CategoryState::Pending => "pending",
            CategoryState::Approved => "approved",
            CategoryState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CategoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignValue {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignEntry {
    pub value: SignValue,
    pub comment_id: u64,
    pub ts: DateTime<Utc>,
}

/// Pending beats rejected beats approved.
pub fn fold_state<I>(entries: I) -> CategoryState
where
    I: IntoIterator<Item = Option<SignValue>>,
{
    let mut rejected = false;
    let mut any = false;
    for entry in entries {
        any = true;
        match entry {
            None => return CategoryState::Pending,
            Some(SignValue::Rejected) => rejected = true,
            Some(SignValue::Approved) => {}
        }
    }
    if !any {
        CategoryState::Pending
    } else if rejected {
        CategoryState::Rejected
    } else {
        CategoryState::Approved
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignatureLedger {
    table: BTreeMap<(FvKey, String), SignEntry>,
}

impl SignatureLedger {
    pub fn replay(
        comments: &BTreeMap<u64, CommentEntry>,
        fv_table: &BTreeMap<FvKey, FileVersion>,
    ) -> Self {
        let mut ordered: Vec<(&u64, &CommentEntry)> = comments
            .iter()
            .filter(|(_, c)| c.ctype.is_sign())
            .collect();
        ordered.sort_by_key(|(id, c)| (c.ts, **id));

        let mut table = BTreeMap::new();
        for (id, comment) in ordered {
            let value = if comment.ctype == CommentKind::Approve {
                SignValue::Approved
            } else {
                SignValue::Rejected
            };
            for key in &comment.fv {
                // Content first seen after the comment was not reviewed by it.
                if !fv_table.get(key).is_some_and(|fv| comment.ts >= fv.ts) {
                    continue;
                }
                for cat in &comment.cats {
                    table.insert(
                        (key.clone(), cat.clone()),
                        SignEntry {
                            value,
                            comment_id: *id,
                            ts: comment.ts,
                        },
                    );
                }
            }
        }
        Self { table }
    }

    pub fn entry(&self, key: &FvKey, category: &str) -> Option<&SignEntry> {
        self.table.get(&(key.clone(), category.to_string()))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// One state per category of the request.
    ///
    /// `relevant` maps each file version the request carries to its frozen
    /// categories. Categories in `global` apply to every relevant version; a
    /// category with no relevant version at all is pending.
    pub fn category_states(
        &self,
        relevant: &BTreeMap<FvKey, BTreeSet<String>>,
        global: &BTreeSet<String>,
    ) -> BTreeMap<String, CategoryState> {
        let mut categories: BTreeSet<&String> = global.iter().collect();
        for cats in relevant.values() {
            categories.extend(cats.iter());
        }
        categories
            .into_iter()
            .map(|cat| {
                let is_global = global.contains(cat);
                let state = fold_state(
                    relevant
                        .iter()
                        .filter(|(_, cats)| is_global || cats.contains(cat))
                        .map(|(key, _)| self.entry(key, cat).map(|e| e.value)),
                );
                (cat.clone(), state)
            })
            .collect()
    }
}
