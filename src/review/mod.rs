//! Review governance: from a request's comment thread to its labels.
//!
//! Leaves first:
//!
//! - [`directory`]: path → category rules and who may sign for what, when
//! - [`file_versions`]: content-addressed file versions and the commit timeline
//! - [`commands`] / [`classifier`]: comment text → typed command
//! - [`ledger`]: chronological fold of sign comments into per-category state
//! - [`squash`]: survive force-pushes that keep the net diff
//! - [`codec`]: the cache as chunked technical comments
//! - [`aggregate`]: labels and merge eligibility
//! - [`engine`] / [`driver`]: one request, many requests

pub mod aggregate;
pub mod cache;
pub mod classifier;
pub mod codec;
pub mod commands;
pub mod context;
pub mod directory;
pub mod driver;
pub mod engine;
pub mod file_versions;
pub mod ledger;
pub mod squash;
