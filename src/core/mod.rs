//! Core modules shared by every review run.
//!
//! Configuration, errors, time handling and the forge boundary live here.
//! Nothing in this module knows about categories or signatures.

pub mod broker;
pub mod config;
pub mod error;
pub mod forge;
pub mod recorded;
pub mod time;
