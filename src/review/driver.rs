//! Runs many requests on a bounded worker pool.
//!
//! Request numbers are deduplicated before scheduling, so a request is never
//! processed by two workers at once within one batch. A failing request is
//! reported and does not stop the others.

use crate::core::error::SignbotError;
use crate::core::forge::Forge;
use crate::review::context::Context;
use crate::review::engine::{self, RunReport};
use rayon::prelude::*;
use std::collections::BTreeSet;

pub struct RequestOutcome {
    pub number: u64,
    pub result: Result<RunReport, SignbotError>,
}

pub struct Driver<'a> {
    ctx: &'a Context,
    forge: &'a dyn Forge,
    workers: usize,
    dry_run: bool,
}

impl<'a> Driver<'a> {
    pub fn new(ctx: &'a Context, forge: &'a dyn Forge, workers: usize, dry_run: bool) -> Self {
        Self {
            ctx,
            forge,
            workers: workers.max(1),
            dry_run,
        }
    }

    pub fn run(&self, numbers: &[u64]) -> Result<Vec<RequestOutcome>, SignbotError> {
        let unique: Vec<u64> = numbers
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.len() < numbers.len() {
            log::debug!("dropped {} duplicate request numbers", numbers.len() - unique.len());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| SignbotError::ConfigError(format!("worker pool: {}", e)))?;

        let outcomes = pool.install(|| {
            unique
                .par_iter()
                .map(|&number| {
                    let result =
                        engine::process_request(self.ctx, self.forge, number, self.dry_run);
                    if let Err(e) = &result {
                        log::error!("#{}: {}", number, e);
                    }
                    RequestOutcome { number, result }
                })
                .collect()
        });
        Ok(outcomes)
    }
}
