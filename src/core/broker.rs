use crate::core::config::RetryConfig;
use crate::core::error::{ForgeError, SignbotError};
use crate::core::forge::Forge;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The Forge Broker is the "Thin Waist" for remote state access.
///
/// Every forge call of a run goes through it. Reads and writes share one
/// bounded retry policy. Writes are additionally recorded as audit events and
/// suppressed entirely in dry-run mode.
pub struct ForgeBroker<'a> {
    forge: &'a dyn Forge,
    retry: RetryConfig,
    dry_run: bool,
    events: Mutex<Vec<WriteEvent>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub ts: String,
    pub event_id: String,
    pub op: String,
    pub target: String,
    pub status: String,
}

impl<'a> ForgeBroker<'a> {
    pub fn new(forge: &'a dyn Forge, retry: RetryConfig, dry_run: bool) -> Self {
        Self {
            forge,
            retry,
            dry_run,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// A read that must succeed for the run to continue.
    pub fn read<T, F>(&self, op: &str, f: F) -> Result<T, SignbotError>
    where
        F: FnMut(&dyn Forge) -> Result<T, ForgeError>,
    {
        self.attempt(op, f).map_err(|(attempts, source)| exhausted(op, attempts, source))
    }

    /// A read whose failure the caller knows how to degrade around.
    pub fn try_read<T, F>(&self, op: &str, f: F) -> Result<T, ForgeError>
    where
        F: FnMut(&dyn Forge) -> Result<T, ForgeError>,
    {
        self.attempt(op, f).map_err(|(_, source)| source)
    }

    /// Execute a mutating call. Returns `None` when the call was suppressed by dry-run.
    pub fn write<T, F>(&self, op: &str, target: &str, f: F) -> Result<Option<T>, SignbotError>
    where
        F: FnMut(&dyn Forge) -> Result<T, ForgeError>,
    {
        if self.dry_run {
            log::info!("dry-run: skipping {} on {}", op, target);
            self.log_event(op, target, "skipped");
            return Ok(None);
        }
        match self.attempt(op, f) {
            Ok(value) => {
                self.log_event(op, target, "success");
                Ok(Some(value))
            }
            Err((attempts, source)) => {
                self.log_event(op, target, "error");
                Err(exhausted(op, attempts, source))
            }
        }
    }

    pub fn events(&self) -> Vec<WriteEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn attempt<T, F>(&self, op: &str, mut f: F) -> Result<T, (u32, ForgeError)>
    where
        F: FnMut(&dyn Forge) -> Result<T, ForgeError>,
    {
        let mut attempt = 1;
        loop {
            match f(self.forge) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        op,
                        e,
                        attempt,
                        self.retry.max_attempts - 1,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    fn log_event(&self, op: &str, target: &str, status: &str) {
        let ev = WriteEvent {
            ts: time::iso_utc(&time::now_utc()),
            event_id: time::new_event_id(),
            op: op.to_string(),
            target: target.to_string(),
            status: status.to_string(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(ev);
        }
    }
}

fn exhausted(op: &str, attempts: u32, source: ForgeError) -> SignbotError {
    if !source.is_transient() {
        return SignbotError::ForgeError(source);
    }
    SignbotError::RetriesExhausted {
        op: op.to_string(),
        attempts,
        source,
    }
}
