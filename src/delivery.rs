//! The delivery loop: sole mutator of queue entries.
//!
//! Each iteration picks the earliest due entry, resolves its retry step
//! to a provider, dispatches, and advances the entry according to the
//! failure taxonomy. With nothing due the loop blocks in the directory
//! watcher. Delivery errors never terminate the loop; only fatal queue
//! or provider errors propagate.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::Contact,
    constants::MAX_WATCH_WAIT,
    error::{NotifygError, SendError},
    providers::{ProviderRegistry, Recipient},
    queue::PersistentQueue,
    retry::RetryToken,
    watcher::QueueWatcher,
};

/// What one loop iteration did, and what the loop should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The queue is empty; block until something arrives.
    Empty,
    /// The earliest entry is not due yet; block for at most this long.
    NotDue(Duration),
    /// An entry was processed (delivered, advanced or dropped); look at
    /// the queue again immediately.
    Processed,
}

/// Single-threaded worker draining the persistent queue.
pub struct DeliveryLoop {
    queue: PersistentQueue,
    registry: ProviderRegistry,
    contacts: HashMap<String, Contact>,
    shutdown: Arc<AtomicBool>,
}

impl DeliveryLoop {
    /// Builds the loop. The queue lock is taken in [`run`](Self::run),
    /// not here.
    pub fn new(
        queue: PersistentQueue,
        registry: ProviderRegistry,
        contacts: HashMap<String, Contact>,
    ) -> Self {
        Self {
            queue,
            registry,
            contacts,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that requests a graceful shutdown: the current dispatch
    /// finishes, transports terminate, the lock is released.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs until shutdown is requested or a fatal error occurs. Holds
    /// the queue lock for the entire lifetime.
    pub fn run(&mut self, watcher: &mut dyn QueueWatcher) -> Result<(), NotifygError> {
        self.queue.lock()?;
        info!(queuedir = %self.queue.queuedir().display(), "delivery loop started");
        let result = self.run_inner(watcher);
        self.registry.terminate_all();
        self.queue.unlock();
        info!("delivery loop stopped");
        result
    }

    fn run_inner(&mut self, watcher: &mut dyn QueueWatcher) -> Result<(), NotifygError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.step()? {
                StepOutcome::Empty => watcher.wait(MAX_WATCH_WAIT)?,
                StepOutcome::NotDue(wait) => watcher.wait(wait)?,
                StepOutcome::Processed => {}
            }
        }
    }

    /// One iteration: pick, resolve, dispatch, advance.
    pub fn step(&mut self) -> Result<StepOutcome, NotifygError> {
        let Some(entry) = self.queue.find_next()? else {
            return Ok(StepOutcome::Empty);
        };
        let wait = entry.sleep_duration();
        if !wait.is_zero() {
            return Ok(StepOutcome::NotDue(wait));
        }

        let token = self.queue.policy().token_at(entry.step()).clone();
        let provider_name = match token {
            RetryToken::GiveUp => {
                info!(entry = %entry, "giving up on entry");
                self.queue.entry_done(&entry)?;
                return Ok(StepOutcome::Processed);
            }
            RetryToken::Wait(_) => {
                // Only reachable when the policy shrank between runs;
                // re-walk the waits to land on a provider again.
                warn!(entry = %entry, "entry step points at a wait token; re-advancing");
                self.queue.entry_next(&entry, false)?;
                return Ok(StepOutcome::Processed);
            }
            RetryToken::Provider(name) => name,
        };

        let (contact_name, message) = self.queue.contents(&entry)?;
        debug!(entry = %entry, contact = %contact_name, provider = %provider_name,
            "delivering entry");

        let outcome = match (
            self.contacts.get(&contact_name),
            self.registry.get(&provider_name),
        ) {
            (None, _) => Err(SendError::Config(format!(
                "contact {contact_name} is not configured"
            ))),
            (_, None) => Err(SendError::Config(format!(
                "provider {provider_name} is not registered"
            ))),
            (Some(attrs), Some(provider)) => {
                provider.send(&Recipient::new(&contact_name, attrs), &message)
            }
        };

        match outcome {
            Ok(()) => {
                debug!(entry = %entry, contact = %contact_name, provider = %provider_name,
                    "delivery succeeded");
                self.queue.entry_done(&entry)?;
            }
            Err(SendError::Fatal(reason)) => {
                return Err(NotifygError::ProviderFatal {
                    provider: provider_name,
                    reason,
                });
            }
            Err(err) => {
                let fast = err.skips_wait();
                if fast {
                    error!(entry = %entry, contact = %contact_name, provider = %provider_name,
                        error = %err, "delivery failed permanently; skipping wait");
                } else {
                    warn!(entry = %entry, contact = %contact_name, provider = %provider_name,
                        error = %err, "delivery failed; will retry");
                }
                self.queue.entry_next(&entry, fast)?;
            }
        }
        Ok(StepOutcome::Processed)
    }
}
