//! Asynchronous Usage Recorder
//!
//! Commits hand their usage event to a background worker and return at once.
//! The worker appends each event (own entry plus parent-attributed copy) in a
//! single call, retrying under the configured policy. Events that still
//! cannot be written become dead letters, parked in the shared
//! [`DeadLetterStore`] so any process running maintenance can replay them.
//! Letters that cannot be parked either wait in a bounded local outbox.
//! Nothing here can undo a ledger commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{UsageEvent, UsageLogEntry};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{DeadLetterStore, StoreTimeout, UsageLog};

/// Usage recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Events buffered ahead of the worker
    pub queue_capacity: usize,

    /// Retry policy for one append
    pub retry: RetryPolicy,

    /// Dead letters read per replay, and kept in the local outbox before
    /// the oldest are dropped
    pub max_dead_letters: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            retry: RetryPolicy::new().max_attempts(5),
            max_dead_letters: 10_000,
        }
    }
}

/// Usage write that exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDeadLetter {
    pub id: String,
    pub entries: Vec<UsageLogEntry>,
    pub attempt_count: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

enum Command {
    Record(UsageEvent),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    log: Arc<dyn UsageLog>,
    dead_letters: Arc<dyn DeadLetterStore>,
    timeout: StoreTimeout,
    clock: Arc<dyn Clock>,
    config: UsageConfig,
    outbox: Mutex<Vec<UsageDeadLetter>>,
}

impl Shared {
    async fn write(&self, entries: Vec<UsageLogEntry>) {
        let result = retry_with_backoff(
            &self.config.retry,
            |_: &StoreError| true,
            || self.timeout.run("usage_append", self.log.append(&entries)),
        )
        .await;

        match result {
            Ok(()) => debug!(entries = entries.len(), "Usage recorded"),
            Err(err) => {
                metrics::USAGE_WRITE_FAILURES_TOTAL.inc();
                error!(
                    account_id = %entries.first().map(|e| e.account_id.as_str()).unwrap_or(""),
                    request_id = %entries.first().map(|e| e.request_id.as_str()).unwrap_or(""),
                    error = %err,
                    "Usage write failed after retries, dead-lettered"
                );
                let letter = self.letter(entries, self.config.retry.max_attempts, err.to_string());
                self.park(letter).await;
            }
        }
    }

    fn letter(&self, entries: Vec<UsageLogEntry>, attempt_count: u32, last_error: String) -> UsageDeadLetter {
        metrics::USAGE_DEAD_LETTERS.inc();
        UsageDeadLetter {
            id: format!("udl-{}", Uuid::new_v4()),
            entries,
            attempt_count,
            last_error,
            failed_at: self.clock.now(),
        }
    }

    /// Park a letter in the store, or in the outbox if that fails
    async fn park(&self, letter: UsageDeadLetter) {
        let parked = self
            .timeout
            .run("park_dead_letter", self.dead_letters.park_dead_letter(&letter))
            .await;
        if let Err(err) = parked {
            debug!(letter_id = %letter.id, error = %err, "Dead letter kept in local outbox");
            self.keep_local(letter);
        }
    }

    fn keep_local(&self, letter: UsageDeadLetter) {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        outbox.push(letter);
        let overflow = outbox.len().saturating_sub(self.config.max_dead_letters);
        if overflow > 0 {
            let dropped: Vec<UsageDeadLetter> = outbox.drain(..overflow).collect();
            let tokens: u64 = dropped
                .iter()
                .flat_map(|letter| &letter.entries)
                .filter(|entry| entry.attributed_parent_id.is_none())
                .map(|entry| entry.tokens_consumed)
                .sum();
            metrics::USAGE_DEAD_LETTERS_DROPPED_TOTAL.inc_by(overflow as u64);
            metrics::USAGE_DEAD_LETTERS.sub(overflow as i64);
            error!(
                dropped = overflow,
                tokens,
                "Usage dead-letter outbox full, oldest letters lost"
            );
        }
    }

    fn take_outbox(&self) -> Vec<UsageDeadLetter> {
        let mut outbox = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *outbox)
    }

    fn outbox_snapshot(&self) -> Vec<UsageDeadLetter> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn parked(&self) -> Result<Vec<UsageDeadLetter>, StoreError> {
        self.timeout
            .run(
                "parked_dead_letters",
                self.dead_letters
                    .parked_dead_letters(self.config.max_dead_letters),
            )
            .await
    }
}

/// Handle to the background usage writer
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl UsageRecorder {
    /// Start the writer task on the current Tokio runtime
    pub fn spawn(
        log: Arc<dyn UsageLog>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: UsageConfig,
        timeout: StoreTimeout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            log,
            dead_letters,
            timeout,
            clock,
            config,
            outbox: Mutex::new(Vec::new()),
        });
        tokio::spawn(run_worker(rx, shared.clone()));
        Self { tx, shared }
    }

    /// Queue an event; never blocks
    ///
    /// If the queue is full or the worker is gone the event goes straight to
    /// the local outbox; the next replay parks or writes it.
    pub fn record(&self, event: UsageEvent) {
        if let Err(err) = self.tx.try_send(Command::Record(event)) {
            let (reason, event) = match err {
                mpsc::error::TrySendError::Full(Command::Record(e)) => ("usage queue full", e),
                mpsc::error::TrySendError::Closed(Command::Record(e)) => ("usage worker stopped", e),
                _ => return,
            };
            metrics::USAGE_WRITE_FAILURES_TOTAL.inc();
            warn!(
                account_id = %event.account_id,
                request_id = %event.request_id,
                reason,
                "Usage event not queued, dead-lettered"
            );
            let letter = self.shared.letter(event.entries(), 0, reason.to_string());
            self.shared.keep_local(letter);
        }
    }

    /// Wait until every event queued before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Local outbox letters followed by the shared ones
    ///
    /// Only the outbox is returned while the store is unreachable.
    pub async fn dead_letters(&self) -> Vec<UsageDeadLetter> {
        let mut letters = self.shared.outbox_snapshot();
        match self.shared.parked().await {
            Ok(shared) => {
                for letter in shared {
                    if !letters.iter().any(|local| local.id == letter.id) {
                        letters.push(letter);
                    }
                }
            }
            Err(err) => warn!(error = %err, "Dead-letter store unreachable"),
        }
        letters
    }

    /// Try each dead letter once more; returns how many were written
    ///
    /// Outbox letters are parked in the store first. Each letter is claimed
    /// before its append, so two replaying processes never write it twice.
    pub async fn replay_dead_letters(&self) -> usize {
        for letter in self.shared.take_outbox() {
            self.shared.park(letter).await;
        }

        let parked = match self.shared.parked().await {
            Ok(parked) => parked,
            Err(err) => {
                warn!(error = %err, "Dead-letter store unreachable, replay skipped");
                return 0;
            }
        };

        let mut written = 0;
        let mut remaining = 0;
        for mut letter in parked {
            let claimed = self
                .shared
                .timeout
                .run("claim_dead_letter", self.shared.dead_letters.claim_dead_letter(&letter.id))
                .await;
            match claimed {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    remaining += 1;
                    continue;
                }
            }

            let result = self
                .shared
                .timeout
                .run("usage_append", self.shared.log.append(&letter.entries))
                .await;
            match result {
                Ok(()) => written += 1,
                Err(err) => {
                    letter.attempt_count += 1;
                    letter.last_error = err.to_string();
                    self.shared.park(letter).await;
                    remaining += 1;
                }
            }
        }

        let remaining = remaining + self.shared.outbox_snapshot().len();
        metrics::USAGE_DEAD_LETTERS.set(remaining as i64);
        if written > 0 {
            debug!(written, remaining, "Replayed usage dead letters");
        }
        written
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Command>, shared: Arc<Shared>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Record(event) => shared.write(event.entries()).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Usage recorder stopped");
}
