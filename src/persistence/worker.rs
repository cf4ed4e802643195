//! Background persistence worker
//!
//! The trading loop hands records over a bounded channel and never waits on
//! storage. The worker batches them per series, flushes on a fixed tick and
//! runs the blocking file work on the blocking pool. History appends for a
//! series are throttled; live snapshots are coalesced to the latest value.
//! Failed writes stay queued for the next tick.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::store::PersistenceStore;
use super::HistoryBatch;
use crate::config::PersistenceConfig;
use crate::error::PersistError;

/// Messages from the trading loop
#[derive(Debug)]
pub enum PersistCommand {
    History { name: String, batch: HistoryBatch },
    Live { name: String, value: serde_json::Value },
    /// Pre-formatted `signals.log` line
    Log(String),
    /// Write everything pending, ignoring the throttle
    Flush(oneshot::Sender<FlushReport>),
    Shutdown,
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub histories_written: usize,
    pub lives_written: usize,
    pub log_lines_written: usize,
    /// Series left queued after a failed write
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.histories_written == 0 && self.lives_written == 0 && self.log_lines_written == 0 && self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct PendingHistory {
    batch: Option<HistoryBatch>,
    last_write: Option<Instant>,
}

/// Work moved onto the blocking pool
#[derive(Debug, Clone, Default)]
struct FlushBatch {
    histories: Vec<(String, HistoryBatch)>,
    lives: Vec<(String, serde_json::Value)>,
    log_lines: Vec<String>,
}

#[derive(Debug, Default)]
struct FlushOutcome {
    written: Vec<String>,
    failed_histories: Vec<(String, HistoryBatch, PersistError)>,
    lives_written: usize,
    failed_lives: Vec<(String, serde_json::Value, PersistError)>,
    log_lines_written: usize,
    failed_log: Option<(Vec<String>, PersistError)>,
}

impl FlushBatch {
    fn is_empty(&self) -> bool {
        self.histories.is_empty() && self.lives.is_empty() && self.log_lines.is_empty()
    }

    fn write(self, store: &PersistenceStore) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        for (name, batch) in self.histories {
            match batch.write(store, &name) {
                Ok(total) => {
                    debug!("{} +{} records ({} total)", name, batch.len(), total);
                    outcome.written.push(name);
                }
                Err(e) => outcome.failed_histories.push((name, batch, e)),
            }
        }

        for (name, value) in self.lives {
            match store.write_live(&name, &value) {
                Ok(()) => outcome.lives_written += 1,
                Err(e) => outcome.failed_lives.push((name, value, e)),
            }
        }

        if !self.log_lines.is_empty() {
            match store.append_log(&self.log_lines) {
                Ok(()) => outcome.log_lines_written = self.log_lines.len(),
                Err(e) => outcome.failed_log = Some((self.log_lines, e)),
            }
        }

        outcome
    }
}

pub struct PersistenceWorker {
    store: PersistenceStore,
    throttle: Duration,
    flush_interval: Duration,
    histories: BTreeMap<String, PendingHistory>,
    lives: BTreeMap<String, serde_json::Value>,
    log_lines: Vec<String>,
}

impl PersistenceWorker {
    /// Start the worker task for one data directory
    pub fn spawn(store: PersistenceStore, config: &PersistenceConfig) -> PersistenceHandle {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let worker = Self {
            store,
            throttle: config.throttle(),
            flush_interval: config.flush_interval(),
            histories: BTreeMap::new(),
            lives: BTreeMap::new(),
            log_lines: Vec::new(),
        };
        let task = tokio::spawn(worker.run(rx));

        PersistenceHandle {
            tx,
            overflow: VecDeque::new(),
            overflow_limit: config.channel_capacity.max(1) * 8,
            dropped: 0,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PersistCommand>) {
        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("persistence worker started for {:?}", self.store.dir());

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PersistCommand::History { name, batch }) => self.queue_history(name, batch),
                    Some(PersistCommand::Live { name, value }) => {
                        self.lives.insert(name, value);
                    }
                    Some(PersistCommand::Log(line)) => self.log_lines.push(line),
                    Some(PersistCommand::Flush(ack)) => {
                        let report = self.flush(true).await;
                        let _ = ack.send(report);
                    }
                    Some(PersistCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    self.flush(false).await;
                }
            }
        }

        // Drain whatever was queued behind the shutdown request
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                PersistCommand::History { name, batch } => self.queue_history(name, batch),
                PersistCommand::Live { name, value } => {
                    self.lives.insert(name, value);
                }
                PersistCommand::Log(line) => self.log_lines.push(line),
                PersistCommand::Flush(ack) => {
                    let _ = ack.send(FlushReport::default());
                }
                PersistCommand::Shutdown => {}
            }
        }

        let report = self.flush(true).await;
        if !report.failed.is_empty() {
            error!("final flush left {} series unwritten: {:?}", report.failed.len(), report.failed);
        }
        info!("persistence worker stopped for {:?}", self.store.dir());
    }

    fn queue_history(&mut self, name: String, batch: HistoryBatch) {
        let pending = self.histories.entry(name.clone()).or_default();
        match pending.batch.as_mut() {
            Some(existing) => {
                if let Some(mismatched) = existing.merge(batch) {
                    warn!("{}: dropped {} records of a different kind", name, mismatched.len());
                }
            }
            None => pending.batch = Some(batch),
        }
    }

    /// Write everything eligible. `force` ignores the per-series throttle.
    async fn flush(&mut self, force: bool) -> FlushReport {
        let now = Instant::now();
        let throttle = self.throttle;
        let mut batch = FlushBatch::default();

        for (name, pending) in self.histories.iter_mut() {
            let due = force || pending.last_write.map_or(true, |at| now.duration_since(at) >= throttle);
            if !due {
                continue;
            }
            if let Some(records) = pending.batch.take() {
                if records.is_empty() {
                    continue;
                }
                batch.histories.push((name.clone(), records));
            }
        }
        batch.lives = std::mem::take(&mut self.lives).into_iter().collect();
        batch.log_lines = std::mem::take(&mut self.log_lines);

        if batch.is_empty() {
            return FlushReport::default();
        }

        // History appends are keyed, so a rewrite after a partial write is harmless
        let retry = batch.clone();
        let store = self.store.clone();
        let outcome = match tokio::task::spawn_blocking(move || batch.write(&store)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("persistence flush task failed, batch requeued: {}", e);
                return self.requeue(retry);
            }
        };

        self.settle(outcome, now)
    }

    /// Put a whole batch back after the blocking task died
    fn requeue(&mut self, batch: FlushBatch) -> FlushReport {
        let mut report = FlushReport::default();
        for (name, failed) in batch.histories {
            self.restore_history(&name, failed);
            report.failed.push(name);
        }
        for (name, value) in batch.lives {
            self.lives.entry(name.clone()).or_insert(value);
            report.failed.push(name);
        }
        if !batch.log_lines.is_empty() {
            self.restore_log(batch.log_lines);
            report.failed.push("signals.log".to_string());
        }
        report
    }

    /// Failed records go in front of anything queued since
    fn restore_history(&mut self, name: &str, mut failed: HistoryBatch) {
        let pending = self.histories.entry(name.to_string()).or_default();
        if let Some(newer) = pending.batch.take() {
            if let Some(mismatched) = failed.merge(newer) {
                warn!("{}: dropped {} records of a different kind", name, mismatched.len());
            }
        }
        pending.batch = Some(failed);
    }

    fn restore_log(&mut self, mut lines: Vec<String>) {
        lines.append(&mut self.log_lines);
        self.log_lines = lines;
    }

    /// Record successes and put failures back in front of newer records
    fn settle(&mut self, outcome: FlushOutcome, flushed_at: Instant) -> FlushReport {
        let mut report = FlushReport {
            histories_written: outcome.written.len(),
            lives_written: outcome.lives_written,
            log_lines_written: outcome.log_lines_written,
            failed: Vec::new(),
        };

        for name in outcome.written {
            if let Some(pending) = self.histories.get_mut(&name) {
                pending.last_write = Some(flushed_at);
            }
        }

        for (name, failed, err) in outcome.failed_histories {
            match &err {
                PersistError::LockTimeout { .. } => warn!("{}: lock busy, cycle skipped ({})", name, err),
                _ => warn!("{}: write failed, will retry ({})", name, err),
            }
            self.restore_history(&name, failed);
            report.failed.push(name);
        }

        for (name, value, err) in outcome.failed_lives {
            warn!("{}: live write failed, will retry ({})", name, err);
            self.lives.entry(name.clone()).or_insert(value);
            report.failed.push(name);
        }

        if let Some((lines, err)) = outcome.failed_log {
            warn!("signal log write failed, will retry ({})", err);
            self.restore_log(lines);
            report.failed.push("signals.log".to_string());
        }

        report
    }
}

/// Sending side held by the trading loop
pub struct PersistenceHandle {
    tx: mpsc::Sender<PersistCommand>,
    /// Commands that found the channel full. History is merged per series
    /// and live snapshots per name, so only log lines can pile up here.
    overflow: VecDeque<PersistCommand>,
    overflow_limit: usize,
    dropped: u64,
    task: JoinHandle<()>,
}

impl PersistenceHandle {
    /// Hand a command to the worker without waiting
    pub fn submit(&mut self, cmd: PersistCommand) {
        self.drain_overflow();
        if !self.overflow.is_empty() {
            self.push_overflow(cmd);
            return;
        }
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => self.push_overflow(cmd),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped += 1;
                if self.dropped == 1 {
                    error!("persistence worker is gone, records are being dropped");
                }
            }
        }
    }

    pub fn submit_history(&mut self, name: impl Into<String>, batch: HistoryBatch) {
        self.submit(PersistCommand::History {
            name: name.into(),
            batch,
        });
    }

    pub fn submit_live<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => self.submit(PersistCommand::Live { name, value }),
            Err(e) => warn!("{}: snapshot not serializable ({})", name, e),
        }
    }

    pub fn submit_log(&mut self, line: String) {
        self.submit(PersistCommand::Log(line));
    }

    /// Commands dropped because the worker stopped, or log lines and live
    /// snapshots shed from a full overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait until everything submitted so far is written
    pub async fn flush(&mut self) -> Result<FlushReport> {
        self.send_overflow().await?;
        let (ack, done) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(ack))
            .await
            .context("persistence worker stopped")?;
        done.await.context("persistence worker dropped flush request")
    }

    /// Final flush, then wait for the worker to exit
    pub async fn shutdown(mut self) -> Result<()> {
        self.send_overflow().await?;
        // A closed channel means the worker already exited
        let _ = self.tx.send(PersistCommand::Shutdown).await;
        self.task.await.context("persistence worker panicked")
    }

    fn drain_overflow(&mut self) {
        while let Some(cmd) = self.overflow.pop_front() {
            match self.tx.try_send(cmd) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(cmd)) => {
                    self.overflow.push_front(cmd);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.dropped += self.overflow.len() as u64 + 1;
                    self.overflow.clear();
                    break;
                }
            }
        }
    }

    fn push_overflow(&mut self, cmd: PersistCommand) {
        let cmd = match cmd {
            PersistCommand::History { name, batch } => match self.overflow_history(&name) {
                Some(queued) => match queued.merge(batch) {
                    None => return,
                    Some(mismatched) => PersistCommand::History { name, batch: mismatched },
                },
                None => PersistCommand::History { name, batch },
            },
            PersistCommand::Live { name, value } => match self.overflow_live(&name) {
                Some(queued) => {
                    *queued = value;
                    return;
                }
                None => PersistCommand::Live { name, value },
            },
            other => other,
        };
        self.overflow.push_back(cmd);

        // Closed candles and indicator rows are never shed
        while self.overflow.len() > self.overflow_limit {
            let Some(pos) = self
                .overflow
                .iter()
                .position(|c| matches!(c, PersistCommand::Live { .. } | PersistCommand::Log(_)))
            else {
                break;
            };
            self.overflow.remove(pos);
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!("persistence backlog full, {} records dropped so far", self.dropped);
            }
        }
    }

    fn overflow_history(&mut self, series: &str) -> Option<&mut HistoryBatch> {
        self.overflow.iter_mut().find_map(|c| match c {
            PersistCommand::History { name, batch } if name.as_str() == series => Some(batch),
            _ => None,
        })
    }

    fn overflow_live(&mut self, snapshot: &str) -> Option<&mut serde_json::Value> {
        self.overflow.iter_mut().find_map(|c| match c {
            PersistCommand::Live { name, value } if name.as_str() == snapshot => Some(value),
            _ => None,
        })
    }

    async fn send_overflow(&mut self) -> Result<()> {
        while let Some(cmd) = self.overflow.pop_front() {
            self.tx.send(cmd).await.context("persistence worker stopped")?;
        }
        Ok(())
    }
}
