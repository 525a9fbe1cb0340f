//! Block dispatch: handing solved blocks to the node, durably.
//!
//! A block-level share must reach `submitblock` even if the node is down
//! at that moment. The dispatcher tries inline with bounded retries; on
//! failure it appends a pending record to an append-only JSONL log
//! (fsynced per record) and a replay worker retries each key on an
//! exponential backoff until the node accepts, at which point a
//! `submitted` record for the same key is appended. Submission failures
//! never surface to the miner; its share was already acknowledged.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher, RandomState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bitcoin::hash_types::BlockHash;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::node::NodeClient;
use crate::tracing::prelude::*;

/// A block-level share, fully serialised and ready for the node.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    pub hash: BlockHash,
    pub height: u64,
    pub worker: String,
    pub payout_address: String,
    pub block_hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Submitted,
}

/// One line of the pending-submissions log. A key (block hash) appears
/// once per status change; the final `submitted` record shares the key
/// with the earlier `pending` ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub timestamp: u64,
    pub height: u64,
    pub block_hash: String,
    pub worker: String,
    pub block_hex: String,
    pub last_error: Option<String>,
    pub endpoint: String,
    pub payout_address: String,
    pub status: PendingStatus,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Append-only JSONL log, fsynced per record.
pub struct PendingLog {
    path: PathBuf,
}

impl PendingLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn append(&self, record: &PendingRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await
    }

    /// Replay the log: the latest record per key wins; keys whose latest
    /// status is `pending` are due for retry.
    pub async fn load_pending(&self) -> std::io::Result<Vec<PendingRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut latest: HashMap<String, PendingRecord> = HashMap::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PendingRecord>(line) {
                Ok(record) => {
                    latest.insert(record.block_hash.clone(), record);
                }
                Err(e) => {
                    // A torn tail write after a crash; skip it.
                    warn!(error = %e, "Skipping malformed pending-log line");
                }
            }
        }

        Ok(latest
            .into_values()
            .filter(|record| record.status == PendingStatus::Pending)
            .collect())
    }
}

/// Exponential backoff with additive jitter.
///
/// Starts at `base` and doubles per failure, capping at `max`. Each delay
/// gets up to one extra `base` of jitter so simultaneous keys do not
/// retry in lockstep. RandomState is seeded from OS randomness at
/// construction, so different processes jitter differently.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    base: Duration,
    max: Duration,
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Return the next delay (with jitter) and advance the state.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let jitter = self.base.mul_f64(hasher.finish() as f64 / u64::MAX as f64);

        nominal + jitter
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// The saved-workers collaborator, reduced to the one query the core
/// makes: who wants to hear about this worker's block.
pub trait WorkerDirectory: Send + Sync {
    fn notify_interested(&self, worker: &str) -> Vec<u64>;
}

pub struct NoopWorkerDirectory;

impl WorkerDirectory for NoopWorkerDirectory {
    fn notify_interested(&self, _worker: &str) -> Vec<u64> {
        Vec::new()
    }
}

struct RetryEntry {
    record: PendingRecord,
    backoff: ExponentialBackoff,
    next_at: Instant,
}

pub struct BlockDispatcher {
    node: Arc<dyn NodeClient>,
    log: PendingLog,
    cfg: DispatchConfig,
    workers: Arc<dyn WorkerDirectory>,
    retries: parking_lot::Mutex<HashMap<String, RetryEntry>>,
}

impl BlockDispatcher {
    pub fn new(
        node: Arc<dyn NodeClient>,
        cfg: DispatchConfig,
        workers: Arc<dyn WorkerDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: PendingLog::new(cfg.pending_log.clone()),
            node,
            cfg,
            workers,
            retries: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Fire-and-forget entry point for the submit pipeline.
    pub fn spawn_dispatch(self: &Arc<Self>, block: FoundBlock) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(block).await;
        });
    }

    /// Submit a block with bounded inline retries; park it in the
    /// pending log if the node will not take it right now.
    pub async fn dispatch(&self, block: FoundBlock) {
        let mut last_error = String::new();
        for attempt in 0..self.cfg.submit_retries.max(1) {
            match self.node.submit_block(&block.block_hex).await {
                Ok(()) => {
                    self.celebrate(&block);
                    return;
                }
                Err(e) => {
                    warn!(
                        hash = %block.hash,
                        attempt,
                        error = %e,
                        "submitblock failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt + 1 < self.cfg.submit_retries {
                tokio::time::sleep(self.cfg.retry_delay).await;
            }
        }

        let record = PendingRecord {
            timestamp: unix_now(),
            height: block.height,
            block_hash: block.hash.to_string(),
            worker: block.worker.clone(),
            block_hex: block.block_hex.clone(),
            last_error: Some(last_error),
            endpoint: self.node.endpoint(),
            payout_address: block.payout_address.clone(),
            status: PendingStatus::Pending,
        };
        if let Err(e) = self.log.append(&record).await {
            error!(hash = %block.hash, error = %e, "Failed to append pending record");
        }
        self.park(record);
    }

    fn park(&self, record: PendingRecord) {
        let mut retries = self.retries.lock();
        let entry = retries.entry(record.block_hash.clone()).or_insert_with(|| {
            let mut backoff =
                ExponentialBackoff::new(self.cfg.backoff_base, self.cfg.backoff_max);
            let next_at = Instant::now() + backoff.next_delay();
            RetryEntry {
                record: record.clone(),
                backoff,
                next_at,
            }
        });
        entry.record = record;
    }

    fn celebrate(&self, block: &FoundBlock) {
        let interested = self.workers.notify_interested(&block.worker);
        info!(
            hash = %block.hash,
            height = block.height,
            worker = %block.worker,
            payout = %block.payout_address,
            interested_users = interested.len(),
            "Block accepted by node"
        );
    }

    /// One pass over parked submissions; retries only keys whose backoff
    /// has elapsed. Public for tests; the replay task loops over it.
    pub async fn replay_once(&self) {
        let due: Vec<PendingRecord> = {
            let now = Instant::now();
            self.retries
                .lock()
                .values()
                .filter(|entry| entry.next_at <= now)
                .map(|entry| entry.record.clone())
                .collect()
        };

        for record in due {
            match self.node.submit_block(&record.block_hex).await {
                Ok(()) => {
                    info!(hash = %record.block_hash, "Pending block accepted on retry");
                    let submitted = PendingRecord {
                        timestamp: unix_now(),
                        last_error: None,
                        status: PendingStatus::Submitted,
                        ..record.clone()
                    };
                    if let Err(e) = self.log.append(&submitted).await {
                        error!(error = %e, "Failed to append submitted record");
                    }
                    self.retries.lock().remove(&record.block_hash);
                }
                Err(e) => {
                    debug!(hash = %record.block_hash, error = %e, "Pending retry failed");
                    let mut retries = self.retries.lock();
                    if let Some(entry) = retries.get_mut(&record.block_hash) {
                        entry.record.last_error = Some(e.to_string());
                        entry.next_at = Instant::now() + entry.backoff.next_delay();
                    }
                }
            }
        }
    }

    /// Replay worker: load surviving pending records at boot, then retry
    /// periodically until cancelled.
    pub async fn run_replay(self: Arc<Self>, cancel: CancellationToken) {
        match self.log.load_pending().await {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!(count = pending.len(), "Loaded pending block submissions");
                }
                let mut retries = self.retries.lock();
                for record in pending {
                    // Boot replay retries immediately; subsequent
                    // failures back off per key.
                    retries.insert(
                        record.block_hash.clone(),
                        RetryEntry {
                            record,
                            backoff: ExponentialBackoff::new(
                                self.cfg.backoff_base,
                                self.cfg.backoff_max,
                            ),
                            next_at: Instant::now(),
                        },
                    );
                }
            }
            Err(e) => error!(error = %e, "Failed to load pending-submission log"),
        }

        let mut tick = tokio::time::interval(self.cfg.replay_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.replay_once().await,
                _ = cancel.cancelled() => break,
            }
        }
        trace!("Pending-submission replayer stopped.");
    }

    /// Number of parked submissions (operator logging and tests).
    pub fn pending_count(&self) -> usize {
        self.retries.lock().len()
    }
}
