//! The shared share-submission pipeline.
//!
//! Both protocol frontends funnel submits through here. Processing runs
//! in two phases: *prepare* (parameter and policy checks, job lookup,
//! version-rolling resolution) under the connection's state lock, and
//! *process* (coinbase reassembly, merkle fold, header hash) off the
//! lock. The pipeline is protocol-neutral: it returns a verdict and each
//! frontend maps verdicts to its own wire responses.
//!
//! Every reject carries a reason from a closed set; the ban accounting
//! feeds on those reasons (duplicates excluded).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::consensus::encode::VarInt;
use futures::Future;
use serde_json::Value;
use strum::AsRefStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, SubmitPipelineConfig};
use crate::dispatch::{BlockDispatcher, FoundBlock};
use crate::job::{Job, JobId, JobManager};
use crate::merkle::fold_branch;
use crate::miner_conn::{BanVerdict, ConnShared, ConnState, JobMemo, SubmitState};
use crate::miner_conn::dup_ring::ShareFingerprint;
use crate::stratum::format_sig6;
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// How strictly submitted job ids are held against the current job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreshnessMode {
    /// Any known-or-current job is accepted; unknown ids fall back to
    /// the current job and classify as stale.
    Off,
    /// Unknown ids are rejected immediately.
    #[default]
    JobId,
    /// Additionally, shares on jobs whose prevhash/height no longer
    /// match the current job classify as stale.
    JobIdPrev,
}

/// Explicit gates for the single submit path.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub require_authorized_connection: bool,
    pub require_worker_match: bool,
    pub check_param_format: bool,
    pub check_version_rolling: bool,
    pub check_ntime_window: bool,
    pub check_duplicate: bool,
    pub job_freshness: FreshnessMode,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            require_authorized_connection: true,
            require_worker_match: true,
            check_param_format: true,
            check_version_rolling: true,
            check_ntime_window: true,
            check_duplicate: true,
            job_freshness: FreshnessMode::JobId,
        }
    }
}

/// The closed set of submit rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    InvalidParams,
    InvalidWorker,
    InvalidJobId,
    InvalidExtranonce2,
    InvalidNtime,
    InvalidNonce,
    InvalidVersion,
    InvalidVersionMask,
    InsufficientVersionBits,
    Unauthorized,
    WorkerMismatch,
    Banned,
    StaleJob,
    DuplicateShare,
    LowDifficulty,
    Internal,
}

impl RejectReason {
    /// Stratum error code for the reject tuple.
    pub fn code(self) -> i64 {
        use crate::stratum::*;
        match self {
            RejectReason::InvalidJobId | RejectReason::StaleJob => ERR_JOB_NOT_FOUND,
            RejectReason::DuplicateShare => ERR_DUPLICATE,
            RejectReason::LowDifficulty => ERR_LOW_DIFFICULTY,
            RejectReason::Unauthorized | RejectReason::Banned => ERR_UNAUTHORIZED,
            _ => ERR_OTHER,
        }
    }

    /// Default human-readable message; low-difficulty rejects carry a
    /// computed message instead.
    pub fn message(self) -> &'static str {
        match self {
            RejectReason::InvalidParams => "invalid params",
            RejectReason::InvalidWorker => "invalid worker",
            RejectReason::InvalidJobId => "job not found",
            RejectReason::InvalidExtranonce2 => "invalid extranonce2",
            RejectReason::InvalidNtime => "invalid ntime",
            RejectReason::InvalidNonce => "invalid nonce",
            RejectReason::InvalidVersion => "invalid version",
            RejectReason::InvalidVersionMask => "version bits outside mask",
            RejectReason::InsufficientVersionBits => "insufficient version bits",
            RejectReason::Unauthorized => "unauthorized worker",
            RejectReason::WorkerMismatch => "worker mismatch",
            RejectReason::Banned => "banned",
            RejectReason::StaleJob => "stale job",
            RejectReason::DuplicateShare => "duplicate share",
            RejectReason::LowDifficulty => "low difficulty share",
            RejectReason::Internal => "internal error",
        }
    }
}

/// A parsed `mining.submit`, fields still in wire form.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub worker: String,
    pub job_id: String,
    pub extranonce2_hex: String,
    pub ntime_hex: String,
    pub nonce_hex: String,
    pub version_hex: Option<String>,
}

impl SubmitRequest {
    /// Structural parse only: element count and types. Length and hex
    /// checks happen in prepare, where they map to specific reasons.
    pub fn from_params(params: &Value) -> Result<Self, RejectReason> {
        let array = params.as_array().ok_or(RejectReason::InvalidParams)?;
        if array.len() != 5 && array.len() != 6 {
            return Err(RejectReason::InvalidParams);
        }
        let as_str = |index: usize| -> Result<String, RejectReason> {
            array[index]
                .as_str()
                .map(str::to_owned)
                .ok_or(RejectReason::InvalidParams)
        };
        Ok(Self {
            worker: as_str(0)?,
            job_id: as_str(1)?,
            extranonce2_hex: as_str(2)?,
            ntime_hex: as_str(3)?,
            nonce_hex: as_str(4)?,
            version_hex: if array.len() == 6 {
                Some(as_str(5)?)
            } else {
                None
            },
        })
    }
}

/// The pipeline's protocol-neutral result.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitVerdict {
    Accept {
        difficulty: f64,
        block: bool,
    },
    Reject {
        reason: RejectReason,
        message: String,
    },
}

/// Verdict plus an optional `client.show_message`-worthy warning.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub verdict: SubmitVerdict,
    pub warning: Option<String>,
}

impl SubmitOutcome {
    fn reject(reason: RejectReason) -> Self {
        Self {
            verdict: SubmitVerdict::Reject {
                reason,
                message: reason.message().to_string(),
            },
            warning: None,
        }
    }
}

struct Prepared {
    job: Arc<Job>,
    memo: Arc<JobMemo>,
    extranonce2: Vec<u8>,
    ntime: u32,
    nonce: u32,
    version: u32,
    policy_reject: Option<RejectReason>,
    fingerprint: ShareFingerprint,
    worker: String,
    payout_address: String,
}

struct Processed {
    hash: bitcoin::BlockHash,
    share_ok: bool,
    block: Option<FoundBlock>,
    observed_difficulty: f64,
}

pub struct SubmitPipeline {
    cfg: Arc<Config>,
    jobs: Arc<JobManager>,
    dispatcher: Arc<BlockDispatcher>,
}

impl SubmitPipeline {
    pub fn new(cfg: Arc<Config>, jobs: Arc<JobManager>, dispatcher: Arc<BlockDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            jobs,
            dispatcher,
        })
    }

    /// Run one submit through prepare → process → finalize.
    ///
    /// Mutates connection state (duplicate ring, vardiff, ban counters)
    /// and spawns block dispatch as a side effect; responding to the
    /// miner is the caller's job.
    pub async fn submit(&self, conn: &ConnShared, request: SubmitRequest) -> SubmitOutcome {
        let now = Instant::now();

        let prepared = {
            let mut state = conn.state.lock();
            match self.prepare(&mut state, &request, now) {
                Ok(prepared) => prepared,
                Err(reason) => {
                    return self.finalize_early_reject(conn, &mut state, reason, now);
                }
            }
        };

        // Hashing happens off the connection lock.
        let processed = self.process(conn, &prepared);

        let mut state = conn.state.lock();
        self.finalize(conn, &mut state, prepared, processed, now)
    }

    fn options(&self) -> &SubmitOptions {
        &self.cfg.submit.options
    }

    /// Account for a submit (or frame) that never made it into the
    /// pipeline: unparseable JSON, bad parameter structure. These are
    /// protocol violations and feed the ban window like any other
    /// invalid submission.
    pub fn reject_unparsed(&self, conn: &ConnShared, reason: RejectReason) -> SubmitOutcome {
        let now = Instant::now();
        let mut state = conn.state.lock();
        self.finalize_early_reject(conn, &mut state, reason, now)
    }

    fn prepare(
        &self,
        state: &mut SubmitState,
        request: &SubmitRequest,
        now: Instant,
    ) -> Result<Prepared, RejectReason> {
        let options = self.options();

        if state.is_banned(now) {
            return Err(RejectReason::Banned);
        }

        if options.require_authorized_connection && state.worker.is_none() {
            return Err(RejectReason::Unauthorized);
        }

        if request.worker.len() > self.cfg.stratum.max_worker_len {
            return Err(RejectReason::InvalidWorker);
        }
        if options.require_worker_match
            && let Some(worker) = &state.worker
            && worker.label != request.worker
        {
            return Err(RejectReason::WorkerMismatch);
        }

        // Wire-format checks. Decoding has to happen regardless; the
        // option controls the strict length checks.
        let expected_ex2_hex = self.cfg.stratum.extranonce2_size * 2;
        if options.check_param_format {
            if request.extranonce2_hex.len() != expected_ex2_hex {
                return Err(RejectReason::InvalidExtranonce2);
            }
            if request.ntime_hex.len() != 8 {
                return Err(RejectReason::InvalidNtime);
            }
            if request.nonce_hex.len() != 8 {
                return Err(RejectReason::InvalidNonce);
            }
            if let Some(version) = &request.version_hex
                && version.len() > 8
            {
                return Err(RejectReason::InvalidVersion);
            }
        }
        let extranonce2 =
            hex::decode(&request.extranonce2_hex).map_err(|_| RejectReason::InvalidExtranonce2)?;
        let ntime =
            u32::from_str_radix(&request.ntime_hex, 16).map_err(|_| RejectReason::InvalidNtime)?;
        let nonce =
            u32::from_str_radix(&request.nonce_hex, 16).map_err(|_| RejectReason::InvalidNonce)?;
        let rolled_version = request
            .version_hex
            .as_deref()
            .map(|v| u32::from_str_radix(v, 16).map_err(|_| RejectReason::InvalidVersion))
            .transpose()?;

        // Job lookup with freshness classification.
        let job_id: JobId = request.job_id.parse().map_err(|_| RejectReason::InvalidJobId)?;
        let lookup = self.jobs.lookup(job_id).ok_or(RejectReason::Internal)?;
        let mut policy_reject = None;
        if !lookup.known {
            match options.job_freshness {
                FreshnessMode::Off => policy_reject = Some(RejectReason::StaleJob),
                FreshnessMode::JobId | FreshnessMode::JobIdPrev => {
                    return Err(RejectReason::InvalidJobId);
                }
            }
        } else if lookup.job.template.prev_hash != lookup.current.prev_hash
            || lookup.job.template.height != lookup.current.height
        {
            // A known but superseded job. Never discarded outright: the
            // proof of work may still be a block.
            policy_reject = Some(RejectReason::StaleJob);
        }
        let job = lookup.job;

        if options.check_ntime_window && (ntime < job.min_ntime || ntime > job.max_ntime) {
            return Err(RejectReason::InvalidNtime);
        }

        // BIP310 version rolling: an in-mask value is a delta; anything
        // else is a full version whose delta must still fit the mask.
        let template_version = job.template.version.to_consensus() as u32;
        let mask = state.version_mask.unwrap_or(0);
        let version = if let Some(rolled) = rolled_version {
            let delta = if rolled & !mask == 0 {
                rolled
            } else {
                rolled ^ template_version
            };
            if options.check_version_rolling {
                if delta & !mask != 0 {
                    return Err(RejectReason::InvalidVersionMask);
                }
                if state.min_version_bits > 0
                    && mask.count_ones() < state.min_version_bits
                {
                    return Err(RejectReason::InsufficientVersionBits);
                }
            }
            template_version ^ delta
        } else {
            template_version
        };

        let memo = state
            .memo_for(&job)
            .map_err(|e| {
                warn!(error = %e, job_id = %job.id, "Coinbase build failed in submit");
                RejectReason::Internal
            })?;

        let payout_address = state
            .worker
            .as_ref()
            .map(|w| w.address.clone())
            .unwrap_or_default();

        Ok(Prepared {
            fingerprint: ShareFingerprint {
                job_id: job.id,
                extranonce2: extranonce2.clone(),
                ntime,
                nonce,
                version,
            },
            job,
            memo,
            extranonce2,
            ntime,
            nonce,
            version,
            policy_reject,
            worker: request.worker.clone(),
            payout_address,
        })
    }

    /// The proof-of-work evaluation: reassemble, hash, classify.
    fn process(&self, conn: &ConnShared, prepared: &Prepared) -> Processed {
        let parts = &prepared.memo.parts;
        let ex1 = &conn.info.extranonce1;

        let (coinbase, txid) = match (
            parts.assemble(ex1, &prepared.extranonce2),
            parts.txid(ex1, &prepared.extranonce2),
        ) {
            (Ok(coinbase), Ok(txid)) => (coinbase, txid),
            _ => {
                // Lengths were validated in prepare; reaching this is a bug.
                return Processed {
                    hash: <bitcoin::BlockHash as bitcoin::hashes::Hash>::all_zeros(),
                    share_ok: false,
                    block: None,
                    observed_difficulty: 0.0,
                };
            }
        };

        let merkle_root = fold_branch(&txid, &prepared.job.merkle_branch);
        let header = Header {
            version: bitcoin::block::Version::from_consensus(prepared.version as i32),
            prev_blockhash: prepared.job.template.prev_hash,
            merkle_root,
            time: prepared.ntime,
            bits: prepared.job.template.bits,
            nonce: prepared.nonce,
        };
        let hash = header.block_hash();

        let share_target = Difficulty::from_f64(prepared.memo.difficulty);
        let network_target = Difficulty::from_target(prepared.job.network_target);
        let share_ok = share_target.is_met_by(&hash);
        let is_block = network_target.is_met_by(&hash);
        let observed_difficulty = Difficulty::from_hash(&hash).as_f64();

        let block = is_block.then(|| {
            let mut raw = consensus::serialize(&header);
            let transactions = &prepared.job.template.transactions;
            raw.extend(consensus::serialize(&VarInt(1 + transactions.len() as u64)));
            raw.extend_from_slice(&coinbase);
            for tx in transactions {
                raw.extend_from_slice(&tx.raw);
            }
            FoundBlock {
                hash,
                height: prepared.job.template.height,
                worker: prepared.worker.clone(),
                payout_address: prepared.payout_address.clone(),
                block_hex: hex::encode(raw),
            }
        });

        Processed {
            hash,
            share_ok,
            block,
            observed_difficulty,
        }
    }

    fn finalize(
        &self,
        conn: &ConnShared,
        state: &mut SubmitState,
        prepared: Prepared,
        processed: Processed,
        now: Instant,
    ) -> SubmitOutcome {
        let is_block = processed.block.is_some();

        // A block-level share always reaches the node, whatever pool
        // policy says about it.
        if let Some(block) = processed.block {
            info!(
                hash = %block.hash,
                height = block.height,
                worker = %block.worker,
                "BLOCK FOUND"
            );
            self.dispatcher.spawn_dispatch(block);
        }

        let reject = |reason: RejectReason| SubmitVerdict::Reject {
            reason,
            message: reason.message().to_string(),
        };

        let verdict = if let Some(reason) = prepared.policy_reject
            && !is_block
        {
            reject(reason)
        } else if !processed.share_ok && !is_block {
            SubmitVerdict::Reject {
                reason: RejectReason::LowDifficulty,
                message: format!(
                    "low difficulty share ({} expected {})",
                    format_sig6(processed.observed_difficulty),
                    format_sig6(prepared.memo.difficulty),
                ),
            }
        } else if self.options().check_duplicate
            && state.dup_ring.insert(prepared.fingerprint)
            && !is_block
        {
            reject(RejectReason::DuplicateShare)
        } else {
            SubmitVerdict::Accept {
                difficulty: prepared.memo.difficulty,
                block: is_block,
            }
        };

        let mut warning = None;
        match &verdict {
            SubmitVerdict::Accept { difficulty, .. } => {
                state.accepted_shares += 1;
                if processed.observed_difficulty > state.best_share_difficulty {
                    state.best_share_difficulty = processed.observed_difficulty;
                }
                state.vardiff.note_share(now);
                if state.state == ConnState::Authorized {
                    state.state = ConnState::Mining;
                }
                trace!(
                    conn = %conn.info.id,
                    hash = %processed.hash,
                    difficulty,
                    "Share accepted"
                );
            }
            SubmitVerdict::Reject { reason, .. } => {
                state.rejected_shares += 1;
                debug!(
                    conn = %conn.info.id,
                    reason = reason.as_ref(),
                    "Share rejected"
                );
                warning = self.account_reject(conn, state, *reason, now);
            }
        }

        SubmitOutcome { verdict, warning }
    }

    fn finalize_early_reject(
        &self,
        conn: &ConnShared,
        state: &mut SubmitState,
        reason: RejectReason,
        now: Instant,
    ) -> SubmitOutcome {
        state.rejected_shares += 1;
        // Responding "banned" to an already-banned miner is not a new
        // offence.
        let warning = match reason {
            RejectReason::Banned => None,
            _ => self.ban_account(state, reason, now),
        };
        if let Some(until) = state.banned_until {
            conn.registry.set_banned(conn.info.id, until);
        }
        let mut outcome = SubmitOutcome::reject(reason);
        outcome.warning = warning;
        outcome
    }

    /// Ban bookkeeping for a reject that already went through the full
    /// pipeline. Returns a warning message when one is due.
    fn account_reject(
        &self,
        conn: &ConnShared,
        state: &mut SubmitState,
        reason: RejectReason,
        now: Instant,
    ) -> Option<String> {
        let warning = match reason {
            RejectReason::Banned => None,
            RejectReason::DuplicateShare => {
                let strikes = state.note_duplicate();
                (strikes > 3 && strikes % 10 == 0).then(|| {
                    "Repeated duplicate shares; check your miner configuration.".to_string()
                })
            }
            _ => self.ban_account(state, reason, now),
        };
        if let Some(until) = state.banned_until {
            conn.registry.set_banned(conn.info.id, until);
        }
        warning
    }

    fn ban_account(
        &self,
        state: &mut SubmitState,
        reason: RejectReason,
        now: Instant,
    ) -> Option<String> {
        debug_assert!(reason != RejectReason::DuplicateShare);
        match state.note_invalid(now, &self.cfg.ban) {
            BanVerdict::None => None,
            BanVerdict::Warn { strikes_left } => Some(format!(
                "Too many invalid submissions; {strikes_left} more and this connection will be banned."
            )),
            BanVerdict::Banned { .. } => {
                warn!(reason = reason.as_ref(), "Connection banned for invalid submissions");
                Some("Connection banned for repeated invalid submissions.".to_string())
            }
        }
    }
}

/// Executes submit futures either inline on the connection task or on a
/// fixed-size worker pool draining a bounded channel.
pub enum SubmitExecutor {
    Inline,
    Pool {
        tx: mpsc::Sender<SubmitFuture>,
    },
}

pub type SubmitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

impl SubmitExecutor {
    pub fn new(
        cfg: &SubmitPipelineConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        if cfg.inline {
            return Arc::new(Self::Inline);
        }

        let workers = if cfg.workers > 0 {
            cfg.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };
        let (tx, rx) = mpsc::channel::<SubmitFuture>(cfg.queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..workers {
            let rx = rx.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(task) = task else { break };
                    // Run each submit as its own task so a panic inside
                    // the pipeline is contained and logged, not fatal to
                    // the pool.
                    if let Err(e) = tokio::spawn(task).await
                        && e.is_panic()
                    {
                        error!(worker, "Submit worker task panicked");
                    }
                }
                trace!(worker, "Submit worker stopped.");
            });
        }
        Arc::new(Self::Pool { tx })
    }

    /// Run or enqueue a submit future. Enqueueing applies backpressure
    /// when the pool is saturated.
    pub async fn execute(&self, future: SubmitFuture) {
        match self {
            Self::Inline => future.await,
            Self::Pool { tx } => {
                if tx.send(future).await.is_err() {
                    debug!("Submit queue closed; dropping submit");
                }
            }
        }
    }
}
