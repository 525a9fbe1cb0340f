//! Per-connection Stratum v1 actor.
//!
//! Each accepted socket gets one task owning a line-framed reader loop;
//! all outgoing frames go through a write mutex with a deadline so
//! responses and job pushes never interleave mid-frame. Connection state
//! (authorization, version mask, vardiff, duplicate ring, ban counters)
//! is owned here and mutated only under the state lock.
//!
//! State machine: Handshake → Subscribed → Authorized → Mining, with
//! Banned and Closed as terminal-ish offshoots. `mining.configure` may
//! arrive before subscribe; authorize must come after subscribe.

pub mod dup_ring;
pub mod vardiff;

use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hasher, RandomState};
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use bitcoin::ScriptBuf;
use bitcoin::address::Address;
use bitcoin::hashes::Hash;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::coinbase::{CoinbaseError, CoinbaseParts};
use crate::config::{BanConfig, Config};
use crate::job::{Job, JobId, JobManager};
use crate::registry::{ConnControl, ConnectionId, ConnectionRegistry};
use crate::stratum::{
    self, MAX_SHOW_MESSAGE_LEN, Request, Response, be_hex_u32, fast, notification, prevhash_hex,
};
use crate::submit::{RejectReason, SubmitExecutor, SubmitPipeline, SubmitRequest, SubmitVerdict};
use crate::tracing::prelude::*;

use dup_ring::DuplicateRing;
use vardiff::Vardiff;

/// Job memos kept per connection for late shares on old jobs.
const JOB_MEMO_CAP: usize = 16;

/// Duplicate ring depth.
const DUP_RING_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshake,
    Subscribed,
    Authorized,
    Mining,
    Banned,
    Closed,
}

/// The authorized worker and its payout script.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    /// Full worker label as authorized (wallet.rig).
    pub label: String,
    /// The wallet address portion, as text for logs and records.
    pub address: String,
    pub script: ScriptBuf,
}

/// Per-job data memoised at notify time: the coinbase halves sent to
/// this miner and the difficulty in force, so a late share on an old job
/// is checked against that job's parameters.
#[derive(Debug)]
pub struct JobMemo {
    pub parts: CoinbaseParts,
    pub difficulty: f64,
}

#[derive(Debug)]
pub enum BanVerdict {
    None,
    Warn { strikes_left: u32 },
    Banned { until: Instant },
}

/// Mutable per-connection state, guarded by the connection's state lock.
pub struct SubmitState {
    pub state: ConnState,
    pub worker: Option<WorkerIdentity>,
    /// Negotiated BIP310 mask (client ∩ pool).
    pub version_mask: Option<u32>,
    pub min_version_bits: u32,
    pub vardiff: Vardiff,
    pub dup_ring: DuplicateRing,
    pub banned_until: Option<Instant>,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub best_share_difficulty: f64,
    pub last_activity: Instant,
    difficulty_announced: bool,
    dup_strikes: u32,
    invalid_times: VecDeque<Instant>,
    memo: HashMap<JobId, Arc<JobMemo>>,
    memo_order: VecDeque<JobId>,
}

impl SubmitState {
    pub fn new(cfg: &Config, now: Instant) -> Self {
        Self {
            state: ConnState::Handshake,
            worker: None,
            version_mask: None,
            min_version_bits: 0,
            vardiff: Vardiff::new(cfg.vardiff.clone(), now),
            dup_ring: DuplicateRing::new(DUP_RING_CAP),
            banned_until: None,
            accepted_shares: 0,
            rejected_shares: 0,
            best_share_difficulty: 0.0,
            last_activity: now,
            difficulty_announced: false,
            dup_strikes: 0,
            invalid_times: VecDeque::new(),
            memo: HashMap::new(),
            memo_order: VecDeque::new(),
        }
    }

    pub fn is_banned(&self, now: Instant) -> bool {
        match self.banned_until {
            Some(until) => now < until,
            None => false,
        }
    }

    /// The memoised parts/difficulty for a job, built on demand for jobs
    /// this connection was never notified of (freshness mode `off`).
    pub fn memo_for(&mut self, job: &Arc<Job>) -> Result<Arc<JobMemo>, CoinbaseError> {
        if let Some(memo) = self.memo.get(&job.id) {
            return Ok(memo.clone());
        }
        let script = self.worker.as_ref().map(|w| w.script.clone());
        let parts = job.coinbase_parts(script.as_ref())?;
        let memo = Arc::new(JobMemo {
            parts,
            difficulty: self.vardiff.current(),
        });
        self.remember_job(job.id, memo.clone());
        Ok(memo)
    }

    pub fn remember_job(&mut self, id: JobId, memo: Arc<JobMemo>) {
        if self.memo.insert(id, memo).is_none() {
            self.memo_order.push_back(id);
            while self.memo_order.len() > JOB_MEMO_CAP {
                if let Some(evicted) = self.memo_order.pop_front() {
                    self.memo.remove(&evicted);
                }
            }
        }
    }

    /// Record an invalid submission (duplicates are excluded by the
    /// caller) and apply the ban policy.
    pub fn note_invalid(&mut self, now: Instant, cfg: &BanConfig) -> BanVerdict {
        self.invalid_times.push_back(now);
        while let Some(&front) = self.invalid_times.front() {
            if now.duration_since(front) > cfg.window {
                self.invalid_times.pop_front();
            } else {
                break;
            }
        }

        let strikes = self.invalid_times.len() as u32;
        if strikes >= cfg.invalid_submissions_after {
            let until = now + cfg.duration;
            self.banned_until = Some(until);
            self.state = ConnState::Banned;
            self.invalid_times.clear();
            BanVerdict::Banned { until }
        } else if strikes + cfg.warn_margin >= cfg.invalid_submissions_after {
            BanVerdict::Warn {
                strikes_left: cfg.invalid_submissions_after - strikes,
            }
        } else {
            BanVerdict::None
        }
    }

    pub fn note_duplicate(&mut self) -> u32 {
        self.dup_strikes += 1;
        self.dup_strikes
    }
}

/// Write half of a connection: a mutex-serialised sink with a deadline
/// on every frame.
pub struct LineWriter {
    sink: tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    deadline: Duration,
}

impl LineWriter {
    pub fn new(writer: impl AsyncWrite + Send + 'static, deadline: Duration) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(Box::pin(writer)),
            deadline,
        }
    }

    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.deadline, async {
            sink.write_all(line.as_bytes()).await?;
            sink.write_all(b"\n").await?;
            sink.flush().await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))?
    }
}

/// Identity and immutable parameters of one connection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub extranonce1: Vec<u8>,
    pub session_id: String,
}

/// Everything the submit pipeline needs to reach back into a connection.
pub struct ConnShared {
    pub info: ConnInfo,
    pub cfg: Arc<Config>,
    pub state: Mutex<SubmitState>,
    pub writer: Arc<LineWriter>,
    pub registry: Arc<ConnectionRegistry>,
}

/// Wiring shared by every connection task.
#[derive(Clone)]
pub struct ConnDeps {
    pub cfg: Arc<Config>,
    pub jobs: Arc<JobManager>,
    pub pipeline: Arc<SubmitPipeline>,
    pub executor: Arc<SubmitExecutor>,
    pub registry: Arc<ConnectionRegistry>,
    pub cancel: CancellationToken,
}

/// Unique per-connection extranonce1. A process-random base keeps
/// restarts from reissuing the same sequence; the multiplier mixes the
/// counter bijectively across the byte range.
fn extranonce1_for(conn_id: u64, len: usize) -> Vec<u8> {
    static SEED: LazyLock<u64> = LazyLock::new(|| {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u64(0x7a6e756b69);
        hasher.finish()
    });
    let mixed = SEED
        .wrapping_add(conn_id)
        .wrapping_mul(0x9e37_79b9_7f4a_7c15);
    mixed.to_be_bytes()[..len.min(8)].to_vec()
}

/// Serve one miner connection until EOF, error, ban-kick, idle timeout,
/// or shutdown.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, deps: ConnDeps) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (control_tx, mut control_rx) = mpsc::channel(8);
    let guard = deps.registry.register(peer, control_tx);
    let id = guard.id;

    let conn = Arc::new(ConnShared {
        info: ConnInfo {
            id,
            peer,
            extranonce1: extranonce1_for(id.0, deps.cfg.stratum.extranonce1_len),
            session_id: format!("{:08x}", id.0),
        },
        cfg: deps.cfg.clone(),
        state: Mutex::new(SubmitState::new(&deps.cfg, Instant::now())),
        writer: Arc::new(LineWriter::new(write_half, deps.cfg.stratum.write_deadline)),
        registry: deps.registry.clone(),
    });
    debug!(conn = %id, %peer, "Miner connected");

    let mut frames = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(deps.cfg.stratum.max_line_len),
    );
    let mut job_rx = deps.jobs.subscribe();
    let mut idle_check = tokio::time::interval(Duration::from_secs(30));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(line)) => {
                    conn.state.lock().last_activity = Instant::now();
                    if let Err(e) = handle_line(&conn, &deps, &line).await {
                        debug!(conn = %id, error = %e, "Connection write failed");
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(conn = %id, error = %e, "Read error");
                    break;
                }
                None => break,
            },
            job = job_rx.recv() => match job {
                Ok(job) => {
                    if push_job(&conn, &job).await.is_err() {
                        break;
                    }
                }
                // Fell behind; the next recv resumes at the newest job.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(conn = %id, skipped, "Job feed lagged, coalescing");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            control = control_rx.recv() => match control {
                Some(ConnControl::ShowMessage(text)) => {
                    if show_message(&conn, &text).await.is_err() {
                        break;
                    }
                }
                Some(ConnControl::Close) | None => break,
            },
            _ = idle_check.tick() => {
                let last = conn.state.lock().last_activity;
                if last.elapsed() > deps.cfg.stratum.idle_timeout {
                    debug!(conn = %id, "Idle timeout");
                    break;
                }
            }
            _ = deps.cancel.cancelled() => break,
        }
    }

    {
        let mut state = conn.state.lock();
        state.state = ConnState::Closed;
        debug!(
            conn = %id,
            accepted = state.accepted_shares,
            rejected = state.rejected_shares,
            best = state.best_share_difficulty,
            "Miner disconnected"
        );
    }
    Ok(())
}

async fn handle_line(conn: &Arc<ConnShared>, deps: &ConnDeps, line: &str) -> std::io::Result<()> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            // A garbage line is a protocol violation: no response (there
            // is no id to echo), but it counts toward the ban window.
            debug!(conn = %conn.info.id, error = %e, "Unparseable line");
            deps.pipeline
                .reject_unparsed(conn, RejectReason::InvalidParams);
            return Ok(());
        }
    };

    match request.method.as_str() {
        "mining.configure" => handle_configure(conn, deps, request).await,
        "mining.subscribe" => handle_subscribe(conn, deps, request).await,
        "mining.authorize" => handle_authorize(conn, deps, request).await,
        "mining.submit" => handle_submit(conn, deps, request).await,
        "mining.suggest_difficulty" => handle_suggest_difficulty(conn, request).await,
        "mining.ping" => {
            conn.writer
                .write_line(&fast::result_pong(&request.id))
                .await
        }
        "mining.extranonce.subscribe" => {
            conn.writer
                .write_line(&fast::result_true(&request.id))
                .await
        }
        other => {
            debug!(conn = %conn.info.id, method = other, "Unknown method");
            conn.writer
                .write_line(
                    &Response::error(request.id, stratum::ERR_OTHER, "unknown method").to_line(),
                )
                .await
        }
    }
}

/// BIP310 `mining.configure`. May arrive before subscribe.
async fn handle_configure(
    conn: &Arc<ConnShared>,
    deps: &ConnDeps,
    request: Request,
) -> std::io::Result<()> {
    let requested = request.params.get(0).and_then(Value::as_array);
    let wants_version_rolling = requested
        .map(|features| features.iter().any(|f| f.as_str() == Some("version-rolling")))
        .unwrap_or(false);

    if !wants_version_rolling {
        return conn
            .writer
            .write_line(&Response::ok(request.id, json!({})).to_line())
            .await;
    }

    let template_allows = deps
        .jobs
        .current()
        .map(|job| job.template.version_rolling_allowed)
        .unwrap_or(true);

    let options = request.params.get(1);
    let client_mask = options
        .and_then(|o| o.get("version-rolling.mask"))
        .and_then(Value::as_str)
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .unwrap_or(0xffff_ffff);
    let min_bit_count = options
        .and_then(|o| o.get("version-rolling.min-bit-count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let granted = client_mask & conn.cfg.stratum.version_mask;
    if !template_allows || granted == 0 {
        return conn
            .writer
            .write_line(
                &Response::ok(request.id, json!({"version-rolling": false})).to_line(),
            )
            .await;
    }

    {
        let mut state = conn.state.lock();
        state.version_mask = Some(granted);
        state.min_version_bits = min_bit_count;
    }
    debug!(
        conn = %conn.info.id,
        mask = format!("{granted:#010x}"),
        min_bit_count,
        "Version rolling negotiated"
    );

    let result = json!({
        "version-rolling": true,
        "version-rolling.mask": format!("{granted:08x}"),
        "version-rolling.min-bit-count": min_bit_count,
    });
    conn.writer
        .write_line(&Response::ok(request.id, result).to_line())
        .await
}

async fn handle_subscribe(
    conn: &Arc<ConnShared>,
    deps: &ConnDeps,
    request: Request,
) -> std::io::Result<()> {
    let user_agent = request
        .params
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    trace!(conn = %conn.info.id, user_agent, "Subscribe");

    {
        let mut state = conn.state.lock();
        if state.state == ConnState::Handshake {
            state.state = ConnState::Subscribed;
        }
    }

    let line = fast::result_subscribe(
        &request.id,
        &conn.info.session_id,
        &hex::encode(&conn.info.extranonce1),
        conn.cfg.stratum.extranonce2_size,
        conn.cfg.stratum.expanded_subscribe,
    );
    conn.writer.write_line(&line).await?;

    // Miners expect work promptly after subscribing. Without a fallback
    // payout script this quietly waits for authorize instead.
    if let Some(job) = deps.jobs.current() {
        let _ = push_job(conn, &job).await;
    }
    Ok(())
}

async fn handle_authorize(
    conn: &Arc<ConnShared>,
    deps: &ConnDeps,
    request: Request,
) -> std::io::Result<()> {
    let worker = request
        .params
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let subscribed = {
        let state = conn.state.lock();
        state.state != ConnState::Handshake
    };
    if !subscribed {
        return conn
            .writer
            .write_line(
                &Response::error(request.id, stratum::ERR_OTHER, "subscribe first").to_line(),
            )
            .await;
    }

    if worker.is_empty() || worker.len() > conn.cfg.stratum.max_worker_len {
        return conn
            .writer
            .write_line(
                &Response::error(request.id, stratum::ERR_OTHER, "invalid worker").to_line(),
            )
            .await;
    }

    // The wallet is everything before the first '.'; the rest names the
    // rig and is free-form.
    let wallet = worker.split('.').next().unwrap_or(&worker);
    let address = match Address::from_str(wallet)
        .ok()
        .and_then(|a| a.require_network(conn.cfg.network()).ok())
    {
        Some(address) => address,
        None => {
            debug!(conn = %conn.info.id, worker = %worker, "Authorize rejected: bad address");
            return conn
                .writer
                .write_line(
                    &Response::error(request.id, stratum::ERR_OTHER, "invalid worker").to_line(),
                )
                .await;
        }
    };

    {
        let mut state = conn.state.lock();
        state.worker = Some(WorkerIdentity {
            label: worker.clone(),
            address: address.to_string(),
            script: address.script_pubkey(),
        });
        if matches!(state.state, ConnState::Subscribed) {
            state.state = ConnState::Authorized;
        }
    }
    conn.registry.set_worker(conn.info.id, worker.clone());
    info!(conn = %conn.info.id, worker = %worker, "Worker authorized");

    conn.writer
        .write_line(&fast::result_true(&request.id))
        .await?;

    // Re-notify so the miner starts working against its own payout
    // script rather than the pool fallback.
    if let Some(job) = deps.jobs.current() {
        let _ = push_job(conn, &job).await;
    }
    Ok(())
}

async fn handle_submit(
    conn: &Arc<ConnShared>,
    deps: &ConnDeps,
    request: Request,
) -> std::io::Result<()> {
    let submit = match SubmitRequest::from_params(&request.params) {
        Ok(submit) => submit,
        Err(reason) => {
            let outcome = deps.pipeline.reject_unparsed(conn, reason);
            let line =
                Response::error(request.id, reason.code(), reason.message()).to_line();
            conn.writer.write_line(&line).await?;
            if let Some(warning) = outcome.warning {
                let _ = show_message(conn, &warning).await;
            }
            return Ok(());
        }
    };

    let conn = conn.clone();
    let pipeline = deps.pipeline.clone();
    let id = request.id;
    deps.executor
        .execute(Box::pin(async move {
            respond_submit(conn, pipeline, id, submit).await;
        }))
        .await;
    Ok(())
}

/// Map the pipeline verdict onto the v1 wire. A v2 frontend would
/// register its own mapping over the same pipeline.
async fn respond_submit(
    conn: Arc<ConnShared>,
    pipeline: Arc<SubmitPipeline>,
    id: Value,
    request: SubmitRequest,
) {
    let outcome = pipeline.submit(&conn, request).await;
    let line = match &outcome.verdict {
        SubmitVerdict::Accept { .. } => fast::result_true(&id),
        SubmitVerdict::Reject { reason, message } => {
            Response::error(id.clone(), reason.code(), message.clone()).to_line()
        }
    };
    if let Err(e) = conn.writer.write_line(&line).await {
        debug!(conn = %conn.info.id, error = %e, "Submit response write failed");
        return;
    }
    if let Some(warning) = outcome.warning {
        let _ = show_message(&conn, &warning).await;
    }
}

async fn handle_suggest_difficulty(
    conn: &Arc<ConnShared>,
    request: Request,
) -> std::io::Result<()> {
    if let Some(difficulty) = request
        .params
        .get(0)
        .and_then(Value::as_f64)
        .filter(|d| *d > 0.0)
    {
        conn.state.lock().vardiff.suggest(difficulty, Instant::now());
        debug!(conn = %conn.info.id, difficulty, "Difficulty suggested");
    }
    conn.writer
        .write_line(&fast::result_true(&request.id))
        .await
}

pub async fn show_message(conn: &ConnShared, text: &str) -> std::io::Result<()> {
    let mut text = text.to_string();
    text.truncate(MAX_SHOW_MESSAGE_LEN);
    conn.writer
        .write_line(&notification("client.show_message", json!([text])))
        .await
}

/// Send a job to this miner: a staged `mining.set_difficulty` first when
/// one is due, then the `mining.notify`.
pub async fn push_job(conn: &Arc<ConnShared>, job: &Arc<Job>) -> std::io::Result<()> {
    let now = Instant::now();
    let staged = {
        let mut state = conn.state.lock();
        if state.is_banned(now) {
            return Ok(());
        }
        if state.state == ConnState::Handshake {
            return Ok(());
        }

        state.vardiff.tick(now);
        let mut announce = state.vardiff.take_pending();
        if !state.difficulty_announced && announce.is_none() {
            announce = Some(state.vardiff.current());
        }

        let script = state.worker.as_ref().map(|w| w.script.clone());
        let parts = match job.coinbase_parts(script.as_ref()) {
            Ok(parts) => parts,
            Err(CoinbaseError::EmptyScript) => {
                // No worker script and no pool fallback; hold work until
                // authorize.
                return Ok(());
            }
            Err(e) => {
                warn!(conn = %conn.info.id, error = %e, "Coinbase build failed on push");
                return Ok(());
            }
        };

        let memo = Arc::new(JobMemo {
            parts,
            difficulty: state.vardiff.current(),
        });
        state.remember_job(job.id, memo.clone());
        state.difficulty_announced = true;
        (announce, memo)
    };
    let (announce, memo) = staged;

    if let Some(difficulty) = announce {
        conn.writer
            .write_line(&notification("mining.set_difficulty", json!([difficulty])))
            .await?;
    }
    conn.writer.write_line(&notify_line(job, &memo.parts)).await
}

fn notify_line(job: &Job, parts: &CoinbaseParts) -> String {
    let branch: Vec<String> = job
        .merkle_branch
        .iter()
        .map(|node| hex::encode(node.to_byte_array()))
        .collect();
    let params = json!([
        job.id.to_string(),
        prevhash_hex(&job.template.prev_hash),
        hex::encode(&parts.coinb1),
        hex::encode(&parts.coinb2),
        branch,
        be_hex_u32(job.template.version.to_consensus() as u32),
        be_hex_u32(job.template.bits.to_consensus()),
        be_hex_u32(job.template.cur_time),
        job.clean_jobs,
    ]);
    notification("mining.notify", params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::{MockNode, temp_log_path, test_dispatch_config};
    use crate::dispatch::{BlockDispatcher, NoopWorkerDirectory};
    use crate::job::test_support::{fixture_template, fixture_template_with};
    use crate::stratum::prevhash_from_hex;
    use crate::types::Difficulty;
    use bitcoin::Network;
    use bitcoin::pow::{CompactTarget, Target};
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const MAINNET_WORKER: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa.rig1";
    const REGTEST_WORKER: &str = "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn.rig1";

    struct Harness {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
        jobs: Arc<JobManager>,
        registry: Arc<ConnectionRegistry>,
        node: Arc<MockNode>,
        log_path: PathBuf,
    }

    async fn start(cfg: Arc<Config>) -> Harness {
        let payouts = cfg.validate().expect("test config");
        let jobs = JobManager::new(cfg.clone(), payouts);
        let node = MockNode::new();
        let log_path = temp_log_path("conn");
        let dispatcher = BlockDispatcher::new(
            node.clone(),
            test_dispatch_config(log_path.clone()),
            Arc::new(NoopWorkerDirectory),
        );
        let pipeline = SubmitPipeline::new(cfg.clone(), jobs.clone(), dispatcher);
        let registry = ConnectionRegistry::new();
        let deps = ConnDeps {
            cfg: cfg.clone(),
            jobs: jobs.clone(),
            pipeline,
            executor: Arc::new(SubmitExecutor::Inline),
            registry: registry.clone(),
            cancel: CancellationToken::new(),
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer = "203.0.113.5:45000".parse().unwrap();
        tokio::spawn(serve_connection(server, peer, deps));

        let (read_half, writer) = tokio::io::split(client);
        Harness {
            lines: BufReader::new(read_half).lines(),
            writer,
            jobs,
            registry,
            node,
            log_path,
        }
    }

    fn mainnet_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    impl Harness {
        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv_raw(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a frame")
                .expect("read error")
                .expect("connection closed")
        }

        async fn recv(&mut self) -> Value {
            let line = self.recv_raw().await;
            serde_json::from_str(&line).expect("server frames are valid JSON")
        }

        /// Next response, skipping notifications.
        async fn recv_response(&mut self) -> Value {
            loop {
                let frame = self.recv().await;
                if frame.get("method").is_none() {
                    return frame;
                }
            }
        }

        /// Next notification with the given method, skipping others.
        async fn recv_notification(&mut self, method: &str) -> Value {
            loop {
                let frame = self.recv().await;
                if frame.get("method").and_then(Value::as_str) == Some(method) {
                    return frame;
                }
            }
        }

        async fn subscribe(&mut self) -> Value {
            self.send(
                r#"{"id":"sub-1","method":"mining.subscribe","params":["cgminer/4.11.1","resume-fixed-session"]}"#,
            )
            .await;
            self.recv_response().await
        }

        async fn authorize(&mut self, worker: &str) -> Value {
            self.send(&format!(
                r#"{{"id":1,"method":"mining.authorize","params":["{worker}",""]}}"#
            ))
            .await;
            self.recv_response().await
        }

        async fn cleanup(self) {
            let _ = tokio::fs::remove_file(&self.log_path).await;
        }
    }

    /// Mine a share against the given difficulty from real wire data,
    /// the way a miner would: assemble the coinbase from the subscribe
    /// and notify frames, fold the branch, and walk nonces.
    fn mine(
        subscribe_result: &Value,
        notify: &Value,
        extranonce2: &[u8],
        target: Difficulty,
        max_iters: u32,
    ) -> Option<(String, Value)> {
        let ex1 = hex::decode(subscribe_result["result"][1].as_str().unwrap()).unwrap();
        let params = notify["params"].as_array().unwrap();
        let job_id = params[0].as_str().unwrap();
        let prev = prevhash_from_hex(params[1].as_str().unwrap()).unwrap();
        let coinb1 = hex::decode(params[2].as_str().unwrap()).unwrap();
        let coinb2 = hex::decode(params[3].as_str().unwrap()).unwrap();
        let branch: Vec<bitcoin::TxMerkleNode> = params[4]
            .as_array()
            .unwrap()
            .iter()
            .map(|node| {
                let bytes: [u8; 32] =
                    hex::decode(node.as_str().unwrap()).unwrap().try_into().unwrap();
                bitcoin::TxMerkleNode::from_byte_array(bytes)
            })
            .collect();
        let version = u32::from_str_radix(params[5].as_str().unwrap(), 16).unwrap();
        let bits = u32::from_str_radix(params[6].as_str().unwrap(), 16).unwrap();
        let ntime = params[7].as_str().unwrap();

        let mut coinbase = coinb1.clone();
        coinbase.extend_from_slice(&ex1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&coinb2);
        // Fixture templates carry no witness commitment, so the full
        // bytes are the txid form.
        let txid = bitcoin::Txid::from_byte_array(crate::merkle::double_sha256(&coinbase));
        let merkle_root = crate::merkle::fold_branch(&txid, &branch);

        for nonce in 0..max_iters {
            let header = bitcoin::block::Header {
                version: bitcoin::block::Version::from_consensus(version as i32),
                prev_blockhash: prev,
                merkle_root,
                time: u32::from_str_radix(ntime, 16).unwrap(),
                bits: CompactTarget::from_consensus(bits),
                nonce,
            };
            if target.is_met_by(&header.block_hash()) {
                let submit = json!({
                    "id": 10,
                    "method": "mining.submit",
                    "params": [
                        MAINNET_WORKER,
                        job_id,
                        hex::encode(extranonce2),
                        ntime,
                        format!("{nonce:08x}"),
                    ],
                });
                return Some((job_id.to_string(), submit));
            }
        }
        None
    }

    /// Spec scenario: subscribe then authorize.
    #[tokio::test]
    async fn test_subscribe_then_authorize() {
        let mut harness = start(mainnet_config()).await;

        let sub = harness.subscribe().await;
        assert_eq!(sub["id"], "sub-1");
        assert!(sub["error"].is_null());
        let result = sub["result"].as_array().unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(
            result[0].as_array().unwrap().len(),
            4,
            "default expanded shape carries four subscription tuples"
        );
        assert_eq!(result[1].as_str().unwrap().len(), 8, "4-byte extranonce1");
        assert_eq!(result[2], 8, "advertised extranonce2 size");

        let auth = harness.authorize(MAINNET_WORKER).await;
        assert_eq!(auth["id"], 1);
        assert_eq!(auth["result"], true);
        assert!(auth["error"].is_null());

        harness.cleanup().await;
    }

    #[tokio::test]
    async fn test_compat_subscribe_shape() {
        let mut cfg = Config::default();
        cfg.stratum.expanded_subscribe = false;
        let mut harness = start(Arc::new(cfg)).await;

        let sub = harness.subscribe().await;
        let tuples = sub["result"][0].as_array().unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0][0], "mining.notify");

        harness.cleanup().await;
    }

    /// Spec scenario: ping, byte-for-byte.
    #[tokio::test]
    async fn test_ping() {
        let mut harness = start(mainnet_config()).await;
        harness
            .send(r#"{"id":7,"method":"mining.ping","params":[]}"#)
            .await;
        assert_eq!(
            harness.recv_raw().await,
            r#"{"id":7,"result":"pong","error":null}"#
        );
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn test_authorize_requires_subscribe() {
        let mut harness = start(mainnet_config()).await;
        let auth = harness.authorize(MAINNET_WORKER).await;
        assert_eq!(auth["error"][0], 20);
        assert!(auth["result"].is_null());
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn test_authorize_rejects_bad_address() {
        let mut harness = start(mainnet_config()).await;
        harness.subscribe().await;
        let auth = harness.authorize("notanaddress.rig").await;
        assert_eq!(auth["error"][0], 20);
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn test_configure_intersects_masks() {
        let mut harness = start(mainnet_config()).await;
        harness
            .send(
                r#"{"id":2,"method":"mining.configure","params":[["version-rolling"],{"version-rolling.mask":"ffffffff","version-rolling.min-bit-count":2}]}"#,
            )
            .await;
        let response = harness.recv_response().await;
        assert_eq!(response["result"]["version-rolling"], true);
        assert_eq!(
            response["result"]["version-rolling.mask"], "1fffe000",
            "granted mask is the client/pool intersection"
        );
        assert_eq!(response["result"]["version-rolling.min-bit-count"], 2);
        harness.cleanup().await;
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut harness = start(mainnet_config()).await;
        harness
            .send(r#"{"id":3,"method":"mining.frobnicate","params":[]}"#)
            .await;
        let response = harness.recv_response().await;
        assert_eq!(response["error"][0], 20);
        harness.cleanup().await;
    }

    /// Spec scenario: a share below the pool target gets the low-diff
    /// tuple with both difficulties spelled out.
    #[tokio::test]
    async fn test_low_difficulty_share() {
        let mut cfg = Config::default();
        cfg.vardiff.initial_difficulty = 1000.0;
        cfg.vardiff.min_difficulty = 1000.0;
        let cfg = Arc::new(cfg);
        let mut harness = start(cfg).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        let notify = harness.recv_notification("mining.notify").await;
        let job_id = notify["params"][0].as_str().unwrap();

        // An arbitrary nonce is astronomically unlikely to reach
        // difficulty 1000.
        harness
            .send(&format!(
                r#"{{"id":10,"method":"mining.submit","params":["{MAINNET_WORKER}","{job_id}","0000000000000000","6553f358","00000001"]}}"#
            ))
            .await;
        let response = harness.recv_response().await;
        let error = response["error"].as_array().unwrap();
        assert_eq!(error[0], 23);
        let message = error[1].as_str().unwrap();
        assert!(
            message.starts_with("low difficulty share ("),
            "unexpected message {message:?}"
        );
        assert!(
            message.ends_with("expected 1000)"),
            "expected difficulty must be the job's, got {message:?}"
        );
        assert!(error[2].is_null());

        harness.cleanup().await;
    }

    /// Spec scenario: an accepted share, then the same parameters again.
    #[tokio::test]
    async fn test_accepted_share_then_duplicate() {
        let mut cfg = Config::default();
        // Weak share target, strong (mainnet) network target: shares are
        // mineable in-test, blocks are not.
        cfg.vardiff.initial_difficulty = 1e-9;
        cfg.vardiff.min_difficulty = 1e-12;
        let cfg = Arc::new(cfg);
        let mut harness = start(cfg.clone()).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 1, "1d00ffff", Network::Bitcoin));

        let sub = harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        let notify = harness.recv_notification("mining.notify").await;

        let share_target = Difficulty::from_f64(1e-9);
        let (_, submit) = mine(&sub, &notify, &[0u8; 8], share_target, 1_000)
            .expect("a passing nonce within the nonce walk");

        harness.send(&submit.to_string()).await;
        let first = harness.recv_response().await;
        assert_eq!(first["result"], true, "share meeting the target is accepted");

        harness.send(&submit.to_string()).await;
        let second = harness.recv_response().await;
        let error = second["error"].as_array().unwrap();
        assert_eq!(error[0], 22);
        assert_eq!(error[1], "duplicate share");
        assert!(error[2].is_null());

        harness.cleanup().await;
    }

    /// Spec scenario: a block-level share reaches submitblock exactly
    /// once, serialised as a decodable block.
    #[tokio::test]
    async fn test_block_found_dispatches() {
        let mut cfg = Config::default();
        cfg.network = "regtest".into();
        cfg.vardiff.initial_difficulty = 0.001;
        cfg.vardiff.min_difficulty = 0.0001;
        let cfg = Arc::new(cfg);
        let mut harness = start(cfg).await;
        harness.jobs.publish_template(fixture_template(100, 2));

        let sub = harness.subscribe().await;
        harness.authorize(REGTEST_WORKER).await;
        let notify = harness.recv_notification("mining.notify").await;

        // Mine against the regtest network target itself.
        let network_target =
            Difficulty::from_target(Target::from_compact(CompactTarget::from_consensus(
                0x207fffff,
            )));
        let (_, submit) = mine(&sub, &notify, &[7u8; 8], network_target, 1_000)
            .expect("a regtest block within the nonce walk");
        // mine() fills the mainnet worker; swap in the regtest one.
        let mut submit = submit;
        submit["params"][0] = json!(REGTEST_WORKER);

        harness.send(&submit.to_string()).await;
        let response = harness.recv_response().await;
        assert_eq!(response["result"], true, "a block is always accepted");

        // Dispatch is asynchronous.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            harness.node.submit_count(),
            1,
            "submitblock invoked exactly once"
        );

        let submitted_hex = harness.node.submits.lock()[0].clone();
        let block: bitcoin::Block =
            bitcoin::consensus::deserialize(&hex::decode(submitted_hex).unwrap())
                .expect("submitted block must deserialise");
        assert_eq!(block.txdata.len(), 3, "coinbase plus two template transactions");
        assert!(block.txdata[0].is_coinbase());

        harness.cleanup().await;
    }

    /// Spec scenario: four malformed submits trip the auto-ban.
    #[tokio::test]
    async fn test_auto_ban_after_invalid_submissions() {
        let mut cfg = Config::default();
        cfg.ban.invalid_submissions_after = 3;
        cfg.ban.window = Duration::from_secs(300);
        cfg.ban.warn_margin = 1;
        let cfg = Arc::new(cfg);
        let mut harness = start(cfg).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        harness.recv_notification("mining.notify").await;

        // Malformed ntime: correct length, not hex.
        let bad_submit = format!(
            r#"{{"id":20,"method":"mining.submit","params":["{MAINNET_WORKER}","1","0000000000000000","zzzzzzzz","00000001"]}}"#
        );

        for i in 0..3 {
            harness.send(&bad_submit).await;
            let response = harness.recv_response().await;
            assert_eq!(
                response["error"][0], 20,
                "submission {i} is invalid but not yet banned"
            );
        }

        harness.send(&bad_submit).await;
        let response = harness.recv_response().await;
        let error = response["error"].as_array().unwrap();
        assert_eq!(error[0], 24, "the fourth submit answers banned");
        assert_eq!(error[1], "banned");

        // And stays banned.
        harness.send(&bad_submit).await;
        assert_eq!(harness.recv_response().await["error"][0], 24);

        // The registry shows the ban deadline.
        let entries = harness.registry.controls();
        assert_eq!(entries.len(), 1);
        let entry = harness.registry.get(entries[0].0).unwrap();
        assert!(
            entry.banned_until.map(|until| until > Instant::now()).unwrap_or(false),
            "registry must expose the ban-until timestamp"
        );

        harness.cleanup().await;
    }

    /// A worker-name mismatch on submit is rejected and counted.
    #[tokio::test]
    async fn test_worker_mismatch() {
        let mut harness = start(mainnet_config()).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        harness.recv_notification("mining.notify").await;

        harness
            .send(
                r#"{"id":21,"method":"mining.submit","params":["someone.else","1","0000000000000000","6553f358","00000001"]}"#,
            )
            .await;
        let response = harness.recv_response().await;
        assert_eq!(response["error"][0], 20);
        assert_eq!(response["error"][1], "worker mismatch");
        harness.cleanup().await;
    }

    /// Unauthorized submits are refused with code 24.
    #[tokio::test]
    async fn test_submit_requires_authorization() {
        let mut harness = start(mainnet_config()).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness
            .send(
                r#"{"id":22,"method":"mining.submit","params":["w","1","0000000000000000","6553f358","00000001"]}"#,
            )
            .await;
        let response = harness.recv_response().await;
        assert_eq!(response["error"][0], 24);
        assert_eq!(response["error"][1], "unauthorized worker");
        harness.cleanup().await;
    }

    /// Unknown job ids are rejected under the default freshness mode.
    #[tokio::test]
    async fn test_unknown_job_id_rejected() {
        let mut harness = start(mainnet_config()).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        harness.recv_notification("mining.notify").await;

        harness
            .send(&format!(
                r#"{{"id":23,"method":"mining.submit","params":["{MAINNET_WORKER}","dead","0000000000000000","6553f358","00000001"]}}"#
            ))
            .await;
        let response = harness.recv_response().await;
        assert_eq!(response["error"][0], 21);
        assert_eq!(response["error"][1], "job not found");
        harness.cleanup().await;
    }

    /// suggest_difficulty stages a set_difficulty ahead of the next job.
    #[tokio::test]
    async fn test_suggest_difficulty_applies_on_next_job() {
        let mut harness = start(mainnet_config()).await;
        harness
            .jobs
            .publish_template(fixture_template_with(100, 0, "1d00ffff", Network::Bitcoin));

        harness.subscribe().await;
        harness.authorize(MAINNET_WORKER).await;
        harness.recv_notification("mining.notify").await;

        harness
            .send(r#"{"id":30,"method":"mining.suggest_difficulty","params":[65536]}"#)
            .await;
        assert_eq!(harness.recv_response().await["result"], true);

        harness
            .jobs
            .publish_template(fixture_template_with(101, 0, "1d00ffff", Network::Bitcoin));
        let set_diff = harness.recv_notification("mining.set_difficulty").await;
        assert_eq!(
            set_diff["params"][0].as_f64().unwrap(),
            65536.0,
            "suggested difficulty goes out before the next notify"
        );
        harness.recv_notification("mining.notify").await;
        harness.cleanup().await;
    }
}
