//! Block template intake.
//!
//! Normalises `getblocktemplate` results into immutable `Template` values
//! and keeps them flowing: a single intake task longpolls the node, wakes
//! early on external block notifications (the ZMQ collaborator feeds the
//! notify channel), and reports feed health through a watch channel that
//! the admission controller reads.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::block::Version;
use bitcoin::hash_types::{BlockHash, Txid, Wtxid};
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::{Network, ScriptBuf};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::coinbase::strip_witness;
use crate::merkle::double_sha256;
use crate::node::{GetBlockTemplateResult, NodeClient};
use crate::tracing::prelude::*;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("curtime {cur} precedes mintime {min}")]
    TimeInverted { cur: u32, min: u32 },

    #[error("nBits {0:#010x} decodes to a zero target")]
    ZeroTarget(u32),

    #[error("nBits {0:#010x} exceeds the network proof-of-work limit")]
    TargetAboveLimit(u32),

    #[error("transaction {index}: txid does not match raw bytes")]
    TxidMismatch { index: usize },

    #[error("transaction {index}: wtxid does not match raw bytes")]
    WtxidMismatch { index: usize },

    #[error("transaction {index}: {reason}")]
    BadTransaction { index: usize, reason: String },

    #[error("malformed field {field}: {reason}")]
    BadField { field: &'static str, reason: String },
}

/// A non-coinbase transaction included in a template.
#[derive(Debug, Clone)]
pub struct TemplateTx {
    pub txid: Txid,
    pub wtxid: Wtxid,
    pub raw: Vec<u8>,
    pub fee: u64,
}

/// A normalised, validated block template. Immutable once published;
/// superseded by the next successful fetch.
#[derive(Debug, Clone)]
pub struct Template {
    pub prev_hash: BlockHash,
    pub height: u64,
    pub version: Version,
    pub cur_time: u32,
    pub min_time: u32,
    pub bits: CompactTarget,
    pub coinbase_value: u64,
    pub witness_commitment: Option<ScriptBuf>,
    pub transactions: Vec<TemplateTx>,
    /// Whether the node allows mutating the header version (BIP310
    /// rolling stays within the pool mask either way).
    pub version_rolling_allowed: bool,
    pub longpoll_id: Option<String>,
}

/// The proof-of-work limit for a network, used to sanity-check nBits.
pub fn pow_limit(network: Network) -> Target {
    match network {
        Network::Bitcoin => Target::MAX_ATTAINABLE_MAINNET,
        Network::Testnet | Network::Signet => Target::MAX_ATTAINABLE_TESTNET,
        Network::Regtest => Target::MAX_ATTAINABLE_REGTEST,
        _ => Target::MAX_ATTAINABLE_MAINNET,
    }
}

impl Template {
    /// Normalise and validate a `getblocktemplate` result.
    pub fn from_gbt(
        gbt: GetBlockTemplateResult,
        network: Network,
    ) -> Result<Self, TemplateError> {
        let prev_hash = BlockHash::from_str(&gbt.previous_block_hash).map_err(|e| {
            TemplateError::BadField { field: "previousblockhash", reason: e.to_string() }
        })?;

        let bits_raw = u32::from_str_radix(&gbt.bits, 16)
            .map_err(|e| TemplateError::BadField { field: "bits", reason: e.to_string() })?;
        let bits = CompactTarget::from_consensus(bits_raw);

        let witness_commitment = gbt
            .default_witness_commitment
            .as_deref()
            .map(|hex_script| {
                hex::decode(hex_script).map(ScriptBuf::from).map_err(|e| {
                    TemplateError::BadField {
                        field: "default_witness_commitment",
                        reason: e.to_string(),
                    }
                })
            })
            .transpose()?;

        let mut transactions = Vec::with_capacity(gbt.transactions.len());
        for (index, tx) in gbt.transactions.iter().enumerate() {
            let raw = hex::decode(&tx.data).map_err(|e| TemplateError::BadTransaction {
                index,
                reason: e.to_string(),
            })?;
            let txid = Txid::from_str(&tx.txid).map_err(|e| TemplateError::BadTransaction {
                index,
                reason: e.to_string(),
            })?;
            let wtxid = match &tx.hash {
                Some(hash) => Wtxid::from_str(hash).map_err(|e| {
                    TemplateError::BadTransaction { index, reason: e.to_string() }
                })?,
                None => Wtxid::from_byte_array(txid.to_byte_array()),
            };
            transactions.push(TemplateTx {
                txid,
                wtxid,
                raw,
                fee: tx.fee.unwrap_or(0),
            });
        }

        // bitcoind leaves the version rollable; a node-side shim can pin
        // it by emitting a "version/freeze" mutability entry.
        let version_rolling_allowed = !gbt.mutable.iter().any(|m| m == "version/freeze");

        let template = Self {
            prev_hash,
            height: gbt.height,
            version: Version::from_consensus(gbt.version),
            cur_time: gbt.cur_time as u32,
            min_time: gbt.min_time as u32,
            bits,
            coinbase_value: gbt.coinbase_value,
            witness_commitment,
            transactions,
            version_rolling_allowed,
            longpoll_id: gbt.longpoll_id,
        };
        template.validate(pow_limit(network))?;
        Ok(template)
    }

    /// Check the template invariants.
    pub fn validate(&self, network_limit: Target) -> Result<(), TemplateError> {
        if self.cur_time < self.min_time {
            return Err(TemplateError::TimeInverted {
                cur: self.cur_time,
                min: self.min_time,
            });
        }

        let target = self.network_target();
        let bits = self.bits.to_consensus();
        if target == Target::ZERO {
            return Err(TemplateError::ZeroTarget(bits));
        }
        if target > network_limit {
            return Err(TemplateError::TargetAboveLimit(bits));
        }

        for (index, tx) in self.transactions.iter().enumerate() {
            let stripped = strip_witness(&tx.raw)
                .map_err(|e| TemplateError::BadTransaction { index, reason: e.to_string() })?;
            if double_sha256(&stripped) != tx.txid.to_byte_array() {
                return Err(TemplateError::TxidMismatch { index });
            }
            if double_sha256(&tx.raw) != tx.wtxid.to_byte_array() {
                return Err(TemplateError::WtxidMismatch { index });
            }
        }
        Ok(())
    }

    pub fn network_target(&self) -> Target {
        Target::from_compact(self.bits)
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.transactions.iter().map(|tx| tx.txid).collect()
    }
}

/// Health of the template feed, read by the admission controller.
#[derive(Debug, Clone, Default)]
pub struct FeedStatus {
    pub last_success: Option<Instant>,
    pub last_error: Option<(Instant, String)>,
}

impl FeedStatus {
    /// Healthy if a template arrived within the grace window.
    pub fn healthy_within(&self, grace: Duration, now: Instant) -> bool {
        match self.last_success {
            Some(at) => now.duration_since(at) <= grace,
            None => false,
        }
    }
}

/// The template intake task.
///
/// Longpolls once the node has given us a longpoll id; otherwise polls on
/// an interval. An external block notification (ZMQ collaborator) on
/// `notify_rx` forces an immediate refetch without the longpoll id so the
/// node answers right away.
pub struct TemplateFeed {
    node: Arc<dyn NodeClient>,
    network: Network,
    poll_interval: Duration,
    template_tx: mpsc::Sender<Arc<Template>>,
    notify_rx: mpsc::Receiver<()>,
    status_tx: watch::Sender<FeedStatus>,
}

impl TemplateFeed {
    pub fn new(
        node: Arc<dyn NodeClient>,
        network: Network,
        poll_interval: Duration,
        template_tx: mpsc::Sender<Arc<Template>>,
        notify_rx: mpsc::Receiver<()>,
    ) -> (Self, watch::Receiver<FeedStatus>) {
        let (status_tx, status_rx) = watch::channel(FeedStatus::default());
        (
            Self {
                node,
                network,
                poll_interval,
                template_tx,
                notify_rx,
                status_tx,
            },
            status_rx,
        )
    }

    async fn fetch(
        node: &Arc<dyn NodeClient>,
        network: Network,
        status_tx: &watch::Sender<FeedStatus>,
        longpoll_id: Option<&str>,
    ) -> Option<Arc<Template>> {
        let result = node.get_block_template(longpoll_id).await;
        let now = Instant::now();
        match result.and_then(|gbt| {
            Template::from_gbt(gbt, network)
                .map_err(|e| crate::node::NodeError::InvalidResponse(e.to_string()))
        }) {
            Ok(template) => {
                status_tx.send_modify(|status| status.last_success = Some(now));
                Some(Arc::new(template))
            }
            Err(e) => {
                warn!(error = %e, "Template fetch failed");
                status_tx.send_modify(|status| status.last_error = Some((now, e.to_string())));
                None
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            node,
            network,
            poll_interval,
            template_tx,
            mut notify_rx,
            status_tx,
        } = self;

        let mut longpoll_id: Option<String> = None;
        // Short retry while the node is unreachable; longpolling
        // otherwise paces us.
        let error_delay = poll_interval.min(Duration::from_secs(5));

        while !cancel.is_cancelled() {
            let fetched = tokio::select! {
                template = Self::fetch(&node, network, &status_tx, longpoll_id.as_deref()) => {
                    template
                }
                Some(()) = notify_rx.recv() => {
                    debug!("Block notification, refetching template");
                    longpoll_id = None;
                    Self::fetch(&node, network, &status_tx, None).await
                }
                _ = cancel.cancelled() => break,
            };

            match fetched {
                Some(template) => {
                    longpoll_id = template.longpoll_id.clone();
                    if template_tx.send(template).await.is_err() {
                        break; // job manager gone, shutting down
                    }
                    if longpoll_id.is_none() {
                        tokio::select! {
                            _ = tokio::time::sleep(poll_interval) => {}
                            Some(()) = notify_rx.recv() => {
                                debug!("Block notification, refetching template");
                            }
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(error_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        trace!("Template feed stopped.");
    }
}
