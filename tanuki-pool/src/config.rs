//! Pool configuration.
//!
//! Every tunable the core consumes lives here, with defaults suitable for
//! a mainnet solo pool. Loading and rewriting config files belongs to an
//! external collaborator; the daemon builds `Config::default()` and
//! applies a handful of environment overrides.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bitcoin::address::Address;
use bitcoin::{Network, ScriptBuf};

use crate::coinbase::FeeSlice;
use crate::submit::SubmitOptions;

#[derive(Debug, Clone)]
pub struct Config {
    /// "bitcoin" | "testnet" | "signet" | "regtest"
    pub network: String,
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub stratum: StratumConfig,
    pub coinbase: CoinbaseConfig,
    pub vardiff: VardiffConfig,
    pub ban: BanConfig,
    pub submit: SubmitPipelineConfig,
    pub admission: AdmissionConfig,
    pub dispatch: DispatchConfig,
    pub feed: FeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "bitcoin".into(),
            node: NodeConfig::default(),
            server: ServerConfig::default(),
            stratum: StratumConfig::default(),
            coinbase: CoinbaseConfig::default(),
            vardiff: VardiffConfig::default(),
            ban: BanConfig::default(),
            submit: SubmitPipelineConfig::default(),
            admission: AdmissionConfig::default(),
            dispatch: DispatchConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl Config {
    pub fn network(&self) -> Network {
        Network::from_str(&self.network).unwrap_or(Network::Bitcoin)
    }

    /// Defaults plus the environment overrides the deployment scripts
    /// rely on. Anything richer comes from the settings collaborator.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var("TANUKI_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("TANUKI_NODE_URL") {
            config.node.url = url;
        }
        if let Ok(user) = std::env::var("TANUKI_NODE_USER") {
            config.node.user = user;
        }
        if let Ok(password) = std::env::var("TANUKI_NODE_PASSWORD") {
            config.node.password = password;
        }
        if let Ok(network) = std::env::var("TANUKI_NETWORK") {
            config.network = network;
        }
        config
    }

    /// Resolve address strings into scripts and check cross-field
    /// constraints. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<ResolvedPayouts> {
        let network = self.network();
        if Network::from_str(&self.network).is_err() {
            bail!("unknown network {:?}", self.network);
        }
        if self.stratum.extranonce1_len == 0 || self.stratum.extranonce1_len > 8 {
            bail!("extranonce1 length must be 1-8 bytes");
        }
        if self.stratum.extranonce2_size == 0 || self.stratum.extranonce2_size > 8 {
            bail!("extranonce2 size must be 1-8 bytes");
        }

        let fallback_script = self
            .coinbase
            .fallback_address
            .as_deref()
            .map(|addr| resolve_address(addr, network))
            .transpose()
            .context("coinbase.fallback_address")?;

        let fee_slices = self
            .coinbase
            .fee_slices
            .iter()
            .map(|slice| slice.resolve(network))
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedPayouts {
            fee_slices,
            fallback_script,
        })
    }
}

/// Payout scripts resolved from configured addresses at startup.
#[derive(Debug, Clone)]
pub struct ResolvedPayouts {
    pub fee_slices: Vec<FeeSlice>,
    /// Script mined to before a connection authorizes a worker.
    pub fallback_script: Option<ScriptBuf>,
}

fn resolve_address(addr: &str, network: Network) -> Result<ScriptBuf> {
    Ok(Address::from_str(addr)
        .with_context(|| format!("bad address {addr:?}"))?
        .require_network(network)
        .with_context(|| format!("address {addr:?} is not valid on {network}"))?
        .script_pubkey())
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".into(),
            user: "tanuki".into(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
    /// How long shutdown waits for connection tasks before abandoning them.
    pub shutdown_drain: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".into(),
            max_connections: 4096,
            shutdown_drain: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StratumConfig {
    /// Expanded four-tuple subscribe result; false emits the ckpool-style
    /// compatibility shape.
    pub expanded_subscribe: bool,
    /// Pool-wide BIP310 version-rolling mask.
    pub version_mask: u32,
    pub extranonce1_len: usize,
    pub extranonce2_size: usize,
    pub max_worker_len: usize,
    pub write_deadline: Duration,
    pub idle_timeout: Duration,
    pub max_line_len: usize,
    /// Seconds past the template's curtime a submitted ntime may reach.
    pub ntime_forward_slack: u32,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            expanded_subscribe: true,
            version_mask: 0x1fff_e000,
            extranonce1_len: 4,
            extranonce2_size: 8,
            max_worker_len: 64,
            write_deadline: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_line_len: 8192,
            ntime_forward_slack: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub tag: String,
    pub fee_slices: Vec<FeeSliceConfig>,
    /// Mined to before a worker authorizes. None refuses work until
    /// authorization.
    pub fallback_address: Option<String>,
    /// Embed the job creation time in the scriptSig.
    pub script_time: bool,
    pub max_payout_outputs: usize,
    /// Template-required extranonce2 size; padding keeps the coinbase
    /// length stable when it exceeds the advertised size.
    pub required_extranonce2_size: Option<usize>,
}

impl Default for CoinbaseConfig {
    fn default() -> Self {
        Self {
            tag: "/tanuki/".into(),
            fee_slices: Vec::new(),
            fallback_address: None,
            script_time: true,
            max_payout_outputs: 10,
            required_extranonce2_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeeSliceConfig {
    pub address: String,
    pub percent: f64,
    pub sub_slices: Vec<FeeSliceConfig>,
}

impl FeeSliceConfig {
    fn resolve(&self, network: Network) -> Result<FeeSlice> {
        Ok(FeeSlice {
            script: resolve_address(&self.address, network)?,
            percent: self.percent,
            sub_slices: self
                .sub_slices
                .iter()
                .map(|sub| sub.resolve(network))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct VardiffConfig {
    pub enabled: bool,
    pub target_shares_per_minute: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    /// Quantisation steps per octave: difficulty snaps to 2^(k/granularity).
    pub granularity: u32,
    /// Retarget only when the observed rate is off by more than this factor.
    pub hysteresis: f64,
    pub min_retarget_interval: Duration,
    pub window: Duration,
    pub initial_difficulty: f64,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // One share every three seconds.
            target_shares_per_minute: 20.0,
            min_difficulty: 1.0,
            max_difficulty: 1e12,
            granularity: 4,
            hysteresis: 2.0,
            min_retarget_interval: Duration::from_secs(30),
            window: Duration::from_secs(300),
            initial_difficulty: 1024.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BanConfig {
    /// Invalid submissions within `window` before the connection is banned.
    pub invalid_submissions_after: u32,
    pub window: Duration,
    pub duration: Duration,
    /// Emit a client.show_message warning this many strikes early.
    pub warn_margin: u32,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            invalid_submissions_after: 30,
            window: Duration::from_secs(300),
            duration: Duration::from_secs(600),
            warn_margin: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitPipelineConfig {
    pub options: SubmitOptions,
    /// Process submits on the connection task; false drains them through
    /// the worker pool.
    pub inline: bool,
    /// Worker pool size; zero means the CPU count.
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for SubmitPipelineConfig {
    fn default() -> Self {
        Self {
            options: SubmitOptions::default(),
            inline: true,
            workers: 0,
            queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Steady-state accepted connections per second.
    pub accept_rate: f64,
    pub accept_burst: f64,
    /// Accept rate during the reconnection window right after boot, when
    /// a full miner fleet storms back in.
    pub reconnect_rate: f64,
    pub reconnect_window: Duration,
    /// Per-host churn limiting.
    pub host_window: Duration,
    pub host_max_accepts: u32,
    pub host_ban: Duration,
    /// Feed staleness beyond this refuses accepts and sheds miners.
    pub stale_grace: Duration,
    pub boot_grace: Duration,
    pub enforce_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            accept_rate: 20.0,
            accept_burst: 100.0,
            reconnect_rate: 200.0,
            reconnect_window: Duration::from_secs(60),
            host_window: Duration::from_secs(60),
            host_max_accepts: 10,
            host_ban: Duration::from_secs(300),
            stale_grace: Duration::from_secs(180),
            boot_grace: Duration::from_secs(120),
            enforce_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Inline submitblock attempts before the block goes to the pending log.
    pub submit_retries: u32,
    pub retry_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub replay_interval: Duration,
    pub pending_log: std::path::PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            submit_retries: 3,
            retry_delay: Duration::from_millis(500),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            replay_interval: Duration::from_secs(30),
            pending_log: "pending-blocks.jsonl".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub poll_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}
