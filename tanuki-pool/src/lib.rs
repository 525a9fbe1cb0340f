//! tanuki-pool: a Bitcoin solo-mining Stratum v1 pool server.
//!
//! The node feed drives the job manager; the job manager broadcasts to
//! every miner connection; each connection funnels submits into the
//! shared pipeline; block-level shares exit through the dispatcher back
//! to the node. One block, one worker.

pub mod admission;
pub mod coinbase;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod merkle;
pub mod miner_conn;
pub mod node;
pub mod registry;
pub mod server;
pub mod stratum;
pub mod submit;
pub mod template;
pub mod tracing;
pub mod types;
pub mod u256;
