//! Variable difficulty controller.
//!
//! Tracks accepted-share timestamps over a sliding window and steers each
//! miner toward the configured shares-per-minute rate. Retargets are
//! hysteresis-gated so difficulty does not flap, quantised onto the
//! logarithmic grid so repeated retargets land on stable values, and
//! staged: the new value goes out as a `mining.set_difficulty` ahead of
//! the next job push, never mid-job.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::VardiffConfig;
use crate::types::quantize;

#[derive(Debug)]
pub struct Vardiff {
    cfg: VardiffConfig,
    current: f64,
    pending: Option<f64>,
    share_times: VecDeque<Instant>,
    last_retarget: Instant,
    created: Instant,
}

impl Vardiff {
    pub fn new(cfg: VardiffConfig, now: Instant) -> Self {
        // The configured starting point is taken verbatim; only
        // retargets and suggestions snap to the grid.
        let current = cfg
            .initial_difficulty
            .clamp(cfg.min_difficulty, cfg.max_difficulty);
        Self {
            cfg,
            current,
            pending: None,
            share_times: VecDeque::new(),
            last_retarget: now,
            created: now,
        }
    }

    /// The difficulty currently in force for new jobs.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Record an accepted share and re-evaluate the rate.
    pub fn note_share(&mut self, now: Instant) {
        self.share_times.push_back(now);
        self.prune(now);
        self.evaluate(now);
    }

    /// Honor a miner's `mining.suggest_difficulty` hint.
    pub fn suggest(&mut self, difficulty: f64, now: Instant) {
        let quantized = quantize(
            difficulty,
            self.cfg.min_difficulty,
            self.cfg.max_difficulty,
            self.cfg.granularity,
        );
        if quantized != self.current {
            self.pending = Some(quantized);
            self.last_retarget = now;
        }
    }

    /// Re-evaluate without a share (called on job pushes so an idle miner
    /// eventually drifts down).
    pub fn tick(&mut self, now: Instant) {
        self.prune(now);
        self.evaluate(now);
    }

    /// Take the staged difficulty, if any, making it current. Called
    /// just before a job push; the caller emits `mining.set_difficulty`.
    pub fn take_pending(&mut self) -> Option<f64> {
        let pending = self.pending.take()?;
        self.current = pending;
        Some(pending)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.share_times.front() {
            if now.duration_since(front) > self.cfg.window {
                self.share_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate(&mut self, now: Instant) {
        if !self.cfg.enabled {
            return;
        }
        if now.duration_since(self.last_retarget) < self.cfg.min_retarget_interval {
            return;
        }

        // Observe over the window, or the connection's lifetime when
        // younger than the window.
        let span = self
            .cfg
            .window
            .min(now.duration_since(self.created))
            .as_secs_f64()
            .max(1.0);
        let observed = self.share_times.len() as f64 / (span / 60.0);
        let target = self.cfg.target_shares_per_minute;

        let proposed = if observed > target * self.cfg.hysteresis {
            self.current * (observed / target)
        } else if observed < target / self.cfg.hysteresis {
            if self.share_times.is_empty() {
                // Silent miner: halve instead of scaling by zero.
                self.current / 2.0
            } else {
                self.current * (observed / target)
            }
        } else {
            return;
        };

        let quantized = quantize(
            proposed,
            self.cfg.min_difficulty,
            self.cfg.max_difficulty,
            self.cfg.granularity,
        );
        if quantized != self.current {
            self.pending = Some(quantized);
            self.last_retarget = now;
        }
    }
}
