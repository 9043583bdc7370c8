//! Probabilistic packet-loss simulation.
//!
//! Dropping inbound requests forces client retransmission; dropping
//! outbound replies makes retransmitted requests reach the dispatcher, so
//! both delivery contracts can be observed on a local setup. Each drop
//! decision is an independent Bernoulli draw; a draw below the configured
//! probability drops the datagram silently (no ICMP, no error to the peer).
//!
//! Counters are observational only and never appear on the wire.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::ServerError;

/// Snapshot of loss-simulation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossStats {
    /// Inbound datagrams offered to the request gate.
    pub requests_seen: u64,
    /// Inbound datagrams dropped.
    pub requests_dropped: u64,
    /// Outbound replies offered to the reply gate.
    pub replies_seen: u64,
    /// Outbound replies dropped.
    pub replies_dropped: u64,
}

/// Bernoulli drop gates for inbound requests and outbound replies.
pub struct LossSimulator {
    request_loss: f64,
    reply_loss: f64,
    requests_seen: AtomicU64,
    requests_dropped: AtomicU64,
    replies_seen: AtomicU64,
    replies_dropped: AtomicU64,
}

impl LossSimulator {
    /// Create a simulator with the given drop probabilities.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when either probability is outside [0, 1].
    pub fn new(request_loss: f64, reply_loss: f64) -> Result<Self, ServerError> {
        for (name, p) in [("request", request_loss), ("reply", reply_loss)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ServerError::Config(format!(
                    "{name} loss probability {p} out of range [0, 1]"
                )));
            }
        }
        Ok(Self {
            request_loss,
            reply_loss,
            requests_seen: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            replies_seen: AtomicU64::new(0),
            replies_dropped: AtomicU64::new(0),
        })
    }

    /// A pass-through simulator that never drops.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            request_loss: 0.0,
            reply_loss: 0.0,
            requests_seen: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            replies_seen: AtomicU64::new(0),
            replies_dropped: AtomicU64::new(0),
        }
    }

    /// Whether any gate can drop at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.request_loss > 0.0 || self.reply_loss > 0.0
    }

    /// Configured inbound drop probability.
    #[must_use]
    pub fn request_loss(&self) -> f64 {
        self.request_loss
    }

    /// Configured outbound drop probability.
    #[must_use]
    pub fn reply_loss(&self) -> f64 {
        self.reply_loss
    }

    /// Draw for an inbound request. `true` means drop it.
    pub fn should_drop_request(&self) -> bool {
        self.requests_seen.fetch_add(1, Ordering::Relaxed);
        let drop = draw(self.request_loss);
        if drop {
            self.requests_dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop
    }

    /// Draw for an outbound reply. `true` means drop it.
    pub fn should_drop_reply(&self) -> bool {
        self.replies_seen.fetch_add(1, Ordering::Relaxed);
        let drop = draw(self.reply_loss);
        if drop {
            self.replies_dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> LossStats {
        LossStats {
            requests_seen: self.requests_seen.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            replies_seen: self.replies_seen.load(Ordering::Relaxed),
            replies_dropped: self.replies_dropped.load(Ordering::Relaxed),
        }
    }
}

/// One Bernoulli draw: a value below `p` means drop.
fn draw(p: f64) -> bool {
    if p <= 0.0 {
        return false;
    }
    if p >= 1.0 {
        return true;
    }
    rand::thread_rng().gen::<f64>() < p
}
