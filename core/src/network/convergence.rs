//! Convergence detection
//!
//! After each gossip round the disseminator records the local state digest
//! alongside the digests reported by its sampled partners. When a large
//! enough sample has agreed for a configured number of consecutive rounds,
//! the fabric is declared converged. A disagreeing sample resets the streak;
//! an agreeing but undersized sample is neutral and counts toward nothing.

use crate::types::{PeerId, StateDigest};

/// Current convergence verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Not enough agreeing rounds observed yet
    Pending,
    /// Sampled peers have matched the local digest for the required streak
    Converged,
    /// These peers reported a digest different from ours last round
    Diverged(Vec<PeerId>),
}

/// Tracks digest agreement across gossip rounds
pub struct ConvergenceDetector {
    stability_rounds: usize,
    min_sample: usize,
    agreeing_streak: usize,
    last_divergent: Vec<PeerId>,
    observed_any: bool,
}

impl ConvergenceDetector {
    pub fn new(stability_rounds: usize, min_sample: usize) -> Self {
        Self {
            stability_rounds: stability_rounds.max(1),
            min_sample: min_sample.max(1),
            agreeing_streak: 0,
            last_divergent: Vec::new(),
            observed_any: false,
        }
    }

    /// Record one round of digest observations
    ///
    /// A disagreeing digest is evidence of divergence at any sample size.
    /// Agreement only counts toward the streak when the round gathered at
    /// least `min_sample` digests; smaller agreeing rounds are neutral, as
    /// are rounds with no responding peers.
    pub fn observe_round(&mut self, local: StateDigest, peers: &[(PeerId, StateDigest)]) {
        if peers.is_empty() {
            return;
        }

        let divergent: Vec<PeerId> = peers
            .iter()
            .filter(|(_, digest)| *digest != local)
            .map(|(peer, _)| *peer)
            .collect();

        if !divergent.is_empty() {
            tracing::debug!(peers = divergent.len(), "divergent digests observed");
            self.observed_any = true;
            self.agreeing_streak = 0;
            self.last_divergent = divergent;
        } else if peers.len() >= self.min_sample {
            self.observed_any = true;
            self.agreeing_streak += 1;
            self.last_divergent.clear();
        }
    }

    pub fn status(&self) -> ConvergenceStatus {
        if !self.last_divergent.is_empty() {
            ConvergenceStatus::Diverged(self.last_divergent.clone())
        } else if self.observed_any && self.agreeing_streak >= self.stability_rounds {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Pending
        }
    }

    /// Forget history, e.g. after a partition heals
    pub fn reset(&mut self) {
        self.agreeing_streak = 0;
        self.last_divergent.clear();
        self.observed_any = false;
    }
}
