//! Fabric configuration
//!
//! All tunable behavior lives here with documented defaults so deployments
//! (and deterministic tests, via `seed`) can adjust thresholds without code
//! changes.

use crate::types::TypeTag;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for a fabric replica and its gossip disseminator
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Base interval between gossip rounds
    pub gossip_interval: Duration,

    /// Fractional jitter applied to each round interval (0.25 = +/-25%),
    /// drawn from the seeded RNG to avoid thundering-herd synchronization
    pub gossip_jitter: f64,

    /// Number of peers sampled per gossip round
    pub fanout: usize,

    /// Timeout for a single peer gossip session
    pub session_timeout: Duration,

    /// Maximum number of operations carried in one wire message
    pub max_ops_per_message: usize,

    /// Cap on unacknowledged pushed operations per peer session; overflow
    /// waits for the next round instead of queueing unbounded
    pub max_outstanding_pushes: usize,

    /// Consecutive session failures before a peer is evicted
    pub failure_threshold: u32,

    /// Reputation subtracted per invalid submission (scores run 0.0..=1.0,
    /// peers start at 1.0)
    pub reputation_penalty: f64,

    /// Reputation below which a peer is marked suspected
    pub suspect_threshold: f64,

    /// Reputation below which a peer is evicted from gossip sampling
    pub reputation_floor: f64,

    /// How long an evicted peer stays out before it may rejoin (softly,
    /// through the suspected state)
    pub eviction_cooldown: Duration,

    /// Per-type corroboration quorum: operations with these tags are held
    /// until k distinct peers have relayed the same operation id
    pub corroboration: HashMap<TypeTag, usize>,

    /// Maximum operation ids tracked while awaiting corroboration
    pub witness_capacity: usize,

    /// Maximum time a corroboration entry is tracked before it is forgotten
    pub witness_max_age: Duration,

    /// Minimum peer digests a round must gather before it counts toward the
    /// convergence stability streak
    pub convergence_sample: usize,

    /// Consecutive rounds of digest agreement required to report convergence
    pub stability_rounds: usize,

    /// Maximum operations buffered while awaiting missing causal parents
    pub holdback_capacity: usize,

    /// Maximum time an operation may stay buffered before expiry
    pub holdback_max_age: Duration,

    /// RNG seed for peer sampling and round jitter; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            gossip_jitter: 0.25,
            fanout: 3,
            session_timeout: Duration::from_secs(5),
            max_ops_per_message: 100,
            max_outstanding_pushes: 256,
            failure_threshold: 3,
            reputation_penalty: 0.1,
            suspect_threshold: 0.5,
            reputation_floor: 0.2,
            eviction_cooldown: Duration::from_secs(60),
            corroboration: HashMap::new(),
            witness_capacity: 10_000,
            witness_max_age: Duration::from_secs(300),
            convergence_sample: 3,
            stability_rounds: 3,
            holdback_capacity: 10_000,
            holdback_max_age: Duration::from_secs(300),
            seed: None,
        }
    }
}

impl FabricConfig {
    /// Require k distinct witnessing relayers before admitting ops of `tag`
    pub fn with_corroboration(mut self, tag: TypeTag, k: usize) -> Self {
        self.corroboration.insert(tag, k);
        self
    }

    /// Fix the RNG seed for a deterministic run
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
