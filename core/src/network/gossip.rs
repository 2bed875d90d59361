//! Gossip dissemination and anti-entropy
//!
//! Each round the disseminator samples up to `fanout` partners, runs one
//! sync session with each concurrently, and feeds the observed digests to
//! the convergence detector. A session is pull-then-push: ask the partner
//! for what we lack, chase any still-missing ancestors with explicit
//! fetches, then push what the partner lacks, capped per message.

use crate::config::FabricConfig;
use crate::crdt::{Operation, VectorClock};
use crate::network::convergence::{ConvergenceDetector, ConvergenceStatus};
use crate::network::transport::Transport;
use crate::replica::{now_ms, Replica};
use crate::storage::OpStorage;
use crate::types::{OpId, PeerId, StateDigest};
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

/// Bound on ancestor-fetch iterations within one session
const MAX_FETCH_ROUNDS: usize = 8;

/// Wire messages exchanged between replicas
#[derive(Debug, Clone, Encode, Decode)]
pub enum GossipMessage {
    /// Opening exchange: who knows what
    #[n(0)]
    SyncRequest {
        #[n(0)]
        frontier: Vec<OpId>,
        #[n(1)]
        clock: VectorClock,
        #[n(2)]
        digest: StateDigest,
    },

    /// Reply carrying the responder's summary and a capped op delta
    #[n(1)]
    SyncResponse {
        #[n(0)]
        frontier: Vec<OpId>,
        #[n(1)]
        clock: VectorClock,
        #[n(2)]
        digest: StateDigest,
        #[n(3)]
        ops: Vec<Operation>,
    },

    /// Explicit request for operations by id
    #[n(2)]
    FetchRequest {
        #[n(0)]
        ids: Vec<OpId>,
    },

    #[n(3)]
    FetchResponse {
        #[n(0)]
        ops: Vec<Operation>,
    },

    /// Forward operations the sender believes the receiver lacks
    #[n(4)]
    Push {
        #[n(0)]
        ops: Vec<Operation>,
    },

    /// How many pushed operations were newly applied
    #[n(5)]
    PushAck {
        #[n(0)]
        accepted: u64,
    },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::SyncRequest { .. } => "sync_request",
            GossipMessage::SyncResponse { .. } => "sync_response",
            GossipMessage::FetchRequest { .. } => "fetch_request",
            GossipMessage::FetchResponse { .. } => "fetch_response",
            GossipMessage::Push { .. } => "push",
            GossipMessage::PushAck { .. } => "push_ack",
        }
    }
}

/// Runs the gossip rounds for one replica
pub struct Disseminator<S: OpStorage, T: Transport> {
    replica: Arc<Replica<S>>,
    transport: Arc<T>,
    cfg: FabricConfig,
    rng: Mutex<StdRng>,
    detector: Mutex<ConvergenceDetector>,
}

impl<S, T> Disseminator<S, T>
where
    S: OpStorage + 'static,
    T: Transport,
{
    pub fn new(replica: Arc<Replica<S>>, transport: Arc<T>) -> Self {
        let cfg = replica.config().clone();
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let detector = ConvergenceDetector::new(cfg.stability_rounds, cfg.convergence_sample);
        Self {
            replica,
            transport,
            cfg,
            rng: Mutex::new(rng),
            detector: Mutex::new(detector),
        }
    }

    /// Gossip forever with jittered pacing; run this on its own task
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.jittered_interval()).await;
            self.round().await;
            self.replica.expire_holdback();
        }
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.cfg.gossip_interval.as_millis() as f64;
        let jitter = self.cfg.gossip_jitter;
        let factor = 1.0 + self.rng.lock().unwrap().gen_range(-jitter..=jitter);
        Duration::from_millis((base * factor).max(1.0) as u64)
    }

    /// Run one gossip round: sample partners, sync concurrently, record the
    /// outcome in the convergence detector
    pub async fn round(&self) {
        let partners = {
            let mut rng = self.rng.lock().unwrap();
            self.replica.peers().sample(&mut rng, self.cfg.fanout, now_ms())
        };
        if partners.is_empty() {
            return;
        }

        let mut sessions: JoinSet<(PeerId, Result<StateDigest>)> = JoinSet::new();
        for peer in partners {
            let replica = Arc::clone(&self.replica);
            let transport = Arc::clone(&self.transport);
            let cfg = self.cfg.clone();
            sessions.spawn(async move {
                let outcome =
                    tokio::time::timeout(cfg.session_timeout, session(&replica, &*transport, &cfg, peer))
                        .await
                        .map_err(|_| Error::Transport(format!("session with {} timed out", peer)))
                        .and_then(|r| r);
                (peer, outcome)
            });
        }

        let mut digests: Vec<(PeerId, StateDigest)> = Vec::new();
        while let Some(joined) = sessions.join_next().await {
            let Ok((peer, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(digest) => {
                    self.replica.peers().mark_seen(&peer, now_ms());
                    digests.push((peer, digest));
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "gossip session failed");
                    self.replica.peers().mark_failed(&peer, now_ms());
                }
            }
        }

        let local = self.replica.state_digest();
        self.detector.lock().unwrap().observe_round(local, &digests);
    }

    /// Run one sync session against a specific peer
    ///
    /// Returns the digest the peer reported, for convergence tracking.
    pub async fn sync_once(&self, peer: PeerId) -> Result<StateDigest> {
        let outcome = tokio::time::timeout(
            self.cfg.session_timeout,
            session(&self.replica, &*self.transport, &self.cfg, peer),
        )
        .await
        .map_err(|_| Error::Transport(format!("session with {} timed out", peer)))
        .and_then(|r| r);
        match &outcome {
            Ok(_) => self.replica.peers().mark_seen(&peer, now_ms()),
            Err(_) => self.replica.peers().mark_failed(&peer, now_ms()),
        }
        outcome
    }

    /// Current convergence verdict
    pub fn convergence(&self) -> ConvergenceStatus {
        self.detector.lock().unwrap().status()
    }

    /// Forget convergence history, e.g. after membership changes
    pub fn reset_convergence(&self) {
        self.detector.lock().unwrap().reset();
    }

    pub fn replica(&self) -> &Arc<Replica<S>> {
        &self.replica
    }
}

/// One pull-fetch-push exchange with a peer, on top of a bare transport
async fn session<S, T>(
    replica: &Arc<Replica<S>>,
    transport: &T,
    cfg: &FabricConfig,
    peer: PeerId,
) -> Result<StateDigest>
where
    S: OpStorage + 'static,
    T: Transport + ?Sized,
{
    // Pull: advertise our summary, ingest the delta the peer returns
    let summary = replica.summary();
    let request = GossipMessage::SyncRequest {
        frontier: summary.frontier,
        clock: summary.clock,
        digest: summary.digest,
    };
    let reply = exchange(transport, peer, &request).await?;
    let GossipMessage::SyncResponse {
        clock: peer_clock,
        digest: peer_digest,
        ops,
        ..
    } = reply
    else {
        return Err(Error::Transport(format!(
            "peer {} sent {} to a sync request",
            peer,
            reply.kind()
        )));
    };

    replica.peers().note_clock(&peer, &peer_clock, now_ms());
    let pulled = replica.ingest_batch(&ops, Some(peer))?;
    if pulled > 0 {
        tracing::debug!(peer = %peer, ops = pulled, "pulled ops");
    }

    // Chase ancestors the delta alone did not resolve
    for _ in 0..MAX_FETCH_ROUNDS {
        let mut missing = replica.missing_dependencies();
        if missing.is_empty() {
            break;
        }
        missing.truncate(cfg.max_ops_per_message);

        let reply = exchange(transport, peer, &GossipMessage::FetchRequest { ids: missing }).await?;
        let GossipMessage::FetchResponse { ops } = reply else {
            return Err(Error::Transport(format!(
                "peer {} sent {} to a fetch request",
                peer,
                reply.kind()
            )));
        };
        if ops.is_empty() {
            // Peer does not have them either; another partner might
            break;
        }
        replica.ingest_batch(&ops, Some(peer))?;
    }

    // Push: send what the peer's clock says it has not observed. Each batch
    // must be acknowledged before the next goes out, and the session stops
    // at the outstanding-push cap; the rest waits for the next round.
    let mut known = peer_clock;
    let mut outstanding = 0usize;
    loop {
        let batch = replica.ops_since(&known, cfg.max_ops_per_message)?;
        if batch.is_empty() || outstanding >= cfg.max_outstanding_pushes {
            break;
        }
        let pushed = batch.len();
        for op in &batch {
            known.merge(&op.clock);
        }
        let reply = exchange(transport, peer, &GossipMessage::Push { ops: batch }).await?;
        let GossipMessage::PushAck { accepted } = reply else {
            return Err(Error::Transport(format!(
                "peer {} sent {} to a push",
                peer,
                reply.kind()
            )));
        };
        tracing::debug!(peer = %peer, pushed, accepted, "pushed ops");
        outstanding += pushed;
    }

    Ok(peer_digest)
}

async fn exchange<T: Transport + ?Sized>(
    transport: &T,
    peer: PeerId,
    message: &GossipMessage,
) -> Result<GossipMessage> {
    let payload = minicbor::to_vec(message)
        .map_err(|e| Error::Serialization(format!("failed to encode gossip message: {}", e)))?;
    let response = transport.request(peer, payload).await?;
    minicbor::decode(&response)
        .map_err(|e| Error::Serialization(format!("failed to decode gossip reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_message_roundtrip() {
        let message = GossipMessage::SyncRequest {
            frontier: vec![OpId([1u8; 32])],
            clock: VectorClock::new(),
            digest: StateDigest([2u8; 32]),
        };
        let bytes = minicbor::to_vec(&message).unwrap();
        let decoded: GossipMessage = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded.kind(), "sync_request");

        let ack = GossipMessage::PushAck { accepted: 3 };
        let bytes = minicbor::to_vec(&ack).unwrap();
        let decoded: GossipMessage = minicbor::decode(&bytes).unwrap();
        match decoded {
            GossipMessage::PushAck { accepted } => assert_eq!(accepted, 3),
            other => panic!("unexpected message: {}", other.kind()),
        }
    }
}
