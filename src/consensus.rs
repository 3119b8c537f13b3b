//! Consensus gate: drives agreement on the hash of the next block among
//! the ledger peers and emits exactly one committed hash per height.
//!
//! The gate consumes candidate blocks, runs pre-vote/pre-commit rounds
//! with a per-round timeout, and counts votes against the peer set the
//! world state holds at that moment. It promises safety and liveness
//! within the usual quorum assumptions and nothing beyond them; the
//! synchronizer decides what to do with the committed hash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::crypto::{
    decode_digest, hash_bytes, public_key_from_hex, sign_message, signature_from_hex,
    signature_to_hex, verify_signature,
};
use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::{Block, KeyedSignature};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VoteKind {
    PreVote,
    PreCommit,
}

impl VoteKind {
    fn as_byte(self) -> u8 {
        match self {
            VoteKind::PreVote => 0,
            VoteKind::PreCommit => 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub height: u64,
    pub round: u64,
    pub block_hash: String,
    pub kind: VoteKind,
}

impl Vote {
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"vellum-vote");
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.round.to_le_bytes());
        data.extend_from_slice(self.block_hash.as_bytes());
        data.push(self.kind.as_byte());
        data
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedVote {
    pub vote: Vote,
    pub public_key: String,
    pub signature: String,
    /// Pre-commits also carry a signature over the raw block hash bytes;
    /// these become the committed block's quorum signature set.
    pub seal_signature: Option<String>,
}

impl SignedVote {
    pub fn sign(vote: Vote, keypair: &Keypair) -> ChainResult<Self> {
        let signature = sign_message(keypair, &vote.message_bytes());
        let seal_signature = match vote.kind {
            VoteKind::PreCommit => {
                let digest = decode_digest(&vote.block_hash)?;
                Some(signature_to_hex(&sign_message(keypair, &digest)))
            }
            VoteKind::PreVote => None,
        };
        Ok(Self {
            public_key: hex::encode(keypair.public.to_bytes()),
            signature: signature_to_hex(&signature),
            seal_signature,
            vote,
        })
    }

    pub fn verify(&self) -> ChainResult<()> {
        let public_key = public_key_from_hex(&self.public_key)?;
        let signature = signature_from_hex(&self.signature)?;
        verify_signature(&public_key, &self.vote.message_bytes(), &signature)?;
        match (&self.vote.kind, &self.seal_signature) {
            (VoteKind::PreCommit, Some(seal)) => {
                let digest = decode_digest(&self.vote.block_hash)?;
                let seal = signature_from_hex(seal)?;
                verify_signature(&public_key, &digest, &seal)
            }
            (VoteKind::PreCommit, None) => {
                Err(ChainError::Crypto("pre-commit without seal signature".into()))
            }
            (VoteKind::PreVote, _) => Ok(()),
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(hash_bytes(&self.vote.message_bytes()))
    }
}

/// Agreement on (height, hash), plus the quorum of seal signatures the
/// committed block will carry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitEvent {
    pub height: u64,
    pub hash: String,
    pub signatures: Vec<KeyedSignature>,
}

/// Outbound vote gossip. Deliberately fire-and-forget: consensus progress
/// never blocks on a slow peer.
pub trait ConsensusNetwork: Send + Sync {
    fn broadcast_vote(&self, vote: &SignedVote);
}

/// Single-node and test wiring: votes go nowhere.
pub struct NoopConsensusNetwork;

impl ConsensusNetwork for NoopConsensusNetwork {
    fn broadcast_vote(&self, _vote: &SignedVote) {}
}

/// Posts votes to each peer's vote endpoint on its own task.
pub struct HttpConsensusNetwork {
    client: reqwest::Client,
    peers: Vec<String>,
}

impl HttpConsensusNetwork {
    pub fn new(peers: Vec<String>, timeout: Duration) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChainError::Config(format!("cannot build http client: {err}")))?;
        Ok(Self { client, peers })
    }
}

impl ConsensusNetwork for HttpConsensusNetwork {
    fn broadcast_vote(&self, vote: &SignedVote) {
        for peer in &self.peers {
            let client = self.client.clone();
            let url = format!("{peer}/consensus/votes");
            let vote = vote.clone();
            tokio::spawn(async move {
                if let Err(err) = client.post(&url).json(&vote).send().await {
                    debug!(%url, %err, "vote delivery failed");
                }
            });
        }
    }
}

/// Quorum size for `peer_count` voters: strictly more than two thirds.
pub fn quorum_size(peer_count: usize) -> usize {
    if peer_count == 0 {
        1
    } else {
        peer_count * 2 / 3 + 1
    }
}

struct Tally {
    /// hash → voting peer key → seal signature (pre-commits only).
    by_hash: HashMap<String, HashMap<String, Option<String>>>,
}

impl Tally {
    fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
        }
    }

    fn record(&mut self, vote: &SignedVote) {
        self.by_hash
            .entry(vote.vote.block_hash.clone())
            .or_default()
            .insert(vote.public_key.clone(), vote.seal_signature.clone());
    }

    fn winner(&self, quorum: usize) -> Option<(&String, &HashMap<String, Option<String>>)> {
        self.by_hash
            .iter()
            .find(|(_, voters)| voters.len() >= quorum)
    }
}

pub struct ConsensusGate {
    keypair: Arc<Keypair>,
    storage: Storage,
    network: Arc<dyn ConsensusNetwork>,
    round_timeout: Duration,
    last_committed: u64,
}

impl ConsensusGate {
    pub fn new(
        keypair: Arc<Keypair>,
        storage: Storage,
        network: Arc<dyn ConsensusNetwork>,
        round_timeout: Duration,
        last_committed: u64,
    ) -> Self {
        Self {
            keypair,
            storage,
            network,
            round_timeout,
            last_committed,
        }
    }

    fn peer_keys(&self) -> ChainResult<HashSet<String>> {
        let wsv = self.storage.wsv_query()?;
        Ok(wsv
            .peers()?
            .into_iter()
            .map(|peer| peer.public_key)
            .collect())
    }

    /// Worker loop: one candidate at a time, rounds restart on timeout,
    /// re-offered candidates for committed heights are no-ops.
    pub async fn run(
        mut self,
        mut candidates: mpsc::Receiver<Block>,
        mut votes: mpsc::Receiver<SignedVote>,
        commits: mpsc::Sender<CommitEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let candidate = tokio::select! {
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => candidate,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            if candidate.height <= self.last_committed {
                debug!(height = candidate.height, "height already committed, ignoring candidate");
                continue;
            }
            match self
                .decide(&candidate, &mut votes, &mut shutdown)
                .await
            {
                Ok(Some(event)) => {
                    self.last_committed = event.height;
                    info!(height = event.height, hash = %event.hash, "consensus reached");
                    if commits.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => warn!(?err, height = candidate.height, "consensus round failed"),
            }
        }
    }

    /// Runs rounds for one candidate until some hash at its height gathers
    /// a pre-commit quorum. Returns `None` only on shutdown.
    async fn decide(
        &self,
        candidate: &Block,
        votes: &mut mpsc::Receiver<SignedVote>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ChainResult<Option<CommitEvent>> {
        let peers = self.peer_keys()?;
        let own_key = hex::encode(self.keypair.public.to_bytes());
        let quorum = quorum_size(peers.len().max(1));
        let height = candidate.height;
        let mut round: u64 = 0;
        loop {
            let mut prevotes = Tally::new();
            let mut precommits = Tally::new();

            let own_prevote = SignedVote::sign(
                Vote {
                    height,
                    round,
                    block_hash: candidate.hash.clone(),
                    kind: VoteKind::PreVote,
                },
                &self.keypair,
            )?;
            self.network.broadcast_vote(&own_prevote);
            if peers.is_empty() || peers.contains(&own_key) {
                prevotes.record(&own_prevote);
            }

            let mut precommitted_for: Option<String> = None;
            if let Some((hash, _)) = prevotes.winner(quorum) {
                let hash = hash.clone();
                self.cast_precommit(height, round, &hash, &peers, &own_key, &mut precommits)?;
                precommitted_for = Some(hash);
            }
            if let Some(event) = Self::commit_from(&precommits, quorum, height) {
                return Ok(Some(event));
            }

            let deadline = tokio::time::Instant::now() + self.round_timeout;
            loop {
                let vote = tokio::select! {
                    vote = votes.recv() => match vote {
                        Some(vote) => vote,
                        None => return Ok(None),
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = shutdown.changed() => return Ok(None),
                };
                if vote.vote.height != height {
                    continue;
                }
                if let Err(err) = vote.verify() {
                    warn!(?err, "discarding invalid vote");
                    continue;
                }
                if !peers.is_empty() && !peers.contains(&vote.public_key) {
                    debug!(key = %vote.public_key, "vote from outside the peer set");
                    continue;
                }
                match vote.vote.kind {
                    VoteKind::PreVote => prevotes.record(&vote),
                    VoteKind::PreCommit => precommits.record(&vote),
                }
                if precommitted_for.is_none() {
                    if let Some((hash, _)) = prevotes.winner(quorum) {
                        let hash = hash.clone();
                        self.cast_precommit(
                            height,
                            round,
                            &hash,
                            &peers,
                            &own_key,
                            &mut precommits,
                        )?;
                        precommitted_for = Some(hash);
                    }
                }
                if let Some(event) = Self::commit_from(&precommits, quorum, height) {
                    return Ok(Some(event));
                }
            }

            round += 1;
            debug!(height, round, "round timed out, restarting");
        }
    }

    fn cast_precommit(
        &self,
        height: u64,
        round: u64,
        hash: &str,
        peers: &HashSet<String>,
        own_key: &str,
        precommits: &mut Tally,
    ) -> ChainResult<()> {
        let own_precommit = SignedVote::sign(
            Vote {
                height,
                round,
                block_hash: hash.to_string(),
                kind: VoteKind::PreCommit,
            },
            &self.keypair,
        )?;
        self.network.broadcast_vote(&own_precommit);
        if peers.is_empty() || peers.contains(own_key) {
            precommits.record(&own_precommit);
        }
        Ok(())
    }

    fn commit_from(precommits: &Tally, quorum: usize, height: u64) -> Option<CommitEvent> {
        let (hash, voters) = precommits.winner(quorum)?;
        let signatures = voters
            .iter()
            .filter_map(|(public_key, seal)| {
                seal.as_ref().map(|signature| KeyedSignature {
                    public_key: public_key.clone(),
                    signature: signature.clone(),
                })
            })
            .collect::<Vec<_>>();
        if signatures.len() < quorum {
            return None;
        }
        Some(CommitEvent {
            height,
            hash: hash.clone(),
            signatures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn quorum_is_two_thirds_plus_one() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 3);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(7), 5);
        assert_eq!(quorum_size(10), 7);
    }

    #[test]
    fn votes_roundtrip_and_verify() {
        let keypair = generate_keypair();
        let vote = Vote {
            height: 4,
            round: 1,
            block_hash: hex::encode([3u8; 32]),
            kind: VoteKind::PreCommit,
        };
        let signed = SignedVote::sign(vote, &keypair).unwrap();
        signed.verify().unwrap();
        assert!(signed.seal_signature.is_some());
        let encoded = serde_json::to_string(&signed).unwrap();
        let decoded: SignedVote = serde_json::from_str(&encoded).unwrap();
        decoded.verify().unwrap();
    }

    #[test]
    fn tampered_vote_fails_verification() {
        let keypair = generate_keypair();
        let vote = Vote {
            height: 4,
            round: 0,
            block_hash: hex::encode([3u8; 32]),
            kind: VoteKind::PreVote,
        };
        let mut signed = SignedVote::sign(vote, &keypair).unwrap();
        signed.vote.block_hash = hex::encode([4u8; 32]);
        assert!(signed.verify().is_err());
    }

    #[test]
    fn precommit_requires_seal() {
        let keypair = generate_keypair();
        let vote = Vote {
            height: 4,
            round: 0,
            block_hash: hex::encode([3u8; 32]),
            kind: VoteKind::PreCommit,
        };
        let mut signed = SignedVote::sign(vote, &keypair).unwrap();
        signed.seal_signature = None;
        assert!(signed.verify().is_err());
    }

    #[test]
    fn tally_counts_distinct_voters_per_hash() {
        let hash = hex::encode([1u8; 32]);
        let mut tally = Tally::new();
        for _ in 0..2 {
            let keypair = generate_keypair();
            let vote = SignedVote::sign(
                Vote {
                    height: 2,
                    round: 0,
                    block_hash: hash.clone(),
                    kind: VoteKind::PreCommit,
                },
                &keypair,
            )
            .unwrap();
            tally.record(&vote);
            // Double-recording the same voter must not inflate the count.
            tally.record(&vote);
        }
        assert!(tally.winner(3).is_none());
        assert!(tally.winner(2).is_some());
        let event = ConsensusGate::commit_from(&tally, 2, 2).unwrap();
        assert_eq!(event.signatures.len(), 2);
        assert_eq!(event.hash, hash);
    }
}
