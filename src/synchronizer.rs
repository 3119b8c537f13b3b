//! Synchronizer: on a committed (height, hash), make the local ledger
//! match. Either the local candidate is the committed block and is staged
//! directly, or the node is behind/disagrees and the missing chain is
//! fetched from peers, validated, and applied atomically.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::consensus::{quorum_size, CommitEvent};
use crate::crypto::{public_key_from_hex, signature_from_hex, verify_signature};
use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::Block;
use crate::wsv::Peer;

/// Ranged block fetch from the rest of the network. The transport behind
/// it is a collaborator, not part of the core.
#[async_trait]
pub trait BlockLoader: Send + Sync {
    async fn fetch_blocks(&self, from: u64, to: u64) -> ChainResult<Vec<Block>>;
}

/// Fetches block ranges from peer HTTP endpoints with bounded retries and
/// exponential backoff.
pub struct HttpBlockLoader {
    client: reqwest::Client,
    peers: Vec<String>,
    retries: u32,
}

impl HttpBlockLoader {
    pub fn new(peers: Vec<String>, timeout: Duration, retries: u32) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChainError::Config(format!("cannot build http client: {err}")))?;
        Ok(Self {
            client,
            peers,
            retries,
        })
    }

    async fn fetch_from(&self, peer: &str, from: u64, to: u64) -> ChainResult<Vec<Block>> {
        let url = format!("{peer}/blocks?from={from}&to={to}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ChainError::SyncFailed(format!("fetch from {peer} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ChainError::SyncFailed(format!(
                "{peer} answered {} for blocks {from}..={to}",
                response.status()
            )));
        }
        response
            .json::<Vec<Block>>()
            .await
            .map_err(|err| ChainError::SyncFailed(format!("invalid block payload: {err}")))
    }
}

#[async_trait]
impl BlockLoader for HttpBlockLoader {
    async fn fetch_blocks(&self, from: u64, to: u64) -> ChainResult<Vec<Block>> {
        if self.peers.is_empty() {
            return Err(ChainError::SyncFailed("no peers configured".into()));
        }
        let mut backoff = Duration::from_millis(250);
        let mut last_error = None;
        for attempt in 0..=self.retries {
            for peer in &self.peers {
                match self.fetch_from(peer, from, to).await {
                    Ok(blocks) if !blocks.is_empty() => return Ok(blocks),
                    Ok(_) => {
                        last_error =
                            Some(ChainError::SyncFailed(format!("{peer} had no blocks")));
                    }
                    Err(err) => {
                        warn!(attempt, %peer, %err, "block fetch attempt failed");
                        last_error = Some(err);
                    }
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_error
            .unwrap_or_else(|| ChainError::SyncFailed("peer fetch exhausted retries".into())))
    }
}

/// Chain-level validation of a block that did not come out of the local
/// pipeline: the signature set must form a quorum of the peer set in
/// force at that point of the chain. Linkage and command application are
/// enforced by the mutable view itself.
pub struct ChainValidator;

impl ChainValidator {
    pub fn verify_block_signatures(block: &Block, peers: &[Peer]) -> ChainResult<()> {
        if block.height == 1 {
            // Genesis precedes any peer set; it carries no quorum.
            return Ok(());
        }
        let digest = block.hash_digest()?;
        let peer_keys: HashSet<&str> = peers.iter().map(|peer| peer.public_key.as_str()).collect();
        let quorum = quorum_size(peer_keys.len().max(1));
        let mut valid: HashSet<&str> = HashSet::new();
        for signature in &block.signatures {
            if !peer_keys.contains(signature.public_key.as_str()) {
                continue;
            }
            let public_key = public_key_from_hex(&signature.public_key)?;
            let decoded = signature_from_hex(&signature.signature)?;
            if verify_signature(&public_key, &digest, &decoded).is_ok() {
                valid.insert(signature.public_key.as_str());
            }
        }
        if valid.len() < quorum {
            return Err(ChainError::Consistency(format!(
                "block {} carries {} of {} required quorum signatures",
                block.height,
                valid.len(),
                quorum
            )));
        }
        Ok(())
    }
}

pub struct Synchronizer {
    storage: Storage,
    loader: Arc<dyn BlockLoader>,
}

impl Synchronizer {
    pub fn new(storage: Storage, loader: Arc<dyn BlockLoader>) -> Self {
        Self { storage, loader }
    }

    /// Advances the local ledger to the committed hash. Returns the blocks
    /// that were durably applied, in order.
    pub async fn apply_commit(
        &self,
        event: &CommitEvent,
        local_candidate: Option<Block>,
    ) -> ChainResult<Vec<Block>> {
        match local_candidate {
            Some(mut candidate)
                if candidate.height == event.height && candidate.hash == event.hash =>
            {
                candidate.signatures = event.signatures.clone();
                let mut view = self.storage.create_mutable_wsv()?;
                ChainValidator::verify_block_signatures(&candidate, &view.peers()?)?;
                view.apply_block(candidate)?;
                self.storage.commit(view)
            }
            other => {
                if other.is_some() {
                    info!(
                        height = event.height,
                        hash = %event.hash,
                        "consensus disagrees with local candidate, syncing from peers"
                    );
                }
                self.sync_to(event).await
            }
        }
    }

    async fn sync_to(&self, event: &CommitEvent) -> ChainResult<Vec<Block>> {
        let local_tip = self.storage.tip()?.map(|tip| tip.height).unwrap_or(0);
        if event.height <= local_tip {
            let stored = self
                .storage
                .block_query()
                .block(event.height)?
                .ok_or_else(|| {
                    ChainError::Consistency(format!("tip claims height {}", event.height))
                })?;
            if stored.hash == event.hash {
                return Ok(Vec::new());
            }
            return Err(ChainError::Consistency(format!(
                "committed hash at height {} contradicts the local chain",
                event.height
            )));
        }
        info!(
            from = local_tip + 1,
            to = event.height,
            "fetching missing blocks from peers"
        );
        let blocks = self.loader.fetch_blocks(local_tip + 1, event.height).await?;
        let mut view = self.storage.create_mutable_wsv()?;
        for block in blocks {
            ChainValidator::verify_block_signatures(&block, &view.peers()?)?;
            view.apply_block(block)?;
        }
        if view.top_hash() != event.hash {
            return Err(ChainError::SyncFailed(format!(
                "fetched chain ends at {}, consensus committed {}",
                view.top_hash(),
                event.hash
            )));
        }
        self.storage.commit(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::types::{zero_digest_hex, Command, KeyedSignature, SignedTransaction, Transaction};
    use ed25519_dalek::Keypair;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct MemoryLoader {
        blocks: Mutex<HashMap<u64, Block>>,
    }

    impl MemoryLoader {
        fn new(blocks: Vec<Block>) -> Self {
            Self {
                blocks: Mutex::new(blocks.into_iter().map(|b| (b.height, b)).collect()),
            }
        }
    }

    #[async_trait]
    impl BlockLoader for MemoryLoader {
        async fn fetch_blocks(&self, from: u64, to: u64) -> ChainResult<Vec<Block>> {
            let blocks = self.blocks.lock();
            let mut result = Vec::new();
            for height in from..=to {
                match blocks.get(&height) {
                    Some(block) => result.push(block.clone()),
                    None => {
                        return Err(ChainError::SyncFailed(format!("missing block {height}")))
                    }
                }
            }
            Ok(result)
        }
    }

    fn genesis(peer_keypair: &Keypair, account_keypair: &Keypair) -> Block {
        let tx = SignedTransaction::unsigned(Transaction::new(
            "genesis".into(),
            vec![
                Command::CreateAsset {
                    asset_id: "coin".into(),
                    precision: 0,
                },
                Command::CreateAccount {
                    account_id: "alice".into(),
                    public_key: hex::encode(account_keypair.public.to_bytes()),
                },
                Command::CreateAccount {
                    account_id: "bob".into(),
                    public_key: hex::encode(account_keypair.public.to_bytes()),
                },
                Command::AddAssetQuantity {
                    account_id: "alice".into(),
                    asset_id: "coin".into(),
                    amount: 100,
                },
                Command::AddPeer {
                    address: "http://127.0.0.1:7410".into(),
                    public_key: hex::encode(peer_keypair.public.to_bytes()),
                },
            ],
        ));
        Block::build(1, zero_digest_hex(), vec![tx], 1).unwrap()
    }

    fn sealed_transfer_block(
        height: u64,
        previous_hash: String,
        amount: u128,
        peer_keypair: &Keypair,
        account_keypair: &Keypair,
    ) -> Block {
        let tx = SignedTransaction::new(
            Transaction::new(
                "alice".into(),
                vec![Command::TransferAsset {
                    source: "alice".into(),
                    destination: "bob".into(),
                    asset_id: "coin".into(),
                    amount,
                }],
            ),
            account_keypair,
        );
        let mut block = Block::build(height, previous_hash, vec![tx], height * 100).unwrap();
        let digest = block.hash_digest().unwrap();
        block.signatures = vec![KeyedSignature::sign(peer_keypair, &digest)];
        block
    }

    fn seeded_storage(dir: &std::path::Path, peer: &Keypair, account: &Keypair) -> Storage {
        let storage = Storage::open(dir).unwrap();
        let mut view = storage.create_mutable_wsv().unwrap();
        view.apply_block(genesis(peer, account)).unwrap();
        storage.commit(view).unwrap();
        storage
    }

    fn commit_event(block: &Block) -> CommitEvent {
        CommitEvent {
            height: block.height,
            hash: block.hash.clone(),
            signatures: block.signatures.clone(),
        }
    }

    #[tokio::test]
    async fn matching_candidate_is_committed_locally() {
        let dir = tempdir().unwrap();
        let peer = generate_keypair();
        let account = generate_keypair();
        let storage = seeded_storage(dir.path(), &peer, &account);
        let tip = storage.tip().unwrap().unwrap();
        let block = sealed_transfer_block(2, tip.hash, 10, &peer, &account);
        let mut candidate = block.clone();
        candidate.signatures.clear();
        let synchronizer = Synchronizer::new(storage.clone(), Arc::new(MemoryLoader::new(vec![])));
        let applied = synchronizer
            .apply_commit(&commit_event(&block), Some(candidate))
            .await
            .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(storage.tip().unwrap().unwrap().height, 2);
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 90);
        assert_eq!(wsv.balance("bob", "coin").unwrap(), 110);
    }

    #[tokio::test]
    async fn lagging_node_fetches_and_applies_the_gap() {
        let peer = generate_keypair();
        let account = generate_keypair();

        // Build the authoritative chain 1..=4 in a scratch ledger.
        let source_dir = tempdir().unwrap();
        let source = seeded_storage(source_dir.path(), &peer, &account);
        let mut chain = vec![source.block_query().block(1).unwrap().unwrap()];
        for height in 2..=4 {
            let previous = chain.last().unwrap().hash.clone();
            let block = sealed_transfer_block(height, previous, 10, &peer, &account);
            let mut view = source.create_mutable_wsv().unwrap();
            view.apply_block(block.clone()).unwrap();
            source.commit(view).unwrap();
            chain.push(block);
        }

        // A fresh node holding only genesis catches up from the loader.
        let lagging_dir = tempdir().unwrap();
        let lagging = seeded_storage(lagging_dir.path(), &peer, &account);
        let loader = Arc::new(MemoryLoader::new(chain.clone()));
        let synchronizer = Synchronizer::new(lagging.clone(), loader);
        let applied = synchronizer
            .apply_commit(&commit_event(&chain[3]), None)
            .await
            .unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(lagging.tip().unwrap().unwrap().height, 4);
        let wsv = lagging.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 70);
        assert_eq!(wsv.balance("bob", "coin").unwrap(), 130);
    }

    #[tokio::test]
    async fn disagreeing_candidate_is_discarded_for_the_committed_block() {
        let peer = generate_keypair();
        let account = generate_keypair();
        let dir = tempdir().unwrap();
        let storage = seeded_storage(dir.path(), &peer, &account);
        let tip = storage.tip().unwrap().unwrap();

        let committed = sealed_transfer_block(2, tip.hash.clone(), 25, &peer, &account);
        let mut local_candidate =
            sealed_transfer_block(2, tip.hash, 10, &peer, &account);
        local_candidate.signatures.clear();
        assert_ne!(local_candidate.hash, committed.hash);

        let loader = Arc::new(MemoryLoader::new(vec![committed.clone()]));
        let synchronizer = Synchronizer::new(storage.clone(), loader);
        let applied = synchronizer
            .apply_commit(&commit_event(&committed), Some(local_candidate))
            .await
            .unwrap();
        assert_eq!(applied[0].hash, committed.hash);
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 75);
    }

    #[tokio::test]
    async fn unsigned_fetched_blocks_are_refused() {
        let peer = generate_keypair();
        let account = generate_keypair();
        let dir = tempdir().unwrap();
        let storage = seeded_storage(dir.path(), &peer, &account);
        let tip = storage.tip().unwrap().unwrap();
        let mut block = sealed_transfer_block(2, tip.hash, 10, &peer, &account);
        block.signatures.clear();
        let loader = Arc::new(MemoryLoader::new(vec![block.clone()]));
        let synchronizer = Synchronizer::new(storage.clone(), loader);
        let err = synchronizer
            .apply_commit(&commit_event(&block), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Consistency(_)));
        assert_eq!(storage.tip().unwrap().unwrap().height, 1);
    }

    #[tokio::test]
    async fn exhausted_loader_surfaces_sync_failed() {
        let peer = generate_keypair();
        let account = generate_keypair();
        let dir = tempdir().unwrap();
        let storage = seeded_storage(dir.path(), &peer, &account);
        let loader = Arc::new(MemoryLoader::new(vec![]));
        let synchronizer = Synchronizer::new(storage, loader);
        let event = CommitEvent {
            height: 3,
            hash: hex::encode([9u8; 32]),
            signatures: Vec::new(),
        };
        let err = synchronizer.apply_commit(&event, None).await.unwrap_err();
        assert!(matches!(err, ChainError::SyncFailed(_)));
    }
}
