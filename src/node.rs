//! Node assembly and lifecycle. Components are built leaves-first around
//! shared [`Storage`], wired together with bounded channels, and run as
//! dedicated workers: ordering → simulator → candidate builder →
//! consensus → synchronizer. Errors never cross a stream boundary; a
//! stage logs, drops, and keeps its lane moving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::consensus::{
    CommitEvent, ConsensusGate, ConsensusNetwork, HttpConsensusNetwork, NoopConsensusNetwork,
    SignedVote,
};
use crate::crypto::load_or_generate_keypair;
use crate::errors::{ChainError, ChainResult};
use crate::ordering::{OrderingConfig, OrderingGate};
use crate::pcs::PeerCommunicationService;
use crate::simulator::Simulator;
use crate::storage::Storage;
use crate::synchronizer::{BlockLoader, HttpBlockLoader, Synchronizer};
use crate::types::{
    current_millis, zero_digest_hex, Block, Command, Proposal, SignedTransaction, Transaction,
};
use crate::validation::StatelessValidator;
use crate::wsv::{AccountRecord, AssetBalance};

const PROPOSAL_CHANNEL: usize = 16;
const CANDIDATE_CHANNEL: usize = 16;
const VOTE_CHANNEL: usize = 256;
const COMMIT_CHANNEL: usize = 16;
const MAX_BLOCK_RANGE: u64 = 128;

pub const GENESIS_CREATOR: &str = "genesis";

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxStatus {
    Queued,
    Committed { height: u64 },
    Rejected { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub chain_id: String,
    pub height: u64,
    pub top_hash: String,
    pub queue_depth: usize,
    pub dropped_transactions: u64,
}

struct NodeInner {
    config: NodeConfig,
    keypair: Arc<Keypair>,
    storage: Storage,
    ordering: OrderingGate,
    stateless: StatelessValidator,
    pcs: PeerCommunicationService,
    statuses: Mutex<HashMap<String, TxStatus>>,
    dropped_transactions: AtomicU64,
    votes_tx: mpsc::Sender<SignedVote>,
    candidate_cache: Mutex<Option<Block>>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Node {
    inner: Arc<NodeInner>,
    votes_rx: Option<mpsc::Receiver<SignedVote>>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let keypair = Arc::new(load_or_generate_keypair(&config.key_path)?);
        let storage = Storage::open(&config.data_dir)?;
        if storage.tip()?.is_none() {
            commit_genesis(&storage, &config)?;
        }
        let tip_height = storage.tip()?.map(|tip| tip.height).unwrap_or(0);
        let ordering = OrderingGate::new(
            OrderingConfig {
                max_txs_per_proposal: config.max_txs_per_proposal,
                proposal_interval: config.proposal_interval(),
                queue_capacity: config.queue_capacity,
                dedup_window_heights: config.dedup_window_heights,
            },
            tip_height + 1,
        );
        let stateless =
            StatelessValidator::new(config.max_timestamp_skew_ms, config.max_signatures_per_tx);
        let (votes_tx, votes_rx) = mpsc::channel(VOTE_CHANNEL);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            config,
            keypair,
            storage,
            ordering,
            stateless,
            pcs: PeerCommunicationService::new(),
            statuses: Mutex::new(HashMap::new()),
            dropped_transactions: AtomicU64::new(0),
            votes_tx,
            candidate_cache: Mutex::new(None),
            shutdown_tx,
        });
        info!(
            public_key = %hex::encode(inner.keypair.public.to_bytes()),
            height = tip_height,
            "node initialized"
        );
        Ok(Self {
            inner,
            votes_rx: Some(votes_rx),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Runs the pipeline until shutdown is requested. Workers exit on the
    /// shutdown signal; outstanding mutable views roll back on drop.
    pub async fn start(mut self) -> ChainResult<()> {
        let inner = self.inner.clone();
        let votes_rx = self
            .votes_rx
            .take()
            .ok_or_else(|| ChainError::Config("node already started".into()))?;

        let (proposals_tx, mut proposals_rx) = mpsc::channel::<Proposal>(PROPOSAL_CHANNEL);
        let (verified_tx, mut verified_rx) = mpsc::channel(PROPOSAL_CHANNEL);
        let (candidates_tx, candidates_rx) = mpsc::channel::<Block>(CANDIDATE_CHANNEL);
        let (commits_tx, mut commits_rx) = mpsc::channel::<CommitEvent>(COMMIT_CHANNEL);

        let shutdown = inner.shutdown_tx.subscribe();

        let ordering_worker = tokio::spawn(
            inner
                .ordering
                .clone()
                .run(proposals_tx, inner.shutdown_tx.subscribe()),
        );

        let simulator = Arc::new(Simulator::new(inner.storage.clone()));
        let sim = simulator.clone();
        let sim_inner = inner.clone();
        let mut sim_shutdown = inner.shutdown_tx.subscribe();
        let simulator_worker = tokio::spawn(async move {
            loop {
                let proposal = tokio::select! {
                    proposal = proposals_rx.recv() => match proposal {
                        Some(proposal) => proposal,
                        None => break,
                    },
                    _ = sim_shutdown.changed() => break,
                };
                sim_inner.pcs.publish_proposal(proposal.clone());
                match sim.process_proposal(&proposal) {
                    Ok(Some((verified, rejected))) => {
                        if !rejected.is_empty() {
                            sim_inner
                                .dropped_transactions
                                .fetch_add(rejected.len() as u64, Ordering::Relaxed);
                            let mut statuses = sim_inner.statuses.lock();
                            for rejection in rejected {
                                statuses.insert(
                                    rejection.hash,
                                    TxStatus::Rejected {
                                        reason: rejection.reason,
                                    },
                                );
                            }
                        }
                        if verified_tx.send(verified).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(?err, "stateful validation errored, dropping proposal"),
                }
            }
        });

        let builder_inner = inner.clone();
        let mut builder_shutdown = inner.shutdown_tx.subscribe();
        let builder_worker = tokio::spawn(async move {
            loop {
                let verified = tokio::select! {
                    verified = verified_rx.recv() => match verified {
                        Some(verified) => verified,
                        None => break,
                    },
                    _ = builder_shutdown.changed() => break,
                };
                match simulator.build_candidate(&verified) {
                    Ok(Some(candidate)) => {
                        *builder_inner.candidate_cache.lock() = Some(candidate.clone());
                        if candidates_tx.send(candidate).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(?err, "candidate construction failed"),
                }
            }
        });

        let network: Arc<dyn ConsensusNetwork> = if inner.config.peers.is_empty() {
            Arc::new(NoopConsensusNetwork)
        } else {
            Arc::new(HttpConsensusNetwork::new(
                inner.config.peers.clone(),
                inner.config.fetch_timeout(),
            )?)
        };
        let tip_height = inner.storage.tip()?.map(|tip| tip.height).unwrap_or(0);
        let gate = ConsensusGate::new(
            inner.keypair.clone(),
            inner.storage.clone(),
            network,
            inner.config.consensus_round_timeout(),
            tip_height,
        );
        let consensus_worker = tokio::spawn(gate.run(
            candidates_rx,
            votes_rx,
            commits_tx,
            inner.shutdown_tx.subscribe(),
        ));

        let loader: Arc<dyn BlockLoader> = Arc::new(HttpBlockLoader::new(
            inner.config.peers.clone(),
            inner.config.fetch_timeout(),
            inner.config.fetch_retries,
        )?);
        let synchronizer = Synchronizer::new(inner.storage.clone(), loader);
        let sync_inner = inner.clone();
        let mut sync_shutdown = inner.shutdown_tx.subscribe();
        let sync_worker = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = commits_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = sync_shutdown.changed() => break,
                };
                let candidate = sync_inner.candidate_cache.lock().take();
                loop {
                    match synchronizer.apply_commit(&event, candidate.clone()).await {
                        Ok(blocks) => {
                            sync_inner.note_committed(&blocks);
                            break;
                        }
                        Err(ChainError::SyncFailed(reason)) => {
                            warn!(%reason, height = event.height, "sync failed, pausing before retry");
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                                _ = sync_shutdown.changed() => return,
                            }
                        }
                        Err(err) => {
                            // A failed commit leaves a poisoned view; the
                            // startup consistency check is the recovery path.
                            error!(?err, height = event.height, "halting commit processing");
                            let _ = sync_inner.shutdown_tx.send(true);
                            return;
                        }
                    }
                }
            }
        });

        let mut shutdown_rx = shutdown;
        let _ = shutdown_rx.changed().await;
        info!("shutting down pipeline workers");
        for worker in [
            ordering_worker,
            simulator_worker,
            builder_worker,
            consensus_worker,
            sync_worker,
        ] {
            let _ = worker.await;
        }
        Ok(())
    }
}

impl NodeInner {
    fn note_committed(&self, blocks: &[Block]) {
        for block in blocks {
            self.ordering.observe_commit(block.height);
            {
                let mut statuses = self.statuses.lock();
                for tx in &block.transactions {
                    statuses.insert(
                        tx.hash_hex(),
                        TxStatus::Committed {
                            height: block.height,
                        },
                    );
                }
            }
            self.pcs.publish_commit(block.clone());
        }
    }
}

impl NodeHandle {
    /// Stateless check + enqueue. Acceptance only means the transaction is
    /// queued; commitment is learned by polling the status endpoint.
    pub fn submit_transaction(&self, tx: SignedTransaction) -> ChainResult<String> {
        self.inner.stateless.validate(&tx, current_millis())?;
        let hash = tx.hash_hex();
        self.inner.ordering.submit(tx)?;
        self.inner
            .statuses
            .lock()
            .entry(hash.clone())
            .or_insert(TxStatus::Queued);
        Ok(hash)
    }

    pub fn transaction_status(&self, hash: &str) -> Option<TxStatus> {
        self.inner.statuses.lock().get(hash).cloned()
    }

    pub fn submit_vote(&self, vote: SignedVote) -> ChainResult<String> {
        vote.verify()?;
        let hash = vote.hash_hex();
        self.inner
            .votes_tx
            .try_send(vote)
            .map_err(|_| ChainError::Backpressure)?;
        Ok(hash)
    }

    pub fn get_block(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.block_query().block(height)
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        self.inner.storage.block_query().latest_block()
    }

    /// Ranged fetch used by lagging peers; the range is clamped so one
    /// request cannot drag the whole chain over the wire.
    pub fn blocks_range(&self, from: u64, to: u64) -> ChainResult<Vec<Block>> {
        if from == 0 || to < from {
            return Err(ChainError::Config("invalid block range".into()));
        }
        let to = to.min(from + MAX_BLOCK_RANGE - 1);
        let query = self.inner.storage.block_query();
        let mut blocks = Vec::new();
        for height in from..=to {
            match query.block(height)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn account(&self, account_id: &str) -> ChainResult<Option<AccountRecord>> {
        self.inner.storage.wsv_query()?.account(account_id)
    }

    pub fn account_assets(&self, account_id: &str) -> ChainResult<Vec<AssetBalance>> {
        self.inner.storage.wsv_query()?.assets(account_id)
    }

    pub fn account_signatories(&self, account_id: &str) -> ChainResult<Vec<String>> {
        self.inner.storage.wsv_query()?.signatories(account_id)
    }

    /// Committed transactions created by the account, newest first.
    pub fn account_transactions(
        &self,
        account_id: &str,
        limit: usize,
    ) -> ChainResult<Vec<SignedTransaction>> {
        let query = self.inner.storage.block_query();
        let mut collected = Vec::new();
        let tip = match query.tip()? {
            Some(tip) => tip.height,
            None => return Ok(collected),
        };
        for height in (1..=tip).rev() {
            if collected.len() >= limit {
                break;
            }
            if let Some(block) = query.block(height)? {
                for tx in block.transactions.iter().rev() {
                    if tx.payload.creator == account_id {
                        collected.push(tx.clone());
                        if collected.len() >= limit {
                            break;
                        }
                    }
                }
            }
        }
        Ok(collected)
    }

    pub fn node_status(&self) -> ChainResult<NodeStatus> {
        let tip = self.inner.storage.tip()?;
        Ok(NodeStatus {
            chain_id: self.inner.config.genesis.chain_id.clone(),
            height: tip.as_ref().map(|tip| tip.height).unwrap_or(0),
            top_hash: tip
                .map(|tip| tip.hash)
                .unwrap_or_else(zero_digest_hex),
            queue_depth: self.inner.ordering.queue_depth(),
            dropped_transactions: self.inner.dropped_transactions.load(Ordering::Relaxed),
        })
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.inner.keypair.public.to_bytes())
    }

    pub fn on_proposal(&self) -> tokio::sync::broadcast::Receiver<Proposal> {
        self.inner.pcs.on_proposal()
    }

    pub fn on_commit(&self) -> tokio::sync::broadcast::Receiver<Block> {
        self.inner.pcs.on_commit()
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

/// Builds and commits block 1 from the genesis configuration through the
/// normal mutable-view path. The genesis timestamp is fixed at zero so
/// every peer sharing the configuration derives the same block hash.
fn commit_genesis(storage: &Storage, config: &NodeConfig) -> ChainResult<()> {
    let genesis = &config.genesis;
    let mut commands = Vec::new();
    for asset in &genesis.assets {
        commands.push(Command::CreateAsset {
            asset_id: asset.asset_id.clone(),
            precision: asset.precision,
        });
    }
    for account in &genesis.accounts {
        commands.push(Command::CreateAccount {
            account_id: account.account_id.clone(),
            public_key: account.public_key.clone(),
        });
        for balance in &account.balances {
            commands.push(Command::AddAssetQuantity {
                account_id: account.account_id.clone(),
                asset_id: balance.asset_id.clone(),
                amount: balance.amount,
            });
        }
    }
    for peer in &genesis.peers {
        commands.push(Command::AddPeer {
            address: peer.address.clone(),
            public_key: peer.public_key.clone(),
        });
    }
    for grant in &genesis.permissions {
        commands.push(Command::GrantPermission {
            account_id: grant.account_id.clone(),
            permission: grant.permission,
        });
    }
    let transactions = if commands.is_empty() {
        Vec::new()
    } else {
        vec![SignedTransaction::unsigned(Transaction {
            creator: GENESIS_CREATOR.into(),
            created_ms: 0,
            commands,
        })]
    };
    let block = Block::build(1, zero_digest_hex(), transactions, 0)?;
    let mut view = storage.create_mutable_wsv()?;
    view.apply_block(block)?;
    storage.commit(view)?;
    info!(chain_id = %genesis.chain_id, "genesis block committed");
    Ok(())
}
