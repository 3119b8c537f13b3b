//! Ordering gate: accepts stateless-valid transactions and batches them
//! into height-stamped proposals, bounded by count and time.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Proposal, SignedTransaction};

#[derive(Clone, Debug)]
pub struct OrderingConfig {
    pub max_txs_per_proposal: usize,
    pub proposal_interval: Duration,
    pub queue_capacity: usize,
    pub dedup_window_heights: usize,
}

struct QueueState {
    pending: VecDeque<SignedTransaction>,
    queued_hashes: HashSet<String>,
    /// Hashes of the proposals emitted for the last few heights, oldest
    /// first. Anything in here is silently dropped on resubmission.
    recent: VecDeque<(u64, HashSet<String>)>,
}

struct OrderingInner {
    config: OrderingConfig,
    queue: Mutex<QueueState>,
    next_height: AtomicU64,
    batch_ready: Notify,
}

#[derive(Clone)]
pub struct OrderingGate {
    inner: Arc<OrderingInner>,
}

impl OrderingGate {
    /// `next_height` is the chain position the next proposal is meant for,
    /// i.e. the storage tip plus one.
    pub fn new(config: OrderingConfig, next_height: u64) -> Self {
        Self {
            inner: Arc::new(OrderingInner {
                config,
                queue: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    queued_hashes: HashSet::new(),
                    recent: VecDeque::new(),
                }),
                next_height: AtomicU64::new(next_height),
                batch_ready: Notify::new(),
            }),
        }
    }

    /// Enqueues a transaction. Duplicates of anything queued or recently
    /// proposed are dropped silently; a queue at capacity pushes back.
    pub fn submit(&self, tx: SignedTransaction) -> ChainResult<()> {
        let hash = tx.hash_hex();
        let notify = {
            let mut queue = self.inner.queue.lock();
            if queue.queued_hashes.contains(&hash)
                || queue.recent.iter().any(|(_, hashes)| hashes.contains(&hash))
            {
                debug!(%hash, "dropping duplicate transaction");
                return Ok(());
            }
            if queue.pending.len() >= self.inner.config.queue_capacity {
                return Err(ChainError::Backpressure);
            }
            queue.queued_hashes.insert(hash);
            queue.pending.push_back(tx);
            queue.pending.len() >= self.inner.config.max_txs_per_proposal
        };
        if notify {
            self.inner.batch_ready.notify_one();
        }
        Ok(())
    }

    /// Storage tells the gate how far the chain has advanced; proposal
    /// heights never run behind it.
    pub fn observe_commit(&self, committed_height: u64) {
        self.inner
            .next_height
            .fetch_max(committed_height + 1, Ordering::SeqCst);
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    fn emit(&self) -> Option<Proposal> {
        let mut queue = self.inner.queue.lock();
        if queue.pending.is_empty() {
            return None;
        }
        let take = queue
            .pending
            .len()
            .min(self.inner.config.max_txs_per_proposal);
        let transactions: Vec<SignedTransaction> = queue.pending.drain(..take).collect();
        let height = self.inner.next_height.fetch_add(1, Ordering::SeqCst);
        let mut hashes = HashSet::with_capacity(transactions.len());
        for tx in &transactions {
            let hash = tx.hash_hex();
            queue.queued_hashes.remove(&hash);
            hashes.insert(hash);
        }
        queue.recent.push_back((height, hashes));
        while queue.recent.len() > self.inner.config.dedup_window_heights {
            queue.recent.pop_front();
        }
        Some(Proposal {
            height,
            transactions,
        })
    }

    /// Worker loop: emits on the interval when the queue is non-empty, or
    /// immediately when a full batch accumulates.
    pub async fn run(
        self,
        proposals: mpsc::Sender<Proposal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.inner.config.proposal_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        interval.tick().await;
        loop {
            let emitted = tokio::select! {
                _ = interval.tick() => self.emit(),
                _ = self.inner.batch_ready.notified() => {
                    let full = self.queue_depth() >= self.inner.config.max_txs_per_proposal;
                    if full {
                        interval.reset();
                        self.emit()
                    } else {
                        None
                    }
                }
                _ = shutdown.changed() => break,
            };
            if let Some(proposal) = emitted {
                info!(
                    height = proposal.height,
                    txs = proposal.transactions.len(),
                    "emitting proposal"
                );
                if proposals.send(proposal).await.is_err() {
                    warn!("proposal stream closed, stopping ordering gate");
                    break;
                }
                // A backlog larger than one batch keeps draining without
                // waiting out the interval.
                if self.queue_depth() >= self.inner.config.max_txs_per_proposal {
                    self.inner.batch_ready.notify_one();
                }
            }
        }
    }
}
