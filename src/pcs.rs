//! Peer communication service: the fan-out hub exposing the proposal and
//! commit streams to any number of observers. Subscribers see every event
//! emitted after they subscribe; nothing is replayed.

use tokio::sync::broadcast;

use crate::types::{Block, Proposal};

const HUB_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct PeerCommunicationService {
    proposals: broadcast::Sender<Proposal>,
    commits: broadcast::Sender<Block>,
}

impl Default for PeerCommunicationService {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerCommunicationService {
    pub fn new() -> Self {
        let (proposals, _) = broadcast::channel(HUB_CAPACITY);
        let (commits, _) = broadcast::channel(HUB_CAPACITY);
        Self { proposals, commits }
    }

    pub fn on_proposal(&self) -> broadcast::Receiver<Proposal> {
        self.proposals.subscribe()
    }

    pub fn on_commit(&self) -> broadcast::Receiver<Block> {
        self.commits.subscribe()
    }

    /// A send without subscribers is not an error; events are best-effort
    /// notifications, never control flow.
    pub(crate) fn publish_proposal(&self, proposal: Proposal) {
        let _ = self.proposals.send(proposal);
    }

    pub(crate) fn publish_commit(&self, block: Block) {
        let _ = self.commits.send(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::zero_digest_hex;

    #[tokio::test]
    async fn subscribers_see_events_after_subscription_only() {
        let hub = PeerCommunicationService::new();
        let early = Block::build(1, zero_digest_hex(), Vec::new(), 1).unwrap();
        hub.publish_commit(early.clone());

        let mut commits = hub.on_commit();
        let late = Block::build(2, early.hash.clone(), Vec::new(), 2).unwrap();
        hub.publish_commit(late.clone());
        let seen = commits.recv().await.unwrap();
        assert_eq!(seen.height, 2);
        assert!(commits.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let hub = PeerCommunicationService::new();
        let mut first = hub.on_proposal();
        let mut second = hub.on_proposal();
        hub.publish_proposal(Proposal {
            height: 2,
            transactions: Vec::new(),
        });
        assert_eq!(first.recv().await.unwrap().height, 2);
        assert_eq!(second.recv().await.unwrap().height, 2);
    }
}
