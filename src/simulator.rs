//! Simulator: turns proposals into verified proposals against a scratch
//! branch of the world state, then assembles candidate blocks that chain
//! on the cached last block.

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::errors::ChainResult;
use crate::storage::{BlockQuery, Storage};
use crate::types::{current_millis, Block, Proposal, VerifiedProposal};
use crate::validation::{RejectedTransaction, StatefulValidator};

pub struct Simulator {
    storage: Storage,
    block_query: BlockQuery,
    validator: StatefulValidator,
    last_block: Mutex<Option<Block>>,
}

impl Simulator {
    pub fn new(storage: Storage) -> Self {
        let block_query = storage.block_query();
        Self {
            storage,
            block_query,
            validator: StatefulValidator,
            last_block: Mutex::new(None),
        }
    }

    /// Stateful validation of one proposal. Returns `None` when the local
    /// chain lags behind the proposal height; the synchronizer repairs
    /// that, the proposal itself is abandoned.
    pub fn process_proposal(
        &self,
        proposal: &Proposal,
    ) -> ChainResult<Option<(VerifiedProposal, Vec<RejectedTransaction>)>> {
        if proposal.height < 2 {
            warn!(height = proposal.height, "proposal below first usable height");
            return Ok(None);
        }
        let last_block = match self.block_query.block(proposal.height - 1)? {
            Some(block) => block,
            None => {
                warn!(
                    height = proposal.height,
                    "no local block behind proposal, dropping until synced"
                );
                return Ok(None);
            }
        };
        if last_block.height + 1 != proposal.height {
            warn!(
                height = proposal.height,
                local = last_block.height,
                "chain lag, dropping proposal"
            );
            return Ok(None);
        }
        *self.last_block.lock() = Some(last_block);
        let mut scratch = self.storage.create_temporary_wsv()?;
        let (verified, rejected) = self.validator.validate(proposal, &mut scratch)?;
        info!(
            height = verified.height,
            accepted = verified.transactions.len(),
            rejected = rejected.len(),
            "proposal verified"
        );
        Ok(Some((verified, rejected)))
    }

    /// Builds the candidate block for a verified proposal: parent hash from
    /// the cached last block, merkle root over the surviving transactions,
    /// creation time stamped here. The signature set stays empty until
    /// consensus fills it.
    pub fn build_candidate(&self, verified: &VerifiedProposal) -> ChainResult<Option<Block>> {
        if verified.transactions.is_empty() {
            info!(height = verified.height, "nothing survived validation, no candidate");
            return Ok(None);
        }
        let guard = self.last_block.lock();
        let last_block = match guard.as_ref() {
            Some(block) if block.height + 1 == verified.height => block,
            _ => {
                warn!(height = verified.height, "last block moved, dropping candidate");
                return Ok(None);
            }
        };
        let candidate = Block::build(
            verified.height,
            last_block.hash.clone(),
            verified.transactions.clone(),
            current_millis(),
        )?;
        info!(height = candidate.height, hash = %candidate.hash, "candidate built");
        Ok(Some(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::storage::Storage;
    use crate::types::{zero_digest_hex, Command, SignedTransaction, Transaction};
    use ed25519_dalek::Keypair;
    use tempfile::tempdir;

    fn seeded(dir: &std::path::Path, keypair: &Keypair) -> Storage {
        let storage = Storage::open(dir).unwrap();
        let pk = hex::encode(keypair.public.to_bytes());
        let genesis = SignedTransaction::unsigned(Transaction::new(
            "genesis".into(),
            vec![
                Command::CreateAsset {
                    asset_id: "coin".into(),
                    precision: 0,
                },
                Command::CreateAccount {
                    account_id: "alice".into(),
                    public_key: pk.clone(),
                },
                Command::CreateAccount {
                    account_id: "bob".into(),
                    public_key: pk,
                },
                Command::AddAssetQuantity {
                    account_id: "alice".into(),
                    asset_id: "coin".into(),
                    amount: 100,
                },
            ],
        ));
        let block = Block::build(1, zero_digest_hex(), vec![genesis], 1).unwrap();
        let mut view = storage.create_mutable_wsv().unwrap();
        view.apply_block(block).unwrap();
        storage.commit(view).unwrap();
        storage
    }

    fn transfer(keypair: &Keypair, amount: u128) -> SignedTransaction {
        SignedTransaction::new(
            Transaction::new(
                "alice".into(),
                vec![Command::TransferAsset {
                    source: "alice".into(),
                    destination: "bob".into(),
                    asset_id: "coin".into(),
                    amount,
                }],
            ),
            keypair,
        )
    }

    #[test]
    fn proposal_flows_into_a_linked_candidate() {
        let dir = tempdir().unwrap();
        let keypair = generate_keypair();
        let storage = seeded(dir.path(), &keypair);
        let simulator = Simulator::new(storage.clone());
        let proposal = Proposal {
            height: 2,
            transactions: vec![transfer(&keypair, 10)],
        };
        let (verified, rejected) = simulator.process_proposal(&proposal).unwrap().unwrap();
        assert!(rejected.is_empty());
        let candidate = simulator.build_candidate(&verified).unwrap().unwrap();
        assert_eq!(candidate.height, 2);
        let genesis = storage.block_query().block(1).unwrap().unwrap();
        assert_eq!(candidate.previous_hash, genesis.hash);
        candidate.verify_integrity().unwrap();
        assert!(candidate.signatures.is_empty());
    }

    #[test]
    fn lagging_proposal_is_dropped() {
        let dir = tempdir().unwrap();
        let keypair = generate_keypair();
        let storage = seeded(dir.path(), &keypair);
        let simulator = Simulator::new(storage);
        let proposal = Proposal {
            height: 5,
            transactions: vec![transfer(&keypair, 10)],
        };
        assert!(simulator.process_proposal(&proposal).unwrap().is_none());
    }

    #[test]
    fn fully_rejected_proposal_yields_no_candidate() {
        let dir = tempdir().unwrap();
        let keypair = generate_keypair();
        let storage = seeded(dir.path(), &keypair);
        let simulator = Simulator::new(storage);
        let proposal = Proposal {
            height: 2,
            transactions: vec![transfer(&keypair, 1_000)],
        };
        let (verified, rejected) = simulator.process_proposal(&proposal).unwrap().unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(simulator.build_candidate(&verified).unwrap().is_none());
    }

    #[test]
    fn validation_leaves_committed_state_untouched() {
        let dir = tempdir().unwrap();
        let keypair = generate_keypair();
        let storage = seeded(dir.path(), &keypair);
        let simulator = Simulator::new(storage.clone());
        let proposal = Proposal {
            height: 2,
            transactions: vec![transfer(&keypair, 60)],
        };
        simulator.process_proposal(&proposal).unwrap().unwrap();
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 100);
    }
}
