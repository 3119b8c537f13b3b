//! Transaction validation, split the way the pipeline needs it: stateless
//! checks that depend on nothing but the transaction itself, and stateful
//! validation that filters a proposal against a scratch branch of the
//! world state.

use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::types::{Proposal, SignedTransaction, VerifiedProposal};
use crate::wsv::TemporaryWsv;

/// Well-formedness and signature checks, no ledger state involved.
#[derive(Clone, Debug)]
pub struct StatelessValidator {
    max_timestamp_skew_ms: u64,
    max_signatures: usize,
}

impl StatelessValidator {
    pub fn new(max_timestamp_skew_ms: u64, max_signatures: usize) -> Self {
        Self {
            max_timestamp_skew_ms,
            max_signatures,
        }
    }

    /// Accepts or rejects a transaction; `now_ms` is passed in so the skew
    /// window is testable. No side effects either way.
    pub fn validate(&self, tx: &SignedTransaction, now_ms: u64) -> ChainResult<()> {
        if tx.payload.commands.is_empty() {
            return Err(ChainError::Transaction("empty command list".into()));
        }
        if tx.payload.creator.is_empty() {
            return Err(ChainError::Transaction("missing creator".into()));
        }
        let skew = now_ms.abs_diff(tx.payload.created_ms);
        if skew > self.max_timestamp_skew_ms {
            return Err(ChainError::Transaction(format!(
                "timestamp outside the acceptable window by {skew} ms"
            )));
        }
        if tx.signatures.is_empty() {
            return Err(ChainError::Transaction("no signatures".into()));
        }
        if tx.signatures.len() > self.max_signatures {
            return Err(ChainError::Transaction(format!(
                "too many signatures: {} > {}",
                tx.signatures.len(),
                self.max_signatures
            )));
        }
        tx.verify_signatures()
    }
}

/// A transaction dropped during stateful validation, kept for the status
/// registry; the verified proposal itself carries only survivors.
#[derive(Clone, Debug)]
pub struct RejectedTransaction {
    pub hash: String,
    pub reason: String,
}

/// Filters a proposal to the subsequence that applies cleanly against a
/// temporary WSV.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatefulValidator;

impl StatefulValidator {
    /// Applies each transaction in order against the scratch branch. A
    /// failing transaction is dropped and later ones continue against the
    /// branch as it stood before the failure.
    pub fn validate(
        &self,
        proposal: &Proposal,
        wsv: &mut TemporaryWsv,
    ) -> ChainResult<(VerifiedProposal, Vec<RejectedTransaction>)> {
        let mut accepted = Vec::with_capacity(proposal.transactions.len());
        let mut rejected = Vec::new();
        for tx in &proposal.transactions {
            match wsv.apply_transaction(tx) {
                Ok(()) => accepted.push(tx.clone()),
                Err(ChainError::Transaction(reason)) => {
                    debug!(hash = %tx.hash_hex(), %reason, "transaction failed stateful validation");
                    rejected.push(RejectedTransaction {
                        hash: tx.hash_hex(),
                        reason,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok((
            VerifiedProposal {
                height: proposal.height,
                transactions: accepted,
            },
            rejected,
        ))
    }
}
