use serde::{Deserialize, Serialize};

use super::SignedTransaction;

/// Ordered batch of transactions bound to the chain position it is meant
/// for. Produced by the ordering gate, immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub transactions: Vec<SignedTransaction>,
}

/// The subsequence of a proposal that survived stateful validation, in
/// input order, at the same height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedProposal {
    pub height: u64,
    pub transactions: Vec<SignedTransaction>,
}
