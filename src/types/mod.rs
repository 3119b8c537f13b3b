mod block;
mod command;
mod proposal;
mod transaction;

pub use block::{compute_merkle_root, zero_digest_hex, Block, BlockMetadata};
pub use command::{Command, Permission};
pub use proposal::{Proposal, VerifiedProposal};
pub use transaction::{KeyedSignature, SignedTransaction, Transaction};

pub(crate) use transaction::current_millis;

pub type AccountId = String;
pub type AssetId = String;
