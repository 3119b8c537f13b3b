use serde::{Deserialize, Serialize};

use crate::crypto::{decode_digest, hash_bytes};
use crate::errors::{ChainError, ChainResult};

use super::{KeyedSignature, SignedTransaction};

/// Hex form of the all-zero digest: the previous-hash sentinel for genesis
/// and the merkle root of an empty transaction list.
pub fn zero_digest_hex() -> String {
    hex::encode([0u8; 32])
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub previous_hash: String,
    pub transactions: Vec<SignedTransaction>,
    pub txs_number: u32,
    pub created_ms: u64,
    pub merkle_root: String,
    pub hash: String,
    pub signatures: Vec<KeyedSignature>,
}

impl Block {
    /// Assembles a block over the given transactions, filling the merkle
    /// root, the transaction count, and the seal hash. The signature set
    /// starts empty; consensus attaches the quorum afterwards.
    pub fn build(
        height: u64,
        previous_hash: String,
        transactions: Vec<SignedTransaction>,
        created_ms: u64,
    ) -> ChainResult<Self> {
        let mut leaves: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.hash()).collect();
        let merkle_root = hex::encode(compute_merkle_root(&mut leaves));
        let txs_number = transactions.len() as u32;
        let hash = hex::encode(seal_hash(
            height,
            &previous_hash,
            &merkle_root,
            created_ms,
            txs_number,
        )?);
        Ok(Self {
            height,
            previous_hash,
            transactions,
            txs_number,
            created_ms,
            merkle_root,
            hash,
            signatures: Vec::new(),
        })
    }

    /// The canonical form persisted in the block store and hashed on the
    /// wire. Signatures are part of it; the seal hash is not recomputed
    /// from it.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block")
    }

    /// Recomputes the derived fields and compares them against the stored
    /// ones. Anything off means the block was corrupted or forged.
    pub fn verify_integrity(&self) -> ChainResult<()> {
        if self.txs_number as usize != self.transactions.len() {
            return Err(ChainError::Consistency(format!(
                "block {} declares {} transactions but carries {}",
                self.height,
                self.txs_number,
                self.transactions.len()
            )));
        }
        let mut leaves: Vec<[u8; 32]> = self.transactions.iter().map(|tx| tx.hash()).collect();
        let merkle_root = hex::encode(compute_merkle_root(&mut leaves));
        if merkle_root != self.merkle_root {
            return Err(ChainError::Consistency(format!(
                "block {} merkle root mismatch",
                self.height
            )));
        }
        let expected = hex::encode(seal_hash(
            self.height,
            &self.previous_hash,
            &self.merkle_root,
            self.created_ms,
            self.txs_number,
        )?);
        if expected != self.hash {
            return Err(ChainError::Consistency(format!(
                "block {} hash mismatch",
                self.height
            )));
        }
        for tx in &self.transactions {
            tx.verify_signatures()?;
        }
        Ok(())
    }

    pub fn hash_digest(&self) -> ChainResult<[u8; 32]> {
        decode_digest(&self.hash)
    }
}

/// Seal layout: height ‖ previous hash ‖ merkle root ‖ creation time ‖
/// transaction count, all fixed-width big-endian.
fn seal_hash(
    height: u64,
    previous_hash: &str,
    merkle_root: &str,
    created_ms: u64,
    txs_number: u32,
) -> ChainResult<[u8; 32]> {
    let previous = decode_digest(previous_hash)?;
    let merkle = decode_digest(merkle_root)?;
    let mut data = Vec::with_capacity(8 + 32 + 32 + 8 + 4);
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&previous);
    data.extend_from_slice(&merkle);
    data.extend_from_slice(&created_ms.to_be_bytes());
    data.extend_from_slice(&txs_number.to_be_bytes());
    Ok(hash_bytes(&data))
}

/// Root of a binary merkle tree over the given leaves. Odd levels duplicate
/// the last node; an empty list yields the all-zero root.
pub fn compute_merkle_root(leaves: &mut Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next.push(hash_bytes(&data));
        }
        *leaves = next;
    }
    leaves[0]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub hash: String,
    pub created_ms: u64,
}

impl From<&Block> for BlockMetadata {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            hash: block.hash.clone(),
            created_ms: block.created_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::types::{Command, Transaction};

    fn sample_tx(amount: u128) -> SignedTransaction {
        let keypair = generate_keypair();
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
            &keypair,
        )
    }

    #[test]
    fn empty_merkle_root_is_all_zero() {
        let mut leaves = Vec::new();
        assert_eq!(compute_merkle_root(&mut leaves), [0u8; 32]);
    }

    #[test]
    fn merkle_root_depends_on_order() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let mut forward = vec![a, b];
        let mut reversed = vec![b, a];
        assert_ne!(
            compute_merkle_root(&mut forward),
            compute_merkle_root(&mut reversed)
        );
    }

    #[test]
    fn odd_leaf_count_duplicates_last() {
        let mut three = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let mut padded = vec![[1u8; 32], [2u8; 32], [3u8; 32], [3u8; 32]];
        assert_eq!(
            compute_merkle_root(&mut three),
            compute_merkle_root(&mut padded)
        );
    }

    #[test]
    fn built_block_passes_integrity_check() {
        let block = Block::build(1, zero_digest_hex(), vec![sample_tx(5)], 1_000).unwrap();
        block.verify_integrity().unwrap();
        assert_eq!(block.txs_number, 1);
        assert_ne!(block.merkle_root, zero_digest_hex());
    }

    #[test]
    fn tampered_transaction_list_breaks_integrity() {
        let mut block = Block::build(1, zero_digest_hex(), vec![sample_tx(5)], 1_000).unwrap();
        block.transactions.push(sample_tx(7));
        assert!(block.verify_integrity().is_err());
    }

    #[test]
    fn canonical_roundtrip_is_bit_identical() {
        let block = Block::build(2, hex::encode([9u8; 32]), vec![sample_tx(3)], 42).unwrap();
        let decoded: Block = serde_json::from_slice(&block.canonical_bytes()).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(block.canonical_bytes(), decoded.canonical_bytes());
    }
}
