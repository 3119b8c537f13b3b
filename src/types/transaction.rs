use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    hash_bytes, public_key_from_hex, sign_message, signature_from_hex, signature_to_hex,
    verify_signature,
};
use crate::errors::ChainResult;

use super::{AccountId, Command};

/// Signed command batch authored by one account. The payload is immutable
/// once created; its identity is the hash of the canonical serialization,
/// signatures excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub creator: AccountId,
    pub created_ms: u64,
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new(creator: AccountId, commands: Vec<Command>) -> Self {
        Self {
            creator,
            commands,
            created_ms: current_millis(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing transaction payload")
    }

    pub fn hash(&self) -> [u8; 32] {
        hash_bytes(&self.canonical_bytes())
    }
}

/// Hex-encoded ed25519 signature together with the key that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedSignature {
    pub public_key: String,
    pub signature: String,
}

impl KeyedSignature {
    pub fn sign(keypair: &Keypair, message: &[u8]) -> Self {
        Self {
            public_key: hex::encode(keypair.public.to_bytes()),
            signature: signature_to_hex(&sign_message(keypair, message)),
        }
    }

    pub fn verify(&self, message: &[u8]) -> ChainResult<()> {
        let public_key = public_key_from_hex(&self.public_key)?;
        let signature = signature_from_hex(&self.signature)?;
        verify_signature(&public_key, message, &signature)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub payload: Transaction,
    pub signatures: Vec<KeyedSignature>,
}

impl SignedTransaction {
    pub fn new(payload: Transaction, keypair: &Keypair) -> Self {
        let signature = KeyedSignature::sign(keypair, &payload.canonical_bytes());
        Self {
            payload,
            signatures: vec![signature],
        }
    }

    pub fn unsigned(payload: Transaction) -> Self {
        Self {
            payload,
            signatures: Vec::new(),
        }
    }

    pub fn add_signature(&mut self, keypair: &Keypair) {
        let signature = KeyedSignature::sign(keypair, &self.payload.canonical_bytes());
        if !self
            .signatures
            .iter()
            .any(|existing| existing.public_key == signature.public_key)
        {
            self.signatures.push(signature);
        }
    }

    pub fn hash(&self) -> [u8; 32] {
        self.payload.hash()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Checks every attached signature against its declared public key.
    /// Ledger-state questions (are these keys signatories, do they reach
    /// quorum) are stateful validation, not handled here.
    pub fn verify_signatures(&self) -> ChainResult<()> {
        let message = self.payload.canonical_bytes();
        for signature in &self.signatures {
            signature.verify(&message)?;
        }
        Ok(())
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn transfer() -> Transaction {
        Transaction::new(
            "alice".into(),
            vec![Command::TransferAsset {
                source: "alice".into(),
                destination: "bob".into(),
                asset_id: "coin".into(),
                amount: 10,
            }],
        )
    }

    #[test]
    fn hash_ignores_signatures() {
        let payload = transfer();
        let unsigned = SignedTransaction::unsigned(payload.clone());
        let keypair = generate_keypair();
        let signed = SignedTransaction::new(payload, &keypair);
        assert_eq!(unsigned.hash(), signed.hash());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let keypair = generate_keypair();
        let mut signed = SignedTransaction::new(transfer(), &keypair);
        signed.verify_signatures().unwrap();
        signed.payload.creator = "mallory".into();
        assert!(signed.verify_signatures().is_err());
    }

    #[test]
    fn duplicate_signers_collapse() {
        let keypair = generate_keypair();
        let mut signed = SignedTransaction::new(transfer(), &keypair);
        signed.add_signature(&keypair);
        assert_eq!(signed.signatures.len(), 1);
    }

    #[test]
    fn serialization_roundtrip_is_identical() {
        let keypair = generate_keypair();
        let signed = SignedTransaction::new(transfer(), &keypair);
        let encoded = serde_json::to_vec(&signed).unwrap();
        let decoded: SignedTransaction = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(signed, decoded);
    }
}
