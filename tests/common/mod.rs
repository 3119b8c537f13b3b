#![allow(dead_code)]

use std::path::Path;

use ed25519_dalek::Keypair;

use vellum_chain::config::{
    GenesisAccount, GenesisAsset, GenesisBalance, GenesisPeer, NodeConfig,
};
use vellum_chain::crypto::{generate_keypair, save_keypair};
use vellum_chain::types::{Command, SignedTransaction, Transaction};

pub struct TestSetup {
    pub config: NodeConfig,
    pub alice: Keypair,
    pub bob: Keypair,
}

/// Node config over a temp dir: asset `coin`, accounts `alice` and `bob`
/// seeded with 100 each, and this node registered as the only ledger peer
/// so consensus self-commits.
pub fn setup(dir: &Path, proposal_interval_ms: u64, queue_capacity: usize) -> TestSetup {
    let alice = generate_keypair();
    let bob = generate_keypair();
    let node_key = generate_keypair();

    let mut config = NodeConfig::default();
    config.data_dir = dir.join("data");
    config.key_path = dir.join("keys/node.toml");
    config.proposal_interval_ms = proposal_interval_ms;
    config.queue_capacity = queue_capacity;
    save_keypair(&config.key_path, &node_key).unwrap();

    config.genesis.assets = vec![GenesisAsset {
        asset_id: "coin".into(),
        precision: 0,
    }];
    config.genesis.accounts = vec![
        GenesisAccount {
            account_id: "alice".into(),
            public_key: hex::encode(alice.public.to_bytes()),
            balances: vec![GenesisBalance {
                asset_id: "coin".into(),
                amount: 100,
            }],
        },
        GenesisAccount {
            account_id: "bob".into(),
            public_key: hex::encode(bob.public.to_bytes()),
            balances: vec![GenesisBalance {
                asset_id: "coin".into(),
                amount: 100,
            }],
        },
    ];
    config.genesis.peers = vec![GenesisPeer {
        address: format!("http://{}", config.rpc_listen),
        public_key: hex::encode(node_key.public.to_bytes()),
    }];

    TestSetup { config, alice, bob }
}

pub fn transfer(
    keypair: &Keypair,
    creator: &str,
    destination: &str,
    amount: u128,
) -> SignedTransaction {
    SignedTransaction::new(
        Transaction::new(
            creator.into(),
            vec![Command::TransferAsset {
                source: creator.into(),
                destination: destination.into(),
                asset_id: "coin".into(),
                amount,
            }],
        ),
        keypair,
    )
}

pub fn balance_of(assets: &[vellum_chain::wsv::AssetBalance], asset_id: &str) -> u128 {
    assets
        .iter()
        .find(|balance| balance.asset_id == asset_id)
        .map(|balance| balance.amount)
        .unwrap_or(0)
}
