use std::fmt;

use serde::{Deserialize, Serialize};

use super::{AccountId, AssetId};

/// The closed command set. Every command mutates exactly one region of the
/// world state; anything outside this enum is not expressible on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateAccount {
        account_id: AccountId,
        public_key: String,
    },
    AddSignatory {
        account_id: AccountId,
        public_key: String,
    },
    RemoveSignatory {
        account_id: AccountId,
        public_key: String,
    },
    SetQuorum {
        account_id: AccountId,
        quorum: u32,
    },
    CreateAsset {
        asset_id: AssetId,
        precision: u8,
    },
    AddAssetQuantity {
        account_id: AccountId,
        asset_id: AssetId,
        amount: u128,
    },
    TransferAsset {
        source: AccountId,
        destination: AccountId,
        asset_id: AssetId,
        amount: u128,
    },
    AddPeer {
        address: String,
        public_key: String,
    },
    GrantPermission {
        account_id: AccountId,
        permission: Permission,
    },
    RevokePermission {
        account_id: AccountId,
        permission: Permission,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    CreateAccount,
    CreateAsset,
    MintAsset,
    AddPeer,
    /// Move assets out of accounts other than one's own.
    Transfer,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::CreateAccount => "create_account",
            Permission::CreateAsset => "create_asset",
            Permission::MintAsset => "mint_asset",
            Permission::AddPeer => "add_peer",
            Permission::Transfer => "transfer",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "create_account" => Some(Permission::CreateAccount),
            "create_asset" => Some(Permission::CreateAsset),
            "mint_asset" => Some(Permission::MintAsset),
            "add_peer" => Some(Permission::AddPeer),
            "transfer" => Some(Permission::Transfer),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
