//! World-State-View: the relational projection of the ledger.
//!
//! Three views with strictly separated capabilities hang off one SQLite
//! database: [`WsvQuery`] for serializable read-only access, [`TemporaryWsv`]
//! as a discardable scratch branch for stateful validation, and
//! [`MutableWsv`] as the single exclusive writer that stages blocks for an
//! atomic commit. Every view owns its own connection; no state escapes a
//! view except through [`crate::storage::Storage::commit`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, Command, Permission, SignedTransaction};

const WSV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    quorum     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS signatories (
    account_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    PRIMARY KEY (account_id, public_key)
);
CREATE TABLE IF NOT EXISTS peers (
    address    TEXT PRIMARY KEY,
    public_key TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS asset_definitions (
    asset_id  TEXT PRIMARY KEY,
    precision INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS balances (
    account_id TEXT NOT NULL,
    asset_id   TEXT NOT NULL,
    amount     TEXT NOT NULL,
    PRIMARY KEY (account_id, asset_id)
);
CREATE TABLE IF NOT EXISTS permissions (
    account_id TEXT NOT NULL,
    permission TEXT NOT NULL,
    PRIMARY KEY (account_id, permission)
);
CREATE TABLE IF NOT EXISTS wsv_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const APPLIED_HEIGHT_KEY: &str = "applied_height";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: String,
    pub quorum: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: String,
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_id: String,
    pub amount: u128,
}

/// Identity under which a command executes. Genesis bypasses permission
/// checks (there is no state to hold permissions yet); structural rules
/// still apply.
#[derive(Clone, Copy, Debug)]
pub enum Authority<'a> {
    Genesis,
    Account(&'a str),
}

pub(crate) fn open_connection(path: &Path) -> ChainResult<Connection> {
    let conn = Connection::open(path)
        .map_err(|err| ChainError::StorageUnavailable(format!("cannot open wsv: {err}")))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| ChainError::StorageUnavailable(format!("cannot enable wal: {err}")))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn init_schema(conn: &Connection) -> ChainResult<()> {
    conn.execute_batch(WSV_SCHEMA)?;
    Ok(())
}

pub(crate) fn applied_height(conn: &Connection) -> ChainResult<u64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM wsv_meta WHERE key = ?1",
            params![APPLIED_HEIGHT_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ChainError::Consistency("invalid applied height in wsv".into())),
        None => Ok(0),
    }
}

pub(crate) fn set_applied_height(conn: &Connection, height: u64) -> ChainResult<()> {
    conn.execute(
        "INSERT INTO wsv_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![APPLIED_HEIGHT_KEY, height.to_string()],
    )?;
    Ok(())
}

fn account_quorum(conn: &Connection, account_id: &str) -> ChainResult<Option<u32>> {
    let quorum: Option<u32> = conn
        .query_row(
            "SELECT quorum FROM accounts WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(quorum)
}

fn signatory_count(conn: &Connection, account_id: &str) -> ChainResult<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM signatories WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn is_signatory(conn: &Connection, account_id: &str, public_key: &str) -> ChainResult<bool> {
    let found: Option<u32> = conn
        .query_row(
            "SELECT 1 FROM signatories WHERE account_id = ?1 AND public_key = ?2",
            params![account_id, public_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn has_permission(conn: &Connection, account_id: &str, permission: Permission) -> ChainResult<bool> {
    let found: Option<u32> = conn
        .query_row(
            "SELECT 1 FROM permissions WHERE account_id = ?1 AND permission = ?2",
            params![account_id, permission.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn read_balance(conn: &Connection, account_id: &str, asset_id: &str) -> ChainResult<u128> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT amount FROM balances WHERE account_id = ?1 AND asset_id = ?2",
            params![account_id, asset_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => text
            .parse::<u128>()
            .map_err(|_| ChainError::Consistency(format!("corrupt balance for {account_id}"))),
        None => Ok(0),
    }
}

fn write_balance(conn: &Connection, account_id: &str, asset_id: &str, amount: u128) -> ChainResult<()> {
    conn.execute(
        "INSERT INTO balances (account_id, asset_id, amount) VALUES (?1, ?2, ?3)
         ON CONFLICT(account_id, asset_id) DO UPDATE SET amount = excluded.amount",
        params![account_id, asset_id, amount.to_string()],
    )?;
    Ok(())
}

fn require_account(conn: &Connection, account_id: &str) -> ChainResult<u32> {
    account_quorum(conn, account_id)?
        .ok_or_else(|| ChainError::Transaction(format!("account {account_id} not found")))
}

fn require_asset(conn: &Connection, asset_id: &str) -> ChainResult<()> {
    let found: Option<u32> = conn
        .query_row(
            "SELECT 1 FROM asset_definitions WHERE asset_id = ?1",
            params![asset_id],
            |row| row.get(0),
        )
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| ChainError::Transaction(format!("asset {asset_id} not defined")))
}

fn require_permission(
    conn: &Connection,
    authority: Authority<'_>,
    permission: Permission,
) -> ChainResult<()> {
    match authority {
        Authority::Genesis => Ok(()),
        Authority::Account(account_id) => {
            if has_permission(conn, account_id, permission)? {
                Ok(())
            } else {
                Err(ChainError::Transaction(format!(
                    "{account_id} lacks permission {permission}"
                )))
            }
        }
    }
}

/// Executes one command against the given connection. All structural rules
/// live here; permission rules are skipped only for the genesis authority.
pub(crate) fn apply_command(
    conn: &Connection,
    authority: Authority<'_>,
    command: &Command,
) -> ChainResult<()> {
    match command {
        Command::CreateAccount {
            account_id,
            public_key,
        } => {
            require_permission(conn, authority, Permission::CreateAccount)?;
            if account_id.is_empty() {
                return Err(ChainError::Transaction("empty account id".into()));
            }
            if account_quorum(conn, account_id)?.is_some() {
                return Err(ChainError::Transaction(format!(
                    "account {account_id} already exists"
                )));
            }
            crate::crypto::public_key_from_hex(public_key)
                .map_err(|err| ChainError::Transaction(err.to_string()))?;
            conn.execute(
                "INSERT INTO accounts (account_id, quorum) VALUES (?1, 1)",
                params![account_id],
            )?;
            conn.execute(
                "INSERT INTO signatories (account_id, public_key) VALUES (?1, ?2)",
                params![account_id, public_key],
            )?;
            Ok(())
        }
        Command::AddSignatory {
            account_id,
            public_key,
        } => {
            require_self_or_genesis(authority, account_id)?;
            require_account(conn, account_id)?;
            if is_signatory(conn, account_id, public_key)? {
                return Err(ChainError::Transaction("signatory already present".into()));
            }
            crate::crypto::public_key_from_hex(public_key)
                .map_err(|err| ChainError::Transaction(err.to_string()))?;
            conn.execute(
                "INSERT INTO signatories (account_id, public_key) VALUES (?1, ?2)",
                params![account_id, public_key],
            )?;
            Ok(())
        }
        Command::RemoveSignatory {
            account_id,
            public_key,
        } => {
            require_self_or_genesis(authority, account_id)?;
            let quorum = require_account(conn, account_id)?;
            if !is_signatory(conn, account_id, public_key)? {
                return Err(ChainError::Transaction("signatory not present".into()));
            }
            if signatory_count(conn, account_id)? <= quorum {
                return Err(ChainError::Transaction(
                    "removal would drop signatories below quorum".into(),
                ));
            }
            conn.execute(
                "DELETE FROM signatories WHERE account_id = ?1 AND public_key = ?2",
                params![account_id, public_key],
            )?;
            Ok(())
        }
        Command::SetQuorum { account_id, quorum } => {
            require_self_or_genesis(authority, account_id)?;
            require_account(conn, account_id)?;
            if *quorum == 0 || *quorum > signatory_count(conn, account_id)? {
                return Err(ChainError::Transaction(format!(
                    "quorum {quorum} out of range for {account_id}"
                )));
            }
            conn.execute(
                "UPDATE accounts SET quorum = ?2 WHERE account_id = ?1",
                params![account_id, quorum],
            )?;
            Ok(())
        }
        Command::CreateAsset {
            asset_id,
            precision,
        } => {
            require_permission(conn, authority, Permission::CreateAsset)?;
            if require_asset(conn, asset_id).is_ok() {
                return Err(ChainError::Transaction(format!(
                    "asset {asset_id} already defined"
                )));
            }
            conn.execute(
                "INSERT INTO asset_definitions (asset_id, precision) VALUES (?1, ?2)",
                params![asset_id, precision],
            )?;
            Ok(())
        }
        Command::AddAssetQuantity {
            account_id,
            asset_id,
            amount,
        } => {
            require_permission(conn, authority, Permission::MintAsset)?;
            require_account(conn, account_id)?;
            require_asset(conn, asset_id)?;
            let current = read_balance(conn, account_id, asset_id)?;
            let updated = current
                .checked_add(*amount)
                .ok_or_else(|| ChainError::Transaction("balance overflow".into()))?;
            write_balance(conn, account_id, asset_id, updated)
        }
        Command::TransferAsset {
            source,
            destination,
            asset_id,
            amount,
        } => {
            if let Authority::Account(acting) = authority {
                if acting != source && !has_permission(conn, acting, Permission::Transfer)? {
                    return Err(ChainError::Transaction(format!(
                        "{acting} cannot transfer from {source}"
                    )));
                }
            }
            if *amount == 0 {
                return Err(ChainError::Transaction("zero transfer amount".into()));
            }
            require_account(conn, source)?;
            require_account(conn, destination)?;
            require_asset(conn, asset_id)?;
            let source_balance = read_balance(conn, source, asset_id)?;
            if source_balance < *amount {
                return Err(ChainError::Transaction(format!(
                    "insufficient balance on {source}"
                )));
            }
            let destination_balance = read_balance(conn, destination, asset_id)?
                .checked_add(*amount)
                .ok_or_else(|| ChainError::Transaction("balance overflow".into()))?;
            write_balance(conn, source, asset_id, source_balance - *amount)?;
            write_balance(conn, destination, asset_id, destination_balance)
        }
        Command::AddPeer {
            address,
            public_key,
        } => {
            require_permission(conn, authority, Permission::AddPeer)?;
            crate::crypto::public_key_from_hex(public_key)
                .map_err(|err| ChainError::Transaction(err.to_string()))?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO peers (address, public_key) VALUES (?1, ?2)",
                params![address, public_key],
            )?;
            if inserted == 0 {
                return Err(ChainError::Transaction(format!(
                    "peer {address} already registered"
                )));
            }
            Ok(())
        }
        Command::GrantPermission {
            account_id,
            permission,
        } => {
            require_permission(conn, authority, *permission)?;
            require_account(conn, account_id)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO permissions (account_id, permission) VALUES (?1, ?2)",
                params![account_id, permission.as_str()],
            )?;
            if inserted == 0 {
                return Err(ChainError::Transaction("permission already granted".into()));
            }
            Ok(())
        }
        Command::RevokePermission {
            account_id,
            permission,
        } => {
            require_permission(conn, authority, *permission)?;
            let removed = conn.execute(
                "DELETE FROM permissions WHERE account_id = ?1 AND permission = ?2",
                params![account_id, permission.as_str()],
            )?;
            if removed == 0 {
                return Err(ChainError::Transaction("permission not held".into()));
            }
            Ok(())
        }
    }
}

fn require_self_or_genesis(authority: Authority<'_>, account_id: &str) -> ChainResult<()> {
    match authority {
        Authority::Genesis => Ok(()),
        Authority::Account(acting) if acting == account_id => Ok(()),
        Authority::Account(acting) => Err(ChainError::Transaction(format!(
            "{acting} cannot administer {account_id}"
        ))),
    }
}

/// Creator existence + signature quorum against the current state. The
/// cryptographic validity of each signature is a stateless concern; here
/// only registered signatory keys count towards quorum.
pub(crate) fn check_transaction_quorum(
    conn: &Connection,
    tx: &SignedTransaction,
) -> ChainResult<()> {
    let creator = &tx.payload.creator;
    let quorum = account_quorum(conn, creator)?
        .ok_or_else(|| ChainError::Transaction(format!("creator {creator} not found")))?;
    if quorum == 0 {
        return Err(ChainError::Transaction(format!(
            "creator {creator} has zero quorum"
        )));
    }
    let mut matching: u32 = 0;
    let mut seen: Vec<&str> = Vec::new();
    for signature in &tx.signatures {
        if seen.contains(&signature.public_key.as_str()) {
            continue;
        }
        seen.push(&signature.public_key);
        if is_signatory(conn, creator, &signature.public_key)? {
            matching += 1;
        }
    }
    if matching < quorum {
        return Err(ChainError::Transaction(format!(
            "quorum not met: {matching} of {quorum} signatories"
        )));
    }
    Ok(())
}

/// Applies a full transaction (quorum check + every command) inside a
/// savepoint, so a failing transaction leaves the branch untouched.
pub(crate) fn apply_transaction(conn: &Connection, tx: &SignedTransaction) -> ChainResult<()> {
    conn.execute_batch("SAVEPOINT apply_tx;")?;
    let result = check_transaction_quorum(conn, tx).and_then(|_| {
        for command in &tx.payload.commands {
            apply_command(conn, Authority::Account(&tx.payload.creator), command)?;
        }
        Ok(())
    });
    match result {
        Ok(()) => {
            conn.execute_batch("RELEASE apply_tx;")?;
            Ok(())
        }
        Err(err) => {
            conn.execute_batch("ROLLBACK TO apply_tx; RELEASE apply_tx;")?;
            Err(err)
        }
    }
}

/// Applies every transaction of a committed block. Genesis (height 1) runs
/// under the genesis authority and without quorum checks; there is no state
/// it could be checked against.
pub(crate) fn apply_block_commands(conn: &Connection, block: &Block) -> ChainResult<()> {
    for tx in &block.transactions {
        if block.height == 1 {
            for command in &tx.payload.commands {
                apply_command(conn, Authority::Genesis, command)?;
            }
        } else {
            apply_transaction(conn, tx)?;
        }
    }
    set_applied_height(conn, block.height)
}

pub(crate) fn load_peers(conn: &Connection) -> ChainResult<Vec<Peer>> {
    let mut statement = conn.prepare("SELECT address, public_key FROM peers ORDER BY address")?;
    let rows = statement.query_map([], |row| {
        Ok(Peer {
            address: row.get(0)?,
            public_key: row.get(1)?,
        })
    })?;
    let mut peers = Vec::new();
    for peer in rows {
        peers.push(peer?);
    }
    Ok(peers)
}

/// Read-only view over the committed state. Holds its own connection pinned
/// to query-only mode; every call takes the shared storage read lock so a
/// commit is never observed half-applied.
pub struct WsvQuery {
    conn: Connection,
    read_lock: Arc<RwLock<()>>,
}

impl WsvQuery {
    pub(crate) fn new(path: &Path, read_lock: Arc<RwLock<()>>) -> ChainResult<Self> {
        let conn = open_connection(path)?;
        conn.pragma_update(None, "query_only", true)
            .map_err(|err| ChainError::StorageUnavailable(format!("cannot pin read-only: {err}")))?;
        Ok(Self { conn, read_lock })
    }

    pub fn account(&self, account_id: &str) -> ChainResult<Option<AccountRecord>> {
        let _shared = self.read_lock.read();
        let record = self
            .conn
            .query_row(
                "SELECT account_id, quorum FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(AccountRecord {
                        account_id: row.get(0)?,
                        quorum: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn signatories(&self, account_id: &str) -> ChainResult<Vec<String>> {
        let _shared = self.read_lock.read();
        let mut statement = self
            .conn
            .prepare("SELECT public_key FROM signatories WHERE account_id = ?1 ORDER BY public_key")?;
        let rows = statement.query_map(params![account_id], |row| row.get(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    pub fn balance(&self, account_id: &str, asset_id: &str) -> ChainResult<u128> {
        let _shared = self.read_lock.read();
        read_balance(&self.conn, account_id, asset_id)
    }

    pub fn assets(&self, account_id: &str) -> ChainResult<Vec<AssetBalance>> {
        let _shared = self.read_lock.read();
        let mut statement = self
            .conn
            .prepare("SELECT asset_id, amount FROM balances WHERE account_id = ?1 ORDER BY asset_id")?;
        let rows = statement.query_map(params![account_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut balances = Vec::new();
        for row in rows {
            let (asset_id, raw) = row?;
            let amount = raw
                .parse::<u128>()
                .map_err(|_| ChainError::Consistency(format!("corrupt balance for {account_id}")))?;
            balances.push(AssetBalance { asset_id, amount });
        }
        Ok(balances)
    }

    pub fn peers(&self) -> ChainResult<Vec<Peer>> {
        let _shared = self.read_lock.read();
        load_peers(&self.conn)
    }

    pub fn applied_height(&self) -> ChainResult<u64> {
        let _shared = self.read_lock.read();
        applied_height(&self.conn)
    }
}

/// Scratch branch of the committed state. Lives on its own connection with
/// one open transaction that is rolled back on drop; nothing done here is
/// ever visible elsewhere.
pub struct TemporaryWsv {
    conn: Connection,
    finished: bool,
}

impl TemporaryWsv {
    pub(crate) fn new(path: &Path) -> ChainResult<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch("BEGIN;")
            .map_err(|err| ChainError::StorageUnavailable(format!("cannot branch wsv: {err}")))?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    /// Quorum check plus sequential command application, atomically per
    /// transaction: a failure rolls the branch back to where this
    /// transaction started.
    pub fn apply_transaction(&mut self, tx: &SignedTransaction) -> ChainResult<()> {
        apply_transaction(&self.conn, tx)
    }
}

impl Drop for TemporaryWsv {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK;");
            self.finished = true;
        }
    }
}

/// The single exclusive writer view. Staged blocks are applied to an open
/// transaction and persisted only through [`crate::storage::Storage::commit`];
/// dropping the view rolls everything back and frees the writer slot.
pub struct MutableWsv {
    conn: Connection,
    staged: Vec<Block>,
    top_height: u64,
    top_hash: String,
    poisoned: bool,
    committed: bool,
    writer_slot: Arc<AtomicBool>,
}

impl MutableWsv {
    pub(crate) fn new(
        path: &Path,
        top_height: u64,
        top_hash: String,
        writer_slot: Arc<AtomicBool>,
    ) -> ChainResult<Self> {
        let conn = match open_connection(path) {
            Ok(conn) => conn,
            Err(err) => {
                writer_slot.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE;") {
            writer_slot.store(false, Ordering::SeqCst);
            return Err(ChainError::StorageUnavailable(format!(
                "cannot open writer transaction: {err}"
            )));
        }
        Ok(Self {
            conn,
            staged: Vec::new(),
            top_height,
            top_hash,
            poisoned: false,
            committed: false,
            writer_slot,
        })
    }

    pub fn top_height(&self) -> u64 {
        self.top_height
    }

    pub fn top_hash(&self) -> &str {
        &self.top_hash
    }

    pub fn staged(&self) -> &[Block] {
        &self.staged
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Peer set as seen by this branch, including staged membership changes.
    pub fn peers(&self) -> ChainResult<Vec<Peer>> {
        load_peers(&self.conn)
    }

    /// Verifies linkage against the staged tip, applies every transaction,
    /// and stages the block for commit.
    pub fn apply_block(&mut self, block: Block) -> ChainResult<()> {
        if self.poisoned {
            return Err(ChainError::CommitFailed("mutable view poisoned".into()));
        }
        block.verify_integrity()?;
        if block.height != self.top_height + 1 {
            return Err(ChainError::Consistency(format!(
                "block {} does not extend height {}",
                block.height, self.top_height
            )));
        }
        if block.previous_hash != self.top_hash {
            return Err(ChainError::Consistency(format!(
                "block {} previous hash does not match tip",
                block.height
            )));
        }
        apply_block_commands(&self.conn, &block)?;
        self.top_height = block.height;
        self.top_hash = block.hash.clone();
        self.staged.push(block);
        Ok(())
    }

    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub(crate) fn take_staged(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.staged)
    }

    pub(crate) fn commit_transaction(&mut self) -> ChainResult<()> {
        self.conn
            .execute_batch("COMMIT;")
            .map_err(|err| ChainError::CommitFailed(format!("wsv commit failed: {err}")))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for MutableWsv {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK;");
        }
        self.writer_slot.store(false, Ordering::SeqCst);
    }
}
