//! Storage facade over the three backends: flat block log, RocksDB index,
//! and the SQLite world state. Owns the commit lock and the single writer
//! slot; every durable mutation in the system funnels through
//! [`Storage::commit`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::block_store::{BlockIndex, BlockStore, IndexEntry};
use crate::errors::{ChainError, ChainResult};
use crate::types::{zero_digest_hex, Block, BlockMetadata};
use crate::wsv::{self, MutableWsv, TemporaryWsv, WsvQuery};

pub struct Storage {
    store: BlockStore,
    index: BlockIndex,
    wsv_path: PathBuf,
    read_lock: Arc<RwLock<()>>,
    writer_slot: Arc<AtomicBool>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            index: self.index.clone(),
            wsv_path: self.wsv_path.clone(),
            read_lock: self.read_lock.clone(),
            writer_slot: self.writer_slot.clone(),
        }
    }
}

impl Storage {
    /// Opens the backends in order block store → index → WSV, then runs the
    /// startup consistency check, repairing whatever the block files (the
    /// source of truth) say can be repaired.
    pub fn open(data_dir: &Path) -> ChainResult<Self> {
        let store = BlockStore::open(&data_dir.join("blocks"))?;
        let index = BlockIndex::open(&data_dir.join("index"))?;
        let wsv_path = data_dir.join("wsv.db");
        {
            let conn = wsv::open_connection(&wsv_path)?;
            wsv::init_schema(&conn)?;
        }
        let storage = Self {
            store,
            index,
            wsv_path,
            read_lock: Arc::new(RwLock::new(())),
            writer_slot: Arc::new(AtomicBool::new(false)),
        };
        storage.check_consistency()?;
        Ok(storage)
    }

    /// Verifies the global ledger invariants and repairs the derived
    /// backends. Gaps in the block files and a WSV ahead of the files are
    /// fatal; a stale index is rebuilt and orphaned block files are
    /// replayed into the WSV.
    fn check_consistency(&self) -> ChainResult<()> {
        let heights = self.store.heights()?;
        for (position, height) in heights.iter().enumerate() {
            if *height != position as u64 + 1 {
                return Err(ChainError::Consistency(format!(
                    "gap in block store: expected height {}, found {height}",
                    position + 1
                )));
            }
        }
        let tip_height = heights.last().copied().unwrap_or(0);

        let mut previous_hash = zero_digest_hex();
        let mut index_stale = false;
        let mut blocks = Vec::with_capacity(heights.len());
        for height in &heights {
            let block = self.store.read(*height)?.ok_or_else(|| {
                ChainError::Consistency(format!("block file {height} vanished during startup"))
            })?;
            block.verify_integrity()?;
            if block.previous_hash != previous_hash {
                return Err(ChainError::Consistency(format!(
                    "block {height} does not link to its predecessor"
                )));
            }
            previous_hash = block.hash.clone();
            match self.index.entry(*height)? {
                Some(entry) if entry.hash == block.hash => {}
                _ => index_stale = true,
            }
            blocks.push(block);
        }
        match self.index.tip()? {
            Some(tip) if tip.height == tip_height => {}
            None if tip_height == 0 => {}
            _ => index_stale = true,
        }
        if index_stale {
            warn!(tip_height, "block index diverged from block files, rebuilding");
            self.index.clear()?;
            for block in &blocks {
                self.index.put_entry(
                    block.height,
                    &IndexEntry {
                        file_name: BlockStore::file_name(block.height),
                        hash: block.hash.clone(),
                    },
                )?;
            }
            if let Some(last) = blocks.last() {
                self.index.set_tip(&BlockMetadata::from(last))?;
            }
        }

        let conn = wsv::open_connection(&self.wsv_path)?;
        let applied = wsv::applied_height(&conn)?;
        if applied > tip_height {
            return Err(ChainError::Consistency(format!(
                "wsv applied height {applied} exceeds block store tip {tip_height}"
            )));
        }
        if applied < tip_height {
            info!(
                from = applied + 1,
                to = tip_height,
                "replaying orphaned block files into wsv"
            );
            conn.execute_batch("BEGIN IMMEDIATE;")?;
            let result: ChainResult<()> = blocks[applied as usize..]
                .iter()
                .try_for_each(|block| wsv::apply_block_commands(&conn, block));
            match result {
                Ok(()) => conn.execute_batch("COMMIT;")?,
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK;");
                    return Err(ChainError::Consistency(format!(
                        "orphan replay failed: {err}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fresh scratch branch of the committed state, discarded on drop.
    pub fn create_temporary_wsv(&self) -> ChainResult<TemporaryWsv> {
        TemporaryWsv::new(&self.wsv_path)
    }

    /// The exclusive writer view, pre-initialized with the current tip so
    /// consumers can chain against it. Fails fast when one is already
    /// outstanding rather than waiting.
    pub fn create_mutable_wsv(&self) -> ChainResult<MutableWsv> {
        if self
            .writer_slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChainError::StorageUnavailable(
                "a mutable view is already outstanding".into(),
            ));
        }
        let (top_height, top_hash) = match self.index.tip()? {
            Some(tip) => (tip.height, tip.hash),
            None => (0, zero_digest_hex()),
        };
        MutableWsv::new(&self.wsv_path, top_height, top_hash, self.writer_slot.clone())
    }

    /// Atomically persists the staged blocks and WSV changes. Readers see
    /// either the pre-commit or the post-commit state, never a partial one.
    pub fn commit(&self, mut view: MutableWsv) -> ChainResult<Vec<Block>> {
        if view.is_poisoned() {
            return Err(ChainError::CommitFailed("mutable view poisoned".into()));
        }
        if view.staged().is_empty() {
            return Ok(Vec::new());
        }
        let _exclusive = self.read_lock.write();
        let mut append_failure = None;
        for block in view.staged() {
            if let Err(err) = self.store.append(block) {
                append_failure = Some((block.height, err));
                break;
            }
        }
        if let Some((height, err)) = append_failure {
            view.poison();
            return Err(ChainError::CommitFailed(format!(
                "block store append failed at height {height}: {err}"
            )));
        }
        if let Err(err) = view.commit_transaction() {
            view.poison();
            return Err(err);
        }
        // Block files and WSV are durable beyond this point; an index
        // failure is repaired by the startup rebuild, not rolled back.
        for block in view.staged() {
            self.index.put_entry(
                block.height,
                &IndexEntry {
                    file_name: BlockStore::file_name(block.height),
                    hash: block.hash.clone(),
                },
            )?;
        }
        let committed = view.take_staged();
        if let Some(last) = committed.last() {
            self.index.set_tip(&BlockMetadata::from(last))?;
            info!(height = last.height, hash = %last.hash, "committed");
        }
        Ok(committed)
    }

    pub fn wsv_query(&self) -> ChainResult<WsvQuery> {
        WsvQuery::new(&self.wsv_path, self.read_lock.clone())
    }

    pub fn block_query(&self) -> BlockQuery {
        BlockQuery {
            store: self.store.clone(),
            index: self.index.clone(),
            read_lock: self.read_lock.clone(),
        }
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let _shared = self.read_lock.read();
        self.index.tip()
    }
}

/// Cheap handle for read-only access to committed blocks.
#[derive(Clone)]
pub struct BlockQuery {
    store: BlockStore,
    index: BlockIndex,
    read_lock: Arc<RwLock<()>>,
}

impl BlockQuery {
    pub fn block(&self, height: u64) -> ChainResult<Option<Block>> {
        let _shared = self.read_lock.read();
        self.store.read(height)
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let _shared = self.read_lock.read();
        self.index.tip()
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        let tip = {
            let _shared = self.read_lock.read();
            self.index.tip()?
        };
        match tip {
            Some(metadata) => self.block(metadata.height),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::types::{Command, SignedTransaction, Transaction};
    use tempfile::tempdir;

    fn genesis_block() -> Block {
        let keypair = generate_keypair();
        let tx = SignedTransaction::unsigned(Transaction::new(
            "genesis".into(),
            vec![
                Command::CreateAsset {
                    asset_id: "coin".into(),
                    precision: 0,
                },
                Command::CreateAccount {
                    account_id: "alice".into(),
                    public_key: hex::encode(keypair.public.to_bytes()),
                },
                Command::AddAssetQuantity {
                    account_id: "alice".into(),
                    asset_id: "coin".into(),
                    amount: 100,
                },
            ],
        ));
        Block::build(1, zero_digest_hex(), vec![tx], 1_000).unwrap()
    }

    #[test]
    fn commit_persists_blocks_and_state() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let mut view = storage.create_mutable_wsv().unwrap();
        view.apply_block(genesis_block()).unwrap();
        let committed = storage.commit(view).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(storage.tip().unwrap().unwrap().height, 1);
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 100);
        assert_eq!(wsv.applied_height().unwrap(), 1);
    }

    #[test]
    fn only_one_mutable_view_at_a_time() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let first = storage.create_mutable_wsv().unwrap();
        assert!(matches!(
            storage.create_mutable_wsv(),
            Err(ChainError::StorageUnavailable(_))
        ));
        drop(first);
        storage.create_mutable_wsv().unwrap();
    }

    #[test]
    fn dropped_view_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        {
            let mut view = storage.create_mutable_wsv().unwrap();
            view.apply_block(genesis_block()).unwrap();
        }
        assert!(storage.tip().unwrap().is_none());
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.applied_height().unwrap(), 0);
    }

    #[test]
    fn reopen_passes_consistency_check() {
        let dir = tempdir().unwrap();
        let genesis = genesis_block();
        {
            let storage = Storage::open(dir.path()).unwrap();
            let mut view = storage.create_mutable_wsv().unwrap();
            view.apply_block(genesis.clone()).unwrap();
            storage.commit(view).unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.tip().unwrap().unwrap().hash, genesis.hash);
    }

    #[test]
    fn orphaned_block_files_are_replayed_into_wsv() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            let mut view = storage.create_mutable_wsv().unwrap();
            view.apply_block(genesis_block()).unwrap();
            storage.commit(view).unwrap();
        }
        // Losing the WSV leaves the block files as the source of truth.
        for suffix in ["wsv.db", "wsv.db-wal", "wsv.db-shm"] {
            let _ = std::fs::remove_file(dir.path().join(suffix));
        }
        let storage = Storage::open(dir.path()).unwrap();
        let wsv = storage.wsv_query().unwrap();
        assert_eq!(wsv.balance("alice", "coin").unwrap(), 100);
        assert_eq!(wsv.applied_height().unwrap(), 1);
    }

    #[test]
    fn stale_index_is_rebuilt_from_files() {
        let dir = tempdir().unwrap();
        let genesis = genesis_block();
        {
            let storage = Storage::open(dir.path()).unwrap();
            let mut view = storage.create_mutable_wsv().unwrap();
            view.apply_block(genesis.clone()).unwrap();
            storage.commit(view).unwrap();
            storage.index.clear().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.tip().unwrap().unwrap().hash, genesis.hash);
        assert_eq!(storage.index.entry(1).unwrap().unwrap().hash, genesis.hash);
    }
}
