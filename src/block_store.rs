//! Durable block log: one file per block named by zero-padded height, plus
//! a RocksDB secondary index mapping heights to file names and hashes and
//! holding the chain tip metadata.

use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options,
};
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, BlockMetadata};

pub(crate) const CF_INDEX: &str = "index";
pub(crate) const CF_METADATA: &str = "metadata";
const TIP_HEIGHT_KEY: &[u8] = b"tip_height";
const TIP_HASH_KEY: &[u8] = b"tip_hash";
const TIP_TIMESTAMP_KEY: &[u8] = b"tip_timestamp";

/// Append-only directory of canonical block files.
#[derive(Clone)]
pub struct BlockStore {
    dir: PathBuf,
}

impl BlockStore {
    pub fn open(dir: &Path) -> ChainResult<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            ChainError::StorageUnavailable(format!("cannot create block store: {err}"))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn file_name(height: u64) -> String {
        format!("{height:016}")
    }

    fn path_for(&self, height: u64) -> PathBuf {
        self.dir.join(Self::file_name(height))
    }

    /// Writes the canonical form of the block, fsyncing file and directory.
    /// Idempotent on height: an existing identical file is a no-op, an
    /// existing different file is a failed commit.
    pub fn append(&self, block: &Block) -> ChainResult<()> {
        let path = self.path_for(block.height);
        let bytes = block.canonical_bytes();
        if path.exists() {
            let existing = fs::read(&path)?;
            if existing == bytes {
                return Ok(());
            }
            return Err(ChainError::CommitFailed(format!(
                "conflicting block file at height {}",
                block.height
            )));
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    pub fn read(&self, height: u64) -> ChainResult<Option<Block>> {
        let path = self.path_for(height);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let block: Block = serde_json::from_slice(&bytes)?;
        Ok(Some(block))
    }

    /// All heights present, ascending. Non-numeric entries in the directory
    /// are a consistency violation, not something to skip over.
    pub fn heights(&self) -> ChainResult<Vec<u64>> {
        let mut heights = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let height: u64 = name.parse().map_err(|_| {
                ChainError::Consistency(format!("foreign file in block store: {name}"))
            })?;
            heights.push(height);
        }
        heights.sort_unstable();
        Ok(heights)
    }

    pub fn max_height(&self) -> ChainResult<u64> {
        Ok(self.heights()?.last().copied().unwrap_or(0))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file_name: String,
    pub hash: String,
}

/// Secondary index over the flat block log.
pub struct BlockIndex {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for BlockIndex {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl BlockIndex {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|err| ChainError::StorageUnavailable(format!("cannot open index: {err}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn index_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_INDEX)
            .ok_or_else(|| ChainError::Config("missing index column family".into()))
    }

    fn metadata_cf(&self) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| ChainError::Config("missing metadata column family".into()))
    }

    pub fn put_entry(&self, height: u64, entry: &IndexEntry) -> ChainResult<()> {
        let cf = self.index_cf()?;
        let data = bincode::serialize(entry)
            .map_err(|err| ChainError::CommitFailed(format!("index encoding failed: {err}")))?;
        self.db.put_cf(&cf, height.to_be_bytes(), data)?;
        Ok(())
    }

    pub fn entry(&self, height: u64) -> ChainResult<Option<IndexEntry>> {
        let cf = self.index_cf()?;
        match self.db.get_cf(&cf, height.to_be_bytes())? {
            Some(value) => {
                let entry: IndexEntry = bincode::deserialize(&value).map_err(|err| {
                    ChainError::Consistency(format!("corrupt index entry: {err}"))
                })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn set_tip(&self, metadata: &BlockMetadata) -> ChainResult<()> {
        let cf = self.metadata_cf()?;
        self.db
            .put_cf(&cf, TIP_HEIGHT_KEY, metadata.height.to_be_bytes())?;
        self.db.put_cf(&cf, TIP_HASH_KEY, metadata.hash.as_bytes())?;
        self.db
            .put_cf(&cf, TIP_TIMESTAMP_KEY, metadata.created_ms.to_be_bytes())?;
        Ok(())
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let cf = self.metadata_cf()?;
        let height_bytes = match self.db.get_cf(&cf, TIP_HEIGHT_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let hash_bytes = self
            .db
            .get_cf(&cf, TIP_HASH_KEY)?
            .ok_or_else(|| ChainError::Consistency("missing tip hash".into()))?;
        let timestamp_bytes = self
            .db
            .get_cf(&cf, TIP_TIMESTAMP_KEY)?
            .ok_or_else(|| ChainError::Consistency("missing tip timestamp".into()))?;
        let height = u64::from_be_bytes(
            height_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Consistency("invalid tip height encoding".into()))?,
        );
        let hash = String::from_utf8(hash_bytes.to_vec())
            .map_err(|err| ChainError::Consistency(format!("invalid tip hash encoding: {err}")))?;
        let created_ms = u64::from_be_bytes(
            timestamp_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Consistency("invalid tip timestamp encoding".into()))?,
        );
        Ok(Some(BlockMetadata {
            height,
            hash,
            created_ms,
        }))
    }

    /// Drops every index row. Used when the index diverges from the block
    /// files and has to be rebuilt from them.
    pub fn clear(&self) -> ChainResult<()> {
        let keys: Vec<Vec<u8>> = {
            let cf = self.index_cf()?;
            self.db
                .iterator_cf(&cf, IteratorMode::Start)
                .map(|entry| entry.map(|(key, _)| key.to_vec()))
                .collect::<Result<_, _>>()?
        };
        let cf = self.index_cf()?;
        for key in keys {
            self.db.delete_cf(&cf, key)?;
        }
        let metadata_cf = self.metadata_cf()?;
        for key in [TIP_HEIGHT_KEY, TIP_HASH_KEY, TIP_TIMESTAMP_KEY] {
            self.db.delete_cf(&metadata_cf, key)?;
        }
        Ok(())
    }
}
