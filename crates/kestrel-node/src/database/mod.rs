//! Transactional bucket store.
//!
//! A [`Database`] wraps an ordered key-value [`Backend`] and exposes
//! read-only ([`Database::view`]) and read-write ([`Database::update`])
//! transactions. A write transaction buffers its mutations and commits them
//! as one atomic batch when its closure returns `Ok`; an `Err` discards
//! them. Writers are serialised; readers work on a snapshot and never block.
//!
//! Rows are grouped into named buckets. On disk a row lives under
//! `len(bucket) || bucket || key`, so every bucket is a contiguous, ordered
//! key range, and a registry row `0x00 || bucket` marks that the bucket
//! exists. Full block bodies are kept in a reserved bucket and reached
//! through the block-store methods on [`Tx`].

pub mod memory;
pub mod rocks;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_core::constants::BLOCK_HEADER_SIZE;
use kestrel_core::error::DatabaseError;
use kestrel_core::types::{Block, BlockHeader, Hash256, Transaction};

pub use memory::MemoryBackend;
pub use rocks::RocksBackend;

/// Bucket holding singleton chain records (best state, markers, versions).
pub const METADATA_BUCKET: &[u8] = b"metadata";

/// Reserved bucket holding full block bodies keyed by block hash.
const BLOCKS_BUCKET: &[u8] = b"blocks";

/// Leading byte of bucket registry rows. Real rows start with the bucket
/// name length, which is never zero.
const REGISTRY_PREFIX: u8 = 0x00;

/// A single mutation, applied atomically with the rest of its batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered key-value storage that the transaction layer runs on.
pub trait Backend: Send + Sync {
    /// A consistent point-in-time view of the whole keyspace.
    fn snapshot(&self) -> Box<dyn Snapshot + '_>;

    /// Apply every operation in `ops` atomically.
    fn write(&self, ops: Vec<WriteOp>) -> Result<(), DatabaseError>;

    /// Persist buffered writes to durable storage.
    fn flush(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Read access to a backend snapshot.
pub trait Snapshot {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// First entry whose key is `>= from` (`> from` when `inclusive` is false).
    fn next_entry(
        &self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError>;
}

struct DatabaseInner {
    backend: Box<dyn Backend>,
    write_lock: Mutex<()>,
}

/// Handle to a transactional bucket store. Cloning shares the same store.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Wrap `backend`, creating the reserved metadata and block buckets if
    /// they do not exist yet.
    pub fn new(backend: impl Backend + 'static) -> Result<Self, DatabaseError> {
        let db = Self {
            inner: Arc::new(DatabaseInner {
                backend: Box::new(backend),
                write_lock: Mutex::new(()),
            }),
        };
        db.update(|tx| {
            tx.create_bucket_if_not_exists(METADATA_BUCKET)?;
            tx.create_bucket_if_not_exists(BLOCKS_BUCKET)
        })?;
        Ok(db)
    }

    /// A fresh, empty in-memory store.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::new(MemoryBackend::new())
    }

    /// Open or create a RocksDB-backed store at `path`.
    pub fn open_rocks(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::new(RocksBackend::open(path)?)
    }

    /// Run `f` inside a read-only transaction.
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> Result<T, E>,
    {
        let tx = Tx::new(self.inner.backend.snapshot(), false);
        f(&tx)
    }

    /// Run `f` inside a read-write transaction. Its writes are committed
    /// atomically if `f` returns `Ok` and discarded otherwise.
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let _guard = self.inner.write_lock.lock();
        let mut tx = Tx::new(self.inner.backend.snapshot(), true);
        let out = f(&mut tx)?;
        let ops = tx.into_write_ops();
        if !ops.is_empty() {
            self.inner.backend.write(ops)?;
        }
        Ok(out)
    }

    /// Flush all in-memory buffers of the backend to disk.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.inner.backend.flush()
    }
}

/// Pending writes of one bucket: `None` marks a deletion.
type BucketWrites = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// A database transaction.
///
/// Reads see the transaction's own pending writes on top of the snapshot it
/// started from.
pub struct Tx<'a> {
    snapshot: Box<dyn Snapshot + 'a>,
    writable: bool,
    created: BTreeSet<Vec<u8>>,
    pending: BTreeMap<Vec<u8>, BucketWrites>,
}

impl<'a> Tx<'a> {
    fn new(snapshot: Box<dyn Snapshot + 'a>, writable: bool) -> Self {
        Self {
            snapshot,
            writable,
            created: BTreeSet::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_writable(&self) -> Result<(), DatabaseError> {
        if self.writable {
            Ok(())
        } else {
            Err(DatabaseError::TxNotWritable)
        }
    }

    pub fn bucket_exists(&self, bucket: &[u8]) -> Result<bool, DatabaseError> {
        if self.created.contains(bucket) {
            return Ok(true);
        }
        Ok(self.snapshot.get(&registry_key(bucket))?.is_some())
    }

    fn require_bucket(&self, bucket: &[u8]) -> Result<(), DatabaseError> {
        if self.bucket_exists(bucket)? {
            Ok(())
        } else {
            Err(DatabaseError::BucketNotFound(bucket_label(bucket)))
        }
    }

    /// Create `bucket`, failing if it already exists.
    pub fn create_bucket(&mut self, bucket: &[u8]) -> Result<(), DatabaseError> {
        self.check_writable()?;
        if bucket.is_empty() || bucket.len() > usize::from(u8::MAX) {
            return Err(DatabaseError::InvalidBucketName(bucket_label(bucket)));
        }
        if self.bucket_exists(bucket)? {
            return Err(DatabaseError::BucketExists(bucket_label(bucket)));
        }
        self.created.insert(bucket.to_vec());
        Ok(())
    }

    pub fn create_bucket_if_not_exists(&mut self, bucket: &[u8]) -> Result<(), DatabaseError> {
        if self.bucket_exists(bucket)? {
            return Ok(());
        }
        self.create_bucket(bucket)
    }

    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.require_bucket(bucket)?;
        if let Some(pending) = self.pending.get(bucket).and_then(|writes| writes.get(key)) {
            return Ok(pending.clone());
        }
        self.snapshot.get(&row_key(bucket, key))
    }

    /// Store `value` under `key`. The transaction keeps `key` itself until
    /// commit, so a caller must not reuse the buffer.
    pub fn put(&mut self, bucket: &[u8], key: Vec<u8>, value: Vec<u8>) -> Result<(), DatabaseError> {
        self.check_writable()?;
        self.require_bucket(bucket)?;
        self.pending
            .entry(bucket.to_vec())
            .or_default()
            .insert(key, Some(value));
        Ok(())
    }

    /// Remove `key`. Deleting an absent key is not an error.
    pub fn delete(&mut self, bucket: &[u8], key: Vec<u8>) -> Result<(), DatabaseError> {
        self.check_writable()?;
        self.require_bucket(bucket)?;
        self.pending.entry(bucket.to_vec()).or_default().insert(key, None);
        Ok(())
    }

    /// Forward cursor over the rows of `bucket`.
    pub fn cursor(&self, bucket: &[u8]) -> Result<Cursor<'_, 'a>, DatabaseError> {
        self.require_bucket(bucket)?;
        Ok(Cursor {
            tx: self,
            bucket: bucket.to_vec(),
            current: None,
        })
    }

    /// First row of `bucket` with key `>= from` (`> from` when not
    /// `inclusive`), merging pending writes over the snapshot.
    fn next_in_bucket(
        &self,
        bucket: &[u8],
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let prefix = row_key(bucket, &[]);
        let pending = self.pending.get(bucket);
        let mut from = from.to_vec();
        let mut inclusive = inclusive;

        loop {
            let stored = self
                .snapshot
                .next_entry(&row_key(bucket, &from), inclusive)?
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, value)| (key[prefix.len()..].to_vec(), value));

            let lower = if inclusive {
                Bound::Included(from.as_slice())
            } else {
                Bound::Excluded(from.as_slice())
            };
            let overlay = pending.and_then(|writes| {
                writes
                    .range::<[u8], _>((lower, Bound::Unbounded))
                    .next()
                    .map(|(key, value)| (key.clone(), value.clone()))
            });

            match (stored, overlay) {
                (stored, None) => return Ok(stored),
                (Some(stored), Some((key, _))) if stored.0 < key => return Ok(Some(stored)),
                (_, Some((key, Some(value)))) => return Ok(Some((key, value))),
                (_, Some((key, None))) => {
                    // Deleted in this transaction: skip past it.
                    from = key;
                    inclusive = false;
                }
            }
        }
    }

    fn into_write_ops(self) -> Vec<WriteOp> {
        let mut ops = Vec::new();
        for bucket in self.created {
            ops.push(WriteOp::Put {
                key: registry_key(&bucket),
                value: Vec::new(),
            });
        }
        for (bucket, writes) in self.pending {
            for (key, value) in writes {
                let key = row_key(&bucket, &key);
                ops.push(match value {
                    Some(value) => WriteOp::Put { key, value },
                    None => WriteOp::Delete { key },
                });
            }
        }
        ops
    }

    // --- Block store ---

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, DatabaseError> {
        Ok(self.get(BLOCKS_BUCKET, hash.as_bytes())?.is_some())
    }

    /// Store a full block body keyed by its hash. A no-op if the block is
    /// already present.
    ///
    /// Layout: `header(80) || bincode(transactions)`, so headers can be read
    /// without decoding the body.
    pub fn store_block(&mut self, block: &Block) -> Result<(), DatabaseError> {
        let hash = block.hash();
        if self.has_block(&hash)? {
            return Ok(());
        }
        let mut value = block.header.serialize().to_vec();
        let body = bincode::encode_to_vec(&block.transactions, bincode::config::standard())
            .map_err(|e| DatabaseError::Backend(e.to_string()))?;
        value.extend_from_slice(&body);
        self.put(BLOCKS_BUCKET, hash.as_bytes().to_vec(), value)
    }

    pub fn fetch_block(&self, hash: &Hash256) -> Result<Block, DatabaseError> {
        let bytes = self.fetch_block_bytes(hash)?;
        let header = BlockHeader::deserialize(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("block {hash}: {e}")))?;
        let (transactions, _): (Vec<Transaction>, _) = bincode::decode_from_slice(
            &bytes[BLOCK_HEADER_SIZE..],
            bincode::config::standard(),
        )
        .map_err(|e| DatabaseError::Corruption(format!("block {hash}: {e}")))?;
        Ok(Block {
            header,
            transactions,
        })
    }

    pub fn fetch_block_header(&self, hash: &Hash256) -> Result<BlockHeader, DatabaseError> {
        let bytes = self.fetch_block_bytes(hash)?;
        BlockHeader::deserialize(&bytes)
            .map_err(|e| DatabaseError::Corruption(format!("block {hash}: {e}")))
    }

    fn fetch_block_bytes(&self, hash: &Hash256) -> Result<Vec<u8>, DatabaseError> {
        self.get(BLOCKS_BUCKET, hash.as_bytes())?
            .ok_or_else(|| DatabaseError::BlockNotFound(hash.to_string()))
    }
}

/// Forward cursor over one bucket, yielding rows in key order.
///
/// Positioning calls return the row the cursor lands on, or `None` once the
/// bucket is exhausted.
pub struct Cursor<'t, 'a> {
    tx: &'t Tx<'a>,
    bucket: Vec<u8>,
    current: Option<Vec<u8>>,
}

impl Cursor<'_, '_> {
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        self.position(&[], true)
    }

    /// Move to the first row whose key is `>= key`. The row found may have
    /// a different key, callers must compare.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        self.position(key, true)
    }

    /// Move to the row after the current one.
    pub fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        match self.current.take() {
            Some(current) => self.position(&current, false),
            None => Ok(None),
        }
    }

    fn position(
        &mut self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let found = self.tx.next_in_bucket(&self.bucket, from, inclusive)?;
        self.current = found.as_ref().map(|(key, _)| key.clone());
        Ok(found)
    }
}

fn row_key(bucket: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bucket.len() + key.len());
    out.push(bucket.len() as u8);
    out.extend_from_slice(bucket);
    out.extend_from_slice(key);
    out
}

fn registry_key(bucket: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bucket.len());
    out.push(REGISTRY_PREFIX);
    out.extend_from_slice(bucket);
    out
}

fn bucket_label(bucket: &[u8]) -> String {
    String::from_utf8_lossy(bucket).into_owned()
}
