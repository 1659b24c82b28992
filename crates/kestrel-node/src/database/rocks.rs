//! RocksDB backend.
//!
//! Everything lives in the default column family; bucket prefixes keep the
//! keyspaces apart. Commits go through a single `WriteBatch`.

use std::path::Path;

use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};
use tracing::info;

use kestrel_core::error::DatabaseError;

use super::{Backend, Snapshot, WriteOp};

fn backend_err(e: rocksdb::Error) -> DatabaseError {
    DatabaseError::Backend(e.to_string())
}

pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(backend_err)?;
        info!(path = %path.as_ref().display(), "opened rocksdb chain database");
        Ok(Self { db })
    }
}

impl Backend for RocksBackend {
    fn snapshot(&self) -> Box<dyn Snapshot + '_> {
        Box::new(RocksSnapshot {
            inner: self.db.snapshot(),
        })
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), DatabaseError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.put(key, value),
                WriteOp::Delete { key } => batch.delete(key),
            }
        }
        self.db.write(batch).map_err(backend_err)
    }

    fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush().map_err(backend_err)
    }
}

struct RocksSnapshot<'a> {
    inner: rocksdb::Snapshot<'a>,
}

impl Snapshot for RocksSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.inner.get(key).map_err(backend_err)
    }

    fn next_entry(
        &self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let iter = self
            .inner
            .iterator(IteratorMode::From(from, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(backend_err)?;
            if !inclusive && &*key == from {
                continue;
            }
            return Ok(Some((key.into_vec(), value.into_vec())));
        }
        Ok(None)
    }
}
