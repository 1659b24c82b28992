//! Error types for the Kestrel chain state.
use thiserror::Error;

/// Failures raised by the transactional bucket store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("bucket not found: {0}")] BucketNotFound(String),
    #[error("bucket already exists: {0}")] BucketExists(String),
    #[error("invalid bucket name: {0}")] InvalidBucketName(String),
    #[error("write attempted in a read-only transaction")] TxNotWritable,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("database corruption: {0}")] Corruption(String),
    #[error("backend: {0}")] Backend(String),
}

/// Failures raised by the chain state persistence layer.
///
/// [`ChainError::Deserialize`] is only ever produced by the record codecs.
/// Every fetch path wraps it into [`ChainError::Corruption`] with the key
/// that failed, see [`ChainError::into_corruption`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("{0} is not in the main chain")] NotInMainChain(String),
    #[error("deserialize: {0}")] Deserialize(String),
    #[error("corrupt {what}: {detail}")] Corruption { what: String, detail: String },
    #[error("assertion failed: {0}")] Assert(String),
    #[error("missing utxo: {0}")] MissingUtxo(String),
    #[error("duplicate block: {0}")] DuplicateBlock(String),
    #[error("block {block} does not extend tip {tip}")] OrphanBlock { block: String, tip: String },
    #[error("cannot disconnect the genesis block")] DisconnectGenesis,
    #[error(transparent)] Database(#[from] DatabaseError),
}

impl ChainError {
    /// Upgrade a deserialize failure into a corruption error tagged with
    /// `what` (usually the key, hash or height of the record). Any other
    /// error passes through unchanged.
    pub fn into_corruption(self, what: impl Into<String>) -> Self {
        match self {
            ChainError::Deserialize(detail) => ChainError::Corruption {
                what: what.into(),
                detail,
            },
            other => other,
        }
    }

    /// Whether this is a codec failure that has not yet been attributed.
    pub fn is_deserialize(&self) -> bool {
        matches!(self, ChainError::Deserialize(_))
    }

    /// Whether this error signals a structural inconsistency that must stop
    /// the node (corrupt records or violated internal invariants).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::Corruption { .. }
                | ChainError::Assert(_)
                | ChainError::Database(DatabaseError::Corruption(_))
        )
    }
}
