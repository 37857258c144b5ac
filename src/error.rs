//! Error types for client operations

use thiserror::Error;

use crate::transport::RpcCode;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Client error types
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted without an active session
    #[error("no session is open")]
    NotOpen,

    /// `open` called while a session is already active
    #[error("a session is already open")]
    AlreadyOpen,

    /// Server reported the requested key as missing
    #[error("key not found")]
    KeyNotFound,

    /// Server reported the requested transaction as missing
    #[error("tx not found")]
    TxNotFound,

    /// Server returned a structurally impossible response
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Proof, signature, or binding check failed
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// Server UUID disagrees with the one recorded for this deployment
    #[error("deployment mismatch: expected server uuid {expected}, got {actual}")]
    DeploymentMismatch {
        /// UUID recorded when the deployment was first seen
        expected: String,
        /// UUID reported by the server now
        actual: String,
    },

    /// RPC issued against a released connection
    #[error("connection has been released")]
    ConnectionReleased,

    /// Connection pool has been shut down
    #[error("connection pool is shut down")]
    PoolClosed,

    /// Underlying RPC error with the original code and message preserved
    #[error("transport error ({code:?}): {message}")]
    Transport {
        /// gRPC-style status code reported by the transport
        code: RpcCode,
        /// Original server message
        message: String,
    },

    /// Invalid client configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// State persistence error
    #[error("state storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Specific sub-reason carried by [`Error::Verification`].
///
/// Every rejection names the first check that failed; no trusted state is
/// published once any of these is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Header version outside the supported set {0, 1}
    #[error("unsupported tx header version {0}")]
    UnsupportedVersion(u16),

    /// Proof arrays disagree with declared sizes
    #[error("malformed proof: {0}")]
    MalformedProof(&'static str),

    /// Dual proof's source header does not match the expected id or alh
    #[error("source tx header mismatch")]
    SourceHeaderMismatch,

    /// Dual proof's target header does not match the expected id or alh
    #[error("target tx header mismatch")]
    TargetHeaderMismatch,

    /// Entry inclusion proof did not reconstruct the expected root
    #[error("inclusion proof rejected")]
    InclusionFailed,

    /// Consistency proof between tree snapshots rejected
    #[error("consistency proof rejected")]
    ConsistencyFailed,

    /// Last-inclusion proof of the newest tree leaf rejected
    #[error("last-inclusion proof rejected")]
    LastInclusionFailed,

    /// Linear chain walk did not reach the target alh
    #[error("linear proof rejected")]
    LinearFailed,

    /// Source and target share a tx id but their alh values differ
    #[error("alh mismatch for identical tx ids")]
    AlhMismatch,

    /// Returned entry is not bound to the requested key
    #[error("returned entry key does not match the requested key")]
    KeyMismatch,

    /// Returned entry does not belong to the requested transaction
    #[error("returned entry tx does not match the requested tx")]
    TxMismatch,

    /// Entry is marked deleted
    #[error("entry is marked deleted")]
    DeletedEntry,

    /// Committed transaction carries an unexpected entry count
    #[error("expected {expected} entries in tx, got {actual}")]
    EntryCountMismatch {
        /// Entries the client expected the tx to carry
        expected: u32,
        /// Entries the returned header declares
        actual: u32,
    },

    /// Server state signature missing or not valid under the configured key
    #[error("invalid state signature")]
    InvalidSignature,
}
