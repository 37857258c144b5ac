//! Transport seam
//!
//! The verification core works with any transport that delivers the
//! required message shapes. [`LedgerRpc`] is that contract: a production
//! implementation adapts generated gRPC stubs to it, the integration
//! tests run an in-process server behind it. Session tokens and
//! deadlines travel in a [`CallContext`] the way gRPC carries them in
//! call headers.
//!
//! Server errors are mapped to crate errors in exactly one place,
//! [`map_rpc_error`]: status codes first, message substrings only as a
//! fallback for legacy servers.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::proof::{VerifiableEntry, VerifiableTx};
use crate::schema::{
    DatabaseState, DeleteRequest, Entry, HistoryRequest, KeyRequest, ReferenceRequest,
    ScanRequest, SetRequest, Tx, TxHeader, TxRequest, TxScanRequest, VerifiableGetRequest,
    VerifiableReferenceRequest, VerifiableSetRequest, VerifiableTxRequest, VerifiableZAddRequest,
    ZAddRequest, ZEntry, ZScanRequest,
};

/// gRPC-style status codes surfaced by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    /// Requested object does not exist
    NotFound,
    /// Request is malformed
    InvalidArgument,
    /// Caller is not authenticated
    Unauthenticated,
    /// Caller lacks permission
    PermissionDenied,
    /// Server unreachable or refusing work
    Unavailable,
    /// Call deadline elapsed
    DeadlineExceeded,
    /// Server-side failure
    Internal,
    /// Anything else
    Unknown,
}

/// An error reported by the transport layer.
#[derive(Debug, Clone)]
pub struct RpcError {
    /// Status code
    pub code: RpcCode,
    /// Server-provided message
    pub message: String,
}

impl RpcError {
    /// Convenience constructor.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Result type for transport operations.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Map a transport error to a crate error.
///
/// `KeyNotFound` and `TxNotFound` are identified by status code plus
/// message; the substring match keeps legacy servers working and is
/// centralized here so it can be audited.
pub fn map_rpc_error(err: RpcError) -> Error {
    let msg = err.message.to_ascii_lowercase();
    match err.code {
        RpcCode::NotFound if msg.contains("tx not found") => Error::TxNotFound,
        RpcCode::NotFound => Error::KeyNotFound,
        _ if msg.contains("key not found") => Error::KeyNotFound,
        _ if msg.contains("tx not found") => Error::TxNotFound,
        code => Error::Transport {
            code,
            message: err.message,
        },
    }
}

/// Per-call headers: session token and deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Session token sent as the `authorization` header, if any
    pub token: Option<String>,
    /// Absolute deadline for the call, if any
    pub deadline: Option<Instant>,
}

impl CallContext {
    /// Context authorized by a session token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            deadline: None,
        }
    }

    /// Attach a deadline `timeout` from now.
    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Result of a successful login RPC.
#[derive(Debug, Clone)]
pub struct OpenSessionResponse {
    /// Server-assigned session id
    pub session_id: String,
    /// Opaque auth token to send on every call
    pub token: String,
    /// UUID identifying the server deployment
    pub server_uuid: String,
}

/// The RPC surface the verification core requires from a server.
///
/// One method per wire call; implementations must be cheap to clone
/// behind an `Arc` and safe for concurrent calls (gRPC channels
/// multiplex streams the same way).
#[async_trait]
pub trait LedgerRpc: Send + Sync + 'static {
    /// Authenticate and open a session against a database.
    async fn open_session(
        &self,
        ctx: &CallContext,
        user: &[u8],
        password: &[u8],
        db: &str,
    ) -> RpcResult<OpenSessionResponse>;

    /// Invalidate the session token server-side.
    async fn close_session(&self, ctx: &CallContext) -> RpcResult<()>;

    /// Session heartbeat.
    async fn keep_alive(&self, ctx: &CallContext) -> RpcResult<()>;

    /// Liveness probe.
    async fn health_check(&self, ctx: &CallContext) -> RpcResult<bool>;

    /// Latest database state as reported by the server.
    async fn current_state(&self, ctx: &CallContext) -> RpcResult<DatabaseState>;

    /// Plain single-key read.
    async fn get(&self, ctx: &CallContext, req: &KeyRequest) -> RpcResult<Entry>;

    /// Plain multi-key read.
    async fn get_all(&self, ctx: &CallContext, keys: &[Vec<u8>]) -> RpcResult<Vec<Entry>>;

    /// Single-key read with proofs.
    async fn verifiable_get(
        &self,
        ctx: &CallContext,
        req: &VerifiableGetRequest,
    ) -> RpcResult<VerifiableEntry>;

    /// Plain write.
    async fn set(&self, ctx: &CallContext, req: &SetRequest) -> RpcResult<TxHeader>;

    /// Write with proofs over the committed transaction.
    async fn verifiable_set(
        &self,
        ctx: &CallContext,
        req: &VerifiableSetRequest,
    ) -> RpcResult<VerifiableTx>;

    /// Logical deletion (tombstone write).
    async fn delete(&self, ctx: &CallContext, req: &DeleteRequest) -> RpcResult<TxHeader>;

    /// Plain reference (alias) creation.
    async fn set_reference(
        &self,
        ctx: &CallContext,
        req: &ReferenceRequest,
    ) -> RpcResult<TxHeader>;

    /// Reference creation with proofs.
    async fn verifiable_set_reference(
        &self,
        ctx: &CallContext,
        req: &VerifiableReferenceRequest,
    ) -> RpcResult<VerifiableTx>;

    /// Plain sorted-set insertion.
    async fn zadd(&self, ctx: &CallContext, req: &ZAddRequest) -> RpcResult<TxHeader>;

    /// Sorted-set insertion with proofs.
    async fn verifiable_zadd(
        &self,
        ctx: &CallContext,
        req: &VerifiableZAddRequest,
    ) -> RpcResult<VerifiableTx>;

    /// Key-range scan.
    async fn scan(&self, ctx: &CallContext, req: &ScanRequest) -> RpcResult<Vec<Entry>>;

    /// Sorted-set scan.
    async fn zscan(&self, ctx: &CallContext, req: &ZScanRequest) -> RpcResult<Vec<ZEntry>>;

    /// Per-key revision history.
    async fn history(&self, ctx: &CallContext, req: &HistoryRequest) -> RpcResult<Vec<Entry>>;

    /// Fetch one transaction.
    async fn tx_by_id(&self, ctx: &CallContext, req: &TxRequest) -> RpcResult<Tx>;

    /// Fetch one transaction with proofs.
    async fn verifiable_tx_by_id(
        &self,
        ctx: &CallContext,
        req: &VerifiableTxRequest,
    ) -> RpcResult<VerifiableTx>;

    /// Scan a transaction range.
    async fn tx_scan(&self, ctx: &CallContext, req: &TxScanRequest) -> RpcResult<Vec<Tx>>;
}

/// Creates transports for the pool.
///
/// Production factories dial a gRPC channel; tests hand out an
/// in-process server.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Open a transport to the given server address.
    async fn connect(&self, address: &str) -> RpcResult<Arc<dyn LedgerRpc>>;
}

/// A pooled transport, or the released sentinel.
///
/// The released variant removes nullable-connection branches from the
/// facade: any RPC against it fails with [`Error::ConnectionReleased`].
pub enum Connection {
    /// Transport held from the pool
    Active(ActiveConnection),
    /// No transport held
    Released,
}

/// A live transport checked out of the pool.
pub struct ActiveConnection {
    pub(crate) address: String,
    pub(crate) rpc: Arc<dyn LedgerRpc>,
    pub(crate) permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl Connection {
    /// The transport behind this connection, or `ConnectionReleased`.
    pub fn rpc(&self) -> Result<&Arc<dyn LedgerRpc>> {
        match self {
            Connection::Active(conn) => Ok(&conn.rpc),
            Connection::Released => Err(Error::ConnectionReleased),
        }
    }

    /// Server address this connection points at, if active.
    pub fn address(&self) -> Option<&str> {
        match self {
            Connection::Active(conn) => Some(&conn.address),
            Connection::Released => None,
        }
    }

    /// Whether this is the released sentinel.
    pub fn is_released(&self) -> bool {
        matches!(self, Connection::Released)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Active(conn) => f
                .debug_struct("Connection::Active")
                .field("address", &conn.address)
                .finish_non_exhaustive(),
            Connection::Released => f.write_str("Connection::Released"),
        }
    }
}
