//! # VeriKV Client
//!
//! Client-side verification core for VeriKV, a cryptographically
//! verifiable append-only key/value database. The server maintains a
//! Merkle-like accumulator over all transactions; for verified
//! operations it returns proofs this crate checks locally before
//! trusting any result.
//!
//! ## Features
//!
//! - Inclusion, consistency, and dual-proof verification against the
//!   server's transaction log
//! - A persistent trusted state per `(deployment, database)` that only
//!   advances when every proof accepts
//! - Session lifecycle with supervised keepalive
//! - Bounded connection pooling with idle sweeping
//!
//! ## Architecture
//!
//! The client operates by:
//! 1. Opening an authenticated session through the connection pool
//! 2. Issuing verifiable RPCs anchored at the last trusted transaction
//! 3. Verifying the returned proofs against the trusted state
//! 4. Atomically publishing the advanced state on success
//!
//! Transport is pluggable: anything implementing
//! [`transport::LedgerRpc`] (typically an adapter over generated gRPC
//! stubs) can back a client.

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod client;
pub mod digest;
pub mod error;
pub mod pool;
pub mod proof;
pub mod schema;
pub mod session;
pub mod state;
pub mod transport;
pub mod verification;


pub use client::{ClientBuilder, VerikvClient};
pub use error::{Error, Result, VerificationError};
pub use pool::{ConnectionPool, PoolConfig, TransportPool};
pub use proof::{DualProof, InclusionProof, LinearProof, VerifiableEntry, VerifiableTx};
pub use schema::{
    DatabaseState, Entry, EntryMetadata, KeyRequest, KeyValue, Reference, Tx, TxHeader,
    ZEntry,
};
pub use session::{Session, SessionManager};
pub use state::{
    deployment_key, FileStateStore, MemoryStateStore, StateStore, TrustedState,
};
pub use transport::{
    CallContext, Connection, LedgerRpc, OpenSessionResponse, RpcCode, RpcError, RpcResult,
    TransportFactory,
};
pub use verification::{
    verify_bl_inclusion, verify_consistency, verify_dual_proof, verify_inclusion,
    verify_last_inclusion, verify_linear,
};
