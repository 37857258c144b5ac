//! Client facade
//!
//! Sequences RPCs, invokes the proof verifiers, and advances the trusted
//! state atomically. Every verified operation follows the same pattern:
//!
//! 1. Require an active session
//! 2. Snapshot the current trusted state
//! 3. Issue the verifiable RPC with `prove_since_tx` set to the snapshot
//! 4. Parse the response into typed proof objects
//! 5. Validate the entry binding (key, tx, deleted marker)
//! 6. Pick source/target sides from the direction of the read
//! 7. Verify inclusion of the entry digest in its transaction
//! 8. Verify the dual proof when prior trust exists
//! 9. Verify the server state signature when a key is configured
//! 10. Publish the new trusted state only if everything accepted
//!
//! A per-client mutex serializes steps 2–10, so trusted-state updates
//! are monotone and never torn. Non-verified operations bypass all of
//! this and never touch trusted state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::digest::{alh, encode_reference_value, kv_digest, z_entry_digest, ServerSigningKey};
use crate::error::{Error, Result, VerificationError};
use crate::pool::{ConnectionPool, PoolConfig, TransportPool};
use crate::proof::{DualProof, InclusionProof, VerifiableTx};
use crate::schema::{
    DatabaseState, DeleteRequest, Digest32, Entry, HistoryRequest, KeyRequest, KeyValue,
    ReferenceRequest, ScanRequest, SetRequest, Tx, TxHeader, TxRequest, TxScanRequest,
    VerifiableGetRequest, VerifiableReferenceRequest, VerifiableSetRequest, VerifiableTxRequest,
    VerifiableZAddRequest, ZAddRequest, ZEntry, ZScanRequest,
};
use crate::session::SessionManager;
use crate::state::{deployment_key, MemoryStateStore, StateStore, TrustedState};
use crate::transport::{
    map_rpc_error, CallContext, Connection, LedgerRpc, RpcCode, RpcResult, TransportFactory,
};
use crate::verification::{verify_dual_proof, verify_inclusion};

/// Builder collecting client configuration.
///
/// A transport factory (or a pre-built pool) must be supplied; every
/// other knob has a default.
pub struct ClientBuilder {
    address: String,
    factory: Option<Arc<dyn TransportFactory>>,
    pool: Option<Arc<dyn TransportPool>>,
    pool_config: PoolConfig,
    state_store: Option<Arc<dyn StateStore>>,
    server_signing_key: Option<Vec<u8>>,
    deployment_info_check: bool,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
}

impl ClientBuilder {
    /// Start building a client for `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            factory: None,
            pool: None,
            pool_config: PoolConfig::default(),
            state_store: None,
            server_signing_key: None,
            deployment_info_check: true,
            heartbeat_interval: Duration::from_secs(60),
            rpc_timeout: Duration::from_secs(30),
        }
    }

    /// Transport factory used by the connection pool.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Inject an existing connection pool instead of building one.
    pub fn pool(mut self, pool: Arc<dyn TransportPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Tuning for the pool the builder creates.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Trusted-state persistence; defaults to in-memory.
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// SEC1-encoded server public signing key; when set, every published
    /// state must carry a valid signature.
    pub fn server_signing_key(mut self, key: Vec<u8>) -> Self {
        self.server_signing_key = Some(key);
        self
    }

    /// Toggle the server-UUID pinning check (default on).
    pub fn deployment_info_check(mut self, enabled: bool) -> Self {
        self.deployment_info_check = enabled;
        self
    }

    /// Keepalive interval for open sessions.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Client-side deadline applied to every RPC.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<VerikvClient> {
        if self.address.is_empty() {
            return Err(Error::InvalidConfig("server address is empty".to_string()));
        }
        let (pool, owns_pool): (Arc<dyn TransportPool>, bool) = match (self.pool, self.factory) {
            (Some(pool), _) => (pool, false),
            (None, Some(factory)) => (
                Arc::new(ConnectionPool::new(factory, self.pool_config)),
                true,
            ),
            (None, None) => {
                return Err(Error::InvalidConfig(
                    "a transport factory or connection pool is required".to_string(),
                ))
            }
        };
        let signing_key = match self.server_signing_key {
            Some(bytes) => Some(ServerSigningKey::from_sec1_bytes(&bytes)?),
            None => None,
        };

        Ok(VerikvClient {
            deployment: deployment_key(&self.address),
            address: self.address,
            pool,
            owns_pool,
            state_store: self
                .state_store
                .unwrap_or_else(|| Arc::new(MemoryStateStore::new())),
            signing_key,
            deployment_info_check: self.deployment_info_check,
            rpc_timeout: self.rpc_timeout,
            sessions: SessionManager::new(self.heartbeat_interval, self.rpc_timeout),
            conn: RwLock::new(Connection::Released),
            active_db: std::sync::Mutex::new(String::new()),
            verify_lock: Mutex::new(()),
        })
    }
}

/// Verifying client for a VeriKV server.
///
/// Cheap to share behind an `Arc`; reentrant across tasks. Verified
/// operations serialize on an internal mutex so the trusted state only
/// ever moves forward.
pub struct VerikvClient {
    address: String,
    deployment: String,
    pool: Arc<dyn TransportPool>,
    owns_pool: bool,
    state_store: Arc<dyn StateStore>,
    signing_key: Option<ServerSigningKey>,
    deployment_info_check: bool,
    rpc_timeout: Duration,
    sessions: SessionManager,
    conn: RwLock<Connection>,
    active_db: std::sync::Mutex<String>,
    verify_lock: Mutex<()>,
}

impl std::fmt::Debug for VerikvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerikvClient")
            .field("address", &self.address)
            .field("deployment", &self.deployment)
            .field("owns_pool", &self.owns_pool)
            .field("deployment_info_check", &self.deployment_info_check)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}

impl VerikvClient {
    /// Start building a client for `address`.
    pub fn builder(address: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    /// Open an authenticated session against `db`.
    pub async fn open(&self, user: &[u8], password: &[u8], db: &str) -> Result<()> {
        let conn = self.pool.acquire(&self.address).await?;
        let rpc = match conn.rpc() {
            Ok(rpc) => Arc::clone(rpc),
            Err(e) => {
                self.pool.release(conn).await;
                return Err(e);
            }
        };

        let session = match self.sessions.open(&rpc, user, password, db).await {
            Ok(session) => session,
            Err(e) => {
                self.pool.release(conn).await;
                return Err(e);
            }
        };

        if self.deployment_info_check {
            if let Err(e) = self.check_deployment(&session.server_uuid) {
                let _ = self.sessions.close(&rpc).await;
                self.pool.release(conn).await;
                return Err(e);
            }
        }

        *self.conn.write().await = conn;
        *self.active_db.lock().expect("db lock poisoned") = db.to_string();
        Ok(())
    }

    /// Close the session and return the connection to the pool.
    pub async fn close(&self) -> Result<()> {
        let conn = {
            let mut held = self.conn.write().await;
            std::mem::replace(&mut *held, Connection::Released)
        };
        let rpc = match conn.rpc() {
            Ok(rpc) => Arc::clone(rpc),
            Err(_) => return Err(Error::NotOpen),
        };

        let result = self.sessions.close(&rpc).await;
        self.pool.release(conn).await;
        result
    }

    /// Close the session if open and shut down an owned pool.
    pub async fn shutdown(&self) {
        let _ = self.close().await;
        if self.owns_pool {
            self.pool.shutdown().await;
        }
    }

    /// Whether a session is currently open.
    pub async fn is_open(&self) -> bool {
        self.sessions.is_open().await
    }

    // -- plumbing ----------------------------------------------------------

    fn check_deployment(&self, server_uuid: &str) -> Result<()> {
        match self.state_store.deployment_uuid(&self.deployment)? {
            Some(stored) if stored != server_uuid => Err(Error::DeploymentMismatch {
                expected: stored,
                actual: server_uuid.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.state_store
                    .record_deployment_uuid(&self.deployment, server_uuid)
            }
        }
    }

    async fn rpc_handle(&self) -> Result<(Arc<dyn LedgerRpc>, CallContext)> {
        let session = self.sessions.current().await?;
        let conn = self.conn.read().await;
        let rpc = Arc::clone(conn.rpc()?);
        let ctx = CallContext::with_token(session.token).deadline_in(self.rpc_timeout);
        Ok((rpc, ctx))
    }

    fn db(&self) -> String {
        self.active_db.lock().expect("db lock poisoned").clone()
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = RpcResult<T>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(result) => result.map_err(map_rpc_error),
            Err(_) => Err(Error::Transport {
                code: RpcCode::DeadlineExceeded,
                message: "rpc deadline exceeded".to_string(),
            }),
        }
    }

    fn trusted_state(&self, db: &str) -> Result<TrustedState> {
        Ok(self
            .state_store
            .get(&self.deployment, db)?
            .unwrap_or_else(|| TrustedState::genesis(db)))
    }

    fn verify_signature(&self, state: &TrustedState) -> Result<()> {
        if let Some(key) = &self.signing_key {
            if state.signature.is_empty() {
                return Err(VerificationError::InvalidSignature.into());
            }
            key.verify_state(&state.db, state.tx_id, &state.tx_hash, &state.signature)?;
        }
        Ok(())
    }

    /// Dual-proof check plus state publication shared by every verified
    /// operation. The new state adopts the target side of `sides`.
    fn adopt_verified_state(
        &self,
        state: &TrustedState,
        sides: &ProofSides,
        dual_proof: &DualProof,
        signature: &[u8],
    ) -> Result<()> {
        if state.tx_id > 0 {
            if sides.source_id == sides.target_id {
                if sides.source_alh != sides.target_alh {
                    return Err(VerificationError::AlhMismatch.into());
                }
            } else {
                verify_dual_proof(
                    dual_proof,
                    sides.source_id,
                    sides.target_id,
                    &sides.source_alh,
                    &sides.target_alh,
                )?;
            }
        }

        let new_state = TrustedState {
            db: state.db.clone(),
            tx_id: sides.target_id,
            tx_hash: sides.target_alh,
            signature: signature.to_vec(),
        };
        self.verify_signature(&new_state)?;

        if new_state.tx_id >= state.tx_id {
            self.state_store.set(&self.deployment, &new_state)?;
            debug!(db = %new_state.db, tx_id = new_state.tx_id, "trusted state advanced");
        }
        Ok(())
    }

    // -- verified operations -----------------------------------------------

    /// Verified read of the latest entry for `key`.
    pub async fn verified_get(&self, key: &[u8]) -> Result<Entry> {
        self.verified_get_with(KeyRequest {
            key: key.to_vec(),
            ..Default::default()
        })
        .await
    }

    /// Verified read pinned to the entry committed by `at_tx`.
    pub async fn verified_get_at(&self, key: &[u8], at_tx: u64) -> Result<Entry> {
        self.verified_get_with(KeyRequest {
            key: key.to_vec(),
            at_tx,
            ..Default::default()
        })
        .await
    }

    /// Verified read with full request control.
    pub async fn verified_get_with(&self, key_request: KeyRequest) -> Result<Entry> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let db = self.db();
        let _guard = self.verify_lock.lock().await;
        let state = self.trusted_state(&db)?;

        let req = VerifiableGetRequest {
            key_request: key_request.clone(),
            prove_since_tx: state.tx_id,
        };
        let ventry = self.call(rpc.verifiable_get(&ctx, &req)).await?;
        let entry = &ventry.entry;

        // binding checks before any hashing
        if entry.is_deleted() {
            return Err(VerificationError::DeletedEntry.into());
        }
        let bound_key = match &entry.referenced_by {
            Some(reference) => &reference.key,
            None => &entry.key,
        };
        if bound_key != &key_request.key {
            return Err(VerificationError::KeyMismatch.into());
        }
        let entry_tx = entry
            .referenced_by
            .as_ref()
            .map(|r| r.tx)
            .unwrap_or(entry.tx);
        if key_request.at_tx != 0 && entry_tx != key_request.at_tx {
            return Err(VerificationError::TxMismatch.into());
        }
        if entry_tx == 0 {
            return Err(Error::CorruptedData("entry without a tx id".to_string()));
        }

        let dual = &ventry.verifiable_tx.dual_proof;
        let sides = ProofSides::for_entry(&state, entry_tx, dual)?;

        let digest = crate::digest::entry_digest(entry, sides.entry_header.version)?;
        if !verify_inclusion(&ventry.inclusion_proof, &digest, &sides.entry_header.eh) {
            return Err(VerificationError::InclusionFailed.into());
        }

        self.adopt_verified_state(&state, &sides, dual, &ventry.verifiable_tx.signature)?;
        Ok(ventry.entry)
    }

    /// Verified write of one key/value pair.
    pub async fn verified_set(&self, key: &[u8], value: &[u8]) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let db = self.db();
        let _guard = self.verify_lock.lock().await;
        let state = self.trusted_state(&db)?;

        let req = VerifiableSetRequest {
            set_request: SetRequest {
                kvs: vec![KeyValue {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    metadata: None,
                }],
            },
            prove_since_tx: state.tx_id,
        };
        let vtx = self.call(rpc.verifiable_set(&ctx, &req)).await?;

        let version = vtx.tx.header.version;
        let digest = kv_digest(key, value, None, version)?;
        self.verify_committed_tx(&state, &vtx, digest)
    }

    /// Verified creation of a reference from `key` to `referenced_key`.
    pub async fn verified_set_reference(
        &self,
        key: &[u8],
        referenced_key: &[u8],
    ) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let db = self.db();
        let _guard = self.verify_lock.lock().await;
        let state = self.trusted_state(&db)?;

        let req = VerifiableReferenceRequest {
            reference_request: ReferenceRequest {
                key: key.to_vec(),
                referenced_key: referenced_key.to_vec(),
                at_tx: 0,
                bound_ref: false,
            },
            prove_since_tx: state.tx_id,
        };
        let vtx = self.call(rpc.verifiable_set_reference(&ctx, &req)).await?;

        let version = vtx.tx.header.version;
        let value = encode_reference_value(referenced_key, 0);
        let digest = kv_digest(key, &value, None, version)?;
        self.verify_committed_tx(&state, &vtx, digest)
    }

    /// Verified insertion of `key` into the sorted set `set`.
    pub async fn verified_zadd(&self, set: &[u8], key: &[u8], score: f64) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let db = self.db();
        let _guard = self.verify_lock.lock().await;
        let state = self.trusted_state(&db)?;

        let req = VerifiableZAddRequest {
            zadd_request: ZAddRequest {
                set: set.to_vec(),
                key: key.to_vec(),
                at_tx: 0,
                score,
                bound_ref: false,
            },
            prove_since_tx: state.tx_id,
        };
        let vtx = self.call(rpc.verifiable_zadd(&ctx, &req)).await?;

        let version = vtx.tx.header.version;
        let digest = z_entry_digest(set, key, score, 0, version)?;
        self.verify_committed_tx(&state, &vtx, digest)
    }

    /// Verified fetch of a transaction; dual proof and signature only.
    pub async fn verified_tx_by_id(&self, tx: u64) -> Result<Tx> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let db = self.db();
        let _guard = self.verify_lock.lock().await;
        let state = self.trusted_state(&db)?;

        let req = VerifiableTxRequest {
            tx,
            prove_since_tx: state.tx_id,
        };
        let vtx = self.call(rpc.verifiable_tx_by_id(&ctx, &req)).await?;
        if vtx.tx.header.id != tx {
            return Err(Error::CorruptedData(format!(
                "server returned tx {} instead of {}",
                vtx.tx.header.id, tx
            )));
        }

        let sides = ProofSides::for_entry(&state, tx, &vtx.dual_proof)?;
        self.adopt_verified_state(&state, &sides, &vtx.dual_proof, &vtx.signature)?;
        Ok(vtx.tx)
    }

    /// Inclusion + dual-proof + signature checks for a transaction the
    /// client itself just committed.
    fn verify_committed_tx(
        &self,
        state: &TrustedState,
        vtx: &VerifiableTx,
        expected_digest: Digest32,
    ) -> Result<TxHeader> {
        let header = &vtx.tx.header;
        if header.n_entries != 1 {
            return Err(VerificationError::EntryCountMismatch {
                expected: 1,
                actual: header.n_entries,
            }
            .into());
        }
        if vtx.tx.entries.len() != 1 {
            return Err(Error::CorruptedData(format!(
                "tx declares 1 entry but carries {}",
                vtx.tx.entries.len()
            )));
        }
        if state.tx_id > header.id {
            return Err(Error::CorruptedData(
                "committed tx precedes the trusted state".to_string(),
            ));
        }

        // single-entry tree: the root is the submitted entry's digest
        let inclusion = InclusionProof {
            leaf: 0,
            width: 1,
            terms: vec![],
        };
        if !verify_inclusion(&inclusion, &expected_digest, &header.eh) {
            return Err(VerificationError::InclusionFailed.into());
        }

        let target_alh = alh(header)?;
        let sides = ProofSides {
            source_id: state.tx_id,
            target_id: header.id,
            source_alh: state.tx_hash,
            target_alh,
            entry_header: header.clone(),
        };
        self.adopt_verified_state(state, &sides, &vtx.dual_proof, &vtx.signature)?;
        Ok(vtx.tx.header.clone())
    }

    // -- non-verified operations -------------------------------------------

    /// Plain read of the latest entry for `key`.
    pub async fn get(&self, key: &[u8]) -> Result<Entry> {
        self.get_with(KeyRequest {
            key: key.to_vec(),
            ..Default::default()
        })
        .await
    }

    /// Plain read with full request control.
    pub async fn get_with(&self, req: KeyRequest) -> Result<Entry> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.get(&ctx, &req)).await
    }

    /// Plain multi-key read.
    pub async fn get_all(&self, keys: &[Vec<u8>]) -> Result<Vec<Entry>> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.get_all(&ctx, keys)).await
    }

    /// Plain write of one key/value pair.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<TxHeader> {
        self.set_all(vec![KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            metadata: None,
        }])
        .await
    }

    /// Plain write of several pairs in one transaction.
    pub async fn set_all(&self, kvs: Vec<KeyValue>) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.set(&ctx, &SetRequest { kvs })).await
    }

    /// Tombstone `key`.
    pub async fn delete(&self, key: &[u8]) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let req = DeleteRequest {
            keys: vec![key.to_vec()],
        };
        self.call(rpc.delete(&ctx, &req)).await
    }

    /// Plain reference creation.
    pub async fn set_reference(&self, key: &[u8], referenced_key: &[u8]) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let req = ReferenceRequest {
            key: key.to_vec(),
            referenced_key: referenced_key.to_vec(),
            at_tx: 0,
            bound_ref: false,
        };
        self.call(rpc.set_reference(&ctx, &req)).await
    }

    /// Plain sorted-set insertion.
    pub async fn zadd(&self, set: &[u8], key: &[u8], score: f64) -> Result<TxHeader> {
        let (rpc, ctx) = self.rpc_handle().await?;
        let req = ZAddRequest {
            set: set.to_vec(),
            key: key.to_vec(),
            at_tx: 0,
            score,
            bound_ref: false,
        };
        self.call(rpc.zadd(&ctx, &req)).await
    }

    /// Key-range scan.
    pub async fn scan(&self, req: ScanRequest) -> Result<Vec<Entry>> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.scan(&ctx, &req)).await
    }

    /// Sorted-set scan.
    pub async fn zscan(&self, req: ZScanRequest) -> Result<Vec<ZEntry>> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.zscan(&ctx, &req)).await
    }

    /// Per-key revision history.
    pub async fn history(&self, req: HistoryRequest) -> Result<Vec<Entry>> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.history(&ctx, &req)).await
    }

    /// Plain fetch of one transaction.
    pub async fn tx_by_id(&self, tx: u64) -> Result<Tx> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.tx_by_id(&ctx, &TxRequest { tx })).await
    }

    /// Scan a transaction range.
    pub async fn tx_scan(&self, req: TxScanRequest) -> Result<Vec<Tx>> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.tx_scan(&ctx, &req)).await
    }

    /// Liveness probe.
    pub async fn health_check(&self) -> Result<bool> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.health_check(&ctx)).await
    }

    /// Latest database state as reported by the server, without
    /// touching trusted state.
    pub async fn current_state(&self) -> Result<DatabaseState> {
        let (rpc, ctx) = self.rpc_handle().await?;
        self.call(rpc.current_state(&ctx)).await
    }
}

/// Source/target assignment for one verified operation.
struct ProofSides {
    source_id: u64,
    target_id: u64,
    source_alh: Digest32,
    target_alh: Digest32,
    /// Header of the transaction holding the entry under verification
    entry_header: TxHeader,
}

impl ProofSides {
    /// Pick sides from the direction of the read.
    ///
    /// Reading at or past the trusted state advances trust forward;
    /// reading history keeps the trust anchor as target.
    fn for_entry(state: &TrustedState, entry_tx: u64, dual: &DualProof) -> Result<Self> {
        let sides = if state.tx_id <= entry_tx {
            Self {
                source_id: state.tx_id,
                source_alh: state.tx_hash,
                target_id: entry_tx,
                target_alh: alh(&dual.target_tx_header)?,
                entry_header: dual.target_tx_header.clone(),
            }
        } else {
            Self {
                source_id: entry_tx,
                source_alh: alh(&dual.source_tx_header)?,
                target_id: state.tx_id,
                target_alh: state.tx_hash,
                entry_header: dual.source_tx_header.clone(),
            }
        };
        if sides.entry_header.id != entry_tx {
            return Err(Error::CorruptedData(format!(
                "proof header covers tx {} instead of {}",
                sides.entry_header.id, entry_tx
            )));
        }
        Ok(sides)
    }
}
