//! In-process mock ledger server for integration tests.
//!
//! Commits real transactions over an append-only accumulator (per-tx
//! entry tree, alh chain, binary-linked tree) and generates the same
//! proofs an honest server would, so the client's verifiers run against
//! genuine material. A corruption switch flips proof bytes to exercise
//! the rejection paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::SigningKey;

use verikv_client::digest::{
    alh, bl_leaf_digest, encode_reference_value, encode_z_key, inner_hash, kv_digest,
    node_digest, sha256,
};
use verikv_client::proof::{DualProof, InclusionProof, LinearProof, VerifiableEntry, VerifiableTx};
use verikv_client::schema::{
    DatabaseState, DeleteRequest, Digest32, Entry, EntryMetadata, HistoryRequest, KeyRequest,
    Reference, ReferenceRequest, ScanRequest, SetRequest, Tx, TxEntry, TxHeader, TxRequest,
    TxScanRequest, VerifiableGetRequest, VerifiableReferenceRequest, VerifiableSetRequest,
    VerifiableTxRequest, VerifiableZAddRequest, ZAddRequest, ZEntry, ZScanRequest,
};
use verikv_client::transport::{
    CallContext, LedgerRpc, OpenSessionResponse, RpcCode, RpcError, RpcResult, TransportFactory,
};

const TX_VERSION: u16 = 1;

fn not_found(msg: &str) -> RpcError {
    RpcError::new(RpcCode::NotFound, msg)
}

// ---------------------------------------------------------------------------
// Merkle helpers (server side)
// ---------------------------------------------------------------------------

/// Entry tree levels, duplicating the last node of odd levels.
fn build_entry_tree(leaves: &[Digest32]) -> Vec<Vec<Digest32>> {
    let mut levels = vec![leaves.to_vec()];
    while levels.last().unwrap().len() > 1 {
        let prev = levels.last().unwrap();
        let mut next = Vec::with_capacity(prev.len().div_ceil(2));
        for chunk in prev.chunks(2) {
            let node = if chunk.len() == 2 {
                node_digest(&chunk[0], &chunk[1])
            } else {
                node_digest(&chunk[0], &chunk[0])
            };
            next.push(node);
        }
        levels.push(next);
    }
    levels
}

fn entry_tree_path(levels: &[Vec<Digest32>], mut i: usize) -> Vec<Digest32> {
    let mut terms = Vec::new();
    for level in &levels[..levels.len() - 1] {
        let sibling = if i % 2 == 0 {
            if i + 1 < level.len() {
                i + 1
            } else {
                i
            }
        } else {
            i - 1
        };
        terms.push(level[sibling]);
        i /= 2;
    }
    terms
}

/// Binary-linked tree levels, promoting the last node of odd levels
/// (left-balanced, RFC 6962 structure).
fn build_bl_tree(leaves: &[Digest32]) -> Vec<Vec<Digest32>> {
    let mut levels = vec![leaves.to_vec()];
    while levels.last().unwrap().len() > 1 {
        let prev = levels.last().unwrap();
        let mut next = Vec::new();
        let mut i = 0;
        while i + 1 < prev.len() {
            next.push(node_digest(&prev[i], &prev[i + 1]));
            i += 2;
        }
        if i < prev.len() {
            next.push(prev[i]);
        }
        levels.push(next);
    }
    levels
}

fn bl_tree_path(levels: &[Vec<Digest32>], mut i: usize) -> Vec<Digest32> {
    let mut terms = Vec::new();
    let mut r = levels[0].len() - 1;
    let mut level = 0;
    while r > 0 {
        if !(i == r && i % 2 == 0) {
            let sibling = if i % 2 == 0 { i + 1 } else { i - 1 };
            terms.push(levels[level][sibling]);
        }
        i /= 2;
        r /= 2;
        level += 1;
    }
    terms
}

fn largest_pow2_below(n: usize) -> usize {
    debug_assert!(n > 1);
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn mth(leaves: &[Digest32]) -> Digest32 {
    match leaves.len() {
        0 => [0u8; 32],
        1 => leaves[0],
        n => {
            let k = largest_pow2_below(n);
            node_digest(&mth(&leaves[..k]), &mth(&leaves[k..]))
        }
    }
}

fn subproof(m: usize, leaves: &[Digest32], b: bool, out: &mut Vec<Digest32>) {
    let n = leaves.len();
    if m == n {
        if !b {
            out.push(mth(leaves));
        }
        return;
    }
    let k = largest_pow2_below(n);
    if m <= k {
        subproof(m, &leaves[..k], b, out);
        out.push(mth(&leaves[k..]));
    } else {
        subproof(m - k, &leaves[k..], false, out);
        out.push(mth(&leaves[..k]));
    }
}

/// Consistency path between the `m`-leaf prefix and the full tree. The
/// walk seed is always included as the first term.
fn consistency_path(leaves: &[Digest32], m: usize) -> Vec<Digest32> {
    let mut out = Vec::new();
    subproof(m, leaves, true, &mut out);
    if m.is_power_of_two() {
        let mut seeded = vec![mth(&leaves[..m])];
        seeded.extend(out);
        seeded
    } else {
        out
    }
}

// ---------------------------------------------------------------------------
// Ledger state
// ---------------------------------------------------------------------------

struct EntrySpec {
    key: Vec<u8>,
    value: Vec<u8>,
    metadata: Option<EntryMetadata>,
}

struct CommittedTx {
    header: TxHeader,
    entries: Vec<TxEntry>,
    leaf_digests: Vec<Digest32>,
}

#[derive(Clone)]
struct KvVersion {
    tx: u64,
    entry_index: usize,
    value: Vec<u8>,
    metadata: Option<EntryMetadata>,
    /// `(target_key, at_tx)` when this version is a reference
    reference: Option<(Vec<u8>, u64)>,
}

#[derive(Clone)]
struct ZMember {
    key: Vec<u8>,
    score: f64,
    at_tx: u64,
}

#[derive(Default)]
struct LedgerInner {
    txs: Vec<CommittedTx>,
    alhs: Vec<Digest32>,
    inner_hashes: Vec<Digest32>,
    bl_leaves: Vec<Digest32>,
    kv: HashMap<Vec<u8>, Vec<KvVersion>>,
    zsets: HashMap<Vec<u8>, Vec<ZMember>>,
}

impl LedgerInner {
    fn commit(&mut self, specs: Vec<EntrySpec>) -> u64 {
        let id = self.txs.len() as u64 + 1;
        let leaf_digests: Vec<Digest32> = specs
            .iter()
            .map(|s| kv_digest(&s.key, &s.value, s.metadata.as_ref(), TX_VERSION).unwrap())
            .collect();
        let eh = build_entry_tree(&leaf_digests).last().unwrap()[0];

        let bl_size = id - 1;
        let bl_root = if bl_size > 0 {
            build_bl_tree(&self.bl_leaves[..bl_size as usize]).last().unwrap()[0]
        } else {
            [0u8; 32]
        };
        let prev_alh = if id > 1 {
            self.alhs[(id - 2) as usize]
        } else {
            [0u8; 32]
        };

        let header = TxHeader {
            id,
            prev_alh,
            timestamp: 1_700_000_000 + id as i64,
            version: TX_VERSION,
            metadata: None,
            n_entries: specs.len() as u32,
            eh,
            bl_tx_id: bl_size,
            bl_root,
        };
        let tx_alh = alh(&header).unwrap();
        self.alhs.push(tx_alh);
        self.inner_hashes.push(inner_hash(&header).unwrap());
        self.bl_leaves.push(bl_leaf_digest(&tx_alh));

        let entries = specs
            .iter()
            .map(|s| TxEntry {
                key: s.key.clone(),
                metadata: s.metadata,
                h_value: sha256(&s.value),
                v_len: s.value.len() as u32,
            })
            .collect();
        self.txs.push(CommittedTx {
            header,
            entries,
            leaf_digests,
        });
        id
    }

    /// Commit several key/value writes as one transaction.
    fn commit_kvs(&mut self, kvs: &[(Vec<u8>, Vec<u8>, Option<EntryMetadata>)]) -> u64 {
        let specs = kvs
            .iter()
            .map(|(key, value, metadata)| EntrySpec {
                key: key.clone(),
                value: value.clone(),
                metadata: *metadata,
            })
            .collect();
        let id = self.commit(specs);
        for (i, (key, value, metadata)) in kvs.iter().enumerate() {
            self.kv.entry(key.clone()).or_default().push(KvVersion {
                tx: id,
                entry_index: i,
                value: value.clone(),
                metadata: *metadata,
                reference: None,
            });
        }
        id
    }

    fn commit_kv(&mut self, key: &[u8], value: &[u8], metadata: Option<EntryMetadata>) -> u64 {
        self.commit_kvs(&[(key.to_vec(), value.to_vec(), metadata)])
    }

    fn commit_reference(&mut self, key: &[u8], target: &[u8], at_tx: u64) -> u64 {
        let stored = encode_reference_value(target, at_tx);
        let id = self.commit(vec![EntrySpec {
            key: key.to_vec(),
            value: stored.clone(),
            metadata: None,
        }]);
        self.kv.entry(key.to_vec()).or_default().push(KvVersion {
            tx: id,
            entry_index: 0,
            value: stored,
            metadata: None,
            reference: Some((target.to_vec(), at_tx)),
        });
        id
    }

    fn commit_zadd(&mut self, set: &[u8], key: &[u8], score: f64, at_tx: u64) -> u64 {
        let encoded = encode_z_key(set, key, score, at_tx);
        let id = self.commit(vec![EntrySpec {
            key: encoded,
            value: Vec::new(),
            metadata: None,
        }]);
        self.zsets.entry(set.to_vec()).or_default().push(ZMember {
            key: key.to_vec(),
            score,
            at_tx,
        });
        id
    }

    fn version_for(&self, key: &[u8], at_tx: u64) -> Option<&KvVersion> {
        let versions = self.kv.get(key)?;
        if at_tx == 0 {
            versions.last()
        } else {
            versions.iter().rev().find(|v| v.tx == at_tx)
        }
    }

    fn revision_of(&self, key: &[u8], version: &KvVersion) -> i64 {
        self.kv
            .get(key)
            .map(|vs| vs.iter().position(|v| v.tx == version.tx).unwrap_or(0) as i64 + 1)
            .unwrap_or(0)
    }

    /// Resolve a key request to `(proved_tx, leaf_index, entry)`.
    fn resolve(&self, req: &KeyRequest) -> RpcResult<(u64, usize, Entry)> {
        let version = self
            .version_for(&req.key, req.at_tx)
            .ok_or_else(|| not_found("key not found"))?;

        match &version.reference {
            Some((target_key, at_tx)) => {
                let target = self
                    .version_for(target_key, *at_tx)
                    .ok_or_else(|| not_found("key not found"))?;
                if target.reference.is_some() {
                    return Err(not_found("key not found"));
                }
                let entry = Entry {
                    tx: target.tx,
                    key: target_key.clone(),
                    value: target.value.clone(),
                    metadata: target.metadata,
                    revision: self.revision_of(target_key, target),
                    referenced_by: Some(Reference {
                        tx: version.tx,
                        key: req.key.clone(),
                        at_tx: *at_tx,
                        metadata: version.metadata,
                    }),
                };
                Ok((version.tx, version.entry_index, entry))
            }
            None => {
                let entry = Entry {
                    tx: version.tx,
                    key: req.key.clone(),
                    value: version.value.clone(),
                    metadata: version.metadata,
                    revision: self.revision_of(&req.key, version),
                    referenced_by: None,
                };
                Ok((version.tx, version.entry_index, entry))
            }
        }
    }

    fn linear_proof(&self, from: u64, to: u64) -> LinearProof {
        let mut terms = vec![self.alhs[(from - 1) as usize]];
        for id in from + 1..=to {
            terms.push(self.inner_hashes[(id - 1) as usize]);
        }
        LinearProof {
            source_tx_id: from,
            target_tx_id: to,
            terms,
        }
    }

    fn dual_proof(&self, prove_since_tx: u64, tx: u64) -> DualProof {
        let lo = prove_since_tx.clamp(1, tx);
        let hi = prove_since_tx.max(tx);

        let source = self.txs[(lo - 1) as usize].header.clone();
        let target = self.txs[(hi - 1) as usize].header.clone();
        let bl = target.bl_tx_id;

        let bl_levels = if bl > 0 {
            build_bl_tree(&self.bl_leaves[..bl as usize])
        } else {
            Vec::new()
        };

        let inclusion_proof = if lo < bl {
            bl_tree_path(&bl_levels, (lo - 1) as usize)
        } else {
            Vec::new()
        };
        let consistency_proof = if lo < bl && source.bl_tx_id > 0 {
            consistency_path(&self.bl_leaves[..bl as usize], source.bl_tx_id as usize)
        } else {
            Vec::new()
        };
        let target_bl_tx_alh = if bl > 0 {
            self.alhs[(bl - 1) as usize]
        } else {
            [0u8; 32]
        };
        let last_inclusion_proof = if bl > 0 {
            bl_tree_path(&bl_levels, (bl - 1) as usize)
        } else {
            Vec::new()
        };
        let linear_proof = if lo < bl {
            self.linear_proof(bl, hi)
        } else {
            self.linear_proof(lo, hi)
        };

        DualProof {
            source_tx_header: source,
            target_tx_header: target,
            inclusion_proof,
            consistency_proof,
            target_bl_tx_alh,
            last_inclusion_proof,
            linear_proof,
        }
    }

    fn tx_message(&self, id: u64) -> RpcResult<Tx> {
        let committed = self
            .txs
            .get((id - 1) as usize)
            .ok_or_else(|| not_found("tx not found"))?;
        Ok(Tx {
            header: committed.header.clone(),
            entries: committed.entries.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// RPC surface
// ---------------------------------------------------------------------------

/// In-process mock server implementing [`LedgerRpc`].
pub struct MockLedger {
    inner: Mutex<LedgerInner>,
    db: String,
    uuid: String,
    user: Vec<u8>,
    password: Vec<u8>,
    signing: Option<SigningKey>,
    session_counter: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    /// Flip a linear-proof byte in every dual proof
    pub corrupt_dual_proofs: AtomicBool,
    pub keepalives: AtomicUsize,
}

impl MockLedger {
    pub fn new(db: &str) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            db: db.to_string(),
            uuid: "mock-deployment-1".to_string(),
            user: b"admin".to_vec(),
            password: b"admin".to_vec(),
            signing: None,
            session_counter: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            corrupt_dual_proofs: AtomicBool::new(false),
            keepalives: AtomicUsize::new(0),
        }
    }

    pub fn with_signing_key(db: &str, key: SigningKey) -> Self {
        let mut ledger = Self::new(db);
        ledger.signing = Some(key);
        ledger
    }

    fn auth(&self, ctx: &CallContext) -> RpcResult<()> {
        let token = ctx
            .token
            .as_ref()
            .ok_or_else(|| RpcError::new(RpcCode::Unauthenticated, "missing session token"))?;
        let tokens = self.tokens.lock().unwrap();
        if tokens.contains(token) {
            Ok(())
        } else {
            Err(RpcError::new(RpcCode::Unauthenticated, "invalid session token"))
        }
    }

    fn sign_state(&self, tx_id: u64, tx_hash: &Digest32) -> Vec<u8> {
        match &self.signing {
            Some(key) => {
                let mut msg = Vec::new();
                msg.extend_from_slice(self.db.as_bytes());
                msg.extend_from_slice(&tx_id.to_be_bytes());
                msg.extend_from_slice(tx_hash);
                let signature: p256::ecdsa::Signature = key.sign(&msg);
                signature.to_der().as_bytes().to_vec()
            }
            None => Vec::new(),
        }
    }

    fn verifiable_tx(&self, inner: &LedgerInner, prove_since_tx: u64, tx: u64) -> VerifiableTx {
        let mut dual_proof = inner.dual_proof(prove_since_tx, tx);
        if self.corrupt_dual_proofs.load(Ordering::SeqCst) {
            if let Some(term) = dual_proof.linear_proof.terms.last_mut() {
                term[0] ^= 0xFF;
            }
        }
        let hi = prove_since_tx.max(tx);
        let signature = self.sign_state(hi, &inner.alhs[(hi - 1) as usize]);
        let tx_message = inner.tx_message(tx).expect("committed tx");
        VerifiableTx {
            tx: tx_message,
            dual_proof,
            signature,
        }
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn open_session(
        &self,
        _ctx: &CallContext,
        user: &[u8],
        password: &[u8],
        db: &str,
    ) -> RpcResult<OpenSessionResponse> {
        if user != self.user || password != self.password {
            return Err(RpcError::new(
                RpcCode::Unauthenticated,
                "invalid user name or password",
            ));
        }
        if db != self.db {
            return Err(not_found("database not found"));
        }
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("mock-token-{n}");
        self.tokens.lock().unwrap().push(token.clone());
        Ok(OpenSessionResponse {
            session_id: format!("mock-session-{n}"),
            token,
            server_uuid: self.uuid.clone(),
        })
    }

    async fn close_session(&self, ctx: &CallContext) -> RpcResult<()> {
        self.auth(ctx)?;
        let token = ctx.token.clone().unwrap();
        self.tokens.lock().unwrap().retain(|t| t != &token);
        Ok(())
    }

    async fn keep_alive(&self, ctx: &CallContext) -> RpcResult<()> {
        self.auth(ctx)?;
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self, ctx: &CallContext) -> RpcResult<bool> {
        self.auth(ctx)?;
        Ok(true)
    }

    async fn current_state(&self, ctx: &CallContext) -> RpcResult<DatabaseState> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let tx_id = inner.txs.len() as u64;
        let tx_hash = if tx_id > 0 {
            inner.alhs[(tx_id - 1) as usize]
        } else {
            [0u8; 32]
        };
        let signature = if tx_id > 0 {
            self.sign_state(tx_id, &tx_hash)
        } else {
            Vec::new()
        };
        Ok(DatabaseState {
            db: self.db.clone(),
            tx_id,
            tx_hash,
            signature,
        })
    }

    async fn get(&self, ctx: &CallContext, req: &KeyRequest) -> RpcResult<Entry> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let (_, _, entry) = inner.resolve(req)?;
        if entry.is_deleted() {
            return Err(not_found("key not found"));
        }
        Ok(entry)
    }

    async fn get_all(&self, ctx: &CallContext, keys: &[Vec<u8>]) -> RpcResult<Vec<Entry>> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for key in keys {
            let req = KeyRequest {
                key: key.clone(),
                ..Default::default()
            };
            if let Ok((_, _, entry)) = inner.resolve(&req) {
                if !entry.is_deleted() {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    async fn verifiable_get(
        &self,
        ctx: &CallContext,
        req: &VerifiableGetRequest,
    ) -> RpcResult<VerifiableEntry> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let (proved_tx, leaf, entry) = inner.resolve(&req.key_request)?;

        let committed = &inner.txs[(proved_tx - 1) as usize];
        let levels = build_entry_tree(&committed.leaf_digests);
        let inclusion_proof = InclusionProof {
            leaf: leaf as u64,
            width: committed.header.n_entries as u64,
            terms: entry_tree_path(&levels, leaf),
        };

        let verifiable_tx = self.verifiable_tx(&inner, req.prove_since_tx, proved_tx);
        Ok(VerifiableEntry {
            entry,
            verifiable_tx,
            inclusion_proof,
        })
    }

    async fn set(&self, ctx: &CallContext, req: &SetRequest) -> RpcResult<TxHeader> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        if req.kvs.is_empty() {
            return Err(RpcError::new(RpcCode::InvalidArgument, "no entries"));
        }
        let kvs: Vec<_> = req
            .kvs
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone(), kv.metadata))
            .collect();
        let id = inner.commit_kvs(&kvs);
        Ok(inner.txs[(id - 1) as usize].header.clone())
    }

    async fn verifiable_set(
        &self,
        ctx: &CallContext,
        req: &VerifiableSetRequest,
    ) -> RpcResult<VerifiableTx> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        let kv = req
            .set_request
            .kvs
            .first()
            .ok_or_else(|| RpcError::new(RpcCode::InvalidArgument, "no entries"))?;
        let id = inner.commit_kv(&kv.key, &kv.value, kv.metadata);
        Ok(self.verifiable_tx(&inner, req.prove_since_tx, id))
    }

    async fn delete(&self, ctx: &CallContext, req: &DeleteRequest) -> RpcResult<TxHeader> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        let tombstone = EntryMetadata {
            deleted: true,
            non_indexable: false,
        };
        for key in &req.keys {
            if inner.version_for(key, 0).is_none() {
                return Err(not_found("key not found"));
            }
        }
        let kvs: Vec<_> = req
            .keys
            .iter()
            .map(|key| (key.clone(), Vec::new(), Some(tombstone)))
            .collect();
        let id = inner.commit_kvs(&kvs);
        Ok(inner.txs[(id - 1) as usize].header.clone())
    }

    async fn set_reference(
        &self,
        ctx: &CallContext,
        req: &ReferenceRequest,
    ) -> RpcResult<TxHeader> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.version_for(&req.referenced_key, 0).is_none() {
            return Err(not_found("key not found"));
        }
        let at_tx = if req.bound_ref { req.at_tx } else { 0 };
        let id = inner.commit_reference(&req.key, &req.referenced_key, at_tx);
        Ok(inner.txs[(id - 1) as usize].header.clone())
    }

    async fn verifiable_set_reference(
        &self,
        ctx: &CallContext,
        req: &VerifiableReferenceRequest,
    ) -> RpcResult<VerifiableTx> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        let r = &req.reference_request;
        if inner.version_for(&r.referenced_key, 0).is_none() {
            return Err(not_found("key not found"));
        }
        let at_tx = if r.bound_ref { r.at_tx } else { 0 };
        let id = inner.commit_reference(&r.key, &r.referenced_key, at_tx);
        Ok(self.verifiable_tx(&inner, req.prove_since_tx, id))
    }

    async fn zadd(&self, ctx: &CallContext, req: &ZAddRequest) -> RpcResult<TxHeader> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        let at_tx = if req.bound_ref { req.at_tx } else { 0 };
        let id = inner.commit_zadd(&req.set, &req.key, req.score, at_tx);
        Ok(inner.txs[(id - 1) as usize].header.clone())
    }

    async fn verifiable_zadd(
        &self,
        ctx: &CallContext,
        req: &VerifiableZAddRequest,
    ) -> RpcResult<VerifiableTx> {
        self.auth(ctx)?;
        let mut inner = self.inner.lock().unwrap();
        let z = &req.zadd_request;
        let at_tx = if z.bound_ref { z.at_tx } else { 0 };
        let id = inner.commit_zadd(&z.set, &z.key, z.score, at_tx);
        Ok(self.verifiable_tx(&inner, req.prove_since_tx, id))
    }

    async fn scan(&self, ctx: &CallContext, req: &ScanRequest) -> RpcResult<Vec<Entry>> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let mut keys: Vec<&Vec<u8>> = inner
            .kv
            .keys()
            .filter(|k| k.starts_with(&req.prefix))
            .collect();
        keys.sort();
        if req.desc {
            keys.reverse();
        }

        let mut out = Vec::new();
        for key in keys {
            let request = KeyRequest {
                key: key.clone(),
                ..Default::default()
            };
            if let Ok((_, _, entry)) = inner.resolve(&request) {
                if !entry.is_deleted() && entry.referenced_by.is_none() {
                    out.push(entry);
                }
            }
            if req.limit > 0 && out.len() as u64 >= req.limit {
                break;
            }
        }
        Ok(out)
    }

    async fn zscan(&self, ctx: &CallContext, req: &ZScanRequest) -> RpcResult<Vec<ZEntry>> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let mut members = inner.zsets.get(&req.set).cloned().unwrap_or_default();
        members.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        if req.desc {
            members.reverse();
        }
        if req.limit > 0 {
            members.truncate(req.limit as usize);
        }

        let mut out = Vec::new();
        for member in members {
            let entry = inner
                .resolve(&KeyRequest {
                    key: member.key.clone(),
                    at_tx: member.at_tx,
                    ..Default::default()
                })
                .map(|(_, _, e)| e)
                .unwrap_or(Entry {
                    tx: 0,
                    key: member.key.clone(),
                    value: Vec::new(),
                    metadata: None,
                    revision: 0,
                    referenced_by: None,
                });
            out.push(ZEntry {
                set: req.set.clone(),
                key: member.key,
                entry,
                score: member.score,
                at_tx: member.at_tx,
            });
        }
        Ok(out)
    }

    async fn history(&self, ctx: &CallContext, req: &HistoryRequest) -> RpcResult<Vec<Entry>> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        let versions = inner
            .kv
            .get(&req.key)
            .ok_or_else(|| not_found("key not found"))?;

        let mut entries: Vec<Entry> = versions
            .iter()
            .enumerate()
            .map(|(i, v)| Entry {
                tx: v.tx,
                key: req.key.clone(),
                value: v.value.clone(),
                metadata: v.metadata,
                revision: i as i64 + 1,
                referenced_by: None,
            })
            .collect();
        if req.desc {
            entries.reverse();
        }
        let offset = req.offset as usize;
        let mut entries: Vec<Entry> = entries.into_iter().skip(offset).collect();
        if req.limit > 0 {
            entries.truncate(req.limit as usize);
        }
        Ok(entries)
    }

    async fn tx_by_id(&self, ctx: &CallContext, req: &TxRequest) -> RpcResult<Tx> {
        self.auth(ctx)?;
        if req.tx == 0 {
            return Err(not_found("tx not found"));
        }
        let inner = self.inner.lock().unwrap();
        inner.tx_message(req.tx)
    }

    async fn verifiable_tx_by_id(
        &self,
        ctx: &CallContext,
        req: &VerifiableTxRequest,
    ) -> RpcResult<VerifiableTx> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        if req.tx == 0 || req.tx > inner.txs.len() as u64 {
            return Err(not_found("tx not found"));
        }
        Ok(self.verifiable_tx(&inner, req.prove_since_tx, req.tx))
    }

    async fn tx_scan(&self, ctx: &CallContext, req: &TxScanRequest) -> RpcResult<Vec<Tx>> {
        self.auth(ctx)?;
        let inner = self.inner.lock().unwrap();
        if req.initial_tx == 0 {
            return Err(not_found("tx not found"));
        }
        let mut out = Vec::new();
        let total = inner.txs.len() as u64;
        let mut id = req.initial_tx;
        loop {
            if id == 0 || id > total {
                break;
            }
            out.push(inner.tx_message(id)?);
            if req.limit > 0 && out.len() as u32 >= req.limit {
                break;
            }
            if req.desc {
                id -= 1;
            } else {
                id += 1;
            }
        }
        Ok(out)
    }
}

/// Factory handing out a shared mock server.
pub struct MockFactory {
    pub ledger: Arc<MockLedger>,
}

impl MockFactory {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, _address: &str) -> RpcResult<Arc<dyn LedgerRpc>> {
        Ok(Arc::clone(&self.ledger) as Arc<dyn LedgerRpc>)
    }
}
