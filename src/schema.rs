//! Data model and wire message shapes
//!
//! Typed representations of everything the server exchanges with the
//! client: entries, transaction headers, and the request/response
//! messages of the RPC surface. Keys and values are opaque byte strings;
//! keys compare bytewise, no text encoding is assumed at this layer.

use serde::{Deserialize, Serialize};

/// A 32-byte SHA-256 digest.
pub type Digest32 = [u8; 32];

/// Flags attached to an individual entry.
///
/// The deleted marker makes a verified read fail even when every proof
/// checks out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry is a tombstone
    pub deleted: bool,

    /// Entry is excluded from secondary indexing
    pub non_indexable: bool,
}

impl EntryMetadata {
    /// Canonical byte encoding folded into entry digests.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut mask = 0u8;
        if self.deleted {
            mask |= 1 << 0;
        }
        if self.non_indexable {
            mask |= 1 << 1;
        }
        vec![mask]
    }
}

/// Opaque transaction-header metadata.
///
/// Carried through the v1 inner-hash computation as raw bytes; the
/// client never interprets its contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMetadata(pub Vec<u8>);

impl TxMetadata {
    /// Raw bytes contributed to the v1 inner hash.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Alias record attached to an entry reached through a reference.
///
/// When present, verification must bind the proof to the alias key,
/// not to the resolved entry's own key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Transaction that committed the reference
    pub tx: u64,

    /// The alias key
    pub key: Vec<u8>,

    /// Pinned target transaction, 0 when the reference is unbound
    pub at_tx: u64,

    /// Metadata of the reference entry itself
    pub metadata: Option<EntryMetadata>,
}

/// A key/value entry as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Transaction that committed this entry
    pub tx: u64,

    /// Entry key (the resolved target key when reached via an alias)
    pub key: Vec<u8>,

    /// Entry value
    pub value: Vec<u8>,

    /// Entry metadata, if any
    pub metadata: Option<EntryMetadata>,

    /// Revision number of the key at this entry
    pub revision: i64,

    /// Present when this entry was reached via an alias
    pub referenced_by: Option<Reference>,
}

impl Entry {
    /// Whether the entry carries a deleted marker.
    pub fn is_deleted(&self) -> bool {
        self.metadata.map(|m| m.deleted).unwrap_or(false)
    }
}

/// A key/value pair submitted on writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Key to write
    pub key: Vec<u8>,

    /// Value to write
    pub value: Vec<u8>,

    /// Optional metadata to attach
    pub metadata: Option<EntryMetadata>,
}

/// Header of a committed transaction.
///
/// Its accumulative linear hash (`alh`) chains transactions; see
/// [`crate::digest::alh`] for the canonical computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHeader {
    /// Transaction id, 1-based and strictly increasing
    pub id: u64,

    /// Alh of the preceding transaction, all zeroes for the first
    pub prev_alh: Digest32,

    /// Commit timestamp, seconds since epoch as reported by the server
    pub timestamp: i64,

    /// Header layout version; {0, 1} are supported
    pub version: u16,

    /// Optional header metadata (v1 only)
    pub metadata: Option<TxMetadata>,

    /// Number of entries committed by this transaction
    pub n_entries: u32,

    /// Merkle root over this transaction's entry digests
    pub eh: Digest32,

    /// Size of the binary-linked tree this header commits to
    pub bl_tx_id: u64,

    /// Root of the binary-linked tree at `bl_tx_id`
    pub bl_root: Digest32,
}

/// One entry as recorded inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    /// Entry key as stored
    pub key: Vec<u8>,

    /// Entry metadata, if any
    pub metadata: Option<EntryMetadata>,

    /// Digest of the stored value
    pub h_value: Digest32,

    /// Length of the stored value in bytes
    pub v_len: u32,
}

/// A transaction: header plus its entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    /// Transaction header
    pub header: TxHeader,

    /// Entries committed by the transaction
    pub entries: Vec<TxEntry>,
}

/// A sorted-set member as returned by `zscan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZEntry {
    /// Sorted-set name
    pub set: Vec<u8>,

    /// Member key
    pub key: Vec<u8>,

    /// Resolved entry for the member key
    pub entry: Entry,

    /// Member score
    pub score: f64,

    /// Pinned target transaction, 0 when unbound
    pub at_tx: u64,
}

/// Database state as reported by the server (`currentState`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseState {
    /// Database name
    pub db: String,

    /// Latest committed transaction id
    pub tx_id: u64,

    /// Alh of the latest committed transaction
    pub tx_hash: Digest32,

    /// Signature over `(db ‖ tx_id ‖ tx_hash)`, empty when unsigned
    pub signature: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Parameters of a single-key read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    /// Key to read
    pub key: Vec<u8>,

    /// Pin the read to the entry committed by this tx, 0 for latest
    pub at_tx: u64,

    /// Wait until at least this tx is indexed, 0 to not wait
    pub since_tx: u64,

    /// Read a specific revision, 0 for latest
    pub at_revision: i64,

    /// Do not wait for indexing at all
    pub no_wait: bool,
}

/// Verified single-key read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableGetRequest {
    /// The underlying read
    pub key_request: KeyRequest,

    /// Tx id the returned proof must anchor to
    pub prove_since_tx: u64,
}

/// Multi-entry write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRequest {
    /// Entries to commit in one transaction
    pub kvs: Vec<KeyValue>,
}

/// Verified write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableSetRequest {
    /// The underlying write
    pub set_request: SetRequest,

    /// Tx id the returned proof must anchor to
    pub prove_since_tx: u64,
}

/// Reference (alias) creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRequest {
    /// Alias key to create
    pub key: Vec<u8>,

    /// Target key the alias resolves to
    pub referenced_key: Vec<u8>,

    /// Pin the alias to the target entry committed by this tx
    pub at_tx: u64,

    /// Whether `at_tx` is meaningful
    pub bound_ref: bool,
}

/// Verified reference creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableReferenceRequest {
    /// The underlying reference write
    pub reference_request: ReferenceRequest,

    /// Tx id the returned proof must anchor to
    pub prove_since_tx: u64,
}

/// Sorted-set insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZAddRequest {
    /// Sorted-set name
    pub set: Vec<u8>,

    /// Member key
    pub key: Vec<u8>,

    /// Pin the member to the entry committed by this tx
    pub at_tx: u64,

    /// Member score
    pub score: f64,

    /// Whether `at_tx` is meaningful
    pub bound_ref: bool,
}

/// Verified sorted-set insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifiableZAddRequest {
    /// The underlying insertion
    pub zadd_request: ZAddRequest,

    /// Tx id the returned proof must anchor to
    pub prove_since_tx: u64,
}

/// Key-range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Only keys with this prefix
    pub prefix: Vec<u8>,

    /// Resume after this key, empty to start at the boundary
    pub seek_key: Vec<u8>,

    /// Maximum number of entries, 0 for the server default
    pub limit: u64,

    /// Descending key order
    pub desc: bool,

    /// Wait until at least this tx is indexed
    pub since_tx: u64,

    /// Do not wait for indexing
    pub no_wait: bool,
}

/// Sorted-set scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZScanRequest {
    /// Sorted-set name
    pub set: Vec<u8>,

    /// Maximum number of members, 0 for the server default
    pub limit: u64,

    /// Descending score order
    pub desc: bool,

    /// Wait until at least this tx is indexed
    pub since_tx: u64,

    /// Do not wait for indexing
    pub no_wait: bool,
}

/// Per-key revision history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Key whose history to read
    pub key: Vec<u8>,

    /// Number of oldest revisions to skip
    pub offset: u64,

    /// Maximum number of revisions, 0 for the server default
    pub limit: u64,

    /// Newest revisions first
    pub desc: bool,
}

/// Single-transaction lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    /// Transaction id to fetch
    pub tx: u64,
}

/// Verified single-transaction lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableTxRequest {
    /// Transaction id to fetch
    pub tx: u64,

    /// Tx id the returned proof must anchor to
    pub prove_since_tx: u64,
}

/// Transaction-range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxScanRequest {
    /// First transaction id of the range
    pub initial_tx: u64,

    /// Maximum number of transactions, 0 for the server default
    pub limit: u32,

    /// Descending id order
    pub desc: bool,
}

/// Multi-key delete. Deletion is logical: a tombstone entry is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Keys to tombstone
    pub keys: Vec<Vec<u8>>,
}
