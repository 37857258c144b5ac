//! Canonical digests and signature verification
//!
//! Bit-exact byte layouts shared with the server. All integers are
//! big-endian and fixed-width; every digest is SHA-256. Getting a single
//! byte wrong here makes every proof verification fail, so the layouts
//! below mirror the server's canonical spec:
//!
//! - `alh = SHA256(id(8) ‖ prev_alh(32) ‖ inner_hash)`
//! - inner hash v0: `SHA256(ts(8) ‖ n_entries(4) ‖ eh(32) ‖ bl_tx_id(8) ‖ bl_root(32))`
//! - inner hash v1: `SHA256(ts(8) ‖ bl_tx_id(8) ‖ bl_root(32) ‖
//!   SHA256(version(2) ‖ metadata? ‖ n_entries(4) ‖ eh(32)))`
//! - leaf digest: `SHA256(0x00 ‖ encoded_key ‖ h_value)`

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result, VerificationError};
use crate::schema::{Digest32, Entry, EntryMetadata, TxHeader};

/// Prefix of Merkle leaf nodes.
pub const LEAF_PREFIX: u8 = 0x00;

/// Prefix of Merkle inner nodes.
pub const NODE_PREFIX: u8 = 0x01;

/// Prefix of stored values holding a reference to another key.
pub const REFERENCE_VALUE_PREFIX: u8 = 0x01;

/// Compute SHA-256 hash of the input data.
#[inline]
pub fn sha256(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash of concatenated data slices.
///
/// More efficient than allocating a buffer for concatenation.
pub fn sha256_concat(parts: &[&[u8]]) -> Digest32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Digest of an inner Merkle node over two children.
#[inline]
pub fn node_digest(left: &Digest32, right: &Digest32) -> Digest32 {
    sha256_concat(&[&[NODE_PREFIX], left, right])
}

/// Leaf digest of the binary-linked tree for one transaction's alh.
#[inline]
pub fn bl_leaf_digest(alh: &Digest32) -> Digest32 {
    sha256_concat(&[&[LEAF_PREFIX], alh])
}

/// Accumulative linear hash of a transaction header.
///
/// Fails closed on header versions the client does not understand.
pub fn alh(header: &TxHeader) -> Result<Digest32> {
    let inner = inner_hash(header)?;
    Ok(sha256_concat(&[
        &header.id.to_be_bytes(),
        &header.prev_alh,
        &inner,
    ]))
}

/// Version-dependent inner hash folded into the alh.
pub fn inner_hash(header: &TxHeader) -> Result<Digest32> {
    match header.version {
        0 => Ok(sha256_concat(&[
            &header.timestamp.to_be_bytes(),
            &header.n_entries.to_be_bytes(),
            &header.eh,
            &header.bl_tx_id.to_be_bytes(),
            &header.bl_root,
        ])),
        1 => {
            let md_bytes = header
                .metadata
                .as_ref()
                .map(|m| m.bytes().to_vec())
                .unwrap_or_default();
            let entries_digest = sha256_concat(&[
                &header.version.to_be_bytes(),
                &md_bytes,
                &header.n_entries.to_be_bytes(),
                &header.eh,
            ]);
            Ok(sha256_concat(&[
                &header.timestamp.to_be_bytes(),
                &header.bl_tx_id.to_be_bytes(),
                &header.bl_root,
                &entries_digest,
            ]))
        }
        v => Err(VerificationError::UnsupportedVersion(v).into()),
    }
}

/// Canonical stored value of a reference entry pointing at `target_key`.
pub fn encode_reference_value(target_key: &[u8], at_tx: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + target_key.len());
    out.push(REFERENCE_VALUE_PREFIX);
    out.extend_from_slice(&at_tx.to_be_bytes());
    out.extend_from_slice(target_key);
    out
}

/// Canonical key of a sorted-set member.
///
/// `set ‖ key_len(8) ‖ key ‖ score(8, IEEE-754 BE) ‖ at_tx(8)`.
pub fn encode_z_key(set: &[u8], key: &[u8], score: f64, at_tx: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(set.len() + 8 + key.len() + 8 + 8);
    out.extend_from_slice(set);
    out.extend_from_slice(&(key.len() as u64).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&score.to_be_bytes());
    out.extend_from_slice(&at_tx.to_be_bytes());
    out
}

/// Value digest folded with entry metadata under v1 rules.
///
/// With metadata: `SHA256(metadata ‖ value_len(4) ‖ SHA256(value))`.
/// Without metadata, or under v0, the plain value digest is used as-is.
pub fn fold_h_value(
    value_digest: &Digest32,
    value_len: u32,
    metadata: Option<&EntryMetadata>,
    version: u16,
) -> Result<Digest32> {
    match version {
        0 => Ok(*value_digest),
        1 => match metadata {
            Some(md) => Ok(sha256_concat(&[
                &md.to_bytes(),
                &value_len.to_be_bytes(),
                value_digest,
            ])),
            None => Ok(*value_digest),
        },
        v => Err(VerificationError::UnsupportedVersion(v).into()),
    }
}

/// Merkle leaf digest over an encoded key and a folded value digest.
#[inline]
pub fn leaf_digest(encoded_key: &[u8], h_value: &Digest32) -> Digest32 {
    sha256_concat(&[&[LEAF_PREFIX], encoded_key, h_value])
}

/// Leaf digest committing a raw key/value pair under the given version.
pub fn kv_digest(
    key: &[u8],
    value: &[u8],
    metadata: Option<&EntryMetadata>,
    version: u16,
) -> Result<Digest32> {
    let hv = fold_h_value(&sha256(value), value.len() as u32, metadata, version)?;
    Ok(leaf_digest(key, &hv))
}

/// Leaf digest of an entry as returned by the server.
///
/// An entry reached through an alias commits to the alias key and the
/// canonical reference value, not to its own key and value.
pub fn entry_digest(entry: &Entry, version: u16) -> Result<Digest32> {
    match &entry.referenced_by {
        Some(reference) => {
            let value = encode_reference_value(&entry.key, reference.at_tx);
            kv_digest(&reference.key, &value, reference.metadata.as_ref(), version)
        }
        None => kv_digest(&entry.key, &entry.value, entry.metadata.as_ref(), version),
    }
}

/// Leaf digest of a sorted-set member entry.
///
/// Z entries store an empty value; all of the binding lives in the
/// encoded key.
pub fn z_entry_digest(
    set: &[u8],
    key: &[u8],
    score: f64,
    at_tx: u64,
    version: u16,
) -> Result<Digest32> {
    let encoded = encode_z_key(set, key, score, at_tx);
    kv_digest(&encoded, &[], None, version)
}

/// Server public signing key (ECDSA over secp256r1).
#[derive(Debug, Clone)]
pub struct ServerSigningKey(VerifyingKey);

impl ServerSigningKey {
    /// Parse a key from SEC1-encoded bytes (compressed or uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::InvalidConfig(format!("bad server signing key: {e}")))?;
        Ok(Self(key))
    }

    /// Verify a DER-encoded ECDSA signature over a database state.
    ///
    /// The signed message is `db ‖ tx_id(8) ‖ tx_hash(32)`. Any parse or
    /// curve error rejects.
    pub fn verify_state(
        &self,
        db: &str,
        tx_id: u64,
        tx_hash: &Digest32,
        signature: &[u8],
    ) -> Result<()> {
        let sig = Signature::from_der(signature)
            .map_err(|_| Error::Verification(VerificationError::InvalidSignature))?;
        let mut msg = Vec::with_capacity(db.len() + 8 + 32);
        msg.extend_from_slice(db.as_bytes());
        msg.extend_from_slice(&tx_id.to_be_bytes());
        msg.extend_from_slice(tx_hash);
        self.0
            .verify(&msg, &sig)
            .map_err(|_| Error::Verification(VerificationError::InvalidSignature))?;
        Ok(())
    }
}
