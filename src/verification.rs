//! Proof verifiers
//!
//! Pure functions validating proofs against roots. Nothing here touches
//! the network or the trusted state; the client facade feeds these with
//! parsed proof objects and publishes state only when every check
//! accepts.
//!
//! Supports:
//! - Entry inclusion proofs inside one transaction's Merkle tree
//! - Inclusion, last-inclusion, and consistency proofs over the
//!   binary-linked tree of committed transactions (RFC 6962 shape)
//! - Linear alh chain walks
//! - The combined dual proof tying all of the above together

use crate::digest::{alh, bl_leaf_digest, node_digest, sha256_concat};
use crate::error::VerificationError;
use crate::proof::{DualProof, InclusionProof, LinearProof};
use crate::schema::Digest32;

/// Verify a Merkle inclusion proof for one leaf of a transaction's
/// entry tree.
///
/// Reconstructs the root by folding `leaf_digest` against the proof
/// terms along the binary path derived from the leaf index and tree
/// width; accepts iff the reconstruction equals `root`.
pub fn verify_inclusion(proof: &InclusionProof, leaf_digest: &Digest32, root: &Digest32) -> bool {
    if proof.validate().is_err() {
        return false;
    }

    let mut i = proof.leaf;
    let mut r = proof.width - 1;
    let mut calc = *leaf_digest;

    for term in &proof.terms {
        calc = if i % 2 == 0 && i != r {
            node_digest(&calc, term)
        } else {
            node_digest(term, &calc)
        };
        i /= 2;
        r /= 2;
    }

    i == r && calc == *root
}

/// Verify inclusion of leaf `i` in the binary-linked tree of size `j`.
///
/// Positions are 1-based transaction ids.
pub fn verify_bl_inclusion(
    terms: &[Digest32],
    i: u64,
    j: u64,
    i_leaf: &Digest32,
    j_root: &Digest32,
) -> bool {
    if i == 0 || i > j {
        return false;
    }
    if i < j && terms.is_empty() {
        return false;
    }

    let mut i1 = i - 1;
    let mut j1 = j - 1;
    let mut calc = *i_leaf;

    for term in terms {
        calc = if i1 % 2 == 0 && i1 != j1 {
            node_digest(&calc, term)
        } else {
            node_digest(term, &calc)
        };
        i1 /= 2;
        j1 /= 2;
    }

    i1 == j1 && calc == *j_root
}

/// Verify that `leaf` sits at the rightmost position of the
/// binary-linked tree of size `i`.
///
/// The rightmost node only ever merges with left siblings, one per set
/// bit of its zero-based index.
pub fn verify_last_inclusion(
    terms: &[Digest32],
    i: u64,
    leaf: &Digest32,
    root: &Digest32,
) -> bool {
    if i == 0 {
        return false;
    }

    let mut i1 = i - 1;
    let mut calc = *leaf;
    let mut iter = terms.iter();

    while i1 > 0 {
        if i1 & 1 == 1 {
            match iter.next() {
                Some(term) => calc = node_digest(term, &calc),
                None => return false,
            }
        }
        i1 >>= 1;
    }

    iter.next().is_none() && calc == *root
}

/// Verify consistency between two snapshots of the binary-linked tree.
///
/// Standard Merkle consistency check (RFC 6962 shape) over the tree of
/// size `i` with root `i_root` and the tree of size `j` with root
/// `j_root`. The proof always carries the walk seed as its first term.
pub fn verify_consistency(
    terms: &[Digest32],
    i: u64,
    j: u64,
    i_root: &Digest32,
    j_root: &Digest32,
) -> bool {
    if i > j || i == 0 {
        return false;
    }
    if i == j {
        return i_root == j_root;
    }
    if terms.is_empty() {
        return false;
    }

    let mut fnode = i - 1;
    let mut snode = j - 1;
    while fnode % 2 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut ci = terms[0];
    let mut cj = terms[0];

    for term in &terms[1..] {
        if snode == 0 {
            return false;
        }
        if fnode % 2 == 1 || fnode == snode {
            ci = node_digest(term, &ci);
            cj = node_digest(term, &cj);
            while fnode % 2 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            cj = node_digest(&cj, term);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    ci == *i_root && cj == *j_root && snode == 0
}

/// Verify a linear alh chain walk from `source_alh` to `target_alh`.
///
/// Walks the terms starting at the source alh, computing
/// `next = SHA256(tx_id ‖ prev ‖ inner_term)` with `tx_id` incrementing
/// from `source_tx_id + 1` to `target_tx_id`. The expected endpoints
/// are pinned by the caller so a proof cannot choose its own range.
pub fn verify_linear(
    proof: &LinearProof,
    source_tx_id: u64,
    target_tx_id: u64,
    source_alh: &Digest32,
    target_alh: &Digest32,
) -> bool {
    if proof.source_tx_id != source_tx_id || proof.target_tx_id != target_tx_id {
        return false;
    }
    if proof.validate().is_err() {
        return false;
    }
    if proof.terms[0] != *source_alh {
        return false;
    }

    let mut calc = proof.terms[0];
    for (step, term) in proof.terms.iter().enumerate().skip(1) {
        let tx_id = proof.source_tx_id + step as u64;
        calc = sha256_concat(&[&tx_id.to_be_bytes(), &calc, term]);
    }

    calc == *target_alh
}

/// Verify a dual proof for the transition `source → target`.
///
/// Every sub-check must accept; the first failing check names the
/// rejection. Callers handle the `source_id == 0` (no prior trust) and
/// `source_id == target_id` tie-breaks before invoking this.
pub fn verify_dual_proof(
    proof: &DualProof,
    source_id: u64,
    target_id: u64,
    source_alh: &Digest32,
    target_alh: &Digest32,
) -> Result<(), VerificationError> {
    if source_id == 0 || source_id > target_id {
        return Err(VerificationError::MalformedProof("bad dual proof range"));
    }
    if proof.source_tx_header.id != source_id {
        return Err(VerificationError::SourceHeaderMismatch);
    }
    if proof.target_tx_header.id != target_id {
        return Err(VerificationError::TargetHeaderMismatch);
    }

    let source_header_alh = alh(&proof.source_tx_header)
        .map_err(|_| VerificationError::UnsupportedVersion(proof.source_tx_header.version))?;
    if source_header_alh != *source_alh {
        return Err(VerificationError::SourceHeaderMismatch);
    }
    let target_header_alh = alh(&proof.target_tx_header)
        .map_err(|_| VerificationError::UnsupportedVersion(proof.target_tx_header.version))?;
    if target_header_alh != *target_alh {
        return Err(VerificationError::TargetHeaderMismatch);
    }

    let bl_tx_id = proof.target_tx_header.bl_tx_id;

    if source_id < bl_tx_id {
        if !verify_bl_inclusion(
            &proof.inclusion_proof,
            source_id,
            bl_tx_id,
            &bl_leaf_digest(source_alh),
            &proof.target_tx_header.bl_root,
        ) {
            return Err(VerificationError::InclusionFailed);
        }
        if proof.source_tx_header.bl_tx_id > 0
            && !verify_consistency(
                &proof.consistency_proof,
                proof.source_tx_header.bl_tx_id,
                bl_tx_id,
                &proof.source_tx_header.bl_root,
                &proof.target_tx_header.bl_root,
            )
        {
            return Err(VerificationError::ConsistencyFailed);
        }
    }

    if bl_tx_id > 0
        && !verify_last_inclusion(
            &proof.last_inclusion_proof,
            bl_tx_id,
            &bl_leaf_digest(&proof.target_bl_tx_alh),
            &proof.target_tx_header.bl_root,
        )
    {
        return Err(VerificationError::LastInclusionFailed);
    }

    let linear_ok = if source_id < bl_tx_id {
        verify_linear(
            &proof.linear_proof,
            bl_tx_id,
            target_id,
            &proof.target_bl_tx_alh,
            target_alh,
        )
    } else {
        verify_linear(
            &proof.linear_proof,
            source_id,
            target_id,
            source_alh,
            target_alh,
        )
    };
    if !linear_ok {
        return Err(VerificationError::LinearFailed);
    }

    Ok(())
}
