//! Typed proof structures
//!
//! Ephemeral values parsed out of verifiable RPC responses and handed to
//! the verifiers in [`crate::verification`]. Structural checks (term
//! counts against declared sizes) live here so hashing never runs over
//! malformed input.

use crate::error::{Result, VerificationError};
use crate::schema::{Digest32, Entry, Tx, TxHeader};

/// Merkle path for one leaf of a transaction's entry tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    /// Index of the proven leaf
    pub leaf: u64,

    /// Number of leaves in the tree
    pub width: u64,

    /// Sibling digests from leaf level to root
    pub terms: Vec<Digest32>,
}

impl InclusionProof {
    /// Reject proofs whose shape cannot belong to the declared tree.
    ///
    /// The term count of a width-`w` tree never exceeds `ceil(log2(w))`
    /// rounded up once for ragged levels.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(VerificationError::MalformedProof("zero tree width").into());
        }
        if self.leaf >= self.width {
            return Err(VerificationError::MalformedProof("leaf outside tree").into());
        }
        let max_terms = 64 - (self.width - 1).leading_zeros() as usize + 1;
        if self.terms.len() > max_terms {
            return Err(VerificationError::MalformedProof("too many inclusion terms").into());
        }
        Ok(())
    }
}

/// Chain of alh values from a source to a target transaction.
///
/// `terms[0]` is the source alh; each following term is the inner hash
/// of the next transaction in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearProof {
    /// First transaction of the walk
    pub source_tx_id: u64,

    /// Last transaction of the walk
    pub target_tx_id: u64,

    /// Source alh followed by one inner hash per chained transaction
    pub terms: Vec<Digest32>,
}

impl LinearProof {
    /// Reject walks whose term count disagrees with the id range.
    pub fn validate(&self) -> Result<()> {
        if self.source_tx_id == 0 || self.source_tx_id > self.target_tx_id {
            return Err(VerificationError::MalformedProof("bad linear proof range").into());
        }
        let expected = self.target_tx_id - self.source_tx_id + 1;
        if self.terms.len() as u64 != expected {
            return Err(VerificationError::MalformedProof("linear term count mismatch").into());
        }
        Ok(())
    }
}

/// Combined proof that a target transaction legitimately succeeds a
/// source transaction.
///
/// Merges binary-linked-tree inclusion and consistency with a linear
/// chain walk over the transactions not yet folded into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualProof {
    /// Header of the trust anchor
    pub source_tx_header: TxHeader,

    /// Header of the transaction being adopted
    pub target_tx_header: TxHeader,

    /// Inclusion of the source alh in the target's binary-linked tree
    pub inclusion_proof: Vec<Digest32>,

    /// Consistency between source and target binary-linked trees
    pub consistency_proof: Vec<Digest32>,

    /// Alh of the newest transaction folded into the target tree
    pub target_bl_tx_alh: Digest32,

    /// Inclusion of `target_bl_tx_alh` as the tree's last leaf
    pub last_inclusion_proof: Vec<Digest32>,

    /// Chain walk covering transactions past the tree boundary
    pub linear_proof: LinearProof,
}

/// A transaction accompanied by its dual proof, as returned by
/// verifiable writes and `verifiableTxById`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiableTx {
    /// The transaction itself
    pub tx: Tx,

    /// Proof anchoring the transaction to the client's trusted state
    pub dual_proof: DualProof,

    /// Signature over the resulting database state, empty when unsigned
    pub signature: Vec<u8>,
}

/// An entry accompanied by its transaction and inclusion proof, as
/// returned by `verifiableGet`.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiableEntry {
    /// The resolved entry
    pub entry: Entry,

    /// Transaction and dual proof covering the entry
    pub verifiable_tx: VerifiableTx,

    /// Merkle path of the entry inside its transaction
    pub inclusion_proof: InclusionProof,
}
