//! Trusted state holder
//!
//! Owns the client's last verified `(db, tx_id, tx_hash, signature)`.
//! Verified operations read a snapshot, verify against it, and publish a
//! new state atomically; a failed verification never publishes.
//!
//! Persistence is pluggable: an in-memory store for throwaway clients
//! and a file-backed store that survives restarts. Both are keyed by a
//! deployment key (a short hash of the server address) and the database
//! name, and both pin the server UUID first seen for a deployment so a
//! client pointed at a different deployment fails instead of silently
//! overwriting trust.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::digest::sha256;
use crate::error::{Error, Result};
use crate::schema::Digest32;

/// The client's last verified database state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedState {
    /// Database the state belongs to
    pub db: String,

    /// Last verified transaction id, 0 before any verified operation
    pub tx_id: u64,

    /// Alh of the last verified transaction
    pub tx_hash: Digest32,

    /// Server signature over `(db ‖ tx_id ‖ tx_hash)`, empty when unsigned
    pub signature: Vec<u8>,
}

impl TrustedState {
    /// Fresh state carrying no prior trust for `db`.
    pub fn genesis(db: &str) -> Self {
        Self {
            db: db.to_string(),
            tx_id: 0,
            tx_hash: [0u8; 32],
            signature: Vec::new(),
        }
    }
}

/// Short, filesystem-safe key identifying a server deployment.
///
/// First 8 bytes of `SHA256(address)`, hex-encoded.
pub fn deployment_key(server_address: &str) -> String {
    hex::encode(&sha256(server_address.as_bytes())[..8])
}

/// Storage backend for trusted states and deployment pins.
///
/// Implementations must be safe for concurrent access: reads return a
/// snapshot, writes are atomic with respect to concurrent reads. All
/// operations are non-suspending.
pub trait StateStore: Send + Sync {
    /// Read the stored state for `(deployment, db)`, if any.
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>>;

    /// Atomically replace the stored state for `(deployment, state.db)`.
    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()>;

    /// Server UUID recorded for a deployment, if any.
    fn deployment_uuid(&self, deployment: &str) -> Result<Option<String>>;

    /// Record the server UUID first seen for a deployment.
    fn record_deployment_uuid(&self, deployment: &str, uuid: &str) -> Result<()>;
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<(String, String), TrustedState>>,
    uuids: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>> {
        let states = self.states.read().expect("state lock poisoned");
        Ok(states
            .get(&(deployment.to_string(), db.to_string()))
            .cloned())
    }

    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()> {
        let mut states = self.states.write().expect("state lock poisoned");
        states.insert(
            (deployment.to_string(), state.db.clone()),
            state.clone(),
        );
        Ok(())
    }

    fn deployment_uuid(&self, deployment: &str) -> Result<Option<String>> {
        let uuids = self.uuids.read().expect("state lock poisoned");
        Ok(uuids.get(deployment).cloned())
    }

    fn record_deployment_uuid(&self, deployment: &str, uuid: &str) -> Result<()> {
        let mut uuids = self.uuids.write().expect("state lock poisoned");
        uuids.insert(deployment.to_string(), uuid.to_string());
        Ok(())
    }
}

/// File-backed state store.
///
/// One record per `(deployment, db)` at `<root>/<deployment>/<db>.state`
/// in a fixed-width binary layout:
///
/// `tx_id(8, BE) ‖ tx_hash(32) ‖ sig_len(4, BE) ‖ signature`
///
/// Updates write a temporary file and atomically rename it over the
/// record. The deployment's server UUID lives next to the records in a
/// `server_uuid` file.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    // serializes writers so rename and temp-file reuse cannot interleave
    lock: RwLock<()>,
}

impl FileStateStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    fn record_path(&self, deployment: &str, db: &str) -> PathBuf {
        self.root.join(deployment).join(format!("{db}.state"))
    }

    fn uuid_path(&self, deployment: &str) -> PathBuf {
        self.root.join(deployment).join("server_uuid")
    }

    fn decode_record(db: &str, bytes: &[u8]) -> Result<TrustedState> {
        if bytes.len() < 8 + 32 + 4 {
            return Err(Error::Storage(format!(
                "state record too short: {} bytes",
                bytes.len()
            )));
        }
        let tx_id = u64::from_be_bytes(bytes[0..8].try_into().expect("sized slice"));
        let mut tx_hash = [0u8; 32];
        tx_hash.copy_from_slice(&bytes[8..40]);
        let sig_len = u32::from_be_bytes(bytes[40..44].try_into().expect("sized slice")) as usize;
        if bytes.len() != 44 + sig_len {
            return Err(Error::Storage(format!(
                "state record length mismatch: {} != {}",
                bytes.len(),
                44 + sig_len
            )));
        }
        Ok(TrustedState {
            db: db.to_string(),
            tx_id,
            tx_hash,
            signature: bytes[44..].to_vec(),
        })
    }

    fn encode_record(state: &TrustedState) -> Vec<u8> {
        let mut out = Vec::with_capacity(44 + state.signature.len());
        out.extend_from_slice(&state.tx_id.to_be_bytes());
        out.extend_from_slice(&state.tx_hash);
        out.extend_from_slice(&(state.signature.len() as u32).to_be_bytes());
        out.extend_from_slice(&state.signature);
        out
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().expect("record path has a parent");
        fs::create_dir_all(dir)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, deployment: &str, db: &str) -> Result<Option<TrustedState>> {
        let _guard = self.lock.read().expect("store lock poisoned");
        match fs::read(self.record_path(deployment, db)) {
            Ok(bytes) => Ok(Some(Self::decode_record(db, &bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, deployment: &str, state: &TrustedState) -> Result<()> {
        let _guard = self.lock.write().expect("store lock poisoned");
        let path = self.record_path(deployment, &state.db);
        Self::write_atomic(&path, &Self::encode_record(state))
    }

    fn deployment_uuid(&self, deployment: &str) -> Result<Option<String>> {
        let _guard = self.lock.read().expect("store lock poisoned");
        match fs::read_to_string(self.uuid_path(deployment)) {
            Ok(uuid) => Ok(Some(uuid.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn record_deployment_uuid(&self, deployment: &str, uuid: &str) -> Result<()> {
        let _guard = self.lock.write().expect("store lock poisoned");
        let path = self.uuid_path(deployment);
        Self::write_atomic(&path, uuid.as_bytes())
    }
}
