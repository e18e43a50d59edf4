//! The `PumpStateStore` collaborator (spec.md §6 and §9's `{InMemory,
//! FileBacked, Preferences}` capability-interface callout).
//!
//! Modeled as a synchronous trait object rather than an `async fn` trait:
//! spec.md §9 explicitly treats the store as "sync-or-async-agnostic", and
//! nothing in this corpus reaches for `async-trait` for a capability this
//! narrow. A store backed by genuinely async I/O can bridge with its own
//! blocking call internally.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::bluetooth::PumpAddress;
use crate::cipher::{Cipher, KEY_LEN};
use crate::error::{Error, Result};
use crate::nonce::Nonce;

/// The per-pump material derived once during pairing (spec.md §3
/// "Invariant pump data"). Cipher keys are stored raw so the struct can
/// round-trip through `serde`; `Cipher` itself is reconstructed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantPumpData {
    pub client_pump_key: [u8; KEY_LEN],
    pub pump_client_key: [u8; KEY_LEN],
    pub key_response_address: u8,
    pub pump_id: String,
}

impl InvariantPumpData {
    pub fn client_pump_cipher(&self) -> Cipher {
        Cipher::new(self.client_pump_key)
    }

    pub fn pump_client_cipher(&self) -> Cipher {
        Cipher::new(self.pump_client_key)
    }
}

/// The per-pump state that changes across sessions (spec.md §3 "Volatile
/// pump state"): only the TX nonce, whose durability-before-send ordering
/// is the one hard requirement in §5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolatilePumpState {
    pub current_tx_nonce: Nonce,
}

/// Everything persisted for one paired pump.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PumpRecord {
    invariant: InvariantPumpData,
    volatile: VolatilePumpState,
}

/// Collaborator interface for persisting per-pump pairing material and the
/// live TX nonce (spec.md §6). Implementations must make
/// `set_current_tx_nonce` durable before returning, since the session layer
/// relies on write-ahead nonce persistence (spec.md §5).
pub trait PumpStateStore: Send + Sync {
    fn create_pump_state(&self, address: &PumpAddress, data: InvariantPumpData) -> Result<()>;

    fn delete_pump_state(&self, address: &PumpAddress) -> Result<bool>;

    fn has_pump_state(&self, address: &PumpAddress) -> Result<bool>;

    fn available_pump_state_addresses(&self) -> Result<Vec<PumpAddress>>;

    fn invariant_pump_data(&self, address: &PumpAddress) -> Result<InvariantPumpData>;

    fn current_tx_nonce(&self, address: &PumpAddress) -> Result<Nonce>;

    fn set_current_tx_nonce(&self, address: &PumpAddress, nonce: Nonce) -> Result<()>;
}

/// An ephemeral, process-lifetime store. Intended for tests and for
/// embedders who re-pair on every run.
#[derive(Default)]
pub struct InMemoryPumpStateStore {
    records: RwLock<HashMap<PumpAddress, PumpRecord>>,
}

impl InMemoryPumpStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PumpStateStore for InMemoryPumpStateStore {
    fn create_pump_state(&self, address: &PumpAddress, data: InvariantPumpData) -> Result<()> {
        let mut records = self.records.write().expect("store lock poisoned");
        records.insert(
            address.clone(),
            PumpRecord { invariant: data, volatile: VolatilePumpState { current_tx_nonce: Nonce::zero() } },
        );
        Ok(())
    }

    fn delete_pump_state(&self, address: &PumpAddress) -> Result<bool> {
        let mut records = self.records.write().expect("store lock poisoned");
        Ok(records.remove(address).is_some())
    }

    fn has_pump_state(&self, address: &PumpAddress) -> Result<bool> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records.contains_key(address))
    }

    fn available_pump_state_addresses(&self) -> Result<Vec<PumpAddress>> {
        let records = self.records.read().expect("store lock poisoned");
        Ok(records.keys().cloned().collect())
    }

    fn invariant_pump_data(&self, address: &PumpAddress) -> Result<InvariantPumpData> {
        let records = self.records.read().expect("store lock poisoned");
        records.get(address).map(|r| r.invariant.clone()).ok_or(Error::NotPaired)
    }

    fn current_tx_nonce(&self, address: &PumpAddress) -> Result<Nonce> {
        let records = self.records.read().expect("store lock poisoned");
        records.get(address).map(|r| r.volatile.current_tx_nonce).ok_or(Error::NotPaired)
    }

    fn set_current_tx_nonce(&self, address: &PumpAddress, nonce: Nonce) -> Result<()> {
        let mut records = self.records.write().expect("store lock poisoned");
        let record = records.get_mut(address).ok_or(Error::NotPaired)?;
        record.volatile.current_tx_nonce = nonce;
        Ok(())
    }
}

/// A JSON-file-per-address store under a configured directory. The on-disk
/// format is this crate's own choice (spec.md §9 deliberately leaves
/// serialization format to the implementer); one file per address keeps a
/// single `set_current_tx_nonce` call a single-file `fs::write`, which is as
/// close to atomic as this crate gets without introducing a WAL.
pub struct FileBackedPumpStateStore {
    directory: PathBuf,
    // A per-process lock serializes writes; cross-process concurrent access
    // to the same directory is not a supported use case.
    guard: RwLock<()>,
}

impl FileBackedPumpStateStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        FileBackedPumpStateStore { directory: directory.into(), guard: RwLock::new(()) }
    }

    fn path_for(&self, address: &PumpAddress) -> PathBuf {
        self.directory.join(format!("{}.json", address.as_str().replace(':', "-")))
    }

    fn read_record(&self, address: &PumpAddress) -> Result<PumpRecord> {
        let bytes = fs::read(self.path_for(address)).map_err(|_| Error::NotPaired)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedPacket(format!("corrupt pump state file: {e}")))
    }

    fn write_record(&self, address: &PumpAddress, record: &PumpRecord) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::MalformedPacket(format!("failed to serialize pump state: {e}")))?;
        fs::write(self.path_for(address), bytes)?;
        Ok(())
    }
}

impl PumpStateStore for FileBackedPumpStateStore {
    fn create_pump_state(&self, address: &PumpAddress, data: InvariantPumpData) -> Result<()> {
        let _guard = self.guard.write().expect("store lock poisoned");
        let record = PumpRecord { invariant: data, volatile: VolatilePumpState { current_tx_nonce: Nonce::zero() } };
        self.write_record(address, &record)
    }

    fn delete_pump_state(&self, address: &PumpAddress) -> Result<bool> {
        let _guard = self.guard.write().expect("store lock poisoned");
        match fs::remove_file(self.path_for(address)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::TransportIo(e)),
        }
    }

    fn has_pump_state(&self, address: &PumpAddress) -> Result<bool> {
        let _guard = self.guard.read().expect("store lock poisoned");
        Ok(self.path_for(address).exists())
    }

    fn available_pump_state_addresses(&self) -> Result<Vec<PumpAddress>> {
        let _guard = self.guard.read().expect("store lock poisoned");

        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut addresses = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                addresses.push(PumpAddress::new(stem.replace('-', ":")));
            }
        }
        Ok(addresses)
    }

    fn invariant_pump_data(&self, address: &PumpAddress) -> Result<InvariantPumpData> {
        let _guard = self.guard.read().expect("store lock poisoned");
        Ok(self.read_record(address)?.invariant)
    }

    fn current_tx_nonce(&self, address: &PumpAddress) -> Result<Nonce> {
        let _guard = self.guard.read().expect("store lock poisoned");
        Ok(self.read_record(address)?.volatile.current_tx_nonce)
    }

    fn set_current_tx_nonce(&self, address: &PumpAddress, nonce: Nonce) -> Result<()> {
        let _guard = self.guard.write().expect("store lock poisoned");
        let mut record = self.read_record(address)?;
        record.volatile.current_tx_nonce = nonce;
        self.write_record(address, &record)
    }
}
