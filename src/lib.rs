//! A protocol core for a Bluetooth RFCOMM insulin pump: framing, pairing,
//! the post-pairing transport session, application-layer command framing,
//! RT display-frame reassembly, and the `PumpManager`/`Pump` public API.
//!
//! Bluetooth transport I/O, persistent storage backends, and UI layers are
//! named external collaborators (`BluetoothInterface`, `PumpStateStore`,
//! `PinProvider`) rather than implemented here; embedders supply concrete
//! implementations.

pub mod app;
pub mod bluetooth;
pub mod cipher;
pub mod display;
pub mod error;
pub mod framing;
pub mod manager;
pub mod nonce;
pub mod orchestrator;
pub mod pairing;
pub mod pump;
pub mod store;
pub mod transport;

pub use bluetooth::{BluetoothInterface, PinProvider, PinResult, PumpAddress};
pub use error::{Error, Result};
pub use manager::{PairingResult, PumpManager};
pub use pump::{Pump, PumpMode};
pub use store::{FileBackedPumpStateStore, InMemoryPumpStateStore, PumpStateStore};
