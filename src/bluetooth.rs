//! The `BluetoothInterface` and `PinProvider` collaborators (spec.md §6).
//!
//! Neither transport I/O nor device discovery is implemented here; this
//! module only names the interfaces the rest of the crate is built against,
//! plus a `MockBluetoothInterface` test double, mirroring how the teacher's
//! `att`/`sm` modules are written against capability traits rather than a
//! concrete BlueZ/Android backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A Bluetooth device address, kept as its canonical colon-hex string
/// rather than a packed `[u8; 6]` so it can double as a stable, human
/// readable key for `PumpStateStore` and `FileBacked` filenames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PumpAddress(String);

impl PumpAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PumpAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PumpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any transport the embedder hands us just needs to be a duplex byte
/// stream; blanket-implemented so `tokio::io::DuplexStream`, a TCP socket,
/// or an RFCOMM wrapper all satisfy it without adapter code.
pub trait ByteStreamTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStreamTransport for T {}

/// The PIN a human reads off the pump's screen during pairing, or a
/// cancellation of the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResult {
    Pin { digits: [u8; 10] },
    Cancelled,
}

/// Supplies the PIN for a given pump during `REQUEST_KEYS`/`GET_AVAILABLE_KEYS`
/// (spec.md §4.5 step 4). Implemented by the embedding UI.
pub trait PinProvider: Send + Sync {
    fn provide_pin(&self, address: &PumpAddress) -> PinResult;
}

/// Discovery/pairing-adjacent operations the core needs from the platform's
/// Bluetooth stack (spec.md §6). `get_device` hands back a transport; actual
/// RFCOMM/SDP/BlueZ/Android plumbing is the embedder's responsibility.
pub trait BluetoothInterface: Send + Sync {
    fn start_discovery(
        &self,
        pin_provider: Arc<dyn PinProvider>,
        on_paired_device_found: Box<dyn Fn(PumpAddress) + Send + Sync>,
        on_device_unpaired: Box<dyn Fn(PumpAddress) + Send + Sync>,
    ) -> Result<()>;

    fn stop_discovery(&self) -> Result<()>;

    fn unpair_device(&self, address: &PumpAddress) -> Result<()>;

    fn get_device(&self, address: &PumpAddress) -> Result<Box<dyn ByteStreamTransportHandle>>;

    fn adapter_friendly_name(&self) -> Result<String>;
}

/// An opened transport handle, boxed so `BluetoothInterface::get_device` can
/// return it as a trait object; `into_inner` recovers the concrete stream to
/// hand to `tokio_util::codec::Framed`.
pub trait ByteStreamTransportHandle: Send {
    fn into_duplex(self: Box<Self>) -> tokio::io::DuplexStream;
}

/// A fixed-pairing-count in-memory double for tests: `get_device` returns
/// one end of a `tokio::io::duplex` whose other end the test drives as the
/// simulated pump.
#[derive(Default)]
pub struct MockBluetoothInterface {
    devices: Mutex<HashMap<PumpAddress, tokio::io::DuplexStream>>,
}

impl MockBluetoothInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulated pump at `address`, returning the peer end for
    /// the test to drive.
    pub fn register(&self, address: PumpAddress, buffer: usize) -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(buffer);
        self.devices.lock().expect("mock lock poisoned").insert(address, ours);
        theirs
    }
}

struct MockTransportHandle(tokio::io::DuplexStream);

impl ByteStreamTransportHandle for MockTransportHandle {
    fn into_duplex(self: Box<Self>) -> tokio::io::DuplexStream {
        self.0
    }
}

impl BluetoothInterface for MockBluetoothInterface {
    fn start_discovery(
        &self,
        _pin_provider: Arc<dyn PinProvider>,
        _on_paired_device_found: Box<dyn Fn(PumpAddress) + Send + Sync>,
        _on_device_unpaired: Box<dyn Fn(PumpAddress) + Send + Sync>,
    ) -> Result<()> {
        Ok(())
    }

    fn stop_discovery(&self) -> Result<()> {
        Ok(())
    }

    fn unpair_device(&self, address: &PumpAddress) -> Result<()> {
        self.devices.lock().expect("mock lock poisoned").remove(address);
        Ok(())
    }

    fn get_device(&self, address: &PumpAddress) -> Result<Box<dyn ByteStreamTransportHandle>> {
        let mut devices = self.devices.lock().expect("mock lock poisoned");
        let stream = devices.remove(address).ok_or(crate::error::Error::NotPaired)?;
        Ok(Box::new(MockTransportHandle(stream)))
    }

    fn adapter_friendly_name(&self) -> Result<String> {
        Ok("pump-link-mock-adapter".into())
    }
}
