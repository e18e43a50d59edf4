//! `PumpManager` (spec.md §6 "Public core API"): discovery-driven pairing,
//! the set of already-paired addresses, and `Pump` acquisition/release.
//!
//! Ownership mirrors spec.md §5: the manager owns a mapping from address to
//! either an in-flight pairing or a live `Pump`; at most one `Pump` exists
//! per address at a time, enforced by `acquire_pump` handing back the same
//! `Arc<Pump>` on repeated calls rather than constructing a second one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::bluetooth::{BluetoothInterface, PinProvider, PumpAddress};
use crate::error::{Error, Result};
use crate::orchestrator::ConnectConfig;
use crate::pairing;
use crate::pump::Pump;
use crate::store::PumpStateStore;
use crate::transport::session::SessionConfig;

/// The outcome of a successful [`PumpManager::pair_with_new_pump`] call.
#[derive(Debug, Clone)]
pub struct PairingResult {
    pub address: PumpAddress,
    pub pump_id: String,
}

pub struct PumpManager {
    bluetooth: Arc<dyn BluetoothInterface>,
    store: Arc<dyn PumpStateStore>,
    session_config: SessionConfig,
    connect_config: ConnectConfig,
    active: Mutex<HashMap<PumpAddress, Arc<Pump>>>,
}

impl PumpManager {
    pub fn new(bluetooth: Arc<dyn BluetoothInterface>, store: Arc<dyn PumpStateStore>) -> Self {
        Self::with_config(bluetooth, store, SessionConfig::default(), ConnectConfig::default())
    }

    pub fn with_config(
        bluetooth: Arc<dyn BluetoothInterface>,
        store: Arc<dyn PumpStateStore>,
        session_config: SessionConfig,
        connect_config: ConnectConfig,
    ) -> Self {
        PumpManager { bluetooth, store, session_config, connect_config, active: Mutex::new(HashMap::new()) }
    }

    /// Discover a single new pump for up to `discovery_duration`, pair with
    /// it, and persist the resulting pairing material. Times out with
    /// [`Error::Timeout`] if nothing is found in time.
    pub async fn pair_with_new_pump(
        &self,
        discovery_duration: Duration,
        pin_provider: Arc<dyn PinProvider>,
        friendly_name: &str,
    ) -> Result<PairingResult> {
        let (found_tx, mut found_rx) = mpsc::channel::<PumpAddress>(1);

        self.bluetooth.start_discovery(
            pin_provider.clone(),
            Box::new(move |address| {
                let _ = found_tx.try_send(address);
            }),
            Box::new(|_address| {}),
        )?;

        let discovered = tokio::time::timeout(discovery_duration, found_rx.recv()).await;
        let _ = self.bluetooth.stop_discovery();

        let address = match discovered {
            Ok(Some(address)) => address,
            _ => return Err(Error::Timeout),
        };

        let transport = self.bluetooth.get_device(&address)?.into_duplex();
        let outcome = pairing::pair(transport, &address, pin_provider.as_ref(), friendly_name).await?;

        self.store.create_pump_state(&address, outcome.invariant.clone())?;
        self.store.set_current_tx_nonce(&address, outcome.next_tx_nonce)?;

        Ok(PairingResult { address, pump_id: outcome.invariant.pump_id })
    }

    pub fn get_paired_pump_addresses(&self) -> Result<Vec<PumpAddress>> {
        self.store.available_pump_state_addresses()
    }

    /// Hand back the live `Pump` for `address`, constructing one on first
    /// call. Repeated calls for the same address return the same instance.
    pub async fn acquire_pump(&self, address: &PumpAddress) -> Result<Arc<Pump>> {
        let mut active = self.active.lock().await;
        if let Some(pump) = active.get(address) {
            return Ok(pump.clone());
        }

        if !self.store.has_pump_state(address)? {
            return Err(Error::NotPaired);
        }

        let pump = Arc::new(Pump::new(
            address.clone(),
            self.bluetooth.clone(),
            self.store.clone(),
            self.session_config.clone(),
            self.connect_config.clone(),
        ));
        active.insert(address.clone(), pump.clone());
        Ok(pump)
    }

    /// Disconnect and drop the manager's handle to `address`'s `Pump`, if
    /// one was acquired.
    pub async fn release_pump(&self, address: &PumpAddress) {
        let pump = self.active.lock().await.remove(address);
        if let Some(pump) = pump {
            let _ = pump.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::MockBluetoothInterface;
    use crate::store::InMemoryPumpStateStore;

    struct NeverAskedPin;
    impl PinProvider for NeverAskedPin {
        fn provide_pin(&self, _address: &PumpAddress) -> crate::bluetooth::PinResult {
            unreachable!("discovery never finds a device in this test")
        }
    }

    #[tokio::test]
    async fn pairing_with_no_discovered_device_times_out() {
        let bluetooth: Arc<dyn BluetoothInterface> = Arc::new(MockBluetoothInterface::new());
        let store: Arc<dyn PumpStateStore> = Arc::new(InMemoryPumpStateStore::new());
        let manager = PumpManager::new(bluetooth, store);

        let result = manager.pair_with_new_pump(Duration::from_millis(20), Arc::new(NeverAskedPin), "test-client").await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn acquiring_an_unpaired_address_fails() {
        let bluetooth: Arc<dyn BluetoothInterface> = Arc::new(MockBluetoothInterface::new());
        let store: Arc<dyn PumpStateStore> = Arc::new(InMemoryPumpStateStore::new());
        let manager = PumpManager::new(bluetooth, store);

        let address = PumpAddress::new("00:00:00:00:00:00");
        assert!(matches!(manager.acquire_pump(&address).await, Err(Error::NotPaired)));
    }

    #[tokio::test]
    async fn acquire_pump_returns_the_same_instance_on_repeated_calls() {
        let bluetooth: Arc<dyn BluetoothInterface> = Arc::new(MockBluetoothInterface::new());
        let store: Arc<dyn PumpStateStore> = Arc::new(InMemoryPumpStateStore::new());
        let address = PumpAddress::new("AA:AA:AA:AA:AA:AA");
        store
            .create_pump_state(
                &address,
                crate::store::InvariantPumpData {
                    client_pump_key: [0u8; 16],
                    pump_client_key: [0u8; 16],
                    key_response_address: 0,
                    pump_id: "PUMP_TEST".into(),
                },
            )
            .unwrap();

        let manager = PumpManager::new(bluetooth, store);
        let first = manager.acquire_pump(&address).await.unwrap();
        let second = manager.acquire_pump(&address).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
