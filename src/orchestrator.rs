//! The connection orchestrator (spec.md §4.8): the linear transport-open →
//! TL regular-connection → CTRL_CONNECT → CTRL_GET_SERVICE_VERSION →
//! CTRL_BIND → CTRL_ACTIVATE_SERVICE(RT_MODE) pipeline, with progress
//! reporting and best-effort teardown on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::app::{ctrl, Dispatcher, ServiceId};
use crate::bluetooth::PumpAddress;
use crate::error::Result;
use crate::nonce::Nonce;
use crate::store::{InvariantPumpData, PumpStateStore};
use crate::transport::packet::Address;
use crate::transport::session::{Session, SessionConfig};

/// Tunables for the app-layer handshake: the serial number CTRL_CONNECT
/// advertises and the service version CTRL_ACTIVATE_SERVICE requests.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub client_serial_number: u32,
    pub rt_mode_version: (u8, u8),
    pub response_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            client_serial_number: 1,
            rt_mode_version: (1, 0),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// The live session and app-layer dispatcher handed back once `connect()`
/// completes.
pub struct ConnectOutcome {
    pub session: Arc<Session>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Best-effort teardown if `connect()` is cancelled (its future dropped)
/// before reaching the end of the pipeline: CTRL_DISCONNECT if the app
/// layer is up, otherwise just the TL-level DISCONNECT, both fire-and-forget
/// since there is no task left alive to await them synchronously.
struct TeardownGuard {
    session: Arc<Session>,
    dispatcher: Option<Arc<Dispatcher>>,
    armed: bool,
}

impl TeardownGuard {
    fn new(session: Arc<Session>) -> Self {
        TeardownGuard { session, dispatcher: None, armed: true }
    }

    fn attach_dispatcher(&mut self, dispatcher: Arc<Dispatcher>) {
        self.dispatcher = Some(dispatcher);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        tracing::warn!("connect() aborted mid-pipeline, attempting best-effort teardown");
        let session = self.session.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            if let Some(dispatcher) = dispatcher {
                let _ = dispatcher.send_ctrl_no_response(ctrl::CTRL_DISCONNECT, Vec::new()).await;
            }
            session.close().await;
        });
    }
}

/// Run the full connect pipeline over an already-open transport, reporting
/// progress in `[0, 1]` after each step via `progress`.
pub async fn connect<T>(
    transport: T,
    invariant: &InvariantPumpData,
    tx_nonce: Nonce,
    store: Arc<dyn PumpStateStore>,
    address_key: PumpAddress,
    session_config: SessionConfig,
    connect_config: ConnectConfig,
    mut progress: impl FnMut(f32) + Send,
) -> Result<ConnectOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    const STEPS: f32 = 6.0;
    progress(0.0);

    let address = Address::from_raw(invariant.key_response_address);
    let session = Arc::new(Session::spawn(
        transport,
        invariant.client_pump_cipher(),
        invariant.pump_client_cipher(),
        address,
        tx_nonce,
        store,
        address_key,
        session_config,
    ));

    let mut teardown = TeardownGuard::new(session.clone());

    session.open_regular_connection().await?;
    progress(1.0 / STEPS);

    let dispatcher = Arc::new(Dispatcher::spawn(session.clone(), connect_config.response_timeout));
    teardown.attach_dispatcher(dispatcher.clone());
    progress(2.0 / STEPS);

    dispatcher
        .send_ctrl(ctrl::CTRL_CONNECT, ctrl::CTRL_CONNECT_RESPONSE, ctrl::connect_payload(connect_config.client_serial_number))
        .await?;
    progress(3.0 / STEPS);

    dispatcher
        .send_ctrl(ctrl::CTRL_GET_SERVICE_VERSION, ctrl::CTRL_SERVICE_VERSION_RESPONSE, Vec::new())
        .await?;
    progress(4.0 / STEPS);

    dispatcher.send_ctrl(ctrl::CTRL_BIND, ctrl::CTRL_BIND_RESPONSE, ctrl::bind_payload()).await?;
    progress(5.0 / STEPS);

    let (major, minor) = connect_config.rt_mode_version;
    dispatcher
        .send_ctrl(
            ctrl::CTRL_ACTIVATE_SERVICE,
            ctrl::CTRL_ACTIVATE_SERVICE_RESPONSE,
            ctrl::activate_service_payload(ServiceId::RtMode, major, minor),
        )
        .await?;
    progress(1.0);

    teardown.disarm();
    Ok(ConnectOutcome { session, dispatcher })
}

/// Switch out of RT_MODE and into COMMAND_MODE (spec.md §4.7 "Mode
/// switching"): only one service may be active, so this deactivates first.
pub async fn switch_to_command_mode(dispatcher: &Dispatcher, version: (u8, u8)) -> Result<()> {
    dispatcher
        .send_ctrl(ctrl::CTRL_DEACTIVATE_ALL_SERVICES, ctrl::CTRL_ALL_SERVICES_DEACTIVATED, Vec::new())
        .await?;

    let (major, minor) = version;
    dispatcher
        .send_ctrl(
            ctrl::CTRL_ACTIVATE_SERVICE,
            ctrl::CTRL_ACTIVATE_SERVICE_RESPONSE,
            ctrl::activate_service_payload(ServiceId::CommandMode, major, minor),
        )
        .await?;

    Ok(())
}

/// The reverse of [`switch_to_command_mode`]: deactivate then re-enter
/// RT_MODE.
pub async fn switch_to_rt_mode(dispatcher: &Dispatcher, version: (u8, u8)) -> Result<()> {
    dispatcher
        .send_ctrl(ctrl::CTRL_DEACTIVATE_ALL_SERVICES, ctrl::CTRL_ALL_SERVICES_DEACTIVATED, Vec::new())
        .await?;

    let (major, minor) = version;
    dispatcher
        .send_ctrl(
            ctrl::CTRL_ACTIVATE_SERVICE,
            ctrl::CTRL_ACTIVATE_SERVICE_RESPONSE,
            ctrl::activate_service_payload(ServiceId::RtMode, major, minor),
        )
        .await?;

    Ok(())
}
