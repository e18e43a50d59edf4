//! The public per-pump handle (spec.md §6 "Public core API"): connect,
//! disconnect, RT button presses, and the mode/display streams. A `Pump` is
//! acquired from a [`crate::manager::PumpManager`] and owns its transport
//! connection, TL session, and app-layer dispatcher for as long as it is
//! connected.

use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};

use crate::app::command_mode::{self, CommandModeRequest};
use crate::app::{ctrl, rt, Dispatcher};
use crate::bluetooth::{BluetoothInterface, PumpAddress};
use crate::display::DisplayFrame;
use crate::error::{Error, Result};
use crate::orchestrator::{self, ConnectConfig};
use crate::store::PumpStateStore;
use crate::transport::session::{Session, SessionConfig};

/// The app-layer service currently active on the pump (spec.md §4.7 "Mode
/// switching"). Only meaningful while connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    Rt,
    Command,
}

enum PumpState {
    Disconnected,
    Connected { session: Arc<Session>, dispatcher: Arc<Dispatcher> },
}

struct LongPressHandle {
    cancel: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<Result<()>>,
}

/// A single paired pump, acquired via [`crate::manager::PumpManager::acquire_pump`].
pub struct Pump {
    address: PumpAddress,
    bluetooth: Arc<dyn BluetoothInterface>,
    store: Arc<dyn PumpStateStore>,
    session_config: SessionConfig,
    connect_config: ConnectConfig,
    state: Mutex<PumpState>,
    mode_tx: watch::Sender<PumpMode>,
    rt_seq: Arc<Mutex<rt::RtSeqCounter>>,
    long_press: Mutex<Option<LongPressHandle>>,
}

impl Pump {
    pub(crate) fn new(
        address: PumpAddress,
        bluetooth: Arc<dyn BluetoothInterface>,
        store: Arc<dyn PumpStateStore>,
        session_config: SessionConfig,
        connect_config: ConnectConfig,
    ) -> Self {
        let (mode_tx, _) = watch::channel(PumpMode::Rt);

        Pump {
            address,
            bluetooth,
            store,
            session_config,
            connect_config,
            state: Mutex::new(PumpState::Disconnected),
            mode_tx,
            rt_seq: Arc::new(Mutex::new(rt::RtSeqCounter::new())),
            long_press: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &PumpAddress {
        &self.address
    }

    /// Open the transport, run the connect pipeline (spec.md §4.8), and
    /// activate RT_MODE. `progress` is called with a fraction in `[0, 1]`.
    pub async fn connect(&self, progress: impl FnMut(f32) + Send) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, PumpState::Connected { .. }) {
            return Err(Error::InvalidState("pump is already connected".into()));
        }

        let invariant = self.store.invariant_pump_data(&self.address)?;
        let tx_nonce = self.store.current_tx_nonce(&self.address)?;
        let transport = self.bluetooth.get_device(&self.address)?.into_duplex();

        let outcome = orchestrator::connect(
            transport,
            &invariant,
            tx_nonce,
            self.store.clone(),
            self.address.clone(),
            self.session_config.clone(),
            self.connect_config.clone(),
            progress,
        )
        .await?;

        let _ = self.mode_tx.send(PumpMode::Rt);
        *state = PumpState::Connected { session: outcome.session, dispatcher: outcome.dispatcher };
        Ok(())
    }

    /// Best-effort CTRL_DISCONNECT followed by closing the transport.
    /// Idempotent: disconnecting an already-disconnected pump is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.stop_long_rt_button_press().await;

        let mut state = self.state.lock().await;
        if let PumpState::Connected { dispatcher, session } = std::mem::replace(&mut *state, PumpState::Disconnected) {
            let _ = dispatcher.send_ctrl_no_response(ctrl::CTRL_DISCONNECT, Vec::new()).await;
            session.close().await;
        }

        Ok(())
    }

    /// A momentary button press: one `statusChanged` packet for `button`,
    /// immediately followed by one for `NO_BUTTON` (spec.md §4.7 describes
    /// only the long-press sequence; a short press is its degenerate case
    /// with no held-status repetition in between).
    pub async fn send_short_rt_button_press(&self, button: u8) -> Result<()> {
        let dispatcher = self.connected_dispatcher().await?;

        let pressed_seq = self.rt_seq.lock().await.next();
        dispatcher.send_rt_button(rt::button_status_payload(pressed_seq, button, rt::STATUS_CHANGED)).await?;

        let released_seq = self.rt_seq.lock().await.next();
        dispatcher
            .send_rt_button(rt::button_status_payload(released_seq, rt::BUTTON_NONE, rt::STATUS_CHANGED))
            .await
    }

    /// Begin a long press: one `statusChanged` packet, then `statusHeld`
    /// packets every ~200ms until [`Pump::stop_long_rt_button_press`] is
    /// called (spec.md §4.7).
    pub async fn start_long_rt_button_press(&self, button: u8) -> Result<()> {
        let mut guard = self.long_press.lock().await;
        if guard.is_some() {
            return Err(Error::InvalidState("a long RT button press is already in progress".into()));
        }

        let dispatcher = self.connected_dispatcher().await?;

        let first_seq = self.rt_seq.lock().await.next();
        dispatcher.send_rt_button(rt::button_status_payload(first_seq, button, rt::STATUS_CHANGED)).await?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let seq_counter = self.rt_seq.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = tokio::time::sleep(rt::LONG_PRESS_TICK) => {
                        let seq = seq_counter.lock().await.next();
                        if dispatcher.send_rt_button(rt::button_status_payload(seq, button, rt::STATUS_HELD)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            let final_seq = seq_counter.lock().await.next();
            dispatcher
                .send_rt_button(rt::button_status_payload(final_seq, rt::BUTTON_NONE, rt::STATUS_CHANGED))
                .await
        });

        *guard = Some(LongPressHandle { cancel: cancel_tx, task });
        Ok(())
    }

    /// End a long press started with [`Pump::start_long_rt_button_press`],
    /// waiting for the final release packet to be sent. A no-op if no press
    /// is in progress.
    pub async fn stop_long_rt_button_press(&self) -> Result<()> {
        let handle = self.long_press.lock().await.take();

        match handle {
            Some(handle) => {
                let _ = handle.cancel.send(());
                handle.task.await.map_err(|_| Error::Cancelled)?
            }
            None => Ok(()),
        }
    }

    /// Deactivate RT_MODE and activate COMMAND_MODE (spec.md §4.7 "Mode switching").
    pub async fn enter_command_mode(&self) -> Result<()> {
        let dispatcher = self.connected_dispatcher().await?;
        orchestrator::switch_to_command_mode(&dispatcher, self.connect_config.rt_mode_version).await?;
        let _ = self.mode_tx.send(PumpMode::Command);
        Ok(())
    }

    /// The reverse of [`Pump::enter_command_mode`].
    pub async fn enter_rt_mode(&self) -> Result<()> {
        let dispatcher = self.connected_dispatcher().await?;
        orchestrator::switch_to_rt_mode(&dispatcher, self.connect_config.rt_mode_version).await?;
        let _ = self.mode_tx.send(PumpMode::Rt);
        Ok(())
    }

    /// A generic COMMAND_MODE request/response round trip (SPEC_FULL.md §4.10).
    pub async fn send_command_mode_request(&self, request: CommandModeRequest) -> Result<Vec<u8>> {
        let dispatcher = self.connected_dispatcher().await?;
        command_mode::send(&dispatcher, request).await
    }

    /// The pump's current mode, with the latest value available immediately
    /// to new subscribers.
    pub fn current_mode_stream(&self) -> impl Stream<Item = PumpMode> {
        WatchStream::new(self.mode_tx.subscribe())
    }

    /// Assembled RT_DISPLAY frames, in arrival order. Only emits while
    /// connected and in RT_MODE.
    pub async fn display_frame_stream(&self) -> Result<impl Stream<Item = DisplayFrame>> {
        let dispatcher = self.connected_dispatcher().await?;
        Ok(BroadcastStream::new(dispatcher.display_stream()).filter_map(|item| item.ok()))
    }

    async fn connected_dispatcher(&self) -> Result<Arc<Dispatcher>> {
        match &*self.state.lock().await {
            PumpState::Connected { dispatcher, .. } => Ok(dispatcher.clone()),
            PumpState::Disconnected => Err(Error::InvalidState("pump is not connected".into())),
        }
    }
}
