//! The application layer carried inside TL `Data` packets (spec.md §4.7):
//! the 4-byte app envelope, the CTRL/RT_MODE command tables, and the
//! `Dispatcher` that demultiplexes solicited CTRL/COMMAND_MODE responses
//! from unsolicited RT_DISPLAY frames coming out of a [`crate::transport::session::Session`].

pub mod command_mode;
pub mod ctrl;
pub mod rt;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex};

use crate::display::{DisplayAssembler, DisplayFrame};
use crate::error::{Error, Result};
use crate::transport::packet::CommandId;
use crate::transport::session::Session;

/// The app-layer envelope version byte, fixed at `0x10` for every service.
pub const APP_VERSION: u8 = 0x10;

/// Which app-layer service an envelope's `commandId` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceId {
    Control,
    RtMode,
    CommandMode,
}

impl ServiceId {
    pub fn raw(self) -> u8 {
        match self {
            ServiceId::Control => 0x00,
            ServiceId::RtMode => 0x48,
            ServiceId::CommandMode => 0xB7,
        }
    }

    pub fn try_from_raw(raw: u8) -> Result<Self> {
        match raw {
            0x00 => Ok(ServiceId::Control),
            0x48 => Ok(ServiceId::RtMode),
            0xB7 => Ok(ServiceId::CommandMode),
            other => Err(Error::MalformedPacket(format!("unknown app service ID {other:#04x}"))),
        }
    }
}

/// One app-layer frame: `version(1) | serviceId(1) | commandId(2, LE) | subPayload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPacket {
    pub service: ServiceId,
    pub command_id: u16,
    pub sub_payload: Vec<u8>,
}

impl AppPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.sub_payload.len());
        out.push(APP_VERSION);
        out.push(self.service.raw());
        out.extend_from_slice(&self.command_id.to_le_bytes());
        out.extend_from_slice(&self.sub_payload);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::MalformedPacket(format!("app packet shorter than its 4-byte header: {} bytes", raw.len())));
        }
        if raw[0] != APP_VERSION {
            return Err(Error::MalformedPacket(format!("unexpected app envelope version {:#04x}", raw[0])));
        }

        let service = ServiceId::try_from_raw(raw[1])?;
        let command_id = u16::from_le_bytes([raw[2], raw[3]]);
        Ok(AppPacket { service, command_id, sub_payload: raw[4..].to_vec() })
    }
}

type ResponseSlot = Arc<Mutex<Option<(u16, oneshot::Sender<AppPacket>)>>>;

/// Sits on top of a [`Session`] and demultiplexes its `recv_data()` stream:
/// CTRL and COMMAND_MODE each allow at most one outstanding request at a
/// time (the orchestrator and command-mode callers never pipeline), while
/// RT_DISPLAY frames are unsolicited and fed through a broadcast channel
/// after passing through the row assembler.
pub struct Dispatcher {
    session: Arc<Session>,
    ctrl_waiter: ResponseSlot,
    command_mode_waiter: ResponseSlot,
    display_tx: broadcast::Sender<DisplayFrame>,
    response_timeout: Duration,
    _demux: tokio::task::JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(session: Arc<Session>, response_timeout: Duration) -> Self {
        let (display_tx, _) = broadcast::channel(16);
        let ctrl_waiter: ResponseSlot = Arc::new(Mutex::new(None));
        let command_mode_waiter: ResponseSlot = Arc::new(Mutex::new(None));

        let demux = tokio::spawn(run_demux(
            session.clone(),
            ctrl_waiter.clone(),
            command_mode_waiter.clone(),
            display_tx.clone(),
        ));

        Dispatcher { session, ctrl_waiter, command_mode_waiter, display_tx, response_timeout, _demux: demux }
    }

    pub fn display_stream(&self) -> broadcast::Receiver<DisplayFrame> {
        self.display_tx.subscribe()
    }

    /// Send a CTRL request and wait for the matching `response_id`.
    pub async fn send_ctrl(&self, command_id: u16, response_id: u16, sub_payload: Vec<u8>) -> Result<AppPacket> {
        self.send_and_wait(&self.ctrl_waiter, ServiceId::Control, command_id, response_id, sub_payload).await
    }

    /// CTRL_DISCONNECT has no app-layer response; the TL ACK is all the
    /// confirmation there is.
    pub async fn send_ctrl_no_response(&self, command_id: u16, sub_payload: Vec<u8>) -> Result<()> {
        let packet = AppPacket { service: ServiceId::Control, command_id, sub_payload };
        self.session.send_reliable(CommandId::Data, packet.encode()).await
    }

    /// Send a COMMAND_MODE request and return the raw response sub-payload;
    /// semantic decoding is left to the caller (spec.md §4.10).
    pub async fn send_command_mode(&self, command_id: u16, sub_payload: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .send_and_wait(&self.command_mode_waiter, ServiceId::CommandMode, command_id, command_id, sub_payload)
            .await?;
        Ok(response.sub_payload)
    }

    /// RT_BUTTON_STATUS is sent unreliably with no app-layer response
    /// (spec.md §4.7).
    pub async fn send_rt_button(&self, sub_payload: Vec<u8>) -> Result<()> {
        let packet = AppPacket { service: ServiceId::RtMode, command_id: rt::RT_BUTTON_STATUS_COMMAND_ID, sub_payload };
        self.session.send_unreliable(CommandId::Data, packet.encode()).await
    }

    async fn send_and_wait(
        &self,
        slot: &ResponseSlot,
        service: ServiceId,
        command_id: u16,
        response_id: u16,
        sub_payload: Vec<u8>,
    ) -> Result<AppPacket> {
        let (tx, rx) = oneshot::channel();
        *slot.lock().await = Some((response_id, tx));

        let packet = AppPacket { service, command_id, sub_payload };
        if let Err(e) = self.session.send_reliable(CommandId::Data, packet.encode()).await {
            slot.lock().await.take();
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(app)) => Ok(app),
            _ => {
                slot.lock().await.take();
                Err(Error::Timeout)
            }
        }
    }
}

async fn run_demux(
    session: Arc<Session>,
    ctrl_waiter: ResponseSlot,
    command_mode_waiter: ResponseSlot,
    display_tx: broadcast::Sender<DisplayFrame>,
) {
    let mut assembler = DisplayAssembler::new();

    loop {
        let packet = match session.recv_data().await {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "dispatcher exiting: session data stream ended");
                break;
            }
        };

        let app = match AppPacket::decode(&packet.payload) {
            Ok(app) => app,
            Err(e) => {
                tracing::warn!(error = %e, "malformed app packet dropped");
                continue;
            }
        };

        match app.service {
            ServiceId::Control => complete_waiter(&ctrl_waiter, app, "CTRL").await,
            ServiceId::CommandMode => complete_waiter(&command_mode_waiter, app, "COMMAND_MODE").await,
            ServiceId::RtMode => {
                if app.command_id == rt::RT_DISPLAY_COMMAND_ID {
                    match rt::parse_rt_display(&app.sub_payload) {
                        Ok(update) => {
                            if let Some(frame) = assembler.accept(update.index, update.row, update.pixels) {
                                let _ = display_tx.send(frame);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "malformed RT_DISPLAY payload dropped"),
                    }
                } else {
                    tracing::warn!(command_id = app.command_id, "unexpected RT_MODE command dropped");
                }
            }
        }
    }
}

async fn complete_waiter(slot: &ResponseSlot, app: AppPacket, service_name: &str) {
    let mut guard = slot.lock().await;
    match guard.as_ref() {
        Some((expected, _)) if *expected == app.command_id => {
            if let Some((_, tx)) = guard.take() {
                let _ = tx.send(app);
            }
        }
        _ => {
            tracing::warn!(command_id = app.command_id, service = service_name, "unsolicited app response dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let packet = AppPacket { service: ServiceId::Control, command_id: 0x9055, sub_payload: vec![1, 2, 3, 4] };
        let encoded = packet.encode();

        assert_eq!(encoded, vec![0x10, 0x00, 0x55, 0x90, 1, 2, 3, 4]);
        assert_eq!(AppPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn wrong_version_byte_is_rejected() {
        let bytes = vec![0x11, 0x00, 0x55, 0x90];
        assert!(AppPacket::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_service_id_is_rejected() {
        let bytes = vec![0x10, 0x7F, 0x55, 0x90];
        assert!(AppPacket::decode(&bytes).is_err());
    }
}
