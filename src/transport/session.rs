//! The post-pairing transport-layer session (spec.md §4.6): authenticated
//! send/receive, the reliability-bit ACK protocol, sequence-bit alternation,
//! retransmit/timeout policy, and error-packet surfacing.
//!
//! Scheduling mirrors spec.md §5: a receiver task owns the transport's read
//! half and is the only place frames are parsed and authenticated; the
//! caller-driven sender pushes onto a bounded queue drained by a dedicated
//! sender task, so reliable sends are strict stop-and-wait (one outstanding
//! at a time) and per-pump send ordering is preserved.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;

use crate::cipher::Cipher;
use crate::error::{Error, Result};
use crate::framing::FrameCodec;
use crate::nonce::Nonce;
use crate::bluetooth::PumpAddress;
use crate::store::PumpStateStore;
use crate::transport::packet::{Address, CommandId, TlPacket, PROTOCOL_VERSION};

/// Tunables called out by spec.md (recommended 1.5s retransmit timer) and
/// the backpressure bound for the outgoing/incoming queues.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub retransmit_timeout: Duration,
    pub outgoing_queue_depth: usize,
    pub data_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            retransmit_timeout: Duration::from_millis(1500),
            outgoing_queue_depth: 16,
            data_queue_depth: 64,
        }
    }
}

struct SendRequest {
    command: CommandId,
    payload: Vec<u8>,
    reliable: bool,
    /// Set only for ACK_RESPONSE: the sequence bit to echo back is the
    /// acknowledged packet's, not our own outgoing alternation.
    sequence_bit_override: Option<bool>,
    completion: oneshot::Sender<Result<()>>,
}

struct SessionContext {
    cp_cipher: Cipher,
    pc_cipher: Cipher,
    address: Address,
    nonce: Mutex<Nonce>,
    store: Arc<dyn PumpStateStore>,
    address_key: PumpAddress,
}

impl SessionContext {
    fn build_outgoing(&self, command: CommandId, sequence_bit: bool, reliability_bit: bool, payload: Vec<u8>, nonce: Nonce) -> TlPacket {
        let mut packet = TlPacket {
            version: PROTOCOL_VERSION,
            command,
            sequence_bit,
            reliability_bit,
            address: self.address,
            nonce,
            payload,
            mac: [0u8; crate::cipher::MAC_LEN],
        };

        packet.mac = self.cp_cipher.mac(&packet.header_and_body());
        packet
    }

    /// Reserve the next TX nonce: durably persist the post-increment value
    /// *before* returning the value to be used on the wire, per spec.md's
    /// write-ahead requirement.
    async fn reserve_nonce(&self) -> Result<Nonce> {
        let mut guard = self.nonce.lock().await;
        let this_nonce = *guard;

        let (next, wrapped) = guard.incremented();
        if wrapped {
            return Err(Error::NonceViolation);
        }

        self.store.set_current_tx_nonce(&self.address_key, next)?;
        *guard = next;

        Ok(this_nonce)
    }

    fn authenticate_incoming(&self, packet: &TlPacket) -> Result<()> {
        if packet.command.is_crc_authenticated() || packet.command.uses_weak_cipher() {
            // Not reachable post-pairing: these command IDs only appear during the
            // pairing sub-flow, which runs before a `Session` exists.
            return Err(Error::UnexpectedCommand(packet.command));
        }

        let body = packet.header_and_body();
        if self.pc_cipher.verify(&body, &packet.mac) {
            Ok(())
        } else {
            Err(Error::AuthenticationFailure)
        }
    }
}

type AckSlot = Arc<Mutex<Option<(bool, oneshot::Sender<()>)>>>;

pub struct Session {
    outgoing: mpsc::Sender<SendRequest>,
    data_rx: Mutex<mpsc::Receiver<TlPacket>>,
    fatal: Arc<Mutex<Option<Error>>>,
    _receiver: tokio::task::JoinHandle<()>,
    _sender: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Spawn the receiver and sender tasks over an already-open transport.
    /// Pairing must have already produced `cp_cipher`/`pc_cipher`/`address`
    /// and the caller must supply the nonce to resume from (persisted, or
    /// `Nonce::one()` immediately after pairing per spec.md §4.5 step 7).
    pub fn spawn<T>(
        transport: T,
        cp_cipher: Cipher,
        pc_cipher: Cipher,
        address: Address,
        initial_tx_nonce: Nonce,
        store: Arc<dyn PumpStateStore>,
        address_key: PumpAddress,
        config: SessionConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(transport, FrameCodec::default());
        let (sink, stream) = framed.split();

        let context = Arc::new(SessionContext {
            cp_cipher,
            pc_cipher,
            address,
            nonce: Mutex::new(initial_tx_nonce),
            store,
            address_key,
        });

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<SendRequest>(config.outgoing_queue_depth);
        let (data_tx, data_rx) = mpsc::channel::<TlPacket>(config.data_queue_depth);

        let ack_slot: AckSlot = Arc::new(Mutex::new(None));
        let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let sender = tokio::spawn(run_sender(
            context.clone(),
            sink,
            outgoing_rx,
            ack_slot.clone(),
            config.retransmit_timeout,
        ));

        let receiver = tokio::spawn(run_receiver(
            context,
            stream,
            data_tx,
            ack_slot,
            fatal.clone(),
            outgoing_tx.clone(),
        ));

        Session {
            outgoing: outgoing_tx,
            data_rx: Mutex::new(data_rx),
            fatal,
            _receiver: receiver,
            _sender: sender,
        }
    }

    async fn submit(&self, command: CommandId, payload: Vec<u8>, reliable: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.outgoing
            .send(SendRequest { command, payload, reliable, sequence_bit_override: None, completion: tx })
            .await
            .map_err(|_| Error::InvalidState("session sender task has exited".into()))?;

        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Send a packet that alternates the sequence bit and blocks until it
    /// is ACKed (retransmitting once on timeout).
    pub async fn send_reliable(&self, command: CommandId, payload: Vec<u8>) -> Result<()> {
        self.submit(command, payload, true).await
    }

    /// Send a packet with no ACK expectation (RT_BUTTON_STATUS, RT_DISPLAY
    /// acknowledgements are not reliable per spec.md §4.7).
    pub async fn send_unreliable(&self, command: CommandId, payload: Vec<u8>) -> Result<()> {
        self.submit(command, payload, false).await
    }

    /// The next authenticated DATA packet, in arrival order. Returns the
    /// session's fatal error (ERROR_RESPONSE, authentication failure, or a
    /// clean DISCONNECT) once the receiver task has shut down and the
    /// queue has drained.
    pub async fn recv_data(&self) -> Result<TlPacket> {
        let mut guard = self.data_rx.lock().await;

        match guard.recv().await {
            Some(packet) => Ok(packet),
            None => Err(self
                .fatal
                .lock()
                .await
                .take()
                .unwrap_or(Error::InvalidState("session closed".into()))),
        }
    }

    /// Best-effort clean shutdown: send an unreliable DISCONNECT if the
    /// sender task is still alive, ignoring any error.
    pub async fn close(&self) {
        let _ = self.send_unreliable(CommandId::Disconnect, Vec::new()).await;
    }

    /// Run spec.md §4.6 steps 1-2: send REQUEST_REGULAR_CONNECTION and wait
    /// for REGULAR_CONNECTION_REQUEST_ACCEPTED before any application-layer
    /// traffic is sent. Must be called exactly once, immediately after
    /// `spawn`, before `recv_data`/`send_reliable` are used for anything
    /// else.
    pub async fn open_regular_connection(&self) -> Result<()> {
        self.send_reliable(CommandId::RequestRegularConnection, Vec::new()).await?;

        let reply = self.recv_data().await?;
        if reply.command != CommandId::RegularConnectionRequestAccepted {
            return Err(Error::UnexpectedCommand(reply.command));
        }

        Ok(())
    }
}

async fn run_sender<S>(
    ctx: Arc<SessionContext>,
    mut sink: S,
    mut outgoing_rx: mpsc::Receiver<SendRequest>,
    ack_slot: AckSlot,
    retransmit_timeout: Duration,
) where
    S: Sink<Vec<u8>> + Unpin,
{
    let mut next_seq_bit = false;

    while let Some(req) = outgoing_rx.recv().await {
        let seq_bit = req.sequence_bit_override.unwrap_or(next_seq_bit);
        let result = send_one(&ctx, &mut sink, &ack_slot, retransmit_timeout, &req, seq_bit).await;

        if req.reliable && req.sequence_bit_override.is_none() && result.is_ok() {
            next_seq_bit = !next_seq_bit;
        }

        let _ = req.completion.send(result);
    }

    tracing::debug!("session sender task exiting: outgoing queue closed");
}

async fn send_one<S>(
    ctx: &Arc<SessionContext>,
    sink: &mut S,
    ack_slot: &AckSlot,
    retransmit_timeout: Duration,
    req: &SendRequest,
    seq_bit: bool,
) -> Result<()>
where
    S: Sink<Vec<u8>> + Unpin,
{
    let nonce = ctx.reserve_nonce().await?;
    let packet = ctx.build_outgoing(req.command, seq_bit, req.reliable, req.payload.clone(), nonce);
    let bytes = packet.serialize();

    if !req.reliable {
        return sink
            .send(bytes)
            .await
            .map_err(|_| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "send failed")));
    }

    for attempt in 0..2 {
        let (ack_tx, ack_rx) = oneshot::channel();
        *ack_slot.lock().await = Some((seq_bit, ack_tx));

        sink.send(bytes.clone())
            .await
            .map_err(|_| Error::TransportIo(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "send failed")))?;

        match tokio::time::timeout(retransmit_timeout, ack_rx).await {
            Ok(Ok(())) => return Ok(()),
            _ => {
                tracing::warn!(attempt, command = ?req.command, "reliable send timed out waiting for ACK");
                *ack_slot.lock().await = None;
            }
        }
    }

    Err(Error::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::PumpAddress;
    use crate::cipher::{KEY_LEN, MAC_LEN};
    use crate::store::{InMemoryPumpStateStore, InvariantPumpData};
    use futures_util::{SinkExt, StreamExt};

    fn signed(command: CommandId, sequence_bit: bool, address: Address, nonce: Nonce, payload: Vec<u8>, cipher: &Cipher) -> TlPacket {
        let mut packet = TlPacket {
            version: PROTOCOL_VERSION,
            command,
            sequence_bit,
            reliability_bit: false,
            address,
            nonce,
            payload,
            mac: [0u8; MAC_LEN],
        };
        packet.mac = cipher.mac(&packet.header_and_body());
        packet
    }

    #[tokio::test]
    async fn open_regular_connection_completes_the_handshake() {
        let (client_io, pump_io) = tokio::io::duplex(4096);
        let cp_cipher = Cipher::new([0x11; KEY_LEN]);
        let pc_cipher = Cipher::new([0x22; KEY_LEN]);
        let address = Address::new(0x1, 0x0);

        let store: Arc<dyn PumpStateStore> = Arc::new(InMemoryPumpStateStore::new());
        let key = PumpAddress::new("11:22:33:44:55:66");
        store
            .create_pump_state(
                &key,
                InvariantPumpData {
                    client_pump_key: *cp_cipher.key(),
                    pump_client_key: *pc_cipher.key(),
                    key_response_address: address.raw(),
                    pump_id: "PUMP_TEST".into(),
                },
            )
            .unwrap();

        let session = Session::spawn(client_io, cp_cipher.clone(), pc_cipher.clone(), address, Nonce::one(), store, key, SessionConfig::default());

        let pump_address = address.swapped();
        let pump_cp = cp_cipher.clone();
        let pump_pc = pc_cipher.clone();

        let pump_task = tokio::spawn(async move {
            let mut framed = Framed::new(pump_io, FrameCodec::default());

            let raw = framed.next().await.unwrap().unwrap();
            let request = TlPacket::parse(&raw).unwrap();
            assert_eq!(request.command, CommandId::RequestRegularConnection);
            assert!(pump_cp.verify(&request.header_and_body(), &request.mac));

            let ack = signed(CommandId::AckResponse, request.sequence_bit, pump_address, Nonce::zero(), Vec::new(), &pump_pc);
            framed.send(ack.serialize()).await.unwrap();

            let accepted = signed(CommandId::RegularConnectionRequestAccepted, false, pump_address, Nonce::zero(), Vec::new(), &pump_pc);
            framed.send(accepted.serialize()).await.unwrap();
        });

        session.open_regular_connection().await.unwrap();
        pump_task.await.unwrap();
    }

    #[tokio::test]
    async fn reliable_send_retransmits_once_then_succeeds_on_second_ack() {
        let (client_io, pump_io) = tokio::io::duplex(4096);
        let cp_cipher = Cipher::new([0x33; KEY_LEN]);
        let pc_cipher = Cipher::new([0x44; KEY_LEN]);
        let address = Address::new(0x1, 0x0);

        let store: Arc<dyn PumpStateStore> = Arc::new(InMemoryPumpStateStore::new());
        let key = PumpAddress::new("AA:AA:AA:AA:AA:AA");
        store
            .create_pump_state(
                &key,
                InvariantPumpData {
                    client_pump_key: *cp_cipher.key(),
                    pump_client_key: *pc_cipher.key(),
                    key_response_address: address.raw(),
                    pump_id: "PUMP_TEST".into(),
                },
            )
            .unwrap();

        let config = SessionConfig { retransmit_timeout: Duration::from_millis(50), ..SessionConfig::default() };
        let session = Session::spawn(client_io, cp_cipher.clone(), pc_cipher.clone(), address, Nonce::one(), store, key, config);

        let pump_pc = pc_cipher.clone();
        let pump_address = address.swapped();

        let pump_task = tokio::spawn(async move {
            let mut framed = Framed::new(pump_io, FrameCodec::default());

            // First attempt is silently dropped to force a retransmit.
            let first = framed.next().await.unwrap().unwrap();
            let first = TlPacket::parse(&first).unwrap();

            let second = framed.next().await.unwrap().unwrap();
            let second = TlPacket::parse(&second).unwrap();
            assert_eq!(first.sequence_bit, second.sequence_bit);
            assert_eq!(first.nonce, second.nonce);

            let ack = signed(CommandId::AckResponse, second.sequence_bit, pump_address, Nonce::zero(), Vec::new(), &pump_pc);
            framed.send(ack.serialize()).await.unwrap();
        });

        session.send_reliable(CommandId::Data, vec![0xAB]).await.unwrap();
        pump_task.await.unwrap();
    }
}

async fn run_receiver<St>(
    ctx: Arc<SessionContext>,
    mut stream: St,
    data_tx: mpsc::Sender<TlPacket>,
    ack_slot: AckSlot,
    fatal: Arc<Mutex<Option<Error>>>,
    outgoing_tx: mpsc::Sender<SendRequest>,
) where
    St: Stream<Item = std::result::Result<Vec<u8>, Error>> + Unpin,
{
    let mut last_acked_incoming: Option<bool> = None;

    while let Some(frame) = stream.next().await {
        let raw = match frame {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "frame decode error, resynchronizing");
                continue;
            }
        };

        let packet = match TlPacket::parse(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(error = %e, "malformed packet dropped");
                continue;
            }
        };

        match packet.command {
            CommandId::AckResponse => {
                let mut slot = ack_slot.lock().await;
                if let Some((expected, _)) = slot.as_ref() {
                    if *expected == packet.sequence_bit {
                        if let Some((_, tx)) = slot.take() {
                            let _ = tx.send(());
                        }
                    } else {
                        tracing::warn!("stale ACK sequence bit ignored");
                    }
                }
            }

            CommandId::ErrorResponse => {
                let code = packet.payload.first().copied().unwrap_or(0xFF);
                tracing::warn!(code, "pump reported ERROR_RESPONSE, session is now fatal");
                *fatal.lock().await = Some(Error::PumpError(code));
                break;
            }

            CommandId::Disconnect => {
                tracing::debug!("pump sent DISCONNECT, session ending cleanly");
                break;
            }

            CommandId::RegularConnectionRequestAccepted => {
                // Forwarded to the data queue rather than handled here so
                // `Session::open_regular_connection` can await it with the
                // same `recv_data` plumbing; it carries no reliability bit
                // and is never re-ACKed or deduplicated.
                if let Err(e) = ctx.authenticate_incoming(&packet) {
                    tracing::warn!(error = %e, "REGULAR_CONNECTION_REQUEST_ACCEPTED failed authentication, dropped");
                    continue;
                }

                if data_tx.send(packet).await.is_err() {
                    tracing::debug!("data consumer dropped, session receiver exiting");
                    break;
                }
            }

            CommandId::Data => {
                if let Err(e) = ctx.authenticate_incoming(&packet) {
                    tracing::warn!(error = %e, "DATA packet failed authentication, dropped");
                    continue;
                }

                if packet.reliability_bit {
                    // The ACK echoes the acknowledged packet's sequence bit, not our
                    // own outgoing alternation, so it's routed through the normal
                    // queue with an explicit override.
                    let (discard_tx, _discard_rx) = oneshot::channel();
                    let _ = outgoing_tx
                        .send(SendRequest {
                            command: CommandId::AckResponse,
                            payload: Vec::new(),
                            reliable: false,
                            sequence_bit_override: Some(packet.sequence_bit),
                            completion: discard_tx,
                        })
                        .await;

                    if last_acked_incoming == Some(packet.sequence_bit) {
                        tracing::debug!("duplicate reliable DATA packet re-ACKed and dropped");
                        continue;
                    }

                    last_acked_incoming = Some(packet.sequence_bit);
                }

                if data_tx.send(packet).await.is_err() {
                    tracing::debug!("data consumer dropped, session receiver exiting");
                    break;
                }
            }

            other => {
                tracing::warn!(command = ?other, "unexpected command dropped");
            }
        }
    }

    tracing::debug!("session receiver task exiting");
}
