//! spec.md §8 scenario 6: a long RT button press emits one `statusChanged`,
//! then repeated `statusHeld` packets roughly every `LONG_PRESS_TICK`, then
//! a final `statusChanged` release once `stop_long_rt_button_press` is
//! called, driven here through the public `Pump` handle over a simulated
//! pump connection rather than the raw `rt` payload helpers directly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::codec::Framed;

use pump_link::app::{ctrl, rt, AppPacket, ServiceId};
use pump_link::bluetooth::{BluetoothInterface, MockBluetoothInterface, PumpAddress};
use pump_link::cipher::{Cipher, KEY_LEN};
use pump_link::framing::FrameCodec;
use pump_link::nonce::Nonce;
use pump_link::store::{InMemoryPumpStateStore, InvariantPumpData, PumpStateStore};
use pump_link::transport::packet::{Address, CommandId, TlPacket, PROTOCOL_VERSION};
use pump_link::PumpManager;

async fn send_signed<T>(framed: &mut Framed<T, FrameCodec>, command: CommandId, sequence_bit: bool, address: Address, payload: Vec<u8>, cipher: &Cipher)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut packet =
        TlPacket { version: PROTOCOL_VERSION, command, sequence_bit, reliability_bit: false, address, nonce: Nonce::zero(), payload, mac: [0u8; pump_link::cipher::MAC_LEN] };
    packet.mac = cipher.mac(&packet.header_and_body());
    use futures_util::SinkExt;
    framed.send(packet.serialize()).await.unwrap();
}

/// Drives the CTRL handshake so the test can connect a `Pump` without
/// repeating the full pipeline assertions every time.
async fn run_handshake<T>(framed: &mut Framed<T, FrameCodec>, pump_address: Address, pc_cipher: &Cipher)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use futures_util::SinkExt;

    let raw = framed.next().await.unwrap().unwrap();
    let request = TlPacket::parse(&raw).unwrap();
    assert_eq!(request.command, CommandId::RequestRegularConnection);
    send_signed(framed, CommandId::AckResponse, request.sequence_bit, pump_address, Vec::new(), pc_cipher).await;
    send_signed(framed, CommandId::RegularConnectionRequestAccepted, false, pump_address, Vec::new(), pc_cipher).await;

    let responses = [ctrl::CTRL_CONNECT_RESPONSE, ctrl::CTRL_SERVICE_VERSION_RESPONSE, ctrl::CTRL_BIND_RESPONSE, ctrl::CTRL_ACTIVATE_SERVICE_RESPONSE];
    for response_id in responses {
        let raw = framed.next().await.unwrap().unwrap();
        let data = TlPacket::parse(&raw).unwrap();
        assert_eq!(data.command, CommandId::Data);
        send_signed(framed, CommandId::AckResponse, data.sequence_bit, pump_address, Vec::new(), pc_cipher).await;

        let reply_payload = AppPacket { service: ServiceId::Control, command_id: response_id, sub_payload: vec![1, 0] }.encode();
        send_signed(framed, CommandId::Data, false, pump_address, reply_payload, pc_cipher).await;
    }
}

async fn recv_rt_button(framed: &mut Framed<tokio::io::DuplexStream, FrameCodec>) -> (u8, u8) {
    let raw = framed.next().await.unwrap().unwrap();
    let packet = TlPacket::parse(&raw).unwrap();
    assert_eq!(packet.command, CommandId::Data);
    let app = AppPacket::decode(&packet.payload).unwrap();
    assert_eq!(app.service, ServiceId::RtMode);
    assert_eq!(app.command_id, rt::RT_BUTTON_STATUS_COMMAND_ID);
    (app.sub_payload[2], app.sub_payload[3]) // (button, status)
}

#[tokio::test]
async fn long_press_emits_changed_then_held_then_changed_release() {
    let mock = MockBluetoothInterface::new();
    let address = PumpAddress::new("AA:BB:CC:DD:EE:03");
    let pump_side = mock.register(address.clone(), 8192);

    let cp_cipher = Cipher::new([0x11; KEY_LEN]);
    let pc_cipher = Cipher::new([0x22; KEY_LEN]);
    let tl_address = Address::new(0x6, 0x0);
    let pump_address = tl_address.swapped();

    let store = Arc::new(InMemoryPumpStateStore::new());
    store
        .create_pump_state(
            &address,
            InvariantPumpData { client_pump_key: *cp_cipher.key(), pump_client_key: *pc_cipher.key(), key_response_address: tl_address.raw(), pump_id: "PUMP_TEST".into() },
        )
        .unwrap();

    let bluetooth: Arc<dyn BluetoothInterface> = Arc::new(mock);
    let manager = PumpManager::new(bluetooth, store);

    let handshake_pc = pc_cipher.clone();
    let handshake = tokio::spawn(async move {
        let mut framed = Framed::new(pump_side, FrameCodec::default());
        run_handshake(&mut framed, pump_address, &handshake_pc).await;

        // Pressed, then at least two held re-announcements, then released.
        let (button, status) = recv_rt_button(&mut framed).await;
        assert_eq!(button, rt::BUTTON_DOWN);
        assert_eq!(status, rt::STATUS_CHANGED);

        for _ in 0..2 {
            let (held_button, status) = recv_rt_button(&mut framed).await;
            assert_eq!(held_button, rt::BUTTON_DOWN);
            assert_eq!(status, rt::STATUS_HELD);
        }

        let (released_button, status) = recv_rt_button(&mut framed).await;
        assert_eq!(released_button, rt::BUTTON_NONE);
        assert_eq!(status, rt::STATUS_CHANGED);
    });

    let pump = manager.acquire_pump(&address).await.unwrap();
    pump.connect(|_| {}).await.unwrap();

    pump.start_long_rt_button_press(rt::BUTTON_DOWN).await.unwrap();
    tokio::time::sleep(rt::LONG_PRESS_TICK * 2 + Duration::from_millis(100)).await;
    pump.stop_long_rt_button_press().await.unwrap();

    handshake.await.unwrap();
}
