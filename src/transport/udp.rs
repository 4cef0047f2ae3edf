use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::protocol::factory::{self, FrameType};
use crate::protocol::message::Message;
use crate::transport::{Received, Transport};

/// Largest possible UDP payload; every valid frame fits.
const RECV_BUF_SIZE: usize = 65536;

/// Datagram transport client: stop-and-wait delivery with per-message
/// acknowledgment, bounded retransmission, duplicate suppression and peer
/// address migration.
///
/// The server may rebind the port it sends from after the first exchange, so
/// the tracked peer address is adopted from every inbound datagram. All peer
/// tracking state is confined to this client and serialized by one lock; the
/// `waiting_for_confirm` flag keeps the background receive loop from racing
/// an in-progress send over the socket's reply channel.
pub struct UdpClient {
    socket: UdpSocket,
    confirm_timeout: Duration,
    max_retries: u8,
    state: Mutex<PeerState>,
    waiting_for_confirm: AtomicBool,
    stopped: AtomicBool,
    shutdown: Notify,
}

struct PeerState {
    server_addr: SocketAddr,
    next_message_id: u16,
    received_ids: FxHashSet<u16>,
}

impl Debug for UdpClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpClient{{timeout:{:?},retries:{}}}", self.confirm_timeout, self.max_retries)
    }
}

impl UdpClient {
    pub async fn new(
        server_addr: SocketAddr,
        confirm_timeout: Duration,
        max_retries: u8,
    ) -> anyhow::Result<UdpClient> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!(local = %socket.local_addr()?, server = %server_addr, "socket bound");

        Ok(UdpClient {
            socket,
            confirm_timeout,
            max_retries,
            state: Mutex::new(PeerState {
                server_addr,
                next_message_id: 0,
                received_ids: FxHashSet::default(),
            }),
            waiting_for_confirm: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn send_with_retries(&self, msg: &Message) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let message_id = state.next_message_id;
        state.next_message_id = state.next_message_id.wrapping_add(1);
        let frame = msg.serialize_binary(message_id);

        for attempt in 0..=self.max_retries {
            trace!(message_id, attempt, to = %state.server_addr, "sending datagram");
            self.socket.send_to(&frame, state.server_addr).await?;

            if self.await_confirm(&mut state, message_id).await? {
                trace!(message_id, "delivery confirmed");
                return Ok(());
            }
        }
        bail!(
            "no CONFIRM for message {} after {} attempts",
            message_id,
            self.max_retries as u32 + 1
        );
    }

    /// Waits up to the confirm timeout for the acknowledgment of
    /// `message_id`. Returns false when the attempt should be considered
    /// dropped: timeout, or an unrelated datagram arriving in the window
    /// (that datagram is discarded - known lossy simplification of the
    /// stop-and-wait design).
    async fn await_confirm(&self, state: &mut PeerState, message_id: u16) -> anyhow::Result<bool> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match time::timeout(self.confirm_timeout, self.socket.recv_from(&mut buf)).await {
            Err(_elapsed) => Ok(false),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((len, from))) => {
                adopt_peer(state, from);
                match factory::parse_binary(&buf[..len]) {
                    Ok((id, Message::Confirm)) if id == message_id => Ok(true),
                    other => {
                        debug!(message_id, ?other, "discarding datagram while awaiting CONFIRM");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Any datagram from an unknown source means the server moved its sending
/// port; adopt the new address for all subsequent sends.
fn adopt_peer(state: &mut PeerState, from: SocketAddr) {
    if state.server_addr != from {
        debug!(old = %state.server_addr, new = %from, "server address migrated");
        state.server_addr = from;
    }
}

#[async_trait]
impl Transport for UdpClient {
    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("transport is stopped");
        }

        // suppress the background receive loop for the duration of the
        // retry/await loop; it owns the socket's reply channel until cleared
        self.waiting_for_confirm.store(true, Ordering::Release);
        let result = self.send_with_retries(&msg).await;
        self.waiting_for_confirm.store(false, Ordering::Release);
        result
    }

    async fn receive(&self) -> anyhow::Result<Received> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(Received::Closed);
        }
        if self.waiting_for_confirm.load(Ordering::Acquire) {
            return Ok(Received::Idle);
        }

        let mut state = self.state.lock().await;
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let (len, from) = select! {
            _ = self.shutdown.notified() => return Ok(Received::Closed),
            read = time::timeout(self.confirm_timeout, self.socket.recv_from(&mut buf)) => {
                match read {
                    Err(_elapsed) => return Ok(Received::Idle),
                    Ok(Err(_)) if self.stopped.load(Ordering::Acquire) => {
                        return Ok(Received::Closed)
                    }
                    Ok(Err(e)) => {
                        // steady-state condition on an unreliable transport,
                        // not a failure of the session
                        warn!("datagram read failed: {}", e);
                        return Ok(Received::Idle);
                    }
                    Ok(Ok(read)) => read,
                }
            }
        };
        adopt_peer(&mut state, from);

        let frame = &buf[..len];
        if frame.len() < 3 {
            bail!("binary frame too short: {} bytes", frame.len());
        }
        let type_code = frame[0];
        let message_id = u16::from_be_bytes([frame[1], frame[2]]);

        if type_code == u8::from(FrameType::Confirm) {
            // transport-internal; a late or duplicate CONFIRM echoes one of
            // our own IDs and must not enter the dedup set
            trace!(message_id, "stray CONFIRM");
            return Ok(Received::Idle);
        }

        // acknowledge before dedup so a retransmitting server stops even
        // when our earlier CONFIRM was lost
        self.socket
            .send_to(&Message::Confirm.serialize_binary(message_id), from)
            .await?;

        if !state.received_ids.insert(message_id) {
            debug!(message_id, "suppressing duplicate datagram");
            return Ok(Received::Idle);
        }

        let (_, msg) = factory::parse_binary(frame)?;
        trace!(message_id, ?msg, "received datagram");
        Ok(Received::Message(msg))
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("stopping transport");
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    const SHORT_TIMEOUT: Duration = Duration::from_millis(50);

    async fn server_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv_frame(socket: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => Some((buf[..len].to_vec(), from)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_send_retransmits_exhaustively() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, SHORT_TIMEOUT, 2).await.unwrap();

        let result = client.send(Message::bye("Alice").unwrap()).await;
        assert!(result.is_err());

        // retries = 2 means exactly 3 transmission attempts, all identical
        let expected = Message::bye("Alice").unwrap().serialize_binary(0);
        for _ in 0..3 {
            let (frame, _) = recv_frame(&server).await.unwrap();
            assert_eq!(frame, expected.as_ref());
        }
        assert!(recv_frame(&server).await.is_none());
    }

    #[tokio::test]
    async fn test_send_succeeds_on_matching_confirm() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, Duration::from_millis(300), 2)
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let (frame, from) = recv_frame(&server).await.unwrap();
            let (id, msg) = factory::parse_binary(&frame).unwrap();
            server
                .send_to(&Message::Confirm.serialize_binary(id), from)
                .await
                .unwrap();
            (id, msg)
        });

        client.send(Message::bye("Alice").unwrap()).await.unwrap();

        let (id, msg) = responder.await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(msg, Message::bye("Alice").unwrap());
    }

    #[tokio::test]
    async fn test_message_ids_are_monotonic() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, Duration::from_millis(300), 0)
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..2 {
                let (frame, from) = recv_frame(&server).await.unwrap();
                let (id, _) = factory::parse_binary(&frame).unwrap();
                server
                    .send_to(&Message::Confirm.serialize_binary(id), from)
                    .await
                    .unwrap();
                ids.push(id);
            }
            ids
        });

        client.send(Message::bye("A").unwrap()).await.unwrap();
        client.send(Message::bye("B").unwrap()).await.unwrap();

        assert_eq!(responder.await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_receive_confirms_and_deduplicates() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, Duration::from_millis(300), 0)
            .await
            .unwrap();
        let client_addr = client.local_addr();

        let frame = Message::msg("Bob", "hi").unwrap().serialize_binary(5);
        server.send_to(&frame, client_addr).await.unwrap();

        assert_eq!(
            client.receive().await.unwrap(),
            Received::Message(Message::msg("Bob", "hi").unwrap())
        );
        let (confirm, _) = recv_frame(&server).await.unwrap();
        assert_eq!(confirm, Message::Confirm.serialize_binary(5).as_ref());

        // the retransmitted duplicate is confirmed again but not surfaced
        server.send_to(&frame, client_addr).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), Received::Idle);
        let (confirm, _) = recv_frame(&server).await.unwrap();
        assert_eq!(confirm, Message::Confirm.serialize_binary(5).as_ref());
    }

    #[tokio::test]
    async fn test_inbound_confirm_is_not_surfaced_or_acknowledged() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, SHORT_TIMEOUT, 0).await.unwrap();

        server
            .send_to(&Message::Confirm.serialize_binary(9), client.local_addr())
            .await
            .unwrap();

        assert_eq!(client.receive().await.unwrap(), Received::Idle);
        assert!(recv_frame(&server).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_timeout_is_idle() {
        let (_server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, SHORT_TIMEOUT, 0).await.unwrap();

        assert_eq!(client.receive().await.unwrap(), Received::Idle);
    }

    #[tokio::test]
    async fn test_peer_migration_redirects_sends() {
        let (original, original_addr) = server_socket().await;
        let (migrated, _) = server_socket().await;
        let client = UdpClient::new(original_addr, Duration::from_millis(300), 0)
            .await
            .unwrap();

        // server "rebinds": next datagram arrives from a different socket
        migrated
            .send_to(
                &Message::reply(true, "hi", 0).unwrap().serialize_binary(1),
                client.local_addr(),
            )
            .await
            .unwrap();
        assert!(matches!(
            client.receive().await.unwrap(),
            Received::Message(Message::Reply { .. })
        ));
        // drain the CONFIRM for the reply
        recv_frame(&migrated).await.unwrap();

        let responder = tokio::spawn(async move {
            let (frame, from) = recv_frame(&migrated).await.unwrap();
            let (id, _) = factory::parse_binary(&frame).unwrap();
            migrated
                .send_to(&Message::Confirm.serialize_binary(id), from)
                .await
                .unwrap();
            frame
        });

        client.send(Message::bye("Alice").unwrap()).await.unwrap();

        // the send went to the migrated address, not the original one
        responder.await.unwrap();
        assert!(recv_frame(&original).await.is_none());
    }

    #[tokio::test]
    async fn test_receive_is_suppressed_while_send_waits_for_confirm() {
        let (server, server_addr) = server_socket().await;
        let client = Arc::new(
            UdpClient::new(server_addr, Duration::from_millis(200), 3)
                .await
                .unwrap(),
        );

        let sender = {
            let client = client.clone();
            tokio::spawn(async move { client.send(Message::bye("Alice").unwrap()).await })
        };
        time::sleep(Duration::from_millis(30)).await;

        // a datagram is queued, but a send owns the reply channel
        server
            .send_to(
                &Message::msg("Bob", "hi").unwrap().serialize_binary(1),
                client.local_addr(),
            )
            .await
            .unwrap();
        assert_eq!(client.receive().await.unwrap(), Received::Idle);

        assert!(sender.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_error() {
        let (server, server_addr) = server_socket().await;
        let client = UdpClient::new(server_addr, Duration::from_millis(300), 0)
            .await
            .unwrap();

        server.send_to(&[0x04, 0x00], client.local_addr()).await.unwrap();

        assert!(client.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_unblocks_receive() {
        let (_server, server_addr) = server_socket().await;
        let client = Arc::new(
            UdpClient::new(server_addr, Duration::from_secs(5), 0).await.unwrap(),
        );

        let receiver = {
            let client = client.clone();
            tokio::spawn(async move { client.receive().await })
        };
        time::sleep(Duration::from_millis(20)).await;
        client.stop().await;
        client.stop().await;

        assert_eq!(receiver.await.unwrap().unwrap(), Received::Closed);
    }
}
