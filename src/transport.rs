//! Frame transport: owns one socket and runs its read and write pumps.
//!
//! # Architecture
//!
//! ```text
//!   send(text) ──► outbound queue ──► write pump ──► WsWrite
//!                        ▲
//!                        │ pong / close ack
//!   WsRead ──► FrameReader (reassembly) ──► read pump ──► Router
//! ```
//!
//! The socket halves are moved into the pumps; no other code performs socket
//! I/O. Outbound messages are written in submission order by the single write
//! pump. The read pump treats any exit (peer close, I/O failure, stream end)
//! as fatal for the connection and fires the connection's disconnect signal.
//!
//! # Close handshake
//!
//! A local [`Transport::close`] queues a close frame and waits for the hub's
//! acknowledgment, both within [`CLOSE_HANDSHAKE_TIMEOUT`], then stops both
//! pumps (waiting up to [`PUMP_EXIT_TIMEOUT`] each before abandoning them).
//! A close initiated by the hub is acknowledged by the read pump. A missing
//! acknowledgment is not an error; the socket is released regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CLOSE_HANDSHAKE_TIMEOUT, DESERIALIZATION_ERROR_DELAY, OUTBOUND_QUEUE_CAPACITY,
    PUMP_EXIT_TIMEOUT,
};
use crate::error::HassError;
use crate::router::Router;
use crate::ws::{WsMessage, WsPair, WsRead, WsWrite};

/// WebSocket lifecycle as observed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Handshake done, traffic flowing.
    Open,
    /// We sent a close frame and await the hub's acknowledgment.
    CloseSent,
    /// The hub sent a close frame.
    CloseReceived,
    /// Close handshake finished or the socket failed.
    Closed,
}

/// Frame queued for the write pump.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    Text(String),
    Pong(Vec<u8>),
    Close,
}

/// State shared between the transport handle and its pumps.
#[derive(Debug)]
struct Shared {
    state: Mutex<SocketState>,
    read_alive: AtomicBool,
    write_alive: AtomicBool,
    /// Fires when the hub's close frame has been read.
    peer_closed: CancellationToken,
}

impl Shared {
    fn state(&self) -> SocketState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SocketState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Apply `f` to the current state and return the state before it.
    fn transition(&self, f: impl FnOnce(SocketState) -> SocketState) -> SocketState {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = *guard;
        *guard = f(before);
        before
    }
}

/// Reassembles fragmented inbound text into whole messages.
///
/// Socket-level pings are answered through the outbound queue; binary and
/// pong frames are ignored.
#[derive(Debug)]
pub struct FrameReader {
    reader: Box<dyn WsRead>,
    pong_tx: Option<mpsc::Sender<Outbound>>,
    buffer: String,
}

impl FrameReader {
    /// Wrap a socket read half. Pings are not answered by a bare reader.
    #[must_use]
    pub fn new(reader: Box<dyn WsRead>) -> Self {
        Self {
            reader,
            pong_tx: None,
            buffer: String::new(),
        }
    }

    fn with_pong_queue(reader: Box<dyn WsRead>, pong_tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            reader,
            pong_tx: Some(pong_tx),
            buffer: String::new(),
        }
    }

    /// Wait for the next complete text message.
    ///
    /// # Errors
    ///
    /// - `HassError::ConnectionClosed` when the hub sends a close frame.
    /// - `HassError::Transport` on a socket failure or when the stream ends
    ///   without a close frame.
    pub async fn receive_next(&mut self) -> Result<String, HassError> {
        loop {
            match self.reader.recv().await {
                Some(Ok(WsMessage::Fragment(chunk))) => self.buffer.push_str(&chunk),
                Some(Ok(WsMessage::Text(chunk))) => {
                    if self.buffer.is_empty() {
                        return Ok(chunk);
                    }
                    self.buffer.push_str(&chunk);
                    return Ok(std::mem::take(&mut self.buffer));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Some(tx) = &self.pong_tx {
                        if tx.try_send(Outbound::Pong(data)).is_err() {
                            log::debug!("[Transport] Outbound queue full, skipping pong");
                        }
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    return Err(HassError::ConnectionClosed { code, reason });
                }
                Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => {}
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(HassError::Transport(
                        "socket stream ended without close frame".into(),
                    ))
                }
            }
        }
    }
}

/// Handle to a live socket and its two pumps.
#[derive(Debug)]
pub struct Transport {
    outbound_tx: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Transport {
    /// Take ownership of `socket` and start the read and write pumps.
    ///
    /// Every complete inbound message goes to `router`. `disconnected` is
    /// cancelled when the socket fails or is closed by either side.
    #[must_use]
    pub fn spawn(socket: WsPair, router: Router, disconnected: CancellationToken) -> Self {
        let (writer, reader) = socket;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(SocketState::Open),
            read_alive: AtomicBool::new(true),
            write_alive: AtomicBool::new(true),
            peer_closed: CancellationToken::new(),
        });
        let shutdown = CancellationToken::new();

        let frames = FrameReader::with_pong_queue(reader, outbound_tx.clone());
        let read_task = tokio::spawn(read_pump(
            frames,
            router,
            outbound_tx.clone(),
            Arc::clone(&shared),
            shutdown.clone(),
            disconnected.clone(),
        ));
        let write_task = tokio::spawn(write_pump(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            shutdown.clone(),
            disconnected,
        ));

        Self {
            outbound_tx,
            shared,
            shutdown,
            tasks: Mutex::new(vec![("read", read_task), ("write", write_task)]),
        }
    }

    /// Queue one message for transmission.
    ///
    /// Waits while the outbound queue is full.
    ///
    /// # Errors
    ///
    /// Returns `HassError::NotConnected` once the transport is no longer
    /// valid.
    pub async fn send(&self, text: String) -> Result<(), HassError> {
        if !self.is_valid() {
            return Err(HassError::NotConnected);
        }
        self.outbound_tx
            .send(Outbound::Text(text))
            .await
            .map_err(|e| {
                log::debug!("[Transport] Outbound queue closed: {}", e);
                HassError::NotConnected
            })
    }

    /// Returns `true` while both pumps run and the socket is open (or the
    /// hub's close is still being acknowledged).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.shared.read_alive.load(Ordering::SeqCst)
            && self.shared.write_alive.load(Ordering::SeqCst)
            && matches!(
                self.shared.state(),
                SocketState::Open | SocketState::CloseReceived
            )
    }

    /// Current socket state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.shared.state()
    }

    /// Perform the close handshake and stop both pumps.
    ///
    /// Never fails: a hub that does not acknowledge, or a pump that does not
    /// exit, is given up on after its bound.
    pub async fn close(&self) {
        let can_handshake = self.shared.read_alive.load(Ordering::SeqCst)
            && self.shared.write_alive.load(Ordering::SeqCst);
        let before = self.shared.transition(|s| match s {
            SocketState::Open => SocketState::CloseSent,
            other => other,
        });

        if before == SocketState::Open && can_handshake {
            // Enqueue and acknowledgment share one bound.
            let handshake = async {
                if self.outbound_tx.send(Outbound::Close).await.is_err() {
                    return false;
                }
                self.shared.peer_closed.cancelled().await;
                true
            };
            match tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, handshake).await {
                Ok(true) => log::debug!("[Transport] Close acknowledged by hub"),
                Ok(false) => log::debug!("[Transport] Write pump gone, skipping close frame"),
                Err(_elapsed) => log::info!(
                    "[Transport] No close acknowledgment within {}s, releasing socket",
                    CLOSE_HANDSHAKE_TIMEOUT.as_secs()
                ),
            }
        }

        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, mut handle) in tasks {
            if tokio::time::timeout(PUMP_EXIT_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                log::warn!("[Transport] {} pump did not exit in time, abandoning it", name);
                handle.abort();
            }
        }

        self.shared.set_state(SocketState::Closed);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read pump: reassemble, route, and stop on any socket-level exit.
async fn read_pump(
    mut frames: FrameReader,
    router: Router,
    outbound_tx: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    disconnected: CancellationToken,
) {
    loop {
        let keep_going = tokio::select! {
            biased;
            () = shutdown.cancelled() => false,
            keep = read_step(&mut frames, &router, &outbound_tx, &shared) => keep,
        };
        if !keep_going {
            break;
        }
    }

    shared.read_alive.store(false, Ordering::SeqCst);
    disconnected.cancel();
    log::debug!("[Transport] Read pump exited");
}

/// Receive and route one message. Returns `false` when the socket is done.
async fn read_step(
    frames: &mut FrameReader,
    router: &Router,
    outbound_tx: &mpsc::Sender<Outbound>,
    shared: &Shared,
) -> bool {
    match frames.receive_next().await {
        Ok(text) => {
            if let Err(e) = router.route(&text).await {
                let preview: String = text.chars().take(200).collect();
                log::warn!("[Transport] Discarding message ({}): {}", e, preview);
                tokio::time::sleep(DESERIALIZATION_ERROR_DELAY).await;
            }
            true
        }
        Err(HassError::ConnectionClosed { code, reason }) => {
            let before = shared.transition(|s| match s {
                SocketState::Open => SocketState::CloseReceived,
                _ => SocketState::Closed,
            });
            if before == SocketState::Open {
                log::info!("[Transport] Connection closed by hub (code {}): {}", code, reason);
                if outbound_tx.try_send(Outbound::Close).is_err() {
                    log::debug!("[Transport] Could not queue close acknowledgment");
                }
            }
            shared.peer_closed.cancel();
            false
        }
        Err(e) => {
            log::warn!("[Transport] {}", e);
            shared.set_state(SocketState::Closed);
            false
        }
    }
}

/// Write pump: drain the outbound queue in order.
async fn write_pump(
    mut writer: Box<dyn WsWrite>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    disconnected: CancellationToken,
) {
    let mut close_sent = false;

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            next = outbound_rx.recv() => next,
        };
        let Some(frame) = next else { break };

        if close_sent {
            log::debug!("[Transport] Dropping outbound frame after close");
            continue;
        }

        let result = match frame {
            Outbound::Text(text) => writer.send_text(&text).await,
            Outbound::Pong(data) => writer.send_pong(data).await,
            Outbound::Close => {
                close_sent = true;
                writer.send_close().await
            }
        };

        if let Err(e) = result {
            if close_sent {
                log::debug!("[Transport] {}", e);
            } else {
                log::warn!("[Transport] {}", e);
                shared.set_state(SocketState::Closed);
                disconnected.cancel();
            }
            break;
        }
    }

    if let Err(e) = writer.close().await {
        log::debug!("[Transport] Releasing writer: {}", e);
    }
    shared.write_alive.store(false, Ordering::SeqCst);
    log::debug!("[Transport] Write pump exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::HassEvent;
    use crate::router::{PendingTable, ReplyMessage, StateCache};
    use crate::ws::memory::{self, ClientFrame, HubSide};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Transport,
        hub: HubSide,
        disconnected: CancellationToken,
        events_rx: mpsc::Receiver<HassEvent>,
        replies_rx: mpsc::Receiver<ReplyMessage>,
    }

    fn harness() -> Harness {
        let (pair, hub) = memory::pair();
        harness_on(pair, hub)
    }

    fn harness_on(pair: WsPair, hub: HubSide) -> Harness {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (replies_tx, replies_rx) = mpsc::channel(16);
        let router = Router::new(
            Arc::new(PendingTable::new()),
            Arc::new(StateCache::new()),
            events_tx,
            replies_tx,
        );
        let disconnected = CancellationToken::new();
        Harness {
            transport: Transport::spawn(pair, router, disconnected.clone()),
            hub,
            disconnected,
            events_rx,
            replies_rx,
        }
    }

    fn event_text(event_type: &str) -> String {
        json!({"type": "event", "id": 1, "event": {
            "event_type": event_type, "origin": "LOCAL",
            "time_fired": "2024-03-01T10:00:00+00:00", "data": {}
        }})
        .to_string()
    }

    #[tokio::test]
    async fn test_receive_next_reassembles_fragments() {
        let (pair, hub) = memory::pair();
        let (_writer, reader) = pair;
        let mut frames = FrameReader::new(reader);

        hub.to_client.send(Ok(WsMessage::Fragment(r#"{"type":"#.into()))).unwrap();
        hub.to_client.send(Ok(WsMessage::Fragment(r#" "po"#.into()))).unwrap();
        hub.to_client.send(Ok(WsMessage::Text(r#"ng"}"#.into()))).unwrap();
        hub.to_client.send(Ok(WsMessage::Text(r#"{"type":"auth_ok"}"#.into()))).unwrap();

        assert_eq!(frames.receive_next().await.unwrap(), r#"{"type": "pong"}"#);
        assert_eq!(frames.receive_next().await.unwrap(), r#"{"type":"auth_ok"}"#);
    }

    #[tokio::test]
    async fn test_receive_next_reports_close_and_failure() {
        let (pair, hub) = memory::pair();
        let (_writer, reader) = pair;
        let mut frames = FrameReader::new(reader);

        hub.to_client
            .send(Ok(WsMessage::Close {
                code: 1001,
                reason: "restart".into(),
            }))
            .unwrap();
        assert_eq!(
            frames.receive_next().await,
            Err(HassError::ConnectionClosed {
                code: 1001,
                reason: "restart".into()
            })
        );

        drop(hub);
        assert!(matches!(
            frames.receive_next().await,
            Err(HassError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_outbound_messages_keep_submission_order() {
        let mut h = harness();
        for i in 1..=5 {
            h.transport
                .send(json!({"type": "ping", "id": i}).to_string())
                .await
                .unwrap();
        }
        for i in 1..=5 {
            let msg = h.hub.next_json().await.unwrap();
            assert_eq!(msg["id"], i);
        }
    }

    #[tokio::test]
    async fn test_fragmented_event_is_routed_whole() {
        let mut h = harness();
        let text = event_text("fragmented");
        let (head, tail) = text.split_at(text.len() / 2);
        h.hub.to_client.send(Ok(WsMessage::Fragment(head.into()))).unwrap();
        h.hub.to_client.send(Ok(WsMessage::Text(tail.into()))).unwrap();

        assert_eq!(h.events_rx.recv().await.unwrap().event_type, "fragmented");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_does_not_stop_the_pump() {
        let mut h = harness();
        h.hub.to_client.send(Ok(WsMessage::Text("{garbage".into()))).unwrap();
        h.hub.to_client.send(Ok(WsMessage::Text(event_text("after_garbage")))).unwrap();

        assert_eq!(h.events_rx.recv().await.unwrap().event_type, "after_garbage");
        assert!(h.transport.is_valid());
        assert!(!h.disconnected.is_cancelled());
    }

    #[tokio::test]
    async fn test_socket_ping_is_answered_with_pong() {
        let mut h = harness();
        h.hub.to_client.send(Ok(WsMessage::Ping(vec![1, 2, 3]))).unwrap();
        assert_eq!(
            h.hub.from_client.recv().await.unwrap(),
            ClientFrame::Pong(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_peer_close_is_acknowledged_and_fatal() {
        let mut h = harness();
        h.hub
            .to_client
            .send(Ok(WsMessage::Close {
                code: 1000,
                reason: "bye".into(),
            }))
            .unwrap();

        assert_eq!(h.hub.from_client.recv().await.unwrap(), ClientFrame::Close);
        h.disconnected.cancelled().await;
        assert!(!h.transport.is_valid());

        h.transport.close().await;
        assert_eq!(h.transport.state(), SocketState::Closed);
        assert!(matches!(
            h.transport.send("{}".into()).await,
            Err(HassError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_abrupt_stream_end_fires_disconnect() {
        let h = harness();
        drop(h.hub);
        h.disconnected.cancelled().await;
        assert!(!h.transport.is_valid());
        assert_eq!(h.transport.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_local_close_completes_handshake() {
        let h = harness();
        let mut hub = h.hub;
        let hub_task = tokio::spawn(async move {
            // Answers the close frame with an acknowledgment.
            assert!(hub.next_json().await.is_none());
        });

        h.transport.close().await;
        hub_task.await.unwrap();
        assert_eq!(h.transport.state(), SocketState::Closed);
        assert!(!h.transport.is_valid());
        assert!(h.disconnected.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_close_without_ack_is_bounded() {
        let h = harness();
        let start = tokio::time::Instant::now();
        h.transport.close().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= CLOSE_HANDSHAKE_TIMEOUT);
        assert!(elapsed < CLOSE_HANDSHAKE_TIMEOUT + PUMP_EXIT_TIMEOUT * 2);
        assert_eq!(h.transport.state(), SocketState::Closed);
        drop(h.hub);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_stalled_writer_is_bounded() {
        let (pair, hub) = memory::stalling_pair(0);
        let h = harness_on(pair, hub);
        // One frame wedges the writer, the rest fill the queue.
        for i in 0..=OUTBOUND_QUEUE_CAPACITY {
            h.transport
                .send(json!({"type": "ping", "id": i}).to_string())
                .await
                .unwrap();
        }

        let start = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(60), h.transport.close())
            .await
            .expect("close must not wait on a stalled writer");
        assert!(start.elapsed() <= CLOSE_HANDSHAKE_TIMEOUT + PUMP_EXIT_TIMEOUT * 2);
        assert_eq!(h.transport.state(), SocketState::Closed);
        assert!(!h.transport.is_valid());
        drop(h.hub);
    }

    #[tokio::test]
    async fn test_reply_path_receives_handshake_messages() {
        let mut h = harness();
        h.hub.send_json(&json!({"type": "auth_required", "ha_version": "2024.3.0"}));
        let envelope = h.replies_rx.recv().await.unwrap().unwrap();
        assert_eq!(envelope.kind, "auth_required");
        assert_eq!(envelope.ha_version.as_deref(), Some("2024.3.0"));
    }
}
