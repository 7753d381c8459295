//! Per-connection read and write pumps.
//!
//! The write pump is the only code that touches the socket's sink: hub
//! fan-out, direct replies and heartbeats all pass through the connection's
//! outbound buffer. Whichever pump first sees the connection end signals the
//! other through the close channel and drives the single hub deregistration.

use std::borrow::Cow;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::domain::foundation::ConversationId;
use crate::domain::projection::{PRESENCE_TTL, TYPING_TTL};
use crate::domain::realtime::{CloseCode, ConnectionState, RoutingEnvelope};
use crate::ports::{ProjectionStore, PubSubBus};

use super::hub::{ConnectionHandle, Hub, Registration};
use super::messages::{ClientMessage, Frame, ServerMessage};

/// Timing and size limits for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bound on a single socket write.
    pub write_wait: Duration,
    /// Close if nothing arrives from the peer for this long.
    pub pong_wait: Duration,
    /// Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(30),
            max_message_size: 8192,
        }
    }
}

/// Shared collaborators of every connection.
pub struct ConnectionContext {
    pub hub: Arc<Hub>,
    pub projections: Arc<dyn ProjectionStore>,
    pub bus: Arc<dyn PubSubBus>,
    pub config: ConnectionConfig,
}

/// How the write pump stopped.
enum WriteExit {
    /// Close requested; send a close frame with this code.
    Close(CloseCode),
    /// The socket failed; nothing more can be written.
    Broken,
}

pub struct Connection {
    handle: Arc<ConnectionHandle>,
    ctx: Arc<ConnectionContext>,
    deregistered: AtomicBool,
}

impl Connection {
    /// Runs both pumps for a registered connection until it closes.
    pub async fn serve<S, E>(socket: S, registration: Registration, ctx: Arc<ConnectionContext>)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        E: Display + Send,
        <S as Sink<Message>>::Error: Display + Send,
    {
        let Registration {
            handle,
            outbound,
            close,
        } = registration;
        let conn = Connection {
            handle,
            ctx,
            deregistered: AtomicBool::new(false),
        };

        if !conn.handle.transition(ConnectionState::Open) {
            // Shutdown closed us before the pumps started.
            conn.terminate(CloseCode::GoingAway).await;
            conn.handle.transition(ConnectionState::Closed);
            return;
        }

        tracing::info!(
            connection_id = %conn.handle.id(),
            user_id = %conn.handle.user(),
            "WebSocket connection opened"
        );
        conn.refresh_presence().await;
        conn.reply(ServerMessage::connected(conn.handle.id(), conn.handle.user()));

        let (sink, stream) = socket.split();
        tokio::join!(
            conn.write_pump(sink, outbound, close.clone()),
            conn.read_pump(stream, close),
        );

        conn.handle.transition(ConnectionState::Closed);
        tracing::info!(
            connection_id = %conn.handle.id(),
            user_id = %conn.handle.user(),
            code = ?conn.handle.close_code(),
            "WebSocket connection closed"
        );
    }

    /// Signals the other pump and deregisters exactly once.
    async fn terminate(&self, code: CloseCode) {
        self.handle.transition(ConnectionState::Closing);
        self.handle.close(code);
        if !self.deregistered.swap(true, Ordering::SeqCst) {
            self.ctx.hub.unregister(&self.handle.id()).await;
        }
    }

    // ════════════════════════════════════════════════════════════════════════════════
    // Write path
    // ════════════════════════════════════════════════════════════════════════════════

    async fn write_pump<W>(
        &self,
        mut sink: W,
        mut outbound: mpsc::Receiver<Frame>,
        mut close: watch::Receiver<Option<CloseCode>>,
    ) where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        let period = self.ctx.config.ping_period;
        let mut ping = time::interval_at(Instant::now() + period, period);

        let exit = loop {
            tokio::select! {
                biased;
                changed = close.changed() => {
                    let code = if changed.is_ok() { *close.borrow() } else { None };
                    break WriteExit::Close(code.unwrap_or(CloseCode::Normal));
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        break WriteExit::Close(CloseCode::Normal);
                    };
                    if !self.write(&mut sink, Message::Text(frame.to_string())).await {
                        break WriteExit::Broken;
                    }
                }
                _ = ping.tick() => {
                    if !self.write(&mut sink, Message::Ping(Vec::new())).await {
                        break WriteExit::Broken;
                    }
                }
            }
        };

        match exit {
            WriteExit::Close(code) => {
                if matches!(code, CloseCode::Normal | CloseCode::GoingAway) {
                    // Flush what was queued before the close was requested.
                    while let Ok(frame) = outbound.try_recv() {
                        if !self.write(&mut sink, Message::Text(frame.to_string())).await {
                            break;
                        }
                    }
                }
                let frame = CloseFrame {
                    code: code.code(),
                    reason: Cow::Borrowed(code.reason()),
                };
                self.write(&mut sink, Message::Close(Some(frame))).await;
                let _ = sink.close().await;
                self.terminate(code).await;
            }
            WriteExit::Broken => self.terminate(CloseCode::InternalError).await,
        }
    }

    /// Writes one message within `write_wait`. Returns false on failure.
    async fn write<W>(&self, sink: &mut W, message: Message) -> bool
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        match time::timeout(self.ctx.config.write_wait, sink.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %self.handle.id(), "Send error: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!(connection_id = %self.handle.id(), "Write timed out");
                false
            }
        }
    }

    // ════════════════════════════════════════════════════════════════════════════════
    // Read path
    // ════════════════════════════════════════════════════════════════════════════════

    async fn read_pump<R, E>(&self, mut stream: R, mut close: watch::Receiver<Option<CloseCode>>)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let max = self.ctx.config.max_message_size;
        let code = loop {
            tokio::select! {
                _ = close.changed() => break None,
                next = time::timeout(self.ctx.config.pong_wait, stream.next()) => {
                    match next {
                        Err(_) => {
                            tracing::debug!(connection_id = %self.handle.id(), "Peer idle, closing");
                            break Some(CloseCode::GoingAway);
                        }
                        Ok(None) => break Some(CloseCode::Normal),
                        Ok(Some(Err(e))) => {
                            tracing::debug!(connection_id = %self.handle.id(), "Receive error: {}", e);
                            break Some(CloseCode::InternalError);
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if text.len() > max {
                                break Some(CloseCode::MessageTooBig);
                            }
                            self.handle_text(&text).await;
                        }
                        Ok(Some(Ok(Message::Binary(bytes)))) => {
                            if bytes.len() > max {
                                break Some(CloseCode::MessageTooBig);
                            }
                            self.reply(ServerMessage::bad_request("binary frames are not supported"));
                        }
                        // Any frame proves liveness; protocol pings are answered by axum.
                        Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {}
                        Ok(Some(Ok(Message::Close(_)))) => {
                            tracing::debug!(connection_id = %self.handle.id(), "Client sent close frame");
                            break Some(CloseCode::Normal);
                        }
                    }
                }
            }
        };

        if let Some(code) = code {
            self.terminate(code).await;
        }
    }

    async fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                self.reply(ServerMessage::bad_request(format!("invalid message: {}", e)));
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                self.refresh_presence().await;
                self.reply(ServerMessage::pong());
            }
            ClientMessage::Subscribe { conversation_ids } => {
                let mut allowed = Vec::with_capacity(conversation_ids.len());
                for conv in conversation_ids {
                    if self.participates(&conv).await {
                        allowed.push(conv);
                    }
                }
                self.ctx.hub.subscribe(&self.handle.id(), &allowed).await;
                self.reply(ServerMessage::subscribed(allowed));
            }
            ClientMessage::Typing { conversation_id } => {
                if !self.participates(&conversation_id).await {
                    self.reply(ServerMessage::error(403, "not a participant"));
                    return;
                }
                self.announce_typing(&conversation_id).await;
            }
        }
    }

    async fn participates(&self, conv: &ConversationId) -> bool {
        match self
            .ctx
            .projections
            .is_participant(conv, self.handle.user())
            .await
        {
            Ok(yes) => yes,
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.handle.id(),
                    conversation_id = %conv,
                    error = %e,
                    "Participant check failed"
                );
                false
            }
        }
    }

    async fn announce_typing(&self, conv: &ConversationId) {
        let user = self.handle.user();
        if let Err(e) = self.ctx.projections.set_typing(conv, user, TYPING_TTL).await {
            tracing::warn!(conversation_id = %conv, user_id = %user, error = %e, "Failed to set typing");
        }
        let envelope = RoutingEnvelope::to_conversation(
            conv,
            "typing.start",
            json!({ "conversation_id": conv, "user_id": user }),
        );
        if let Err(e) = self.ctx.bus.publish_envelope(&envelope).await {
            tracing::warn!(conversation_id = %conv, error = %e, "Failed to publish typing event");
        }
    }

    async fn refresh_presence(&self) {
        let user = self.handle.user();
        if let Err(e) = self
            .ctx
            .projections
            .set_presence(user, "online", PRESENCE_TTL)
            .await
        {
            tracing::warn!(user_id = %user, error = %e, "Failed to refresh presence");
        }
    }

    /// Queues a direct reply through the write pump.
    fn reply(&self, message: ServerMessage) {
        match message.to_frame() {
            Ok(frame) => {
                self.handle.offer(frame);
            }
            Err(e) => {
                tracing::error!(connection_id = %self.handle.id(), error = %e, "Failed to encode reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryProjectionStore, InMemoryPubSub};
    use crate::domain::foundation::UserId;
    use futures::channel::mpsc as fmpsc;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// In-memory duplex standing in for an upgraded socket.
    struct TestSocket {
        incoming: fmpsc::UnboundedReceiver<Result<Message, std::io::Error>>,
        outgoing: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for TestSocket {
        type Item = Result<Message, std::io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx)
        }
    }

    impl Sink<Message> for TestSocket {
        type Error = fmpsc::SendError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            Pin::new(&mut self.outgoing).start_send(item)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.outgoing).poll_close(cx)
        }
    }

    struct Harness {
        hub: Arc<Hub>,
        projections: InMemoryProjectionStore,
        bus: InMemoryPubSub,
        client_tx: fmpsc::UnboundedSender<Result<Message, std::io::Error>>,
        client_rx: fmpsc::UnboundedReceiver<Message>,
        handle: Arc<ConnectionHandle>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn start(user: &str) -> Self {
            let hub = Arc::new(Hub::new(16));
            let projections = InMemoryProjectionStore::new();
            let bus = InMemoryPubSub::new();
            let ctx = Arc::new(ConnectionContext {
                hub: hub.clone(),
                projections: Arc::new(projections.clone()),
                bus: Arc::new(bus.clone()),
                config: ConnectionConfig::default(),
            });

            let (client_tx, incoming) = fmpsc::unbounded();
            let (outgoing, client_rx) = fmpsc::unbounded();
            let socket = TestSocket { incoming, outgoing };
            let registration = hub.register(UserId::new(user).unwrap()).await.unwrap();
            let handle = registration.handle.clone();
            let task = tokio::spawn(Connection::serve(socket, registration, ctx));

            Self {
                hub,
                projections,
                bus,
                client_tx,
                client_rx,
                handle,
                task,
            }
        }

        /// Waits for the connection to finish and checks it left the hub.
        async fn assert_closed_with(self, code: CloseCode) {
            self.task.await.unwrap();
            assert_eq!(self.handle.state(), ConnectionState::Closed);
            assert_eq!(self.handle.close_code(), Some(code));
            assert_eq!(self.hub.connection_count().await, 0);
            // Already removed by the connection itself.
            assert!(!self.hub.unregister(&self.handle.id()).await);
        }

        fn send(&self, text: &str) {
            self.client_tx
                .unbounded_send(Ok(Message::Text(text.to_string())))
                .unwrap();
        }

        async fn next_json(&mut self) -> serde_json::Value {
            loop {
                match self.client_rx.next().await.expect("socket open") {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Ping(_) => continue,
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        }

        async fn next_close_code(&mut self) -> u16 {
            loop {
                match self.client_rx.next().await.expect("socket open") {
                    Message::Close(Some(frame)) => return frame.code,
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn greets_then_answers_ping() {
        let mut h = Harness::start("alice").await;
        assert_eq!(h.next_json().await["type"], "connected");

        h.send(r#"{"type":"ping"}"#);
        assert_eq!(h.next_json().await["type"], "pong");
        assert_eq!(
            h.projections
                .presence(&UserId::new("alice").unwrap())
                .await
                .unwrap()
                .as_deref(),
            Some("online")
        );
    }

    #[tokio::test]
    async fn subscribe_only_grants_member_conversations() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        let mine = ConversationId::new();
        let theirs = ConversationId::new();
        h.projections
            .add_participant(&mine, &UserId::new("alice").unwrap())
            .await
            .unwrap();

        h.send(&format!(
            r#"{{"type":"subscribe","conversation_ids":["{}","{}"]}}"#,
            mine, theirs
        ));
        let reply = h.next_json().await;
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(reply["data"]["conversation_ids"], json!([mine.to_string()]));
    }

    #[tokio::test]
    async fn typing_is_published_on_the_conversation_channel() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;
        let conv = ConversationId::new();
        h.projections
            .add_participant(&conv, &UserId::new("alice").unwrap())
            .await
            .unwrap();

        h.send(&format!(r#"{{"type":"typing","conversation_id":"{}"}}"#, conv));
        h.send(r#"{"type":"ping"}"#);
        h.next_json().await; // pong, so typing was handled first

        let published = h.bus.published_on(&format!("ws:conv:{}", conv));
        assert_eq!(published.len(), 1);
        assert!(published[0].payload.contains("typing.start"));
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;
        h.send("not json");
        let reply = h.next_json().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["data"]["code"], 400);
    }

    #[tokio::test]
    async fn oversized_frame_closes_with_1009() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;
        h.send(&"x".repeat(9000));
        assert_eq!(h.next_close_code().await, 1009);
        h.task.await.unwrap();
        assert_eq!(h.hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn peer_close_deregisters_once() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;
        h.client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(h.next_close_code().await, 1000);
        h.task.await.unwrap();
        assert_eq!(h.hub.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_pinged_then_closed_after_pong_wait() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        let mut pings = 0;
        let code = loop {
            match h.client_rx.next().await.expect("socket open") {
                Message::Ping(_) => pings += 1,
                Message::Close(Some(frame)) => break frame.code,
                other => panic!("unexpected frame {:?}", other),
            }
        };

        assert_eq!(code, 1001);
        assert!(pings >= 1, "no heartbeat before the idle timeout");
        h.assert_closed_with(CloseCode::GoingAway).await;
    }

    #[tokio::test]
    async fn receive_error_closes_with_1011() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        h.client_tx
            .unbounded_send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
            .unwrap();

        assert_eq!(h.next_close_code().await, 1011);
        h.assert_closed_with(CloseCode::InternalError).await;
    }

    #[tokio::test]
    async fn failed_write_tears_the_connection_down() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        // Peer stops reading: every further write fails.
        drop(std::mem::replace(&mut h.client_rx, fmpsc::unbounded().1));
        h.send(r#"{"type":"ping"}"#);

        h.assert_closed_with(CloseCode::InternalError).await;
    }

    #[tokio::test]
    async fn hub_shutdown_sends_going_away() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        let report = h.hub.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.forced, 0);
        assert_eq!(h.next_close_code().await, 1001);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn hub_events_reach_the_socket() {
        let mut h = Harness::start("alice").await;
        h.next_json().await;

        let event = crate::domain::realtime::ClientEvent::new("notification.new", json!({"id": 1}));
        assert_eq!(
            h.hub
                .send_to_user(&UserId::new("alice").unwrap(), &event)
                .await,
            1
        );
        let frame = h.next_json().await;
        assert_eq!(frame["type"], "notification.new");
        assert_eq!(frame["data"]["id"], 1);
    }
}
