//! Duplex channel to the chat server.
//!
//! One websocket per session activation. The socket lives in a supervisor
//! task that reconnects with exponential backoff after an unexpected drop;
//! the caller only holds a [`ChannelHandle`], whose teardown (explicit or on
//! drop) stops that task.

use std::time::Duration;

use chatwire_engine::{Activation, DeltaEvent, Tagged};
use futures::{SinkExt, StreamExt};
use snafu::{OptionExt, ResultExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{
    ChannelError, ChannelResult, ClosedSnafu, ConnectSnafu, EncodeSnafu, ReconnectExhaustedSnafu,
};
use crate::wire::{ClientFrame, ServerFrame, decode_server_frame, encode_client_frame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectResult = Tagged<ChannelResult<ChannelHandle>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

/// What the channel reports to the reconciliation context.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Acknowledged,
    Delta(DeltaEvent),
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Terminal: the channel will not deliver anything else.
    Failed { reason: String },
}

/// Owned handle to one live channel.
#[derive(Debug)]
pub struct ChannelHandle {
    activation: Activation,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ChannelHandle {
    /// Connects and starts the supervisor task; events for this activation
    /// are delivered to `events`.
    pub async fn open(
        config: ChannelConfig,
        activation: Activation,
        events: mpsc::UnboundedSender<Tagged<ChannelEvent>>,
    ) -> ChannelResult<Self> {
        let socket = open_socket(&config.url).await?;
        tracing::info!(
            session_id = %activation.session_id,
            generation = %activation.generation,
            url = %config.url,
            "channel connected"
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = Supervisor {
            config,
            activation,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            events,
            unsent: None,
        };
        tokio::spawn(supervisor.run(socket));

        Ok(Self {
            activation,
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Whether the channel can no longer carry frames.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none() || self.outbound.is_closed()
    }

    /// Enqueues a user message; frames sent while reconnecting go out after
    /// the reconnect succeeds.
    pub fn send(&self, text: &str) -> ChannelResult<()> {
        let frame = encode_client_frame(&ClientFrame::SendMessage {
            session_id: self.activation.session_id,
            text: text.to_string(),
        })
        .context(EncodeSnafu {
            stage: "encode-send-message",
        })?;
        self.send_encoded(frame)
    }

    fn send_encoded(&self, frame: String) -> ChannelResult<()> {
        if self.shutdown.is_none() {
            return ClosedSnafu {
                stage: "send-frame",
                session_id: self.activation.session_id.to_string(),
            }
            .fail();
        }
        self.outbound.send(frame).ok().context(ClosedSnafu {
            stage: "send-frame",
            session_id: self.activation.session_id.to_string(),
        })
    }

    /// Stops the supervisor task and closes the socket. Returns `false` when
    /// the handle was already torn down.
    pub fn teardown(&mut self) -> bool {
        let Some(shutdown) = self.shutdown.take() else {
            return false;
        };
        let _ = shutdown.send(());
        tracing::debug!(
            session_id = %self.activation.session_id,
            generation = %self.activation.generation,
            "channel torn down"
        );
        true
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn open_socket(url: &str) -> ChannelResult<Socket> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(Box::new)
        .context(ConnectSnafu {
            stage: "connect-channel",
            url: url.to_string(),
        })?;
    Ok(socket)
}

enum PumpExit {
    Shutdown,
    Dropped,
}

struct Supervisor {
    config: ChannelConfig,
    activation: Activation,
    outbound: mpsc::UnboundedReceiver<String>,
    shutdown: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<Tagged<ChannelEvent>>,
    unsent: Option<String>,
}

impl Supervisor {
    async fn run(mut self, mut socket: Socket) {
        loop {
            match self.pump(&mut socket).await {
                PumpExit::Shutdown => {
                    let _ = socket.close(None).await;
                    return;
                }
                PumpExit::Dropped => match self.reconnect().await {
                    Some(next) => socket = next,
                    None => return,
                },
            }
        }
    }

    async fn pump(&mut self, socket: &mut Socket) -> PumpExit {
        if let Some(frame) = self.unsent.take()
            && let Err(error) = socket.send(Message::Text(frame.clone())).await
        {
            tracing::warn!(
                session_id = %self.activation.session_id,
                error = %error,
                "failed to resend queued frame"
            );
            self.unsent = Some(frame);
            return PumpExit::Dropped;
        }

        loop {
            tokio::select! {
                _ = &mut self.shutdown => return PumpExit::Shutdown,
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return PumpExit::Shutdown;
                    };
                    if let Err(error) = socket.send(Message::Text(frame.clone())).await {
                        tracing::warn!(
                            session_id = %self.activation.session_id,
                            error = %error,
                            "failed to send frame"
                        );
                        self.unsent = Some(frame);
                        return PumpExit::Dropped;
                    }
                }
                message = socket.next() => match message {
                    Some(Ok(Message::Text(raw))) => {
                        let event = match decode_server_frame(&raw) {
                            Some(ServerFrame::Acknowledged) => ChannelEvent::Acknowledged,
                            Some(ServerFrame::Delta(delta)) => ChannelEvent::Delta(delta),
                            None => continue,
                        };
                        if !self.emit(event) {
                            return PumpExit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!(
                            session_id = %self.activation.session_id,
                            "channel closed by server"
                        );
                        return PumpExit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(
                            session_id = %self.activation.session_id,
                            error = %error,
                            "channel read failed"
                        );
                        return PumpExit::Dropped;
                    }
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Option<Socket> {
        let policy = self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            if !self.emit(ChannelEvent::Reconnecting { attempt }) {
                return None;
            }
            let delay = policy.backoff(attempt);
            tracing::warn!(
                session_id = %self.activation.session_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting channel"
            );

            tokio::select! {
                _ = &mut self.shutdown => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let connected = tokio::select! {
                _ = &mut self.shutdown => return None,
                connected = open_socket(&self.config.url) => connected,
            };
            match connected {
                Ok(socket) => {
                    tracing::info!(
                        session_id = %self.activation.session_id,
                        attempt,
                        "channel reconnected"
                    );
                    self.emit(ChannelEvent::Reconnected);
                    return Some(socket);
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = %self.activation.session_id,
                        attempt,
                        error = %error,
                        "reconnect attempt failed"
                    );
                }
            }
        }

        let error: ChannelError = ReconnectExhaustedSnafu {
            stage: "reconnect-channel",
            attempts: policy.max_attempts,
        }
        .build();
        tracing::error!(session_id = %self.activation.session_id, error = %error, "channel failed");
        self.emit(ChannelEvent::Failed {
            reason: error.to_string(),
        });
        None
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(self.activation.tag(event)).is_ok()
    }
}

/// Result of [`ChannelManager::ensure_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// A live channel for the activation already exists.
    Live,
    /// A connect for the activation is in flight.
    Pending,
    /// A new connect was started.
    Opening,
}

#[derive(Debug)]
enum ChannelSlot {
    Idle,
    Pending {
        activation: Activation,
        queued: Vec<String>,
    },
    Live(ChannelHandle),
}

impl ChannelSlot {
    fn activation(&self) -> Option<Activation> {
        match self {
            Self::Idle => None,
            Self::Pending { activation, .. } => Some(*activation),
            Self::Live(handle) => Some(handle.activation()),
        }
    }
}

/// Owns at most one channel, bound to the activation that asked for it.
#[derive(Debug)]
pub struct ChannelManager {
    config: ChannelConfig,
    slot: ChannelSlot,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    events_tx: mpsc::UnboundedSender<Tagged<ChannelEvent>>,
    events_rx: mpsc::UnboundedReceiver<Tagged<ChannelEvent>>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            slot: ChannelSlot::Idle,
            connect_tx,
            connect_rx,
            events_tx,
            events_rx,
        }
    }

    /// Activation the current channel (live or connecting) belongs to.
    pub fn activation(&self) -> Option<Activation> {
        self.slot.activation()
    }

    pub fn is_live(&self) -> bool {
        matches!(&self.slot, ChannelSlot::Live(handle) if !handle.is_closed())
    }

    /// Reuses the channel of `activation` or starts connecting a new one,
    /// tearing down a channel held for any other activation.
    pub fn ensure_connected(&mut self, activation: Activation) -> Connection {
        match &self.slot {
            ChannelSlot::Live(handle)
                if handle.activation() == activation && !handle.is_closed() =>
            {
                return Connection::Live;
            }
            ChannelSlot::Pending {
                activation: pending,
                ..
            } if *pending == activation => return Connection::Pending,
            _ => {}
        }

        self.teardown();
        self.slot = ChannelSlot::Pending {
            activation,
            queued: Vec::new(),
        };

        let config = self.config.clone();
        let events = self.events_tx.clone();
        let connected = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = ChannelHandle::open(config, activation, events).await;
            if let Err(error) = &result {
                tracing::error!(
                    session_id = %activation.session_id,
                    generation = %activation.generation,
                    error = %error,
                    "failed to open channel"
                );
            }
            // A closed receiver drops the handle, which tears it down.
            let _ = connected.send(activation.tag(result));
        });
        Connection::Opening
    }

    /// Sends a user message for `activation`, connecting lazily. Frames sent
    /// while the connect is in flight are queued.
    pub fn send(&mut self, activation: Activation, text: &str) -> ChannelResult<Connection> {
        let frame = encode_client_frame(&ClientFrame::SendMessage {
            session_id: activation.session_id,
            text: text.to_string(),
        })
        .context(EncodeSnafu {
            stage: "encode-send-message",
        })?;

        let connection = self.ensure_connected(activation);
        match &mut self.slot {
            ChannelSlot::Live(handle) => handle.send_encoded(frame)?,
            ChannelSlot::Pending { queued, .. } => queued.push(frame),
            ChannelSlot::Idle => {
                return ClosedSnafu {
                    stage: "send-message",
                    session_id: activation.session_id.to_string(),
                }
                .fail();
            }
        }
        Ok(connection)
    }

    /// Releases the current channel or abandons the in-flight connect.
    /// Returns `false` when there was nothing to release.
    pub fn teardown(&mut self) -> bool {
        match std::mem::replace(&mut self.slot, ChannelSlot::Idle) {
            ChannelSlot::Idle => false,
            ChannelSlot::Pending { activation, queued } => {
                tracing::debug!(
                    session_id = %activation.session_id,
                    generation = %activation.generation,
                    dropped_frames = queued.len(),
                    "abandoned pending channel connect"
                );
                true
            }
            ChannelSlot::Live(mut handle) => handle.teardown(),
        }
    }

    /// Next event for the current activation. Connect results are installed
    /// here; results and events of any other activation are discarded.
    ///
    /// Cancel safe: nothing is awaited after a message is taken off a queue.
    pub async fn recv(&mut self) -> Tagged<ChannelEvent> {
        loop {
            tokio::select! {
                biased;
                Some(connected) = self.connect_rx.recv() => {
                    if let Some(event) = self.install(connected) {
                        return event;
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    if self.slot.activation() == Some(event.activation) {
                        return event;
                    }
                    tracing::debug!(
                        session_id = %event.activation.session_id,
                        generation = %event.activation.generation,
                        "dropping event from a released channel"
                    );
                }
            }
        }
    }

    fn install(&mut self, connected: ConnectResult) -> Option<Tagged<ChannelEvent>> {
        let Tagged { activation, value } = connected;
        let queued = match std::mem::replace(&mut self.slot, ChannelSlot::Idle) {
            ChannelSlot::Pending {
                activation: pending,
                queued,
            } if pending == activation => queued,
            other => {
                self.slot = other;
                tracing::debug!(
                    session_id = %activation.session_id,
                    generation = %activation.generation,
                    "discarding stale channel connect"
                );
                return None;
            }
        };

        match value {
            Ok(handle) => {
                for frame in queued {
                    if let Err(error) = handle.send_encoded(frame) {
                        tracing::warn!(
                            session_id = %activation.session_id,
                            error = %error,
                            "failed to flush queued frame"
                        );
                    }
                }
                self.slot = ChannelSlot::Live(handle);
                Some(activation.tag(ChannelEvent::Connected))
            }
            Err(error) => Some(activation.tag(ChannelEvent::Failed {
                reason: error.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use chatwire_engine::{Generation, SessionId};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn activation(session: u64, generation: u64) -> Activation {
        Activation::new(SessionId::new(session), Generation::new(generation))
    }

    fn config(url: &str) -> ChannelConfig {
        ChannelConfig {
            url: url.to_string(),
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
            },
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_json(server: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match timeout(WAIT, server.next()).await.unwrap() {
                Some(Ok(Message::Text(raw))) => return serde_json::from_str(&raw).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn push(server: &mut WebSocketStream<TcpStream>, frame: Value) {
        server.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<Tagged<ChannelEvent>>,
    ) -> ChannelEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap().value
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn handle_sends_frames_and_forwards_server_events() {
        let (listener, url) = listen().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = tokio::spawn(ChannelHandle::open(config(&url), activation(3, 1), events_tx));
        let mut server = accept(&listener).await;
        let handle = client.await.unwrap().unwrap();

        handle.send("What is 2+2?").unwrap();
        assert_eq!(
            next_json(&mut server).await,
            json!({ "event": "send_message", "data": { "session_id": 3, "text": "What is 2+2?" } })
        );

        push(&mut server, json!({ "event": "message_received", "data": {} })).await;
        push(
            &mut server,
            json!({ "event": "receive_message", "data": { "message_id": "m1", "text": "4" } }),
        )
        .await;

        assert_eq!(next_event(&mut events).await, ChannelEvent::Acknowledged);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Delta(DeltaEvent::text("m1", "4"))
        );
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_drop_closes_the_socket() {
        let (listener, url) = listen().await;
        let (events_tx, _events) = mpsc::unbounded_channel();

        let client = tokio::spawn(ChannelHandle::open(
            config(&url),
            activation(1, 1),
            events_tx.clone(),
        ));
        let mut first_server = accept(&listener).await;
        let mut handle = client.await.unwrap().unwrap();

        assert!(handle.teardown());
        assert!(!handle.teardown());
        assert!(handle.is_closed());
        assert!(handle.send("late").is_err());
        let closed = timeout(WAIT, first_server.next()).await.unwrap();
        assert!(matches!(closed, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

        let client = tokio::spawn(ChannelHandle::open(config(&url), activation(1, 2), events_tx));
        let mut second_server = accept(&listener).await;
        drop(client.await.unwrap().unwrap());
        let closed = timeout(WAIT, second_server.next()).await.unwrap();
        assert!(matches!(closed, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    }

    #[tokio::test]
    async fn dropped_socket_reconnects_and_delivers_queued_frames() {
        let (listener, url) = listen().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = tokio::spawn(ChannelHandle::open(config(&url), activation(4, 1), events_tx));
        let first_server = accept(&listener).await;
        let handle = client.await.unwrap().unwrap();

        drop(first_server);
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Reconnecting { attempt: 1 }
        );
        handle.send("still there?").unwrap();

        let mut second_server = accept(&listener).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Reconnected);
        assert_eq!(
            next_json(&mut second_server).await["data"]["text"],
            json!("still there?")
        );
    }

    #[tokio::test]
    async fn exhausted_reconnects_emit_a_terminal_failure() {
        let (listener, url) = listen().await;
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = tokio::spawn(ChannelHandle::open(config(&url), activation(5, 1), events_tx));
        let server = accept(&listener).await;
        let handle = client.await.unwrap().unwrap();

        drop(listener);
        drop(server);

        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Reconnecting { attempt: 1 }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Reconnecting { attempt: 2 }
        );
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::Failed { .. }
        ));
        // The supervisor has exited, so the outbound queue is gone.
        assert!(timeout(WAIT, async {
            while !handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn manager_connects_lazily_and_flushes_queued_sends() {
        let (listener, url) = listen().await;
        let mut manager = ChannelManager::new(config(&url));
        let current = activation(8, 1);

        assert_eq!(manager.activation(), None);
        assert_eq!(manager.send(current, "first").unwrap(), Connection::Opening);
        assert_eq!(manager.send(current, "second").unwrap(), Connection::Pending);

        let mut server = accept(&listener).await;
        let connected = timeout(WAIT, manager.recv()).await.unwrap();
        assert_eq!(connected, current.tag(ChannelEvent::Connected));
        assert!(manager.is_live());
        assert_eq!(manager.ensure_connected(current), Connection::Live);

        assert_eq!(next_json(&mut server).await["data"]["text"], json!("first"));
        assert_eq!(next_json(&mut server).await["data"]["text"], json!("second"));
    }

    #[tokio::test]
    async fn manager_discards_a_connect_that_finishes_after_teardown() {
        let (listener, url) = listen().await;
        let mut manager = ChannelManager::new(config(&url));
        let stale = activation(1, 1);
        let fresh = activation(2, 2);

        assert_eq!(manager.ensure_connected(stale), Connection::Opening);
        assert!(manager.teardown());
        assert!(!manager.teardown());

        // The abandoned connect still completes at the transport level.
        let mut stale_server = accept(&listener).await;
        assert_eq!(manager.send(fresh, "hello").unwrap(), Connection::Opening);
        let mut fresh_server = accept(&listener).await;

        let event = timeout(WAIT, manager.recv()).await.unwrap();
        assert_eq!(event, fresh.tag(ChannelEvent::Connected));
        assert_eq!(manager.activation(), Some(fresh));

        let closed = timeout(WAIT, stale_server.next()).await.unwrap();
        assert!(matches!(closed, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        assert_eq!(next_json(&mut fresh_server).await["data"]["text"], json!("hello"));
    }
}
