use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::protocol::{self, ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Retry ceiling reached; the manager will not try again until `open` is
    /// called explicitly.
    Offline,
}

/// Transport credential established out of band (cookie-based session).
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session_token: String,
}

type Outbox = Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>;

/// Capability handed to dependents (presence, conversations): event
/// subscription, outgoing sends and state observation. Dependents never touch
/// the underlying socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    events: broadcast::Sender<ServerEvent>,
    outbox: Outbox,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue an event for the writer task. Rejected synchronously when the
    /// transport is not connected; nothing is buffered for later.
    pub fn send(&self, event: ClientEvent) -> Result<(), ChatError> {
        if self.state() != ConnectionState::Connected {
            return Err(ChatError::Connection("not connected".to_string()));
        }
        let guard = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(event)
                .map_err(|_| ChatError::Connection("writer task ended".to_string())),
            None => Err(ChatError::Connection("not connected".to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        events: broadcast::Sender<ServerEvent>,
        outbox_tx: mpsc::UnboundedSender<ClientEvent>,
        state: ConnectionState,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(state);
        drop(state_tx); // receiver keeps serving the last value
        Self {
            events,
            outbox: Arc::new(Mutex::new(Some(outbox_tx))),
            state: state_rx,
        }
    }
}

/// Outcome of trying to take the single Connecting slot.
enum ConnectClaim {
    Claimed,
    AlreadyConnected,
    InFlight,
}

struct Inner {
    config: ChatConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Held so state publishes never fail for lack of subscribers.
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ServerEvent>,
    outbox: Outbox,
    user_id: Mutex<Option<String>>,
    /// Kept after a successful `open` so a mid-session transport loss can
    /// re-run the connect loop; cleared on explicit close.
    credentials: Mutex<Option<SessionCredentials>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            events: self.events_tx.clone(),
            outbox: self.outbox.clone(),
            state: self.state_rx.clone(),
        }
    }

    /// Atomically claim the sole Connecting slot. The check and the state
    /// publish happen under the watch lock, so two racing callers can never
    /// both claim it.
    fn claim_connecting(&self) -> ConnectClaim {
        let mut claim = ConnectClaim::InFlight;
        self.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Disconnected | ConnectionState::Offline => {
                *state = ConnectionState::Connecting;
                claim = ConnectClaim::Claimed;
                true
            }
            ConnectionState::Connecting => {
                claim = ConnectClaim::InFlight;
                false
            }
            ConnectionState::Connected => {
                claim = ConnectClaim::AlreadyConnected;
                false
            }
        });
        claim
    }

    /// Bounded retry loop. The caller must already hold the Connecting claim.
    /// Ends in Connected, Disconnected (auth rejection) or Offline.
    async fn run_connect_loop(
        self: &Arc<Self>,
        credentials: &SessionCredentials,
    ) -> Result<(), ChatError> {
        let mut delay = tokio::time::Duration::from_millis(self.config.retry_delay_ms);
        let delay_cap = tokio::time::Duration::from_millis(self.config.retry_delay_cap_ms);
        let attempt_timeout = tokio::time::Duration::from_millis(self.config.connect_timeout_ms);

        for attempt in 1..=self.config.max_connect_attempts {
            let outcome =
                match tokio::time::timeout(attempt_timeout, self.try_connect(credentials)).await {
                    Ok(result) => result,
                    Err(_) => Err(ChatError::Timeout),
                };
            match outcome {
                Ok(user_id) => {
                    info!("[WS:CLIENT] Connected and authenticated as {}", user_id);
                    *self.user_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(user_id.clone());
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    // Announce presence now that the room server knows us.
                    if let Err(e) = self.handle().send(ClientEvent::UserOnline { user_id }) {
                        warn!("[WS:CLIENT] Failed to announce presence: {}", e);
                    }
                    return Ok(());
                }
                Err(ChatError::Auth(msg)) => {
                    warn!("[WS:CLIENT] Authentication rejected: {}", msg);
                    let _ = self.state_tx.send(ConnectionState::Disconnected);
                    return Err(ChatError::Auth(msg));
                }
                Err(e) if attempt < self.config.max_connect_attempts => {
                    warn!(
                        "[WS:CLIENT] Connection attempt {} failed: {}; retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, delay_cap);
                }
                Err(e) => {
                    warn!("[WS:CLIENT] Connection attempt {} failed: {}; giving up", attempt, e);
                    let _ = self.state_tx.send(ConnectionState::Offline);
                    return Err(ChatError::Connection(format!(
                        "retry ceiling reached after {} attempts: {}",
                        attempt, e
                    )));
                }
            }
        }

        let _ = self.state_tx.send(ConnectionState::Offline);
        Err(ChatError::Connection("retry ceiling reached".to_string()))
    }

    async fn try_connect(
        self: &Arc<Self>,
        credentials: &SessionCredentials,
    ) -> Result<String, ChatError> {
        let url = Url::parse(&self.config.websocket_url)
            .map_err(|e| ChatError::Connection(format!("bad websocket url: {}", e)))?;

        info!("[WS:CLIENT] Connecting to {}", url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChatError::Connection(format!("failed to connect: {}", e)))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth = ClientEvent::Auth {
            session_token: credentials.session_token.clone(),
        };
        ws_sender
            .send(WsMessage::Text(protocol::encode_client_event(&auth)?))
            .await
            .map_err(|e| ChatError::Connection(format!("failed to send auth frame: {}", e)))?;

        // First text frame must be the auth verdict.
        let auth_response = loop {
            match ws_receiver.next().await {
                Some(Ok(WsMessage::Text(text))) => match protocol::parse_server_event(&text)? {
                    ServerEvent::AuthResponse(resp) => break resp,
                    other => {
                        return Err(ChatError::InvalidMessage(format!(
                            "expected authResponse, got {:?}",
                            other
                        )))
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(ChatError::Connection(
                        "server closed connection during auth".to_string(),
                    ));
                }
                Some(Ok(_)) => continue, // ping/pong
                Some(Err(e)) => {
                    return Err(ChatError::Connection(format!("socket error during auth: {}", e)));
                }
            }
        };

        if !auth_response.success {
            let msg = auth_response
                .error
                .unwrap_or_else(|| "unknown authentication error".to_string());
            return Err(ChatError::Auth(msg));
        }
        let user_id = auth_response
            .user_id
            .ok_or_else(|| ChatError::Auth("auth response without user id".to_string()))?;

        // Bridge the socket halves with channels, as usual: one task drains the
        // outbox into the sink, one task forwards parsed frames to subscribers.
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();
        {
            let mut guard = self.outbox.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(outgoing_tx);
        }

        tokio::spawn(async move {
            while let Some(event) = outgoing_rx.recv().await {
                match protocol::encode_client_event(&event) {
                    Ok(json) => {
                        if let Err(e) = ws_sender.send(WsMessage::Text(json)).await {
                            warn!("[WS:CLIENT] Failed to send frame: {}", e);
                            break;
                        }
                    }
                    Err(e) => warn!("[WS:CLIENT] Dropping unserializable event: {}", e),
                }
            }
            let _ = ws_sender.close().await;
        });

        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match protocol::parse_server_event(&text) {
                        Ok(event) => {
                            // No subscribers is fine; presence and conversations
                            // attach on their own schedule.
                            let _ = inner.events_tx.send(event);
                        }
                        Err(e) => warn!("[WS:CLIENT] Unparseable frame: {} - raw: {}", e, text),
                    },
                    Ok(WsMessage::Close(_)) => {
                        info!("[WS:CLIENT] Connection closed by server");
                        break;
                    }
                    Ok(_) => {} // binary/ping/pong
                    Err(e) => {
                        warn!("[WS:CLIENT] Socket error: {}", e);
                        break;
                    }
                }
            }
            inner.on_transport_loss();
        });

        Ok(user_id)
    }

    /// Reader-task death. If the transport was lost rather than explicitly
    /// closed, re-enter the bounded connect loop with the stored credentials
    /// so the session ends up Connected again or Offline, never silently dead.
    fn on_transport_loss(self: &Arc<Self>) {
        *self.outbox.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let lost = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !lost {
            // Explicit close() or an open() that never finished.
            return;
        }

        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(credentials) = credentials else {
            return;
        };

        warn!("[WS:CLIENT] Transport lost; reconnecting");
        let inner = self.clone();
        tokio::spawn(async move {
            if !matches!(inner.claim_connecting(), ConnectClaim::Claimed) {
                return;
            }
            if let Err(e) = inner.run_connect_loop(&credentials).await {
                warn!("[WS:CLIENT] Reconnect failed: {}", e);
            }
        });
    }
}

/// Owns the one long-lived transport connection for the whole client session.
/// Nothing else opens or closes the socket.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ChatConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                state_tx,
                state_rx,
                events_tx,
                outbox: Arc::new(Mutex::new(None)),
                user_id: Mutex::new(None),
                credentials: Mutex::new(None),
            }),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.inner.handle()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Identity of the authenticated user, set once the server confirms auth.
    pub fn authenticated_user(&self) -> Option<String> {
        self.inner
            .user_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Establish the transport. Transient failures are retried with a doubling
    /// capped delay up to the configured attempt ceiling, then the state goes
    /// `Offline`. Auth rejection is fatal and never retried. At most one
    /// attempt is ever in flight; a concurrent `open` is rejected.
    pub async fn open(&self, credentials: &SessionCredentials) -> Result<(), ChatError> {
        match self.inner.claim_connecting() {
            ConnectClaim::AlreadyConnected => return Ok(()),
            ConnectClaim::InFlight => {
                return Err(ChatError::InvalidState(
                    "connection attempt already in flight".to_string(),
                ));
            }
            ConnectClaim::Claimed => {}
        }
        *self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(credentials.clone());
        self.inner.run_connect_loop(credentials).await
    }

    /// Tear down the transport. Idempotent and legal in every state; after the
    /// retry ceiling (`Offline`) there is nothing to release and the call is a
    /// no-op. Dropping the credentials also stops any reconnect on behalf of
    /// this session.
    pub fn close(&self) {
        *self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        let had_outbox = {
            let mut guard = self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner());
            guard.take().is_some()
        };
        if had_outbox {
            info!("[WS:CLIENT] Transport closed");
        }
        self.inner.state_tx.send_if_modified(|state| match *state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                *state = ConnectionState::Disconnected;
                true
            }
            // Disconnected stays put; Offline keeps recording exhaustion.
            _ => false,
        });
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Put the manager into an established session without a live socket.
    /// Returns the outbox receiver standing in for the writer task.
    pub(crate) fn test_established(
        &self,
        user_id: &str,
        credentials: Option<SessionCredentials>,
    ) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.inner.user_id.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(user_id.to_string());
        *self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = credentials;
        let _ = self.inner.state_tx.send(ConnectionState::Connected);
        rx
    }

    pub(crate) fn test_transport_loss(&self) {
        self.inner.on_transport_loss();
    }

    pub(crate) fn test_events(&self) -> broadcast::Sender<ServerEvent> {
        self.inner.events_tx.clone()
    }
}
