//! Connection State Machine
//!
//! Sequences discovery, link establishment and pairing, and owns the single
//! authoritative [`ConnectionState`]. All transitions run on one actor task;
//! the rest of the crate talks to it through a [`ConnectionHandle`] and
//! observes state through a watch channel. No message reaches the link
//! driver unless the state is READY.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::data::PairedPeerStore;

use super::crypto::{CipherContext, CryptoError, EcdhKeypair};
use super::link::{DiscoveredPeer, LinkDriver, LinkError};
use super::packet::Reassembler;
use super::protocol::{
    Message, MessageType, PairAckPayload, PairRequestPayload, PairStatus, CONTROL_REAUTH,
};

/// Authoritative connection state. Exactly one live instance per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    AwaitingPairing,
    Pairing,
    Ready,
    Reconnecting,
    Failed,
}

/// Events surfaced to the embedding frontend.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A peer was discovered (or rediscovered with fresher info).
    PeerDiscovered(DiscoveredPeer),
    /// Pairing completed or a stored secret reauthenticated.
    Connected { address: String, display_name: Option<String> },
    Disconnected,
    /// User-visible failure description; state carries the FAILED transition.
    Error(String),
    /// Repeated decrypt/reassembly failures on an otherwise live link.
    DegradedLink,
    /// Application message from the host (COMMAND/CONTROL traffic).
    MessageReceived(Message),
}

/// Errors surfaced through the handle.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("operation {op} invalid in state {state:?}")]
    InvalidState { op: &'static str, state: ConnectionState },
    #[error("link not ready")]
    NotReady,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("connection actor gone")]
    ChannelClosed,
    #[error("{0}")]
    Other(String),
}

/// Identity presented in pairing requests.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub device_id: String,
    pub device_name: String,
}

enum Command {
    StartDiscovery(oneshot::Sender<Result<(), ConnectionError>>),
    Connect(String, oneshot::Sender<Result<(), ConnectionError>>),
    Disconnect(oneshot::Sender<()>),
    Forget(String, oneshot::Sender<Result<bool, ConnectionError>>),
    Send(Message, oneshot::Sender<Result<(), ConnectionError>>),
}

enum Internal {
    Established(u64, Result<(), LinkError>),
    ReconnectNow(u64),
}

/// Cloneable handle to the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel for observing state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub async fn start_discovery(&self) -> Result<(), ConnectionError> {
        self.request(Command::StartDiscovery).await?
    }

    pub async fn connect(&self, address: &str) -> Result<(), ConnectionError> {
        let address = address.to_string();
        self.request(|tx| Command::Connect(address, tx)).await?
    }

    pub async fn disconnect(&self) {
        let _ = self.request(Command::Disconnect).await;
    }

    pub async fn forget(&self, address: &str) -> Result<bool, ConnectionError> {
        let address = address.to_string();
        self.request(|tx| Command::Forget(address, tx)).await?
    }

    /// Hand one message to the link; fails unless the state is READY.
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.request(|tx| Command::Send(message, tx)).await?
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ConnectionError::ChannelClosed)?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)
    }
}

/// What the actor is waiting on during authentication.
enum PendingAuth {
    /// Full exchange: our keypair is outstanding until PAIR_ACK arrives.
    Pairing { keypair: Option<EcdhKeypair> },
    /// Sealed REAUTH sent under the stored secret; an ACK proves the key.
    Reauth,
}

pub struct ConnectionManager {
    driver: Arc<LinkDriver>,
    store: Arc<Mutex<PairedPeerStore>>,
    identity: ClientIdentity,
    config: crate::data::LinkConfig,

    cmd_rx: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,

    scan_rx: Option<mpsc::Receiver<DiscoveredPeer>>,
    notif_rx: Option<mpsc::Receiver<Vec<u8>>>,

    /// Bumped on every connect/disconnect; stale timer and task callbacks
    /// from a superseded attempt are dropped by generation mismatch.
    generation: u64,
    deadline: Option<Instant>,
    heartbeat_at: Option<Instant>,
    attempt: Option<tokio::task::JoinHandle<()>>,

    current_address: Option<String>,
    current_name: Option<String>,
    pending_auth: Option<PendingAuth>,
    cipher: Option<Arc<CipherContext>>,
    reassembler: Reassembler,
    seen_peers: HashMap<String, DiscoveredPeer>,
    consecutive_bad: u32,
    reconnect_attempt: u32,
    reconnecting: bool,
}

impl ConnectionManager {
    /// Spawn the actor; returns the command handle.
    pub fn spawn(
        driver: Arc<LinkDriver>,
        store: Arc<Mutex<PairedPeerStore>>,
        identity: ClientIdentity,
        config: crate::data::LinkConfig,
        event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let manager = Self {
            driver,
            store,
            identity,
            config,
            cmd_rx,
            internal_tx,
            internal_rx,
            event_tx,
            state_tx,
            scan_rx: None,
            notif_rx: None,
            generation: 0,
            deadline: None,
            heartbeat_at: None,
            attempt: None,
            current_address: None,
            current_name: None,
            pending_auth: None,
            cipher: None,
            reassembler: Reassembler::new(),
            seen_peers: HashMap::new(),
            consecutive_bad: 0,
            reconnect_attempt: 0,
            reconnecting: false,
        };
        tokio::spawn(manager.run());

        ConnectionHandle { cmd_tx, state_rx }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() != state {
            info!("connection state {:?} -> {:?}", self.state(), state);
            let _ = self.state_tx.send(state);
        }
    }

    async fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                peer = async { self.scan_rx.as_mut().unwrap().recv().await },
                        if self.scan_rx.is_some() => {
                    match peer {
                        Some(peer) => self.handle_discovered(peer).await,
                        None => self.scan_rx = None,
                    }
                }
                packet = async { self.notif_rx.as_mut().unwrap().recv().await },
                        if self.notif_rx.is_some() => {
                    match packet {
                        Some(packet) => self.handle_packet(&packet).await,
                        None => self.handle_link_lost().await,
                    }
                }
                _ = async { tokio::time::sleep_until(self.deadline.unwrap()).await },
                        if self.deadline.is_some() => {
                    self.handle_pairing_timeout().await;
                }
                _ = async { tokio::time::sleep_until(self.heartbeat_at.unwrap()).await },
                        if self.heartbeat_at.is_some() => {
                    self.send_heartbeat().await;
                }
            }
        }
        debug!("connection actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartDiscovery(resp) => {
                let _ = resp.send(self.start_discovery().await);
            }
            Command::Connect(address, resp) => {
                let _ = resp.send(self.begin_connect(&address, false).await);
            }
            Command::Disconnect(resp) => {
                self.disconnect_internal(true).await;
                let _ = resp.send(());
            }
            Command::Forget(address, resp) => {
                let result = self
                    .store
                    .lock()
                    .await
                    .forget(&address)
                    .map_err(|e| ConnectionError::Other(e.to_string()));
                let _ = resp.send(result);
            }
            Command::Send(message, resp) => {
                let _ = resp.send(self.send_app_message(message).await);
            }
        }
    }

    async fn start_discovery(&mut self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Failed => {}
            ConnectionState::Scanning => return Ok(()), // restartable stream, already live
            state => return Err(ConnectionError::InvalidState { op: "start_discovery", state }),
        }
        let (tx, rx) = mpsc::channel(32);
        self.driver.radio().start_scan(tx).await?;
        self.scan_rx = Some(rx);
        self.seen_peers.clear();
        self.set_state(ConnectionState::Scanning);
        Ok(())
    }

    async fn handle_discovered(&mut self, peer: DiscoveredPeer) {
        // Deduplicate by address; re-emit only when the advertisement changed.
        let refresh = match self.seen_peers.get(&peer.address) {
            Some(known) => known != &peer,
            None => true,
        };
        if refresh {
            self.seen_peers.insert(peer.address.clone(), peer.clone());
            self.emit(ConnectionEvent::PeerDiscovered(peer)).await;
        }
    }

    async fn begin_connect(&mut self, address: &str, reconnect: bool) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Idle
            | ConnectionState::Scanning
            | ConnectionState::Failed
            | ConnectionState::Reconnecting => {}
            state => return Err(ConnectionError::InvalidState { op: "connect", state }),
        }

        if self.scan_rx.is_some() {
            self.driver.radio().stop_scan().await;
            self.scan_rx = None;
        }

        self.generation += 1;
        let generation = self.generation;
        self.reconnecting = reconnect;
        self.current_address = Some(address.to_string());
        self.current_name = self
            .seen_peers
            .get(address)
            .and_then(|p| p.name.clone())
            .or(self.current_name.take());
        self.deadline = Some(Instant::now() + self.config.pairing_timeout());
        self.set_state(ConnectionState::Connecting);

        let driver = self.driver.clone();
        let internal_tx = self.internal_tx.clone();
        let address = address.to_string();
        self.attempt = Some(tokio::spawn(async move {
            let result = driver.establish(&address).await;
            let _ = internal_tx.send(Internal::Established(generation, result)).await;
        }));
        Ok(())
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Established(generation, result) => {
                if generation != self.generation {
                    debug!("stale establish outcome dropped");
                    return;
                }
                self.attempt = None;
                match result {
                    Ok(()) => self.begin_authentication().await,
                    Err(e) => {
                        self.fail(format!("connect failed: {e}")).await;
                    }
                }
            }
            Internal::ReconnectNow(generation) => {
                if generation != self.generation || !self.reconnecting {
                    return;
                }
                let Some(address) = self.current_address.clone() else { return };
                info!("auto-reconnect attempt {}", self.reconnect_attempt + 1);
                if let Err(e) = self.begin_connect(&address, true).await {
                    warn!("reconnect attempt rejected: {e}");
                }
            }
        }
    }

    async fn begin_authentication(&mut self) {
        self.notif_rx = Some(self.driver.subscribe().await);
        self.reassembler.reset();
        self.consecutive_bad = 0;

        let address = self.current_address.clone().unwrap_or_default();
        let stored_secret = {
            let store = self.store.lock().await;
            store.get(&address).and_then(|p| p.secret().ok())
        };

        // A prior secret gets one silent reauthentication attempt before we
        // fall back to a full exchange (which needs host-side confirmation).
        if let Some(secret) = stored_secret {
            match CipherContext::from_shared_secret(&secret) {
                Ok(cipher) => {
                    self.cipher = Some(Arc::new(cipher));
                    self.pending_auth = Some(PendingAuth::Reauth);
                    self.set_state(ConnectionState::Pairing);
                    let reauth = Message::new(MessageType::Control, CONTROL_REAUTH.to_string());
                    if let Err(e) = self.transmit(&reauth, true).await {
                        warn!("reauth send failed, falling back to pairing: {e}");
                        self.start_full_pairing().await;
                    }
                    return;
                }
                Err(e) => warn!("stored secret unusable: {e}"),
            }
        }
        self.start_full_pairing().await;
    }

    async fn start_full_pairing(&mut self) {
        self.cipher = None;
        let keypair = match EcdhKeypair::generate() {
            Ok(kp) => kp,
            Err(e) => {
                self.fail(format!("keypair generation failed: {e}")).await;
                return;
            }
        };
        let payload = PairRequestPayload {
            device_id: self.identity.device_id.clone(),
            device_name: Some(self.identity.device_name.clone()),
            public_key: keypair.public_key_base64(),
        };
        let json = match payload.to_json() {
            Ok(json) => json,
            Err(e) => {
                self.fail(format!("pairing payload: {e}")).await;
                return;
            }
        };
        let request = Message::new(MessageType::PairReq, json);
        self.pending_auth = Some(PendingAuth::Pairing { keypair: Some(keypair) });
        self.set_state(ConnectionState::AwaitingPairing);
        if let Err(e) = self.transmit(&request, false).await {
            self.fail(format!("pairing request send failed: {e}")).await;
        }
    }

    async fn handle_packet(&mut self, packet: &[u8]) {
        let complete = match self.reassembler.push(packet) {
            Ok(Some(complete)) => complete,
            Ok(None) => return,
            Err(e) => {
                warn!("reassembly error: {e}");
                self.note_bad_message().await;
                return;
            }
        };

        let plaintext = if complete.encrypted {
            let Some(cipher) = self.cipher.as_ref() else {
                warn!("encrypted message before key agreement, dropped");
                self.note_bad_message().await;
                return;
            };
            match cipher.open(&complete.data) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("dropping undecryptable message: {e}");
                    self.note_bad_message().await;
                    return;
                }
            }
        } else {
            complete.data
        };

        let json = match String::from_utf8(plaintext) {
            Ok(json) => json,
            Err(_) => {
                warn!("inbound message is not UTF-8, dropped");
                self.note_bad_message().await;
                return;
            }
        };
        let message = match Message::from_json(&json) {
            Ok(message) => message,
            Err(e) => {
                warn!("inbound message unparseable: {e}");
                self.note_bad_message().await;
                return;
            }
        };
        self.consecutive_bad = 0;
        self.dispatch_message(message).await;
    }

    async fn dispatch_message(&mut self, message: Message) {
        match message.message_type {
            MessageType::PairAck => self.handle_pair_ack(&message).await,
            MessageType::Ack => {
                if matches!(self.pending_auth, Some(PendingAuth::Reauth)) {
                    self.pending_auth = None;
                    self.complete_ready(false).await;
                }
            }
            MessageType::Heartbeat => {
                let ack = Message::ack(message.timestamp);
                if let Err(e) = self.transmit(&ack, false).await {
                    debug!("heartbeat ack failed: {e}");
                }
            }
            MessageType::Command | MessageType::Control => {
                self.emit(ConnectionEvent::MessageReceived(message)).await;
            }
            other => debug!("ignoring inbound message type {:?}", other),
        }
    }

    async fn handle_pair_ack(&mut self, message: &Message) {
        match self.pending_auth.take() {
            Some(PendingAuth::Pairing { mut keypair }) => {
                self.set_state(ConnectionState::Pairing);
                let ack = match PairAckPayload::from_json(&message.payload) {
                    Ok(ack) => ack,
                    Err(e) => {
                        self.fail(format!("PAIR_ACK unparseable: {e}")).await;
                        return;
                    }
                };
                if ack.status != PairStatus::Ok {
                    let reason = ack.error.unwrap_or_else(|| "pairing rejected".into());
                    self.fail(format!("host rejected pairing: {reason}")).await;
                    return;
                }
                let Some(host_key) = ack.public_key else {
                    self.fail("PAIR_ACK missing host public key".into()).await;
                    return;
                };
                let Some(keypair) = keypair.take() else {
                    self.fail("pairing keypair already consumed".into()).await;
                    return;
                };
                let secret = match keypair.agree_base64(&host_key) {
                    Ok(secret) => secret,
                    Err(e) => {
                        self.fail(format!("key agreement failed: {e}")).await;
                        return;
                    }
                };
                let cipher = match CipherContext::from_shared_secret(&secret) {
                    Ok(cipher) => cipher,
                    Err(e) => {
                        self.fail(format!("cipher init failed: {e}")).await;
                        return;
                    }
                };
                self.cipher = Some(Arc::new(cipher));

                let address = self.current_address.clone().unwrap_or_default();
                let name = self.current_name.clone();
                if let Err(e) = self
                    .store
                    .lock()
                    .await
                    .upsert(&address, name, &ack.device_id, &secret)
                {
                    // Pairing still succeeds; only persistence is degraded.
                    error!("failed to persist paired peer: {e}");
                }
                self.complete_ready(true).await;
            }
            Some(PendingAuth::Reauth) => {
                // Host could not authenticate our stored key; fall back.
                info!("silent reauthentication declined, starting full pairing");
                self.start_full_pairing().await;
            }
            None => debug!("unsolicited PAIR_ACK ignored"),
        }
    }

    async fn complete_ready(&mut self, fresh_pairing: bool) {
        self.deadline = None;
        self.reconnect_attempt = 0;
        self.reconnecting = false;
        let address = self.current_address.clone().unwrap_or_default();
        if !fresh_pairing {
            if let Err(e) = self.store.lock().await.touch_connected(&address) {
                debug!("could not refresh last_connected_at: {e}");
            }
        }
        self.heartbeat_at = Some(Instant::now() + self.config.heartbeat_interval());
        self.set_state(ConnectionState::Ready);
        self.emit(ConnectionEvent::Connected {
            address,
            display_name: self.current_name.clone(),
        })
        .await;
    }

    async fn send_app_message(&mut self, message: Message) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Ready {
            return Err(ConnectionError::NotReady);
        }
        let encrypt = matches!(
            message.message_type,
            MessageType::Word | MessageType::Command | MessageType::Control
        );
        self.transmit(&message, encrypt).await
    }

    async fn transmit(&mut self, message: &Message, encrypt: bool) -> Result<(), ConnectionError> {
        let json = message
            .to_json()
            .map_err(|e| ConnectionError::Other(e.to_string()))?;
        let (bytes, encrypted) = if encrypt {
            let cipher = self.cipher.as_ref().ok_or(ConnectionError::NotReady)?;
            (cipher.seal(json.as_bytes())?, true)
        } else {
            (json.into_bytes(), false)
        };
        self.driver.send_message(&bytes, encrypted).await?;
        Ok(())
    }

    async fn send_heartbeat(&mut self) {
        if self.state() != ConnectionState::Ready {
            self.heartbeat_at = None;
            return;
        }
        self.heartbeat_at = Some(Instant::now() + self.config.heartbeat_interval());
        if let Err(e) = self.transmit(&Message::heartbeat(), false).await {
            warn!("heartbeat failed: {e}");
            self.handle_link_lost().await;
        }
    }

    async fn note_bad_message(&mut self) {
        self.consecutive_bad += 1;
        if self.consecutive_bad == self.config.degraded_link_threshold {
            warn!(
                "{} consecutive undeliverable messages, link degraded",
                self.consecutive_bad
            );
            self.emit(ConnectionEvent::DegradedLink).await;
        }
    }

    async fn handle_pairing_timeout(&mut self) {
        self.deadline = None;
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connecting | ConnectionState::AwaitingPairing | ConnectionState::Pairing
        ) {
            return;
        }
        warn!("pairing timed out in state {:?}", state);
        let was_reconnect = self.reconnecting;
        self.teardown_link().await;
        if was_reconnect {
            self.schedule_reconnect().await;
        } else {
            self.set_state(ConnectionState::Failed);
            self.emit(ConnectionEvent::Error(format!(
                "pairing timed out after {}s",
                self.config.pairing_timeout_secs
            )))
            .await;
        }
    }

    async fn handle_link_lost(&mut self) {
        let state = self.state();
        match state {
            ConnectionState::Idle => return,
            ConnectionState::Ready => {}
            // The link died before authentication finished; that is a
            // failed connect, not a clean disconnect.
            _ => {
                self.fail(format!("link lost in state {state:?}")).await;
                return;
            }
        }
        info!("link lost while ready");
        self.teardown_link().await;
        self.emit(ConnectionEvent::Disconnected).await;

        if self.config.auto_reconnect && self.current_address.is_some() {
            self.schedule_reconnect().await;
        } else {
            self.set_state(ConnectionState::Idle);
        }
    }

    async fn schedule_reconnect(&mut self) {
        self.reconnecting = true;
        self.set_state(ConnectionState::Reconnecting);
        let backoff = Duration::from_millis(
            (self.config.reconnect_backoff_base_ms
                * 2u64.saturating_pow(self.reconnect_attempt))
            .min(self.config.reconnect_backoff_cap_ms),
        );
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        debug!("reconnect in {:?}", backoff);
        let internal_tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = internal_tx.send(Internal::ReconnectNow(generation)).await;
        });
    }

    async fn fail(&mut self, reason: String) {
        error!("{reason}");
        let was_reconnect = self.reconnecting;
        self.teardown_link().await;
        if was_reconnect {
            self.schedule_reconnect().await;
        } else {
            self.set_state(ConnectionState::Failed);
            self.emit(ConnectionEvent::Error(reason)).await;
        }
    }

    /// Explicit disconnect; `user_initiated` suppresses auto-reconnect.
    async fn disconnect_internal(&mut self, user_initiated: bool) {
        if self.state() == ConnectionState::Idle {
            return; // idempotent
        }
        if user_initiated {
            self.reconnecting = false;
            self.reconnect_attempt = 0;
            self.current_address = None;
            self.current_name = None;
        }
        self.teardown_link().await;
        self.set_state(ConnectionState::Idle);
        self.emit(ConnectionEvent::Disconnected).await;
    }

    /// Drop link-scoped resources and cancel in-flight work; bumping the
    /// generation strands stale timers and attempt outcomes.
    async fn teardown_link(&mut self) {
        self.generation += 1;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.deadline = None;
        self.heartbeat_at = None;
        self.pending_auth = None;
        self.cipher = None;
        self.notif_rx = None;
        self.reassembler.reset();
        self.consecutive_bad = 0;
        if self.scan_rx.is_some() {
            self.driver.radio().stop_scan().await;
            self.scan_rx = None;
        }
        self.driver.teardown().await;
    }
}
