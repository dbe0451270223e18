//! End-to-end tests over an in-process loopback radio and a scripted
//! speech engine: pairing, word streaming, watchdog restarts, and audio
//! mute balance.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch, Mutex};

use dictalink::data::{DeliveryConfig, LinkConfig, PairedPeerStore, SpeechConfig};
use dictalink::pipeline::WordSender;
use dictalink::speech::{
    AudioOutput, EngineError, EngineEvent, EngineHandle, RecognizerState, SpeechController,
    SpeechEngine, SpeechEvent, VolumeSnapshot,
};
use dictalink::transport::{
    chunk_message, CipherContext, ClientIdentity, ConnectionError, ConnectionManager,
    ConnectionState, DiscoveredPeer, EcdhKeypair, LinkDriver, LinkError, Message, MessageType,
    PairAckPayload, PairRequestPayload, PairStatus, RadioLink, Reassembler, RetryPolicy,
    WordPayload,
};

// ---------------------------------------------------------------------------
// Fakes

/// In-process host on the other end of the radio: answers PAIR_REQ with its
/// own key exchange and records every WORD it can decrypt.
struct HostState {
    reassembler: Reassembler,
    cipher: Option<CipherContext>,
    words: Vec<WordPayload>,
    notif_tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HostMode {
    /// Answer pairing and record words.
    Normal,
    /// Swallow everything without answering (pairing never completes).
    Silent,
    /// Close the notification stream when the pairing request arrives.
    DropOnPair,
}

struct LoopbackRadio {
    host: std::sync::Mutex<HostState>,
    mtu: usize,
    mode: HostMode,
}

impl LoopbackRadio {
    fn new(mtu: usize, mode: HostMode) -> Self {
        Self {
            host: std::sync::Mutex::new(HostState {
                reassembler: Reassembler::new(),
                cipher: None,
                words: Vec::new(),
                notif_tx: None,
            }),
            mtu,
            mode,
        }
    }

    fn words(&self) -> Vec<WordPayload> {
        self.host.lock().unwrap().words.clone()
    }

    fn reply(host: &mut HostState, message: &Message, mtu: usize) {
        let json = message.to_json().unwrap();
        let chunks = chunk_message(json.as_bytes(), mtu, false).unwrap();
        if let Some(tx) = host.notif_tx.as_ref() {
            for chunk in chunks {
                let _ = tx.try_send(chunk);
            }
        }
    }

    fn handle_message(host: &mut HostState, message: Message, mtu: usize) {
        match message.message_type {
            MessageType::PairReq => {
                let req: PairRequestPayload = serde_json::from_str(&message.payload).unwrap();
                let keypair = EcdhKeypair::generate().unwrap();
                let host_public = keypair.public_key_base64();
                let secret = keypair.agree_base64(&req.public_key).unwrap();
                host.cipher = Some(CipherContext::from_shared_secret(&secret).unwrap());
                let ack = PairAckPayload {
                    device_id: "host-1".to_string(),
                    status: PairStatus::Ok,
                    public_key: Some(host_public),
                    error: None,
                };
                let reply =
                    Message::new(MessageType::PairAck, serde_json::to_string(&ack).unwrap());
                Self::reply(host, &reply, mtu);
            }
            MessageType::Word => {
                host.words.push(WordPayload::from_json(&message.payload).unwrap());
            }
            MessageType::Heartbeat => {
                let reply = Message::ack(message.timestamp);
                Self::reply(host, &reply, mtu);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl RadioLink for LoopbackRadio {
    async fn start_scan(&self, found: mpsc::Sender<DiscoveredPeer>) -> Result<(), LinkError> {
        let _ = found
            .send(DiscoveredPeer {
                address: "host".to_string(),
                name: Some("Loopback Host".to_string()),
                rssi: Some(-40),
            })
            .await;
        Ok(())
    }

    async fn stop_scan(&self) {}

    async fn connect(&self, _address: &str) -> Result<(), LinkError> {
        Ok(())
    }

    async fn disconnect(&self) {
        let mut host = self.host.lock().unwrap();
        host.notif_tx = None;
        host.reassembler.reset();
    }

    async fn negotiate_mtu(&self) -> Result<usize, LinkError> {
        Ok(self.mtu)
    }

    async fn enable_notifications(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn write_chunk(&self, data: &[u8]) -> Result<(), LinkError> {
        let mut host = self.host.lock().unwrap();
        let Some(complete) = host.reassembler.push(data)? else {
            return Ok(());
        };
        if self.mode == HostMode::Silent {
            return Ok(());
        }
        let plaintext = if complete.encrypted {
            match host.cipher.as_ref() {
                Some(cipher) => cipher.open(&complete.data).unwrap(),
                None => return Ok(()),
            }
        } else {
            complete.data
        };
        let message = Message::from_json(std::str::from_utf8(&plaintext).unwrap()).unwrap();
        if self.mode == HostMode::DropOnPair && message.message_type == MessageType::PairReq {
            host.notif_tx = None;
            return Ok(());
        }
        Self::handle_message(&mut host, message, self.mtu);
        Ok(())
    }

    async fn subscribe(&self) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(64);
        self.host.lock().unwrap().notif_tx = Some(tx);
        rx
    }
}

/// Engine factory handing out pre-scripted instances; each successful
/// instance emits its script as soon as it is started.
struct ScriptedEngine {
    scripts: std::sync::Mutex<VecDeque<Result<Vec<EngineEvent>, EngineError>>>,
    created: AtomicU32,
}

impl ScriptedEngine {
    fn new(scripts: Vec<Result<Vec<EngineEvent>, EngineError>>) -> Self {
        Self {
            scripts: std::sync::Mutex::new(scripts.into()),
            created: AtomicU32::new(0),
        }
    }

    fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

impl SpeechEngine for ScriptedEngine {
    fn create(
        &self,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        match self.scripts.lock().unwrap().pop_front() {
            Some(Ok(script)) => Ok(Box::new(ScriptedHandle { script, events })),
            Some(Err(e)) => Err(e),
            // Out of scripts: a quiet instance that only becomes ready.
            None => Ok(Box::new(ScriptedHandle {
                script: vec![EngineEvent::Ready],
                events,
            })),
        }
    }
}

struct ScriptedHandle {
    script: Vec<EngineEvent>,
    events: mpsc::Sender<EngineEvent>,
}

impl EngineHandle for ScriptedHandle {
    fn start(&mut self) -> Result<(), EngineError> {
        for event in self.script.drain(..) {
            let _ = self.events.try_send(event);
        }
        Ok(())
    }

    fn stop(&mut self) {}

    fn destroy(&mut self) {}
}

/// Mixer fake counting mute/restore pairs and checking the snapshot comes
/// back unchanged.
#[derive(Default)]
struct RecordingAudio {
    mutes: AtomicU32,
    restores: AtomicU32,
}

impl RecordingAudio {
    fn mutes(&self) -> u32 {
        self.mutes.load(Ordering::SeqCst)
    }

    fn restores(&self) -> u32 {
        self.restores.load(Ordering::SeqCst)
    }
}

impl AudioOutput for RecordingAudio {
    fn mute_all(&self) -> VolumeSnapshot {
        self.mutes.fetch_add(1, Ordering::SeqCst);
        VolumeSnapshot {
            levels: vec![("speakers".to_string(), 40)],
        }
    }

    fn restore(&self, snapshot: VolumeSnapshot) {
        assert_eq!(snapshot.levels, vec![("speakers".to_string(), 40)]);
        self.restores.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn identity() -> ClientIdentity {
    ClientIdentity {
        device_id: "client-1".to_string(),
        device_name: "Test Client".to_string(),
    }
}

async fn wait_for<T: Copy + PartialEq + std::fmt::Debug>(mut rx: watch::Receiver<T>, want: T) {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if *rx.borrow() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {want:?}"));
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Rig {
    radio: Arc<LoopbackRadio>,
    connection: dictalink::transport::ConnectionHandle,
    store: Arc<Mutex<PairedPeerStore>>,
    _dir: TempDir,
}

fn rig(mode: HostMode) -> Rig {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Mutex::new(PairedPeerStore::new(dir.path()).unwrap()));
    let radio = Arc::new(LoopbackRadio::new(185, mode));
    let retry = RetryPolicy {
        attempts: 3,
        base_delay: Duration::from_millis(1),
    };
    let driver = Arc::new(LinkDriver::new(radio.clone(), retry, Duration::ZERO));
    let (event_tx, mut events) = mpsc::channel(64);
    // Drain connection events so the actor never blocks on a full channel.
    tokio::spawn(async move { while events.recv().await.is_some() {} });
    let connection = ConnectionManager::spawn(
        driver,
        store.clone(),
        identity(),
        LinkConfig::default(),
        event_tx,
    );
    Rig {
        radio,
        connection,
        store,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn words_stream_end_to_end_over_paired_link() {
    let rig = rig(HostMode::Normal);
    rig.connection.connect("host").await.unwrap();
    wait_for(rig.connection.watch_state(), ConnectionState::Ready).await;
    assert!(rig.store.lock().await.is_paired("host"));

    let engine = Arc::new(ScriptedEngine::new(vec![Ok(vec![
        EngineEvent::Ready,
        EngineEvent::Partial("hello".to_string()),
        EngineEvent::Terminal("hello world".to_string()),
    ])]));
    let audio = Arc::new(RecordingAudio::default());
    let (speech_tx, speech_rx) = mpsc::channel(64);
    let speech = SpeechController::spawn(
        engine.clone(),
        audio.clone(),
        SpeechConfig::default(),
        speech_tx,
    );
    WordSender::spawn(
        rig.connection.clone(),
        DeliveryConfig {
            word_send_attempts: 3,
            word_retry_delay_ms: 5,
        },
        speech_rx,
    );

    speech.start().await.unwrap();
    let radio = rig.radio.clone();
    wait_until(move || radio.words().len() >= 2).await;

    let words = rig.radio.words();
    assert_eq!(words.len(), 2);
    assert_eq!(words[0].word, "hello");
    assert_eq!(words[0].seq, Some(0));
    assert_eq!(words[1].word, "world");
    assert_eq!(words[1].seq, Some(1));
    assert!(!words[0].session.is_empty());
    assert_eq!(words[0].session, words[1].session);
    // The user-initiated start is audible: no mute happened.
    assert_eq!(audio.mutes(), 0);
}

#[tokio::test(start_paused = true)]
async fn pairing_timeout_fails_then_fresh_connect_restarts() {
    let rig = rig(HostMode::Silent);
    rig.connection.connect("host").await.unwrap();
    wait_for(rig.connection.watch_state(), ConnectionState::Failed).await;

    // A later connect is accepted and opens a fresh attempt with its own
    // timeout rather than reusing the expired one.
    rig.connection.connect("host").await.unwrap();
    assert_ne!(rig.connection.state(), ConnectionState::Failed);
    wait_for(rig.connection.watch_state(), ConnectionState::Failed).await;
}

#[tokio::test]
async fn connect_while_ready_is_rejected() {
    let rig = rig(HostMode::Normal);
    rig.connection.connect("host").await.unwrap();
    wait_for(rig.connection.watch_state(), ConnectionState::Ready).await;

    let err = rig.connection.connect("host").await.unwrap_err();
    assert!(matches!(
        err,
        ConnectionError::InvalidState { op: "connect", .. }
    ));
    assert_eq!(rig.connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn link_drop_during_pairing_reports_failure() {
    let rig = rig(HostMode::DropOnPair);
    rig.connection.connect("host").await.unwrap();
    // The notification stream closes mid-pairing: that is a failed
    // connect, not a clean disconnect back to idle.
    wait_for(rig.connection.watch_state(), ConnectionState::Failed).await;
}

#[tokio::test]
async fn words_preserve_utterance_order_across_partials_and_terminals() {
    let rig = rig(HostMode::Normal);
    rig.connection.connect("host").await.unwrap();
    wait_for(rig.connection.watch_state(), ConnectionState::Ready).await;

    let engine = Arc::new(ScriptedEngine::new(vec![Ok(vec![
        EngineEvent::Ready,
        EngineEvent::Partial("hello".to_string()),
        EngineEvent::Partial("hello there".to_string()),
        EngineEvent::Terminal("hello there friend".to_string()),
        EngineEvent::Partial("good".to_string()),
        EngineEvent::Terminal("good morning".to_string()),
    ])]));
    let audio = Arc::new(RecordingAudio::default());
    let (speech_tx, speech_rx) = mpsc::channel(64);
    let speech = SpeechController::spawn(
        engine.clone(),
        audio.clone(),
        SpeechConfig::default(),
        speech_tx,
    );
    WordSender::spawn(
        rig.connection.clone(),
        DeliveryConfig {
            word_send_attempts: 3,
            word_retry_delay_ms: 5,
        },
        speech_rx,
    );

    speech.start().await.unwrap();
    let radio = rig.radio.clone();
    wait_until(move || radio.words().len() >= 5).await;

    let words = rig.radio.words();
    let texts: Vec<&str> = words.iter().map(|w| w.word.as_str()).collect();
    assert_eq!(texts, ["hello", "there", "friend", "good", "morning"]);
    for (i, word) in words.iter().enumerate() {
        assert_eq!(word.seq, Some(i as u64));
        assert_eq!(word.session, words[0].session);
    }
}

#[tokio::test(start_paused = true)]
async fn wedged_restart_instance_is_recreated_by_stuck_watchdog() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        Ok(vec![EngineEvent::Ready]),
        // The replacement instance starts but never reports ready.
        Ok(vec![]),
        Ok(vec![EngineEvent::Ready]),
    ]));
    let audio = Arc::new(RecordingAudio::default());
    let (speech_tx, mut speech_rx) = mpsc::channel(64);
    tokio::spawn(async move { while speech_rx.recv().await.is_some() {} });
    let speech = SpeechController::spawn(
        engine.clone(),
        audio.clone(),
        SpeechConfig::default(),
        speech_tx,
    );

    speech.start().await.unwrap();
    wait_for(speech.watch_state(), RecognizerState::Listening).await;

    // Silence brings up instance 2, which wedges before ready while the
    // observable state stays LISTENING; the stuck watchdog must still
    // replace it rather than leave dictation dead.
    let e = engine.clone();
    wait_until(move || e.created() >= 3).await;
    let a = audio.clone();
    wait_until(move || a.mutes() >= 2 && a.mutes() == a.restores()).await;
    assert_eq!(speech.state(), RecognizerState::Listening);
}

#[tokio::test(start_paused = true)]
async fn silence_watchdog_recreates_engine_with_balanced_mute() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        Ok(vec![EngineEvent::Ready]),
        Ok(vec![EngineEvent::Ready]),
    ]));
    let audio = Arc::new(RecordingAudio::default());
    let (speech_tx, mut speech_rx) = mpsc::channel(64);
    tokio::spawn(async move { while speech_rx.recv().await.is_some() {} });
    let speech = SpeechController::spawn(
        engine.clone(),
        audio.clone(),
        SpeechConfig::default(),
        speech_tx,
    );

    speech.start().await.unwrap();
    let state = speech.watch_state();
    wait_for(state, RecognizerState::Listening).await;
    assert_eq!(engine.created(), 1);

    // No partial results: the watchdog must recreate the engine under a
    // mute window, leaving the observable state LISTENING throughout.
    let e = engine.clone();
    let a = audio.clone();
    wait_until(move || e.created() >= 2 && a.mutes() >= 1 && a.mutes() == a.restores()).await;
    assert_eq!(speech.state(), RecognizerState::Listening);
}

#[tokio::test(start_paused = true)]
async fn failing_engine_disables_auto_restart_and_unmutes() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        Ok(vec![EngineEvent::Ready]),
        Err(EngineError::Busy),
        Err(EngineError::Busy),
        Err(EngineError::Busy),
        Err(EngineError::Busy),
        Err(EngineError::Busy),
    ]));
    let audio = Arc::new(RecordingAudio::default());
    let (speech_tx, mut speech_rx) = mpsc::channel(64);
    let speech = SpeechController::spawn(
        engine.clone(),
        audio.clone(),
        SpeechConfig::default(),
        speech_tx,
    );

    speech.start().await.unwrap();
    wait_for(speech.watch_state(), RecognizerState::Listening).await;

    // Every recreate attempt throws; after the limit the controller gives
    // up, surfaces the failure, and must not leave the mixer muted.
    wait_for(speech.watch_state(), RecognizerState::Idle).await;
    let mut saw_error = false;
    while let Ok(event) = speech_rx.try_recv() {
        if matches!(event, SpeechEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error, "permanent failure was not surfaced");
    assert!(audio.mutes() >= 1);
    assert_eq!(audio.mutes(), audio.restores());

    // Listening stays off until an explicit start.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(speech.state(), RecognizerState::Idle);
    speech.start().await.unwrap();
    wait_for(speech.watch_state(), RecognizerState::Listening).await;
}
