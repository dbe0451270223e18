//! Speech Engine Controller
//!
//! Drives the platform engine through IDLE → STARTING → LISTENING →
//! STOPPING, absorbs its failure modes, and hides its audible start/stop
//! tone behind timed mute windows during automatic restarts. All transitions
//! run on one actor task; callbacks and timers are funnelled through typed
//! events so nothing mutates state re-entrantly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::SpeechConfig;

use super::audio::{AudioOutput, VolumeSnapshot};
use super::engine::{EngineError, EngineEvent, EngineHandle, RecognizerState, SpeechEngine};
use super::timer::TimerQueue;

/// A capture session. Created when the user (re)starts capture, never on
/// automatic engine restarts; superseded, not mutated.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Recognition results and failures surfaced to the word pipeline / UI.
#[derive(Debug, Clone)]
pub enum SpeechEvent {
    SessionStarted { session: String },
    Partial { session: String, text: String },
    Terminal { session: String, text: String },
    /// Permanent failure; listening has stopped and needs an explicit start.
    Error(String),
}

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("operation {op} invalid in state {state:?}")]
    InvalidState { op: &'static str, state: RecognizerState },
    #[error("no session to resume")]
    NoSession,
    #[error("speech actor gone")]
    ChannelClosed,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

enum Command {
    Start(oneshot::Sender<Result<(), SpeechError>>),
    Stop(oneshot::Sender<Result<(), SpeechError>>),
    Pause(oneshot::Sender<Result<(), SpeechError>>),
    Resume(oneshot::Sender<Result<(), SpeechError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// No partial result for too long; restart before the platform's own
    /// (audible) silence error fires.
    Silence,
    /// STARTING/STOPPING wedged without a terminal callback.
    Stuck,
    /// Muted restart step 2: tear the engine down.
    MuteTeardown,
    /// Muted restart step 3: start the recreated engine.
    MuteStart,
    /// Muted restart step 4: restore output levels.
    MuteRestore,
    /// Fallback restore in case the sequence stalls mid-way.
    SafetyUnmute,
    /// Grown delay before the next automatic restart after repeated errors.
    RestartDelay,
}

/// Cloneable handle to the controller actor.
#[derive(Clone)]
pub struct SpeechHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<RecognizerState>,
}

impl SpeechHandle {
    pub fn state(&self) -> RecognizerState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecognizerState> {
        self.state_rx.clone()
    }

    /// User-initiated start: new session, audible start tone.
    pub async fn start(&self) -> Result<(), SpeechError> {
        self.request(Command::Start).await?
    }

    pub async fn stop(&self) -> Result<(), SpeechError> {
        self.request(Command::Stop).await?
    }

    /// Stop listening but keep the session for a later resume.
    pub async fn pause(&self) -> Result<(), SpeechError> {
        self.request(Command::Pause).await?
    }

    /// Muted start continuing the paused session.
    pub async fn resume(&self) -> Result<(), SpeechError> {
        self.request(Command::Resume).await?
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SpeechError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| SpeechError::ChannelClosed)?;
        rx.await.map_err(|_| SpeechError::ChannelClosed)
    }
}

pub struct SpeechController {
    engine: Arc<dyn SpeechEngine>,
    audio: Arc<dyn AudioOutput>,
    config: SpeechConfig,

    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SpeechEvent>,
    state_tx: watch::Sender<RecognizerState>,

    engine_rx: Option<mpsc::Receiver<EngineEvent>>,
    handle: Option<Box<dyn EngineHandle>>,
    /// An engine instance exists but has not reported ready. Tracked apart
    /// from the observable state, which muted restarts leave untouched.
    awaiting_ready: bool,
    timers: TimerQueue<TimerKind>,
    /// Bumped whenever a transition supersedes pending timers.
    generation: u64,

    session: Option<Session>,
    paused: bool,
    /// Start arrived while STOPPING; begin a fresh session once idle.
    restart_pending: bool,

    consecutive_errors: u32,
    auto_restart: bool,
    segments_since_restart: u32,
    last_hard_restart: Instant,

    snapshot: Option<VolumeSnapshot>,
}

impl SpeechController {
    pub fn spawn(
        engine: Arc<dyn SpeechEngine>,
        audio: Arc<dyn AudioOutput>,
        config: SpeechConfig,
        event_tx: mpsc::Sender<SpeechEvent>,
    ) -> SpeechHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(RecognizerState::Idle);

        let controller = Self {
            engine,
            audio,
            config,
            cmd_rx,
            event_tx,
            state_tx,
            engine_rx: None,
            handle: None,
            awaiting_ready: false,
            timers: TimerQueue::new(),
            generation: 0,
            session: None,
            paused: false,
            restart_pending: false,
            consecutive_errors: 0,
            auto_restart: true,
            segments_since_restart: 0,
            last_hard_restart: Instant::now(),
            snapshot: None,
        };
        tokio::spawn(controller.run());

        SpeechHandle { cmd_tx, state_rx }
    }

    fn state(&self) -> RecognizerState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: RecognizerState) {
        if self.state() != state {
            debug!("recognizer state {:?} -> {:?}", self.state(), state);
            let _ = self.state_tx.send(state);
        }
    }

    async fn emit(&self, event: SpeechEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn session_id(&self) -> String {
        self.session.as_ref().map(|s| s.id.clone()).unwrap_or_default()
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                event = async { self.engine_rx.as_mut().unwrap().recv().await },
                        if self.engine_rx.is_some() => {
                    match event {
                        Some(event) => self.handle_engine_event(event).await,
                        None => self.engine_rx = None,
                    }
                }
                _ = async { tokio::time::sleep_until(self.timers.next_deadline().unwrap()).await },
                        if self.timers.next_deadline().is_some() => {
                    for kind in self.timers.pop_due(Instant::now(), self.generation) {
                        self.handle_timer(kind).await;
                    }
                }
            }
        }
        // Actor shutdown must never strand a muted mixer.
        self.ensure_unmuted();
        if let Some(mut handle) = self.handle.take() {
            handle.destroy();
        }
        debug!("speech controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(resp) => {
                let _ = resp.send(self.user_start().await);
            }
            Command::Stop(resp) => {
                let _ = resp.send(self.user_stop(false));
            }
            Command::Pause(resp) => {
                let _ = resp.send(self.user_pause());
            }
            Command::Resume(resp) => {
                let _ = resp.send(self.user_resume());
            }
        }
    }

    async fn user_start(&mut self) -> Result<(), SpeechError> {
        match self.state() {
            RecognizerState::Idle => {}
            RecognizerState::Stopping => {
                self.restart_pending = true;
                return Ok(());
            }
            state => return Err(SpeechError::InvalidState { op: "start", state }),
        }
        self.begin_session().await;
        // Audible on purpose: the start tone is the user's feedback that
        // capture began. Only automatic restarts are muted.
        if let Err(e) = self.spin_up(false) {
            self.emit(SpeechEvent::Error(e.to_string())).await;
            self.set_state(RecognizerState::Idle);
            return Err(e.into());
        }
        Ok(())
    }

    async fn begin_session(&mut self) {
        let session = Session::new();
        info!("capture session {} started", session.id);
        self.emit(SpeechEvent::SessionStarted { session: session.id.clone() })
            .await;
        self.session = Some(session);
        self.paused = false;
        self.restart_pending = false;
        self.consecutive_errors = 0;
        self.auto_restart = true;
        self.segments_since_restart = 0;
        self.last_hard_restart = Instant::now();
    }

    fn user_stop(&mut self, pausing: bool) -> Result<(), SpeechError> {
        match self.state() {
            RecognizerState::Idle | RecognizerState::Stopping => return Ok(()), // idempotent
            RecognizerState::Starting | RecognizerState::Listening => {}
        }
        self.generation += 1;
        self.timers.clear();
        self.ensure_unmuted();
        self.paused = pausing;
        self.set_state(RecognizerState::Stopping);
        if let Some(handle) = self.handle.as_mut() {
            handle.stop();
        }
        // The engine may still drain one terminal result; the stuck watchdog
        // forces teardown if no callback ever lands.
        self.timers.schedule(
            TimerKind::Stuck,
            Instant::now() + self.config.stuck_timeout(),
            self.generation,
        );
        Ok(())
    }

    fn user_pause(&mut self) -> Result<(), SpeechError> {
        match self.state() {
            RecognizerState::Listening => self.user_stop(true),
            state => Err(SpeechError::InvalidState { op: "pause", state }),
        }
    }

    fn user_resume(&mut self) -> Result<(), SpeechError> {
        match self.state() {
            RecognizerState::Idle => {}
            state => return Err(SpeechError::InvalidState { op: "resume", state }),
        }
        if !self.paused || self.session.is_none() {
            return Err(SpeechError::NoSession);
        }
        self.paused = false;
        self.consecutive_errors = 0;
        self.auto_restart = true;
        // Resume continues an existing session, so the start tone would be
        // noise; run it through the muted sequence.
        self.initiate_muted_restart();
        Ok(())
    }

    /// Create and start a fresh engine instance. `preserve_state` keeps the
    /// observable state untouched (muted restarts look seamless from the
    /// caller's perspective); otherwise the state becomes STARTING.
    fn spin_up(&mut self, preserve_state: bool) -> Result<(), EngineError> {
        self.awaiting_ready = false;
        let (tx, rx) = mpsc::channel(64);
        let mut handle = self.engine.create(tx)?;
        if let Err(e) = handle.start() {
            handle.destroy();
            return Err(e);
        }
        self.engine_rx = Some(rx);
        self.handle = Some(handle);
        self.awaiting_ready = true;
        if !preserve_state {
            self.set_state(RecognizerState::Starting);
        }
        self.timers.schedule(
            TimerKind::Stuck,
            Instant::now() + self.config.stuck_timeout(),
            self.generation,
        );
        Ok(())
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Ready => {
                if self.state() == RecognizerState::Stopping {
                    return;
                }
                self.awaiting_ready = false;
                self.timers.cancel(TimerKind::Stuck);
                self.set_state(RecognizerState::Listening);
                self.reset_silence_watchdog();
            }
            EngineEvent::Partial(text) => {
                if self.state() != RecognizerState::Listening {
                    debug!("partial result dropped in state {:?}", self.state());
                    return;
                }
                self.reset_silence_watchdog();
                self.emit(SpeechEvent::Partial {
                    session: self.session_id(),
                    text,
                })
                .await;
            }
            EngineEvent::Terminal(text) => self.handle_terminal(text).await,
            EngineEvent::SegmentEnd => {
                if self.state() == RecognizerState::Listening {
                    self.reset_silence_watchdog();
                }
                // End-of-speech with output still muted: arm the short
                // fallback in case the terminal callback never arrives.
                if self.snapshot.is_some() {
                    self.timers.schedule(
                        TimerKind::SafetyUnmute,
                        Instant::now()
                            + Duration::from_millis(self.config.beep_suppression_window_ms),
                        self.generation,
                    );
                }
            }
            EngineEvent::Error(error) => self.handle_engine_error(error).await,
        }
    }

    async fn handle_terminal(&mut self, text: String) {
        let state = self.state();
        // Terminal results are forwarded while LISTENING and during the
        // STOPPING drain; anything else is a stale callback.
        if !matches!(state, RecognizerState::Listening | RecognizerState::Stopping) {
            debug!("terminal result dropped in state {:?}", state);
            return;
        }
        self.segments_since_restart += 1;
        self.consecutive_errors = 0;
        self.emit(SpeechEvent::Terminal {
            session: self.session_id(),
            text,
        })
        .await;

        if state == RecognizerState::Stopping {
            self.finish_stop().await;
            return;
        }

        // Long-lived engine instances accumulate memory; recycle on either
        // threshold, whichever trips first.
        let count_tripped = self.segments_since_restart >= self.config.segment_threshold;
        let clock_tripped =
            self.last_hard_restart.elapsed() >= self.config.hard_restart_interval();
        if count_tripped || clock_tripped {
            info!(
                "hard restart (segments={}, since_last={:?})",
                self.segments_since_restart,
                self.last_hard_restart.elapsed()
            );
            self.segments_since_restart = 0;
            self.last_hard_restart = Instant::now();
            self.initiate_muted_restart();
        }
    }

    async fn handle_engine_error(&mut self, error: EngineError) {
        self.timers.cancel(TimerKind::Stuck);
        if self.state() == RecognizerState::Stopping {
            // Stop was already requested; an error is as good as a drain.
            self.finish_stop().await;
            return;
        }

        if !error.is_transient() {
            warn!("permanent engine error: {error}");
            self.abort_listening(error.to_string()).await;
            return;
        }

        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            warn!(
                "{} consecutive engine errors, auto-restart disabled",
                self.consecutive_errors
            );
            self.auto_restart = false;
            self.abort_listening(format!(
                "speech engine failed {} times in a row: {error}",
                self.consecutive_errors
            ))
            .await;
            return;
        }
        if !self.auto_restart {
            self.abort_listening(error.to_string()).await;
            return;
        }

        debug!(
            "transient engine error ({error}), muted restart #{}",
            self.consecutive_errors
        );
        if self.consecutive_errors == 1 {
            self.initiate_muted_restart();
        } else {
            // Repeated failures back off before the next attempt.
            let delay = Duration::from_millis(
                (250u64 * 2u64.saturating_pow(self.consecutive_errors - 1)).min(2000),
            );
            self.timers.schedule(
                TimerKind::RestartDelay,
                Instant::now() + delay,
                self.generation,
            );
        }
    }

    /// Stop listening after an unrecoverable failure and surface it.
    async fn abort_listening(&mut self, reason: String) {
        self.generation += 1;
        self.timers.clear();
        self.ensure_unmuted();
        if let Some(mut handle) = self.handle.take() {
            handle.destroy();
        }
        self.engine_rx = None;
        self.awaiting_ready = false;
        self.set_state(RecognizerState::Idle);
        self.emit(SpeechEvent::Error(reason)).await;
    }

    async fn finish_stop(&mut self) {
        self.generation += 1;
        self.timers.clear();
        self.ensure_unmuted();
        if let Some(mut handle) = self.handle.take() {
            handle.destroy();
        }
        self.engine_rx = None;
        self.awaiting_ready = false;
        self.set_state(RecognizerState::Idle);
        if self.restart_pending {
            self.restart_pending = false;
            if let Err(e) = Box::pin(self.user_start()).await {
                warn!("queued start failed: {e}");
            }
        }
    }

    fn reset_silence_watchdog(&mut self) {
        self.timers.schedule(
            TimerKind::Silence,
            Instant::now() + self.config.silence_timeout(),
            self.generation,
        );
    }

    /// Begin the timed mute → teardown → recreate → start → unmute sequence
    /// that hides the engine's start/stop tone. Re-entrant: an already
    /// muted sequence keeps its snapshot and just restarts the steps.
    fn initiate_muted_restart(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.audio.mute_all());
        }
        self.timers.cancel(TimerKind::Silence);
        let now = Instant::now();
        self.timers.schedule(
            TimerKind::MuteTeardown,
            now + Duration::from_millis(self.config.mute_propagation_delay_ms),
            self.generation,
        );
        self.timers.schedule(
            TimerKind::SafetyUnmute,
            now + Duration::from_millis(self.config.safety_unmute_ms),
            self.generation,
        );
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Silence => {
                if self.state() == RecognizerState::Listening {
                    debug!("silence watchdog fired, preemptive muted restart");
                    self.initiate_muted_restart();
                }
            }
            TimerKind::Stuck => match self.state() {
                RecognizerState::Stopping => {
                    warn!("engine stuck in STOPPING, forcing teardown");
                    self.finish_stop().await;
                }
                // Covers STARTING and a restarted instance that wedged
                // while the observable state stayed LISTENING.
                _ if self.awaiting_ready => {
                    warn!("engine never became ready, forcing recreation");
                    self.initiate_muted_restart();
                }
                _ => {}
            },
            TimerKind::MuteTeardown => {
                if let Some(mut handle) = self.handle.take() {
                    handle.destroy();
                }
                self.engine_rx = None;
                self.timers.schedule(
                    TimerKind::MuteStart,
                    Instant::now() + Duration::from_millis(self.config.hardware_release_delay_ms),
                    self.generation,
                );
            }
            TimerKind::MuteStart => {
                let result = self.spin_up(true);
                // The restore step runs whether or not the start succeeded;
                // a throwing engine must not leave the system muted.
                self.timers.schedule(
                    TimerKind::MuteRestore,
                    Instant::now()
                        + Duration::from_millis(self.config.beep_suppression_window_ms),
                    self.generation,
                );
                if let Err(e) = result {
                    self.handle_engine_error(e).await;
                }
            }
            TimerKind::MuteRestore | TimerKind::SafetyUnmute => {
                self.ensure_unmuted();
            }
            TimerKind::RestartDelay => {
                if self.auto_restart {
                    self.initiate_muted_restart();
                }
            }
        }
    }

    /// Restore output levels if a mute is outstanding. Exactly one restore
    /// per mute; safe to call from every exit path.
    fn ensure_unmuted(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.audio.restore(snapshot);
            self.timers.cancel(TimerKind::MuteRestore);
            self.timers.cancel(TimerKind::SafetyUnmute);
        }
    }
}
