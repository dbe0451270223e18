//! Word Sender
//!
//! Single consumer between the speech controller and the transport. Words
//! from partial and terminal callbacks are sequenced here, on one task, so
//! they can never interleave out of order, then sent one at a time with a
//! short bounded retry.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::data::DeliveryConfig;
use crate::speech::SpeechEvent;
use crate::transport::{ConnectionHandle, Message};

use super::words::WordTracker;

/// Drains [`SpeechEvent`]s into sequenced WORD messages on the connection.
pub struct WordSender {
    connection: ConnectionHandle,
    config: DeliveryConfig,
    tracker: WordTracker,
    session: String,
    next_seq: u64,
}

impl WordSender {
    /// Spawn the sender task consuming `events` until the channel closes.
    pub fn spawn(
        connection: ConnectionHandle,
        config: DeliveryConfig,
        events: mpsc::Receiver<SpeechEvent>,
    ) -> JoinHandle<()> {
        let sender = Self {
            connection,
            config,
            tracker: WordTracker::new(),
            session: String::new(),
            next_seq: 0,
        };
        tokio::spawn(sender.run(events))
    }

    async fn run(mut self, mut events: mpsc::Receiver<SpeechEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SpeechEvent::SessionStarted { session } => {
                    debug!("word pipeline now on session {session}");
                    self.session = session;
                    self.tracker.reset();
                    self.next_seq = 0;
                }
                SpeechEvent::Partial { session, text } => {
                    if session == self.session {
                        let fresh = self.tracker.on_partial(&text);
                        self.deliver_all(fresh).await;
                    }
                }
                SpeechEvent::Terminal { session, text } => {
                    if session == self.session {
                        let fresh = self.tracker.on_terminal(&text);
                        self.deliver_all(fresh).await;
                    }
                }
                SpeechEvent::Error(_) => {}
            }
        }
        debug!("word sender stopped");
    }

    async fn deliver_all(&mut self, words: Vec<String>) {
        for word in words {
            self.deliver(&word).await;
        }
    }

    /// Send one word, retrying a few times with a fixed delay. Exhausting
    /// the attempts drops the word: a stale word arriving later would harm
    /// the dictation more than a rare gap.
    async fn deliver(&mut self, word: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let message = match Message::word(word, seq, &self.session) {
            Ok(message) => message,
            Err(e) => {
                warn!("failed to build WORD message: {e}");
                return;
            }
        };

        for attempt in 1..=self.config.word_send_attempts {
            match self.connection.send(message.clone()).await {
                Ok(()) => return,
                Err(e) if attempt == self.config.word_send_attempts => {
                    warn!("dropping word (seq {seq}) after {attempt} attempts: {e}");
                }
                Err(e) => {
                    debug!("word send attempt {attempt} failed: {e}");
                    tokio::time::sleep(Duration::from_millis(self.config.word_retry_delay_ms))
                        .await;
                }
            }
        }
    }
}
