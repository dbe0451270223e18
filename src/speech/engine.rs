//! Speech Engine Interface
//!
//! The platform speech engine is injected behind [`SpeechEngine`]; the
//! controller is its sole caller and the sole consumer of its callback set,
//! delivered as typed [`EngineEvent`]s on a channel so re-entrancy can never
//! touch controller state directly.

use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle state of the recognizer. One live instance per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerState {
    Idle,
    Starting,
    Listening,
    Stopping,
}

/// Typed callbacks from the platform engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Engine finished starting and is capturing audio.
    Ready,
    /// Incremental recognition text for the current utterance.
    Partial(String),
    /// One unit of recognition finalized (segment-complete or legacy
    /// full-result).
    Terminal(String),
    /// Engine reports end-of-speech for the current segment; a terminal
    /// result should follow but is not guaranteed to.
    SegmentEnd,
    Error(EngineError),
}

/// Engine failures, classified for restart policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no speech matched")]
    NoMatch,
    #[error("speech timeout")]
    Timeout,
    #[error("recognizer busy")]
    Busy,
    #[error("audio permission revoked")]
    PermissionDenied,
    #[error("no recognizer available")]
    Unavailable,
    #[error("engine failure: {0}")]
    Other(String),
}

impl EngineError {
    /// Transient errors get an immediate muted restart; permanent ones stop
    /// listening and wait for an explicit start.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoMatch | Self::Timeout | Self::Busy)
    }
}

/// A live platform engine instance. Dropped and recreated on every restart;
/// never reused after [`EngineHandle::destroy`]. Held inside the controller
/// task, so the object must be shareable across threads.
pub trait EngineHandle: Send + Sync {
    /// Begin listening; completion is signalled by [`EngineEvent::Ready`].
    fn start(&mut self) -> Result<(), EngineError>;

    /// Request a stop; the engine may still emit one terminal result.
    fn stop(&mut self);

    /// Tear the instance down. Idempotent.
    fn destroy(&mut self);
}

/// Factory for platform engine instances.
pub trait SpeechEngine: Send + Sync {
    /// Create a fresh engine whose callbacks flow into `events`.
    fn create(
        &self,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<Box<dyn EngineHandle>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The controller task owns these trait objects, so they must stay
    // usable from a spawned future.
    #[test]
    fn engine_objects_are_shareable_across_tasks() {
        fn assert_bounds<T: Send + Sync + ?Sized>() {}
        assert_bounds::<dyn EngineHandle>();
        assert_bounds::<dyn SpeechEngine>();
    }

    #[test]
    fn transient_and_permanent_errors_are_classified() {
        assert!(EngineError::NoMatch.is_transient());
        assert!(EngineError::Timeout.is_transient());
        assert!(EngineError::Busy.is_transient());
        assert!(!EngineError::PermissionDenied.is_transient());
        assert!(!EngineError::Unavailable.is_transient());
        assert!(!EngineError::Other("boom".into()).is_transient());
    }
}
