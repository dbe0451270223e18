//! Speech module: engine seam, audio mute control, timer queue, and the
//! controller state machine

mod audio;
mod controller;
mod engine;
mod timer;

pub use audio::{AudioOutput, VolumeSnapshot};
pub use controller::{Session, SpeechController, SpeechError, SpeechEvent, SpeechHandle};
pub use engine::{EngineError, EngineEvent, EngineHandle, RecognizerState, SpeechEngine};
