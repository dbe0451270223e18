//! Dictalink
//!
//! Client core for a BLE dictation link: captures speech through a platform
//! engine, turns recognized text into individually-sequenced words, and
//! streams them encrypted to a paired text-insertion host.
//!
//! Platform specifics (the radio stack, the speech engine, the audio mixer)
//! are injected behind traits; everything above those seams lives here:
//!
//! - [`speech`]: recognizer state machine, watchdogs, muted restarts
//! - [`pipeline`]: word tracking and strictly-ordered delivery
//! - [`transport`]: ECDH pairing, AES-GCM sealing, MTU chunking, the
//!   connection state machine
//! - [`data`]: configuration and the encrypted paired-peer store

pub mod data;
pub mod pipeline;
pub mod speech;
pub mod transport;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Call once at startup; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
