//! Audio Output Control
//!
//! Mute/restore of system output streams, used to hide the platform
//! engine's start/stop tone during automatic restarts. The platform mixer
//! is injected behind [`AudioOutput`].

/// Recorded stream levels, captured at mute time and handed back verbatim
/// on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSnapshot {
    /// (stream identifier, level) pairs.
    pub levels: Vec<(String, u32)>,
}

/// Platform audio mixer seam.
pub trait AudioOutput: Send + Sync {
    /// Mute every output stream, returning the levels to restore later.
    fn mute_all(&self) -> VolumeSnapshot;

    /// Restore previously recorded levels. Consumes the snapshot so a
    /// single mute pairs with exactly one restore.
    fn restore(&self, snapshot: VolumeSnapshot);
}
