//! Data module for configuration and paired-peer persistence

mod config;
mod paired;

pub use config::{AppConfig, DeliveryConfig, LinkConfig, SpeechConfig};
pub use paired::{PairedPeer, PairedPeerStore};
