//! Wire Protocol
//!
//! JSON message envelope and payload shapes exchanged with the host. The
//! envelope is serialized, optionally sealed by the secure channel, then
//! chunked by the packet codec. Pairing and keepalive traffic stays
//! cleartext; WORD/COMMAND/CONTROL traffic is sealed once a cipher context
//! exists.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "WORD")]
    Word,
    #[serde(rename = "COMMAND")]
    Command,
    #[serde(rename = "CONTROL")]
    Control,
    #[serde(rename = "PAIR_REQ")]
    PairReq,
    #[serde(rename = "PAIR_ACK")]
    PairAck,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ACK")]
    Ack,
}

/// Message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: String,
    /// Session id; present on WORD/COMMAND traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Monotonic per-session sequence number, diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: u64,
}

impl Message {
    pub fn new(message_type: MessageType, payload: String) -> Self {
        Self {
            message_type,
            payload,
            session: None,
            seq: None,
            timestamp: current_time_ms(),
        }
    }

    /// Build a WORD message carrying one recognized word.
    pub fn word(word: &str, seq: u64, session: &str) -> Result<Self> {
        let payload = WordPayload {
            word: word.to_string(),
            seq: Some(seq),
            session: session.to_string(),
        };
        let mut msg = Self::new(MessageType::Word, serde_json::to_string(&payload)?);
        msg.session = Some(session.to_string());
        msg.seq = Some(seq);
        Ok(msg)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, String::new())
    }

    /// ACK echoes the timestamp of the message it acknowledges.
    pub fn ack(of_timestamp: u64) -> Self {
        Self::new(MessageType::Ack, of_timestamp.to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize message")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse message")
    }
}

/// Payload of a WORD message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPayload {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub session: String,
}

impl WordPayload {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse WORD payload")
    }
}

/// Payload of a PAIR_REQ message: our identity plus ECDH public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestPayload {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub public_key: String,
}

impl PairRequestPayload {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize PAIR_REQ payload")
    }
}

/// Payload of a PAIR_ACK from the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAckPayload {
    pub device_id: String,
    pub status: PairStatus,
    /// Host's ECDH public key; present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "rejected")]
    Rejected,
}

impl PairAckPayload {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse PAIR_ACK payload")
    }
}

/// CONTROL payload sent sealed under a stored key to reauthenticate a
/// previously paired link without a fresh exchange.
pub const CONTROL_REAUTH: &str = "REAUTH";

/// Current timestamp in milliseconds.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
