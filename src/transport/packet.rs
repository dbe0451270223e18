//! Packet Codec
//!
//! Splits opaque message bytes into MTU-sized packets and reassembles them
//! on the receive side. The link delivers writes serialized and lossless,
//! so packets carry no transfer id; the chunk index is verified only to
//! detect a broken sequence, never to reorder.

use thiserror::Error;

/// First chunk of a message.
pub const FLAG_FIRST: u8 = 0x01;
/// Last chunk of a message.
pub const FLAG_LAST: u8 = 0x02;
/// Message body is sealed by the secure channel.
pub const FLAG_ENCRYPTED: u8 = 0x04;

/// Packet header: flags (1) + chunk index (1) + total message length (4 LE).
pub const HEADER_LEN: usize = 6;

/// Errors from chunking or reassembly.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("MTU {0} too small for the packet header")]
    MtuTooSmall(usize),
    #[error("packet shorter than header ({0} bytes)")]
    Truncated(usize),
    #[error("reassembly broken: {0}")]
    Reassembly(&'static str),
}

/// Split `payload` into ordered packets that each fit within `mtu` bytes.
///
/// A zero-length payload still produces one packet (FIRST|LAST, no body) so
/// empty control messages survive the wire.
pub fn chunk_message(payload: &[u8], mtu: usize, encrypted: bool) -> Result<Vec<Vec<u8>>, PacketError> {
    if mtu <= HEADER_LEN {
        return Err(PacketError::MtuTooSmall(mtu));
    }
    let chunk_size = mtu - HEADER_LEN;
    let total_len = payload.len() as u32;
    let count = payload.len().div_ceil(chunk_size).max(1);

    let mut packets = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(payload.len());

        let mut flags = 0u8;
        if index == 0 {
            flags |= FLAG_FIRST;
        }
        if index == count - 1 {
            flags |= FLAG_LAST;
        }
        if encrypted {
            flags |= FLAG_ENCRYPTED;
        }

        let mut packet = Vec::with_capacity(HEADER_LEN + (end - start));
        packet.push(flags);
        packet.push(index as u8); // wraps for very long messages; verification only
        packet.extend_from_slice(&total_len.to_le_bytes());
        packet.extend_from_slice(&payload[start..end]);
        packets.push(packet);
    }
    Ok(packets)
}

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub data: Vec<u8>,
    pub encrypted: bool,
}

struct Assembly {
    total_len: usize,
    next_index: u8,
    encrypted: bool,
    buf: Vec<u8>,
}

/// Accumulates packets in arrival order into complete messages.
///
/// Any packet that does not continue the open assembly discards the partial
/// buffer and surfaces a [`PacketError::Reassembly`]; no reordering is
/// attempted. A FIRST packet arriving mid-assembly reports the interrupted
/// partial but still opens a fresh assembly from that packet.
#[derive(Default)]
pub struct Reassembler {
    open: Option<Assembly>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet. Returns the complete message once the LAST chunk lands.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<CompleteMessage>, PacketError> {
        if packet.len() < HEADER_LEN {
            return Err(PacketError::Truncated(packet.len()));
        }
        let flags = packet[0];
        let index = packet[1];
        let total_len =
            u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]) as usize;
        let body = &packet[HEADER_LEN..];
        let encrypted = flags & FLAG_ENCRYPTED != 0;

        let interrupted = if flags & FLAG_FIRST != 0 {
            let interrupted = self.open.take().is_some();
            self.open = Some(Assembly {
                total_len,
                next_index: 0,
                encrypted,
                buf: Vec::with_capacity(total_len),
            });
            interrupted
        } else {
            false
        };

        let Some(assembly) = self.open.as_mut() else {
            return Err(PacketError::Reassembly("continuation without open assembly"));
        };

        if index != assembly.next_index {
            self.open = None;
            return Err(PacketError::Reassembly("chunk index gap"));
        }
        if encrypted != assembly.encrypted || total_len != assembly.total_len {
            self.open = None;
            return Err(PacketError::Reassembly("header changed mid-message"));
        }
        if assembly.buf.len() + body.len() > assembly.total_len {
            self.open = None;
            return Err(PacketError::Reassembly("body exceeds declared length"));
        }

        assembly.buf.extend_from_slice(body);
        assembly.next_index = assembly.next_index.wrapping_add(1);

        if flags & FLAG_LAST != 0 {
            let assembly = self.open.take().ok_or(PacketError::Reassembly("no assembly"))?;
            if assembly.buf.len() != assembly.total_len {
                return Err(PacketError::Reassembly("incomplete body at LAST chunk"));
            }
            if interrupted {
                tracing::warn!("previous partial message discarded by new FIRST chunk");
            }
            return Ok(Some(CompleteMessage {
                data: assembly.buf,
                encrypted: assembly.encrypted,
            }));
        }

        if interrupted {
            return Err(PacketError::Reassembly("FIRST chunk interrupted open assembly"));
        }
        Ok(None)
    }

    /// Drop any partial buffer (used on disconnect).
    pub fn reset(&mut self) {
        self.open = None;
    }
}
