//! Transport module: packet codec, secure channel, wire protocol, link
//! driver, and the connection state machine

mod connection;
mod crypto;
mod link;
mod packet;
mod protocol;

pub use connection::{
    ClientIdentity, ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionManager,
    ConnectionState,
};
pub use crypto::{CipherContext, CryptoError, EcdhKeypair, SharedSecret};
pub use link::{DiscoveredPeer, LinkDriver, LinkError, RadioLink, RetryPolicy, DEFAULT_MTU};
pub use packet::{chunk_message, CompleteMessage, PacketError, Reassembler, HEADER_LEN};
pub use protocol::{
    Message, MessageType, PairAckPayload, PairRequestPayload, PairStatus, WordPayload,
};
