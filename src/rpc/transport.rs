//! Transports carrying [Message]s between nodes.

mod memory;
mod udp;

use std::fmt::Debug;
use std::net::SocketAddr;

use crate::common::messages::Message;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// Stream of decoded inbound messages, each paired with the address it was received from.
pub type Inbound = flume::Receiver<(Message, SocketAddr)>;

/// Send and receive [Message]s.
///
/// Implementations must be safe to [Transport::send] from many threads at once,
/// and must drop messages they fail to decode rather than yielding errors.
pub trait Transport: Debug + Send + Sync {
    /// Start receiving messages. Can only be called once.
    ///
    /// The stream ends after [Transport::stop].
    fn listen(&self) -> Result<Inbound, TransportError>;

    /// Send a message to `to`. Delivery is not guaranteed.
    fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError>;

    /// The address other nodes can reach this transport at.
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving messages, and refuse sending any more.
    fn stop(&self);
}

#[derive(thiserror::Error, Debug)]
/// Transport errors.
pub enum TransportError {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_bencode::Error),

    #[error("Transport is already listening")]
    AlreadyListening,

    #[error("Transport was stopped")]
    Stopped,

    #[error("Address {0} is unreachable")]
    Unreachable(SocketAddr),
}
