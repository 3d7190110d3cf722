//! Main Crate Errors

use std::time::Duration;

use crate::rpc::TransportError;

#[derive(thiserror::Error, Debug)]
/// Failed to build a [crate::Dht] node.
pub enum Error {
    #[error(transparent)]
    /// Invalid [crate::rpc::Config].
    Config(#[from] ConfigError),

    #[error(transparent)]
    /// Failed to start the transport.
    Transport(#[from] TransportError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Invalid configuration, detected before any network activity.
pub enum ConfigError {
    /// Only the first node of a network (see [crate::DhtBuilder::seed]) may start without bootstrap addresses.
    #[error("Bootstrap addresses are empty, and this node is not marked as a seed")]
    EmptyBootstrap,

    #[error("Invalid bootstrap address: {0}")]
    InvalidBootstrap(String),

    #[error("Id width must be non zero")]
    ZeroIdWidth,

    #[error("Id width must be a multiple of 8, got {0} bits")]
    UnalignedIdWidth(usize),

    #[error("Bucket size K must be non zero")]
    ZeroBucketSize,

    #[error("Alpha must be non zero")]
    ZeroAlpha,

    #[error("max_failed_requests must be non zero")]
    ZeroMaxFailedRequests,

    /// Republishing after the records expired would let them vanish from the network.
    #[error("Republish interval ({republish:?}) must be shorter than Expire ({expire:?})")]
    RepublishNotBeforeExpire {
        republish: Duration,
        expire: Duration,
    },

    /// Ids derived from addresses are SHA-1 digests.
    #[error("Address derived Ids are 160 bits, but the configured width is {0} bits")]
    AddressIdWidth(usize),

    #[error("Explicit Id is {actual} bits, expected {expected} bits")]
    ExplicitIdWidth { expected: usize, actual: usize },

    #[error("Key transcoder produces {actual} bits keys, expected {expected} bits")]
    TranscoderWidth { expected: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Request rejected before sending anything over the network.
pub enum RequestError {
    #[error("Invalid key length: expected {expected} bits, got {actual} bits")]
    InvalidKeyLength { expected: usize, actual: usize },
}
