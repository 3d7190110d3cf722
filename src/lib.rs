#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    closer_to, common_prefix_len, distance, messages, Contact, Distance, Id, InvalidIdHex,
    KBucket, KeyTranscoder, RoutingTable, Sha1Transcoder, Shake256Transcoder, Sighting, Upsert,
    ADDRESS_ID_BITS, DEFAULT_ID_BITS, MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, Testnet};
pub use error::{ConfigError, Error, RequestError};

pub mod errors {
    //! Exported errors
    pub use super::common::messages::DecodeError;
    pub use super::error::{ConfigError, Error, RequestError};
    pub use super::rpc::{PutError, RpcError, TransportError};

    #[cfg(feature = "async")]
    pub use super::async_dht::{DhtGetError, DhtPutError, DhtWasShutdown};
}
