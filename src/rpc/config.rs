use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::common::{Id, KeyTranscoder, ADDRESS_ID_BITS, DEFAULT_ID_BITS, MAX_BUCKET_SIZE_K};
use crate::error::ConfigError;

/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;
/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default record time to live.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);
/// Default bucket staleness threshold.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(60 * 60);
/// Default replication interval.
pub const DEFAULT_REPLICATE: Duration = Duration::from_secs(60 * 60);
/// Default republish interval.
pub const DEFAULT_REPUBLISH: Duration = Duration::from_secs(23 * 60 * 60);
/// Default interval between expiration sweeps.
pub const DEFAULT_SWEEP: Duration = Duration::from_secs(60);
/// Default number of consecutive failed requests before evicting a contact.
pub const DEFAULT_MAX_FAILED_REQUESTS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// How a node picks its own [Id].
pub enum IdPolicy {
    /// Random Id of the configured width.
    #[default]
    Random,
    /// SHA-1 of the local address, see [Id::from_address]. Requires 160 bits Ids.
    FromAddress,
    /// Caller provided Id, must have the configured width.
    Explicit(Id),
}

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Number of parallel requests per lookup round.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Width of Ids and keys in bits, must be a non zero multiple of 8.
    ///
    /// Defaults to [DEFAULT_ID_BITS]
    pub bits: usize,
    /// Bucket capacity, and the number of nodes each value is stored at.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Time after which a stored record is deleted unless republished.
    ///
    /// Defaults to [DEFAULT_EXPIRE]
    pub expire: Duration,
    /// Buckets not modified for this long get refreshed, also the period of the refresh task.
    ///
    /// Defaults to [DEFAULT_REFRESH]
    pub refresh: Duration,
    /// Period of the replication task.
    ///
    /// Defaults to [DEFAULT_REPLICATE]
    pub replicate: Duration,
    /// Period of the republish task, must be shorter than [Config::expire].
    ///
    /// Defaults to [DEFAULT_REPUBLISH]
    pub republish: Duration,
    /// Period of the expiration sweep.
    ///
    /// Defaults to [DEFAULT_SWEEP]
    pub sweep: Duration,
    /// Request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are deemed "done".
    /// The shorter this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Bootstrap addresses.
    ///
    /// Defaults to an empty list, which is only valid for a [Config::seed] node.
    pub bootstrap: Vec<String>,
    /// Marks the first node of a network, allowed to start without bootstrap addresses.
    ///
    /// Defaults to false
    pub seed: bool,
    /// Explicit port to listen on with the default UDP transport.
    ///
    /// Defaults to None
    pub port: Option<u16>,
    /// How this node picks its own Id.
    ///
    /// Defaults to [IdPolicy::Random]
    pub id: IdPolicy,
    /// Consecutive failed requests before a contact is evicted from the routing table.
    ///
    /// Defaults to [DEFAULT_MAX_FAILED_REQUESTS]
    pub max_failed_requests: u8,
    /// Derives keys from values.
    ///
    /// Defaults to None, where SHA-1 is used for 160 bits Ids and SHAKE-256 otherwise.
    pub transcoder: Option<Arc<dyn KeyTranscoder>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            bits: DEFAULT_ID_BITS,
            k: MAX_BUCKET_SIZE_K,
            expire: DEFAULT_EXPIRE,
            refresh: DEFAULT_REFRESH,
            replicate: DEFAULT_REPLICATE,
            republish: DEFAULT_REPUBLISH,
            sweep: DEFAULT_SWEEP,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bootstrap: vec![],
            seed: false,
            port: None,
            id: IdPolicy::Random,
            max_failed_requests: DEFAULT_MAX_FAILED_REQUESTS,
            transcoder: None,
        }
    }
}

impl Config {
    /// Check every constraint that can be checked before touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bits == 0 {
            return Err(ConfigError::ZeroIdWidth);
        }
        if self.bits % 8 != 0 {
            return Err(ConfigError::UnalignedIdWidth(self.bits));
        }
        if self.k == 0 {
            return Err(ConfigError::ZeroBucketSize);
        }
        if self.alpha == 0 {
            return Err(ConfigError::ZeroAlpha);
        }
        if self.max_failed_requests == 0 {
            return Err(ConfigError::ZeroMaxFailedRequests);
        }
        if self.republish >= self.expire {
            return Err(ConfigError::RepublishNotBeforeExpire {
                republish: self.republish,
                expire: self.expire,
            });
        }

        match &self.id {
            IdPolicy::Random => {}
            IdPolicy::FromAddress => {
                if self.bits != ADDRESS_ID_BITS {
                    return Err(ConfigError::AddressIdWidth(self.bits));
                }
            }
            IdPolicy::Explicit(id) => {
                if id.bits() != self.bits {
                    return Err(ConfigError::ExplicitIdWidth {
                        expected: self.bits,
                        actual: id.bits(),
                    });
                }
            }
        }

        if let Some(transcoder) = &self.transcoder {
            let actual = transcoder.encode(&[]).bits();

            if actual != self.bits {
                return Err(ConfigError::TranscoderWidth {
                    expected: self.bits,
                    actual,
                });
            }
        }

        if self.bootstrap.is_empty() && !self.seed {
            return Err(ConfigError::EmptyBootstrap);
        }

        self.bootstrap_addresses()?;

        Ok(())
    }

    /// Resolve [Config::bootstrap] to socket addresses.
    pub fn bootstrap_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.bootstrap
            .iter()
            .map(|address| {
                address
                    .parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidBootstrap(address.clone()))
            })
            .collect()
    }
}
