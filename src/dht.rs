//! Dht node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::{
    common::{Contact, Id, KeyTranscoder},
    error::{Error, RequestError},
    rpc::{
        Config, FoundValue, IdPolicy, Info, MaintenanceTask, MemoryNetwork, PutError, Rpc,
        RpcError, StoreReport, Transport, TransportError, UdpTransport,
    },
};

#[derive(Debug, Clone)]
/// Kademlia Dht node.
///
/// Cheap to clone, the node shuts down once every clone is dropped.
pub struct Dht(pub(crate) Arc<Rpc>);

#[derive(Debug, Default)]
/// A builder for [Dht] nodes.
pub struct DhtBuilder {
    config: Config,
    transport: Option<Box<dyn Transport>>,
}

impl DhtBuilder {
    /// Set bootstrapping nodes, as `ip:port` strings.
    pub fn bootstrap<T: ToString>(mut self, bootstrap: &[T]) -> Self {
        self.config.bootstrap = bootstrap.iter().map(|b| b.to_string()).collect();

        self
    }

    /// Mark this node as the first node of a new network, allowed to start
    /// without bootstrapping nodes.
    pub fn seed(mut self) -> Self {
        self.config.seed = true;

        self
    }

    /// Explicit port to listen on, for the default UDP transport.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);

        self
    }

    /// Width of [Id]s and keys in bits, see [Config::bits].
    pub fn bits(mut self, bits: usize) -> Self {
        self.config.bits = bits;

        self
    }

    /// Bucket size and replication factor, see [Config::k].
    pub fn k(mut self, k: usize) -> Self {
        self.config.k = k;

        self
    }

    /// Lookup parallelism, see [Config::alpha].
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.config.alpha = alpha;

        self
    }

    pub fn expire(mut self, expire: Duration) -> Self {
        self.config.expire = expire;

        self
    }

    pub fn refresh(mut self, refresh: Duration) -> Self {
        self.config.refresh = refresh;

        self
    }

    pub fn replicate(mut self, replicate: Duration) -> Self {
        self.config.replicate = replicate;

        self
    }

    pub fn republish(mut self, republish: Duration) -> Self {
        self.config.republish = republish;

        self
    }

    /// Period of the expired records sweep.
    pub fn sweep(mut self, sweep: Duration) -> Self {
        self.config.sweep = sweep;

        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;

        self
    }

    pub fn max_failed_requests(mut self, max_failed_requests: u8) -> Self {
        self.config.max_failed_requests = max_failed_requests;

        self
    }

    /// Use an explicit node [Id].
    pub fn id(mut self, id: Id) -> Self {
        self.config.id = IdPolicy::Explicit(id);

        self
    }

    /// How to pick this node's [Id].
    pub fn id_policy(mut self, policy: IdPolicy) -> Self {
        self.config.id = policy;

        self
    }

    /// Override the default [KeyTranscoder].
    pub fn transcoder(mut self, transcoder: Arc<dyn KeyTranscoder>) -> Self {
        self.config.transcoder = Some(transcoder);

        self
    }

    /// Use a custom [Transport] instead of binding a UDP socket.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);

        self
    }

    /// Replace the whole [Config].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;

        self
    }

    /// Create a Dht node and bootstrap it.
    ///
    /// Blocks until bootstrapping is done, an invalid [Config] is rejected
    /// before any socket is bound.
    pub fn build(self) -> Result<Dht, Error> {
        self.config.validate()?;

        let transport: Box<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Box::new(
                UdpTransport::bind_port(self.config.port).map_err(TransportError::IO)?,
            ),
        };

        let rpc = Rpc::new(self.config, transport)?;
        rpc.bootstrap();

        Ok(Dht(rpc))
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node from a [Config] and bootstrap it.
    pub fn new(config: Config) -> Result<Self, Error> {
        Dht::builder().config(config).build()
    }

    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        self.0.id()
    }

    /// Address this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr()
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        self.0.info()
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.0.routing_table().to_bootstrap()
    }

    /// Returns `true` after [Dht::shutdown].
    pub fn is_shutdown(&self) -> bool {
        self.0.is_stopped()
    }

    // === Public Methods ===

    /// Store a value at the closest nodes to its key, returns the key.
    ///
    /// The key is the value encoded with the node's [KeyTranscoder].
    ///
    /// The value is kept locally as a record this node published, even when no other
    /// node acknowledged it. A lone seed gets [PutError::NoClosestNodes], yet [Dht::get]
    /// still returns the value and [MaintenanceTask::Republish] pushes it to the network later.
    pub fn set<T: Into<Bytes>>(&self, value: T) -> Result<Id, PutError> {
        self.put(value).map(|report| report.key)
    }

    /// Like [Dht::set] but returns which nodes acknowledged the value.
    pub fn put<T: Into<Bytes>>(&self, value: T) -> Result<StoreReport, PutError> {
        self.0.put(value.into())
    }

    /// Get the value stored under `key`, `None` if no node has it.
    pub fn get(&self, key: &Id) -> Result<Option<Bytes>, RequestError> {
        Ok(self.find_value(key)?.map(|found| found.value))
    }

    /// Like [Dht::get] but also returns where the value was found.
    pub fn find_value(&self, key: &Id) -> Result<Option<FoundValue>, RequestError> {
        self.0.get(key)
    }

    /// Find the closest live nodes to `target`.
    pub fn find_node(&self, target: &Id) -> Result<Vec<Contact>, RequestError> {
        self.0.find_node(target)
    }

    /// Ping a node, returns its [Id].
    pub fn ping(&self, address: SocketAddr) -> Result<Id, RpcError> {
        self.0.ping(address)
    }

    /// Run a maintenance task now, blocking until it is done.
    pub fn run_maintenance(&self, task: MaintenanceTask) {
        self.0.run_maintenance(task)
    }

    /// Stop running a maintenance task periodically.
    ///
    /// Returns `false` if it was already cancelled.
    pub fn cancel_maintenance(&self, task: MaintenanceTask) -> bool {
        self.0.cancel_maintenance(task)
    }

    /// Stop maintenance and close the transport, for every clone of this node.
    pub fn shutdown(&self) {
        self.0.shutdown()
    }
}

#[derive(Debug)]
/// Create a testnet of Dht nodes on an in-memory network, to run tests
/// without touching the real network.
pub struct Testnet {
    pub network: MemoryNetwork,
    pub bootstrap: Vec<String>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, Error> {
        Testnet::with_config(count, Config::default())
    }

    /// Create `count` nodes, the first one being the seed every other node bootstraps from.
    pub fn with_config(count: usize, config: Config) -> Result<Testnet, Error> {
        let network = MemoryNetwork::new();

        let mut testnet = Testnet {
            network,
            bootstrap: vec![],
            nodes: Vec::with_capacity(count),
        };

        for i in 0..count {
            let builder = Dht::builder()
                .config(config.clone())
                .transport(Box::new(testnet.network.transport()));

            let node = if i == 0 {
                builder.seed().build()?
            } else {
                builder.bootstrap(&testnet.bootstrap).build()?
            };

            if i == 0 {
                testnet.bootstrap = vec![node.local_addr().to_string()];
            }

            testnet.nodes.push(node);
        }

        Ok(testnet)
    }

    /// A builder for a new node on this testnet, bootstrapping from its seed.
    pub fn builder(&self) -> DhtBuilder {
        Dht::builder()
            .bootstrap(&self.bootstrap)
            .transport(Box::new(self.network.transport()))
    }
}
