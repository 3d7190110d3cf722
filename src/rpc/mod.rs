//! Kademlia node core: request/response plumbing and the operations built on it.

mod config;
mod inbox;
mod info;
mod lookup;
mod maintenance;
mod server;
mod store;
mod transport;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace};

use crate::common::messages::{
    ErrorSpecific, Message, MessageType, RequestSpecific, ResponseSpecific, StoreRequestArguments,
};
use crate::common::{
    Contact, Id, KeyTranscoder, RoutingTable, Sha1Transcoder, Shake256Transcoder, Sighting,
    ADDRESS_ID_BITS,
};
use crate::error::{Error, RequestError};

pub use config::{
    Config, IdPolicy, DEFAULT_ALPHA, DEFAULT_EXPIRE, DEFAULT_MAX_FAILED_REQUESTS, DEFAULT_REFRESH,
    DEFAULT_REPLICATE, DEFAULT_REPUBLISH, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP,
};
pub use info::Info;
pub use lookup::{FoundValue, Shortlist};
pub use maintenance::MaintenanceTask;
pub use server::PROTOCOL_ERROR_CODE;
pub use store::{Store, StoredRecord};
pub use transport::{
    Inbound, MemoryNetwork, MemoryTransport, Transport, TransportError, UdpTransport,
};

use inbox::{Inbox, PendingResponse};
use lookup::LookupKind;
use maintenance::Scheduler;

#[derive(Debug)]
/// A running Kademlia node.
///
/// Always lives behind an [Arc]; background threads (listener, maintenance,
/// eviction probes) only hold weak references, so dropping the last [Arc]
/// shuts the node down.
pub struct Rpc {
    id: Id,
    config: Config,
    local_addr: SocketAddr,
    transcoder: Arc<dyn KeyTranscoder>,
    transport: Box<dyn Transport>,

    routing_table: RoutingTable,
    inbox: Inbox,
    store: Store,

    /// Ids of stale contacts currently being pinged before eviction.
    probes: Mutex<HashSet<Id>>,
    scheduler: Mutex<Option<Scheduler>>,
    stopped: AtomicBool,

    weak: Weak<Rpc>,
}

impl Rpc {
    /// Start a node on `transport`.
    ///
    /// Does not bootstrap, see [Rpc::bootstrap].
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Result<Arc<Rpc>, Error> {
        config.validate()?;

        let local_addr = transport.local_addr();

        let id = match &config.id {
            IdPolicy::Random => Id::random(config.bits),
            IdPolicy::FromAddress => Id::from_address(local_addr),
            IdPolicy::Explicit(id) => id.clone(),
        };

        let transcoder = config
            .transcoder
            .clone()
            .unwrap_or_else(|| default_transcoder(config.bits));

        let inbound = transport.listen()?;

        let rpc = Arc::new_cyclic(|weak| Rpc {
            routing_table: RoutingTable::new(id.clone(), config.k),
            id,
            local_addr,
            transcoder,
            transport,
            inbox: Inbox::new(),
            store: Store::new(),
            probes: Mutex::new(HashSet::new()),
            scheduler: Mutex::new(None),
            stopped: AtomicBool::new(false),
            weak: weak.clone(),
            config,
        });

        rpc.start(inbound).map_err(TransportError::from)?;

        info!(id = %rpc.id, local_addr = ?rpc.local_addr, "Kademlia node started");

        Ok(rpc)
    }

    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Address this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node as a [Contact].
    pub fn contact(&self) -> Contact {
        Contact::new(self.id.clone(), self.local_addr)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transcoder(&self) -> &dyn KeyTranscoder {
        self.transcoder.as_ref()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn is_scheduled(&self, task: MaintenanceTask) -> bool {
        self.scheduler()
            .as_ref()
            .map(|scheduler| scheduler.is_scheduled(task))
            .unwrap_or(false)
    }

    // === Public Methods ===

    /// Ping every bootstrap address, then look up this node's own [Id] to
    /// fill the routing table.
    pub fn bootstrap(&self) {
        let seeds: Vec<SocketAddr> = self
            .config
            .bootstrap_addresses()
            .unwrap_or_default()
            .into_iter()
            .filter(|address| *address != self.local_addr)
            .collect();

        let deadline = Instant::now() + self.config.request_timeout;

        let pending: Vec<PendingResponse> = seeds
            .iter()
            .filter_map(|address| {
                self.send_request(*address, RequestSpecific::Ping)
                    .map_err(|error| debug!(?address, ?error, "Failed to ping bootstrap node"))
                    .ok()
            })
            .collect();

        // Responders are added to the routing table as their responses come in.
        for pending in &pending {
            if let Err(error) = self.wait(pending, deadline) {
                debug!(address = ?pending.to, ?error, "Bootstrap node did not respond");
            }
        }

        let id = self.id.clone();
        self.lookup(&id, LookupKind::FindNode);

        let table_size = self.routing_table.size();

        if table_size == 0 {
            if !seeds.is_empty() {
                error!("Could not bootstrap the routing table");
            }
        } else {
            debug!(table_size, "Populated the routing table");
        }
    }

    /// Store `value` at the `k` closest nodes to its key, and keep an original
    /// copy locally to be republished.
    pub fn put(&self, value: Bytes) -> Result<StoreReport, PutError> {
        let key = self.transcoder.encode(&value);
        self.validate_key(&key)?;

        self.store
            .publish(key.clone(), value.clone(), self.config.expire);

        self.store_closest(&key, value, None)
    }

    /// Get the value stored under `key`, from the local store or the network.
    pub fn get(&self, key: &Id) -> Result<Option<FoundValue>, RequestError> {
        self.validate_key(key)?;

        if let Some(record) = self.store.get(key) {
            trace!(%key, "Found value in local store");

            return Ok(Some(FoundValue {
                key: key.clone(),
                ttl: Some(record.remaining(Instant::now())),
                value: record.value,
                from: self.contact(),
            }));
        }

        let result = self.lookup(key, LookupKind::FindValue);

        let Some(found) = result.value else {
            debug!(%key, "Value not found");
            return Ok(None);
        };

        // Cache at the closest node that did not have it.
        if let Some(contact) = result.closest.first() {
            if let Err(error) = self.store_at(contact, key.clone(), found.value.clone(), found.ttl)
            {
                debug!(%key, ?contact, ?error, "Failed to cache value on lookup path");
            }
        }

        Ok(Some(found))
    }

    /// The `k` closest live nodes to `target`.
    pub fn find_node(&self, target: &Id) -> Result<Vec<Contact>, RequestError> {
        self.validate_key(target)?;

        Ok(self.lookup(target, LookupKind::FindNode).closest)
    }

    /// Ping a node, returns its [Id].
    pub fn ping(&self, address: SocketAddr) -> Result<Id, RpcError> {
        let message = self.request(address, RequestSpecific::Ping)?;

        match message.message_type {
            MessageType::Response(ResponseSpecific::Ping) => Ok(message.sender_id),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Send a `STORE` request to a single node and wait for its acknowledgement.
    pub fn store_at(
        &self,
        contact: &Contact,
        key: Id,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), RpcError> {
        let request = RequestSpecific::Store(StoreRequestArguments { key, value, ttl });

        match self.request(contact.address(), request) {
            Ok(Message {
                message_type: MessageType::Response(ResponseSpecific::Store),
                ..
            }) => Ok(()),
            Ok(_) => Err(RpcError::UnexpectedResponse),
            Err(error) => {
                self.request_failed(contact, &error);
                Err(error)
            }
        }
    }

    /// Send a request and wait up to the request timeout for its response.
    pub fn request(&self, to: SocketAddr, request: RequestSpecific) -> Result<Message, RpcError> {
        let pending = self.send_request(to, request)?;

        self.wait(&pending, Instant::now() + self.config.request_timeout)
    }

    /// Stop scheduling a maintenance task. Returns `false` if it was not scheduled.
    pub fn cancel_maintenance(&self, task: MaintenanceTask) -> bool {
        self.scheduler()
            .as_ref()
            .map(|scheduler| scheduler.cancel(task))
            .unwrap_or(false)
    }

    /// Stop maintenance and the transport. Lookups in progress fail their
    /// remaining requests.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(scheduler) = self.scheduler().take() {
            scheduler.shutdown();
        }

        self.transport.stop();

        debug!(id = %self.id, "Kademlia node stopped");
    }

    // === Private Methods ===

    fn start(&self, inbound: Inbound) -> std::io::Result<()> {
        let weak = self.weak.clone();

        thread::Builder::new()
            .name("kademlia-listener".to_string())
            .spawn(move || {
                for (message, from) in inbound.iter() {
                    let Some(rpc) = weak.upgrade() else {
                        break;
                    };

                    rpc.handle_inbound(message, from);
                }

                trace!("Listener stopped");
            })?;

        let weak = self.weak.clone();

        let scheduler = Scheduler::start(
            &[
                (MaintenanceTask::Refresh, self.config.refresh),
                (MaintenanceTask::Replicate, self.config.replicate),
                (MaintenanceTask::Republish, self.config.republish),
                (MaintenanceTask::Expire, self.config.sweep),
            ],
            move |task| match weak.upgrade() {
                Some(rpc) if !rpc.is_stopped() => {
                    rpc.run_maintenance(task);
                    true
                }
                _ => false,
            },
        )?;

        *self.scheduler() = Some(scheduler);

        Ok(())
    }

    pub(crate) fn validate_key(&self, key: &Id) -> Result<(), RequestError> {
        if key.bits() != self.config.bits {
            return Err(RequestError::InvalidKeyLength {
                expected: self.config.bits,
                actual: key.bits(),
            });
        }

        Ok(())
    }

    /// Look up the closest nodes to `key` and send them a `STORE` request in parallel.
    pub(crate) fn store_closest(
        &self,
        key: &Id,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<StoreReport, PutError> {
        let closest = self.lookup(key, LookupKind::FindNode).closest;

        if closest.is_empty() {
            debug!(%key, "No closest nodes to store value at");
            return Err(PutError::NoClosestNodes);
        }

        let request = RequestSpecific::Store(StoreRequestArguments {
            key: key.clone(),
            value,
            ttl,
        });

        let deadline = Instant::now() + self.config.request_timeout;
        let inflight: Vec<(&Contact, Result<PendingResponse, RpcError>)> = closest
            .iter()
            .map(|contact| (contact, self.send_request(contact.address(), request.clone())))
            .collect();

        let mut stored_at = Vec::with_capacity(closest.len());

        for (contact, pending) in inflight {
            match pending.and_then(|pending| self.wait(&pending, deadline)) {
                Ok(Message {
                    message_type: MessageType::Response(ResponseSpecific::Store),
                    ..
                }) => stored_at.push(contact.clone()),
                Ok(message) => {
                    debug!(?contact, ?message, "Unexpected response to STORE request");
                }
                Err(error) => self.request_failed(contact, &error),
            }
        }

        debug!(
            %key,
            acks = stored_at.len(),
            attempted = closest.len(),
            "Stored value"
        );

        if stored_at.is_empty() {
            return Err(PutError::NoAcknowledgements);
        }

        Ok(StoreReport {
            key: key.clone(),
            stored_at,
            attempted: closest.len(),
            k: self.config.k,
        })
    }

    pub(crate) fn send_request(
        &self,
        to: SocketAddr,
        request: RequestSpecific,
    ) -> Result<PendingResponse, RpcError> {
        let pending = self.inbox.register(to);

        let message = Message {
            transaction_id: pending.transaction_id,
            sender_id: self.id.clone(),
            message_type: MessageType::Request(request),
        };

        if let Err(error) = self.transport.send(&message, to) {
            self.inbox.cancel(pending.transaction_id);
            return Err(error.into());
        }

        Ok(pending)
    }

    pub(crate) fn wait(
        &self,
        pending: &PendingResponse,
        deadline: Instant,
    ) -> Result<Message, RpcError> {
        match self.inbox.wait(pending, deadline) {
            None => Err(RpcError::Timeout),
            Some(Message {
                message_type: MessageType::Error(error),
                ..
            }) => Err(RpcError::ErrorResponse(error)),
            Some(message) => Ok(message),
        }
    }

    fn send_message(&self, to: SocketAddr, transaction_id: u32, message_type: MessageType) {
        let message = Message {
            transaction_id,
            sender_id: self.id.clone(),
            message_type,
        };

        if let Err(error) = self.transport.send(&message, to) {
            debug!(?to, ?error, "Error sending message");
        }
    }

    /// Count a failed request against a routing table member.
    pub(crate) fn request_failed(&self, contact: &Contact, error: &RpcError) {
        if !matches!(error, RpcError::Timeout | RpcError::Transport(_)) {
            return;
        }

        if self
            .routing_table
            .record_failure(contact.id(), self.config.max_failed_requests)
        {
            debug!(?contact, "Evicted unresponsive contact");
        }
    }

    /// Record a contact seen in a message or a response, probing the least
    /// recently seen contact of its bucket if the bucket is full.
    pub(crate) fn saw(&self, contact: Contact) {
        if let Sighting::BucketFull {
            least_recently_seen,
        } = self.routing_table.record_sighting(contact.clone())
        {
            self.probe(least_recently_seen, contact);
        }
    }

    /// Ping `stale` on a separate thread; evict it in favor of `candidate` if it fails to respond.
    fn probe(&self, stale: Contact, candidate: Contact) {
        if self.is_stopped() {
            return;
        }

        if !self.probes().insert(stale.id().clone()) {
            trace!(?stale, "Already probing, discarding candidate");
            return;
        }

        let weak = self.weak.clone();
        let stale_id = stale.id().clone();

        let spawned = thread::Builder::new()
            .name("kademlia-probe".to_string())
            .spawn(move || {
                let Some(rpc) = weak.upgrade() else {
                    return;
                };

                match rpc.ping(stale.address()) {
                    Ok(id) if &id == stale.id() => {
                        trace!(?stale, "Stale contact responded, discarding candidate");
                        rpc.routing_table.record_sighting(stale.clone());
                    }
                    result => {
                        let inserted = rpc
                            .routing_table
                            .evict_and_insert(stale.id(), candidate.clone());

                        debug!(
                            ?stale,
                            ?candidate,
                            inserted,
                            error = ?result.err(),
                            "Evicted stale contact"
                        );
                    }
                }

                rpc.probes().remove(stale.id());
            });

        if spawned.is_err() {
            self.probes().remove(&stale_id);
        }
    }

    fn probes(&self) -> MutexGuard<'_, HashSet<Id>> {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler(&self) -> MutexGuard<'_, Option<Scheduler>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// SHA-1 for 160 bits Ids, SHAKE-256 with the matching output size otherwise.
fn default_transcoder(bits: usize) -> Arc<dyn KeyTranscoder> {
    if bits == ADDRESS_ID_BITS {
        Arc::new(Sha1Transcoder)
    } else {
        Arc::new(Shake256Transcoder::new(bits / 8))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of storing a value at the closest nodes to its key.
pub struct StoreReport {
    pub key: Id,
    /// Nodes that acknowledged the `STORE` request.
    pub stored_at: Vec<Contact>,
    /// Number of closest nodes found and sent a `STORE` request.
    pub attempted: usize,
    k: usize,
}

impl StoreReport {
    pub fn acks(&self) -> usize {
        self.stored_at.len()
    }

    /// Returns `true` if fewer than `k` nodes acknowledged.
    pub fn is_partial(&self) -> bool {
        self.acks() < self.k
    }
}

#[derive(thiserror::Error, Debug)]
/// A single request failed.
pub enum RpcError {
    /// The node did not respond in time, it may be unreachable.
    #[error("Request timed out")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Error response: {0:?}")]
    ErrorResponse(ErrorSpecific),

    #[error("Unexpected response type")]
    UnexpectedResponse,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Failed to store a value.
pub enum PutError {
    #[error(transparent)]
    Validation(#[from] RequestError),

    /// Failed to find any nodes close, usually means dht node failed to bootstrap,
    /// so the routing table is empty.
    #[error("Failed to find any nodes close to store value at")]
    NoClosestNodes,

    /// None of the closest nodes acknowledged the `STORE` request.
    #[error("No node acknowledged the STORE request")]
    NoAcknowledgements,
}
