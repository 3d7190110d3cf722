//! Iterative lookup of the closest nodes to a target, or the value stored under a key.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{inbox::PendingResponse, Rpc, RpcError};
use crate::common::messages::{
    FindNodeRequestArguments, FindValueRequestArguments, FindValueResponseArguments, MessageType,
    RequestSpecific, ResponseSpecific,
};
use crate::common::{Contact, Distance, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    Inflight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    state: CandidateState,
}

#[derive(Debug, Clone)]
/// Candidates of a lookup sorted by distance to the target, deduplicated by [Id].
pub struct Shortlist {
    target: Id,
    k: usize,
    candidates: Vec<Candidate>,
}

impl Shortlist {
    pub fn new(target: Id, k: usize) -> Self {
        Self {
            target,
            k,
            candidates: Vec::with_capacity(k * 2),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Distance of the closest candidate that did not fail.
    pub fn best_distance(&self) -> Option<Distance> {
        self.live().next().map(|candidate| candidate.distance.clone())
    }

    /// Returns `true` if the `k` closest live candidates have all responded.
    pub fn is_settled(&self) -> bool {
        self.live()
            .take(self.k)
            .all(|candidate| candidate.state == CandidateState::Responded)
    }

    /// Up to `k` closest candidates that responded, closest first.
    pub fn closest_responded(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|candidate| candidate.state == CandidateState::Responded)
            .take(self.k)
            .map(|candidate| candidate.contact.clone())
            .collect()
    }

    // === Public Methods ===

    /// Add a candidate, returns `false` if a candidate with the same [Id] is already known.
    pub fn add(&mut self, contact: Contact) -> bool {
        let distance = contact.id().xor(&self.target);

        if self
            .candidates
            .iter()
            .any(|candidate| candidate.contact.id() == contact.id())
        {
            return false;
        }

        let position = self
            .candidates
            .binary_search_by(|probe| {
                probe
                    .distance
                    .cmp(&distance)
                    .then_with(|| probe.contact.id().cmp(contact.id()))
            })
            .unwrap_or_else(|position| position);

        self.candidates.insert(
            position,
            Candidate {
                contact,
                distance,
                state: CandidateState::Unqueried,
            },
        );

        true
    }

    /// Pick up to `alpha` unqueried candidates among the `k` closest live ones,
    /// and mark them inflight.
    pub fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch = Vec::with_capacity(alpha);

        for candidate in self
            .candidates
            .iter_mut()
            .filter(|candidate| candidate.state != CandidateState::Failed)
            .take(self.k)
        {
            if batch.len() >= alpha {
                break;
            }

            if candidate.state == CandidateState::Unqueried {
                candidate.state = CandidateState::Inflight;
                batch.push(candidate.contact.clone());
            }
        }

        batch
    }

    pub fn responded(&mut self, id: &Id) {
        self.set_state(id, CandidateState::Responded)
    }

    /// Failed candidates are never queried again nor returned.
    pub fn failed(&mut self, id: &Id) {
        self.set_state(id, CandidateState::Failed)
    }

    // === Private Methods ===

    fn live(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates
            .iter()
            .filter(|candidate| candidate.state != CandidateState::Failed)
    }

    fn set_state(&mut self, id: &Id, state: CandidateState) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|candidate| candidate.contact.id() == id)
        {
            candidate.state = state;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupKind {
    FindNode,
    FindValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value found for a key, and where it was found.
pub struct FoundValue {
    pub key: Id,
    pub value: Bytes,
    /// The node that returned the value, this node itself for local reads.
    pub from: Contact,
    /// Remaining lifetime of the value at [FoundValue::from], if known.
    pub ttl: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct LookupResult {
    /// Closest responding nodes, for value lookups only those that did not have the value.
    pub closest: Vec<Contact>,
    pub value: Option<FoundValue>,
}

impl Rpc {
    /// Iteratively query the closest known nodes to `target`, `alpha` at a time,
    /// until the `k` closest live nodes have all responded or no more nodes can be queried.
    ///
    /// Never fails, unreachable nodes are dropped from the result.
    pub(crate) fn lookup(&self, target: &Id, kind: LookupKind) -> LookupResult {
        let k = self.config.k;
        let alpha = self.config.alpha;

        let request = match kind {
            LookupKind::FindNode => RequestSpecific::FindNode(FindNodeRequestArguments {
                target: target.clone(),
            }),
            LookupKind::FindValue => RequestSpecific::FindValue(FindValueRequestArguments {
                key: target.clone(),
            }),
        };

        let mut shortlist = Shortlist::new(target.clone(), k);
        for contact in self.routing_table.closest_contacts(target, k) {
            shortlist.add(contact);
        }
        self.routing_table.touch(target);

        let mut rounds = 0;

        loop {
            let batch = shortlist.next_batch(alpha);

            if batch.is_empty() {
                break;
            }

            rounds += 1;
            let best_before = shortlist.best_distance();

            // Send the whole round before waiting on any of it.
            let deadline = Instant::now() + self.config.request_timeout;
            let inflight: Vec<(Contact, Result<PendingResponse, RpcError>)> = batch
                .into_iter()
                .map(|contact| {
                    let pending = self.send_request(contact.address(), request.clone());
                    (contact, pending)
                })
                .collect();

            let mut found: Option<FoundValue> = None;

            // The rest of the round is still awaited after a value is found,
            // its non holders are where the value gets cached.
            for (contact, pending) in inflight {
                match pending.and_then(|pending| self.wait(&pending, deadline)) {
                    Ok(message) => match &message.message_type {
                        MessageType::Response(ResponseSpecific::FindValue(
                            FindValueResponseArguments::Value { value, ttl },
                        )) => {
                            if found.is_none() {
                                found = Some(FoundValue {
                                    key: target.clone(),
                                    value: value.clone(),
                                    from: contact,
                                    ttl: *ttl,
                                });
                            }
                        }
                        _ => {
                            shortlist.responded(contact.id());

                            for closer in message.get_closer_contacts().unwrap_or_default() {
                                if closer.id() == &self.id {
                                    continue;
                                }

                                // Only direct contact refreshes a known contact.
                                if !self.routing_table.contains(closer.id()) {
                                    self.saw(closer.clone());
                                }
                                shortlist.add(closer.clone());
                            }
                        }
                    },
                    Err(error) => {
                        trace!(?target, ?contact, ?error, "Lookup request failed");

                        shortlist.failed(contact.id());
                        self.request_failed(&contact, &error);
                    }
                }
            }

            if let Some(value) = found {
                debug!(?target, rounds, from = ?value.from, "Lookup found value");

                return LookupResult {
                    closest: shortlist.closest_responded(),
                    value: Some(value),
                };
            }

            let improved = match (&best_before, shortlist.best_distance()) {
                (Some(before), Some(after)) => after.cmp(before) == Ordering::Less,
                (None, Some(_)) => true,
                _ => false,
            };

            if !improved && shortlist.is_settled() {
                break;
            }
        }

        let closest = shortlist.closest_responded();

        debug!(
            ?target,
            ?kind,
            rounds,
            candidates = shortlist.len(),
            closest = closest.len(),
            "Done lookup"
        );

        LookupResult {
            closest,
            value: None,
        }
    }
}
