//! Correlate inbound responses with outstanding requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::trace;

use crate::common::messages::Message;

#[derive(Debug)]
struct PendingRequest {
    to: SocketAddr,
    sent_at: Instant,
    sender: flume::Sender<Message>,
}

impl PendingRequest {
    /// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
    fn does_match(&self, from: &SocketAddr) -> bool {
        if self.to.port() != from.port() {
            return false;
        }

        if self.to.ip().is_unspecified() {
            return true;
        }

        self.to.ip() == from.ip()
    }
}

#[derive(Debug)]
/// A registered request waiting for its response.
pub struct PendingResponse {
    pub transaction_id: u32,
    pub to: SocketAddr,
    receiver: flume::Receiver<Message>,
}

#[derive(Debug)]
/// Outstanding requests by transaction id.
pub struct Inbox {
    next_tid: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self {
            next_tid: AtomicU32::new(rand::random()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a request about to be sent to `to`.
    pub fn register(&self, to: SocketAddr) -> PendingResponse {
        let (sender, receiver) = flume::bounded(1);

        let mut pending = self.pending();

        let mut transaction_id = self.tid();
        while pending.contains_key(&transaction_id) {
            transaction_id = self.tid();
        }

        pending.insert(
            transaction_id,
            PendingRequest {
                to,
                sent_at: Instant::now(),
                sender,
            },
        );

        PendingResponse {
            transaction_id,
            to,
            receiver,
        }
    }

    /// Hand a response or error to the request waiting for it.
    ///
    /// Returns `false` and drops the message if no request matches its
    /// transaction id and source address.
    pub fn resolve(&self, message: Message, from: SocketAddr) -> bool {
        let mut pending = self.pending();

        match pending.get(&message.transaction_id) {
            Some(request) if request.does_match(&from) => {}
            Some(_) => {
                trace!(
                    context = "inbox",
                    ?from,
                    message = "Response from wrong address"
                );
                return false;
            }
            None => {
                trace!(context = "inbox", ?from, message = "Unexpected response id");
                return false;
            }
        }

        let Some(request) = pending.remove(&message.transaction_id) else {
            return false;
        };
        drop(pending);

        trace!(
            context = "inbox",
            transaction_id = message.transaction_id,
            elapsed = ?request.sent_at.elapsed(),
            "Resolved request"
        );

        // Capacity is one and there is only ever one response, so this never blocks.
        request.sender.try_send(message).is_ok()
    }

    /// Wait for the response to `pending` until `deadline`.
    ///
    /// On timeout the request is removed, so a late response goes unmatched.
    pub fn wait(&self, pending: &PendingResponse, deadline: Instant) -> Option<Message> {
        match pending.receiver.recv_deadline(deadline) {
            Ok(message) => Some(message),
            Err(_) => {
                self.cancel(pending.transaction_id);

                // A response may have been resolved right before the cancel.
                pending.receiver.try_recv().ok()
            }
        }
    }

    /// Forget about a request.
    pub fn cancel(&self, transaction_id: u32) {
        self.pending().remove(&transaction_id);
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u32, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::common::messages::{MessageType, ResponseSpecific};
    use crate::common::Id;

    fn response(transaction_id: u32) -> Message {
        Message {
            transaction_id,
            sender_id: Id::random(160),
            message_type: MessageType::Response(ResponseSpecific::Ping),
        }
    }

    #[test]
    fn resolve_matching_response() {
        let inbox = Inbox::new();
        let to: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let pending = inbox.register(to);
        let message = response(pending.transaction_id);

        assert!(inbox.resolve(message.clone(), to));
        assert_eq!(
            inbox.wait(&pending, Instant::now() + Duration::from_secs(1)),
            Some(message)
        );
        assert!(inbox.is_empty());
    }

    #[test]
    fn drop_unmatched() {
        let inbox = Inbox::new();
        let to: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let pending = inbox.register(to);

        // Wrong transaction id.
        assert!(!inbox.resolve(response(pending.transaction_id.wrapping_add(1)), to));
        // Wrong address.
        assert!(!inbox.resolve(
            response(pending.transaction_id),
            "127.0.0.1:6882".parse().unwrap()
        ));

        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn unspecified_ip_matches_any_ip() {
        let inbox = Inbox::new();

        let pending = inbox.register("0.0.0.0:6881".parse().unwrap());

        assert!(inbox.resolve(
            response(pending.transaction_id),
            "192.168.1.1:6881".parse().unwrap()
        ));
    }

    #[test]
    fn timeout_removes_request() {
        let inbox = Inbox::new();
        let to: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let pending = inbox.register(to);

        assert_eq!(
            inbox.wait(&pending, Instant::now() + Duration::from_millis(10)),
            None
        );
        assert!(inbox.is_empty());

        // Late response is dropped.
        assert!(!inbox.resolve(response(pending.transaction_id), to));
    }

    #[test]
    fn concurrent_registrations_are_unique() {
        let inbox = std::sync::Arc::new(Inbox::new());
        let to: SocketAddr = "127.0.0.1:6881".parse().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let inbox = inbox.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| inbox.register(to).transaction_id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u32> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 400);
        assert_eq!(inbox.len(), 400);
    }
}
