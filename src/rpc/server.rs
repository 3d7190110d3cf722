//! Handle inbound messages: answer requests, route responses to their waiting requests.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::trace;

use super::Rpc;
use crate::common::messages::{
    ErrorSpecific, FindNodeResponseArguments, FindValueResponseArguments, Message, MessageType,
    RequestSpecific, ResponseSpecific,
};
use crate::common::{Contact, Id};

/// KRPC "Protocol Error" code.
pub const PROTOCOL_ERROR_CODE: i32 = 203;

impl Rpc {
    /// Handle one message received from `from`.
    pub(super) fn handle_inbound(&self, message: Message, from: SocketAddr) {
        let bits = self.config.bits;

        if message.sender_id.bits() != bits {
            trace!(
                context = "server_validation",
                ?from,
                sender_bits = message.sender_id.bits(),
                "Dropped message with wrong sender id width"
            );
            return;
        }

        if message.sender_id == self.id {
            trace!(context = "server_validation", ?from, "Dropped message from own id");
            return;
        }

        let sender = Contact::new(message.sender_id.clone(), from);

        if !message.has_id_width(bits) {
            trace!(
                context = "server_validation",
                ?from,
                "Message carries ids of the wrong width"
            );

            if message.is_request() {
                self.send_message(
                    from,
                    message.transaction_id,
                    MessageType::Error(ErrorSpecific {
                        code: PROTOCOL_ERROR_CODE,
                        description: format!("Invalid id width, expected {bits} bits"),
                    }),
                );
            }

            return;
        }

        match message.message_type {
            MessageType::Request(request) => {
                trace!(context = "server_request", ?from, request = request.name());

                self.saw(sender.clone());
                self.handle_request(&sender, message.transaction_id, request);
            }
            MessageType::Response(_) | MessageType::Error(_) => {
                if self.inbox.resolve(message, from) {
                    self.saw(sender);
                }
            }
        }
    }

    fn handle_request(&self, from: &Contact, transaction_id: u32, request: RequestSpecific) {
        let response = match request {
            RequestSpecific::Ping => ResponseSpecific::Ping,
            RequestSpecific::Store(arguments) => {
                let ttl = arguments
                    .ttl
                    .map_or(self.config.expire, |ttl| ttl.min(self.config.expire));

                self.store.insert(arguments.key, arguments.value, ttl);

                ResponseSpecific::Store
            }
            RequestSpecific::FindNode(arguments) => {
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    contacts: self.closest_for(&arguments.target, from.id()),
                })
            }
            RequestSpecific::FindValue(arguments) => {
                ResponseSpecific::FindValue(match self.store.get(&arguments.key) {
                    Some(record) => FindValueResponseArguments::Value {
                        ttl: Some(record.remaining(Instant::now())),
                        value: record.value,
                    },
                    None => FindValueResponseArguments::Contacts(
                        self.closest_for(&arguments.key, from.id()),
                    ),
                })
            }
        };

        self.send_message(
            from.address(),
            transaction_id,
            MessageType::Response(response),
        );
    }

    /// Closest contacts to `target`, leaving out the requester itself.
    fn closest_for(&self, target: &Id, requester: &Id) -> Vec<Contact> {
        let mut contacts = self
            .routing_table
            .closest_contacts(target, self.config.k + 1);

        contacts.retain(|contact| contact.id() != requester);
        contacts.truncate(self.config.k);

        contacts
    }
}
