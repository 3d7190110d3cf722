//! Struct and implementation of the Contact entry in the Kademlia routing table
use std::net::SocketAddr;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A peer as known to this node: its self reported [Id] and the address it was last seen at.
///
/// Two contacts are the same peer if their Ids are equal, regardless of the address.
pub struct Contact {
    id: Id,
    address: SocketAddr,
}

impl Contact {
    /// Creates a new Contact from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Contact {
        Contact { id, address }
    }

    /// Creates a contact with a random Id of `bits` width, for testing.
    pub fn random(bits: usize, address: SocketAddr) -> Contact {
        Contact {
            id: Id::random(bits),
            address,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns `true` if both contacts refer to the same peer.
    pub fn same_peer(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}
