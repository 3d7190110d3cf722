use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::{Inbound, Transport, TransportError};
use crate::common::messages::Message;

const FIRST_PORT: u16 = 10000;

#[derive(Debug, Default)]
struct NetworkState {
    next_port: u16,
    listeners: HashMap<SocketAddr, flume::Sender<(Message, SocketAddr)>>,
    offline: HashSet<SocketAddr>,
    sends: HashMap<SocketAddr, usize>,
}

#[derive(Debug, Clone, Default)]
/// In process network connecting [MemoryTransport]s.
///
/// Messages still go through the bencode codec, so nodes exchange exactly
/// what they would over UDP. Useful for tests and simulations.
pub struct MemoryNetwork(Arc<Mutex<NetworkState>>);

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a fresh address on this network.
    pub fn transport(&self) -> MemoryTransport {
        let mut state = self.state();

        let port = FIRST_PORT.wrapping_add(state.next_port);
        state.next_port = state.next_port.wrapping_add(1);

        MemoryTransport {
            network: self.clone(),
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    /// Offline nodes neither send nor receive anything.
    pub fn set_offline(&self, address: SocketAddr, offline: bool) {
        let mut state = self.state();

        if offline {
            state.offline.insert(address);
        } else {
            state.offline.remove(&address);
        }
    }

    /// Number of messages sent from `address` so far.
    pub fn sends_from(&self, address: SocketAddr) -> usize {
        self.state().sends.get(&address).copied().unwrap_or(0)
    }

    /// Number of messages sent on this network so far.
    pub fn total_sends(&self) -> usize {
        self.state().sends.values().sum()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
/// A [Transport] on a [MemoryNetwork].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
}

impl Transport for MemoryTransport {
    fn listen(&self) -> Result<Inbound, TransportError> {
        let mut state = self.network.state();

        if state.listeners.contains_key(&self.local_addr) {
            return Err(TransportError::AlreadyListening);
        }

        let (sender, receiver) = flume::unbounded();
        state.listeners.insert(self.local_addr, sender);

        Ok(receiver)
    }

    fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = message.to_bytes()?;

        let mut state = self.network.state();

        if !state.listeners.contains_key(&self.local_addr) {
            return Err(TransportError::Stopped);
        }

        *state.sends.entry(self.local_addr).or_default() += 1;

        if state.offline.contains(&self.local_addr) || state.offline.contains(&to) {
            trace!(context = "memory_transport", ?to, "Dropped message to or from offline node");
            return Ok(());
        }

        let Some(listener) = state.listeners.get(&to) else {
            // Sent to the void.
            return Ok(());
        };

        match Message::from_bytes(&bytes) {
            Ok(message) => {
                let _ = listener.send((message, self.local_addr));
            }
            Err(error) => {
                trace!(context = "memory_transport", ?error, "Dropped undecodable message");
            }
        }

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn stop(&self) {
        self.network.state().listeners.remove(&self.local_addr);
    }
}
