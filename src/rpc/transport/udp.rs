use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace};

use super::{Inbound, Transport, TransportError};
use crate::common::messages::Message;

/// Large enough for any UDP datagram.
const MAX_DATAGRAM_SIZE: usize = 65535;
/// How often the reader thread checks whether the transport was stopped.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
/// Bencoded messages over a UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    listening: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind a UDP socket on `address`.
    pub fn bind(address: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(address)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            listening: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind a UDP socket on all interfaces, on `port` or a random port.
    pub fn bind_port(port: Option<u16>) -> io::Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0))))
    }
}

impl Transport for UdpTransport {
    fn listen(&self) -> Result<Inbound, TransportError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyListening);
        }

        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let stopped = self.stopped.clone();
        let (sender, receiver) = flume::unbounded();

        info!(local_addr = ?self.local_addr, "Listening on UDP");

        thread::Builder::new()
            .name("kademlia-udp-reader".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

                while !stopped.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok((amt, from)) => {
                            let bytes = &buf[..amt];

                            if from.port() == 0 {
                                trace!(context = "socket_validation", "Message from port 0");
                                continue;
                            }

                            match Message::from_bytes(bytes) {
                                Ok(message) => {
                                    if sender.send((message, from)).is_err() {
                                        // Receiver dropped.
                                        break;
                                    }
                                }
                                Err(error) => {
                                    trace!(
                                        context = "socket_error",
                                        ?error,
                                        ?from,
                                        message = ?String::from_utf8_lossy(bytes),
                                        "Received invalid Bencode message."
                                    );
                                }
                            }
                        }
                        Err(ref e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) => {}
                        Err(e) => {
                            trace!(context = "socket_error", ?e, "recv_from failed unexpectedly");
                        }
                    }
                }

                debug!("UDP reader stopped");
            })?;

        Ok(receiver)
    }

    fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::Stopped);
        }

        self.socket.send_to(&message.to_bytes()?, to)?;
        trace!(context = "socket_message_sending", ?message, ?to);

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
