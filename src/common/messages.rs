//! Serialize and deserialize DHT messages.

mod internal;

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{Contact, Id};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// The self reported Id of the sender, carried by every message.
    pub sender_id: Id,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    Store(StoreRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping,
    Store,
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Bytes,
    /// Remaining lifetime the sender wants the value stored for.
    pub ttl: Option<Duration>,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub contacts: Vec<Contact>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FindValueResponseArguments {
    Value { value: Bytes, ttl: Option<Duration> },
    Contacts(Vec<Contact>),
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            id: ByteBuf::from(self.sender_id.to_vec()),
            variant: match self.message_type {
                MessageType::Request(request) => {
                    internal::DHTMessageVariant::Request(match request {
                        RequestSpecific::Ping => internal::DHTRequestSpecific::Ping {
                            arguments: internal::DHTEmptyArguments {},
                        },
                        RequestSpecific::Store(store_args) => {
                            internal::DHTRequestSpecific::Store {
                                arguments: internal::DHTStoreRequestArguments {
                                    key: ByteBuf::from(store_args.key.to_vec()),
                                    v: ByteBuf::from(store_args.value.to_vec()),
                                    ttl: store_args.ttl.map(duration_to_millis),
                                },
                            }
                        }
                        RequestSpecific::FindNode(find_node_args) => {
                            internal::DHTRequestSpecific::FindNode {
                                arguments: internal::DHTFindNodeRequestArguments {
                                    target: ByteBuf::from(find_node_args.target.to_vec()),
                                },
                            }
                        }
                        RequestSpecific::FindValue(find_value_args) => {
                            internal::DHTRequestSpecific::FindValue {
                                arguments: internal::DHTFindValueRequestArguments {
                                    key: ByteBuf::from(find_value_args.key.to_vec()),
                                },
                            }
                        }
                    })
                }

                MessageType::Response(response) => {
                    internal::DHTMessageVariant::Response(match response {
                        ResponseSpecific::Ping => internal::DHTResponseSpecific::Ping {
                            arguments: internal::DHTEmptyArguments {},
                        },
                        ResponseSpecific::Store => internal::DHTResponseSpecific::Store {
                            arguments: internal::DHTEmptyArguments {},
                        },
                        ResponseSpecific::FindNode(find_node_args) => {
                            internal::DHTResponseSpecific::FindNode {
                                arguments: internal::DHTFindNodeResponseArguments {
                                    nodes: contacts_to_serde(&find_node_args.contacts),
                                },
                            }
                        }
                        ResponseSpecific::FindValue(find_value_args) => {
                            internal::DHTResponseSpecific::FindValue {
                                arguments: match find_value_args {
                                    FindValueResponseArguments::Value { value, ttl } => {
                                        internal::DHTFindValueResponseArguments {
                                            nodes: None,
                                            v: Some(ByteBuf::from(value.to_vec())),
                                            ttl: ttl.map(duration_to_millis),
                                        }
                                    }
                                    FindValueResponseArguments::Contacts(contacts) => {
                                        internal::DHTFindValueResponseArguments {
                                            nodes: Some(contacts_to_serde(&contacts)),
                                            v: None,
                                            ttl: None,
                                        }
                                    }
                                },
                            }
                        }
                    })
                }

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, DecodeError> {
        Ok(Message {
            transaction_id: transaction_id(&msg.transaction_id)?,
            sender_id: id_from_bytes(&msg.id)?,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::DHTRequestSpecific::Ping { .. } => RequestSpecific::Ping,
                        internal::DHTRequestSpecific::Store { arguments } => {
                            RequestSpecific::Store(StoreRequestArguments {
                                key: id_from_bytes(&arguments.key)?,
                                value: Bytes::from(arguments.v.into_vec()),
                                ttl: arguments.ttl.map(Duration::from_millis),
                            })
                        }
                        internal::DHTRequestSpecific::FindNode { arguments } => {
                            RequestSpecific::FindNode(FindNodeRequestArguments {
                                target: id_from_bytes(&arguments.target)?,
                            })
                        }
                        internal::DHTRequestSpecific::FindValue { arguments } => {
                            RequestSpecific::FindValue(FindValueRequestArguments {
                                key: id_from_bytes(&arguments.key)?,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::DHTResponseSpecific::Ping { .. } => ResponseSpecific::Ping,
                        internal::DHTResponseSpecific::Store { .. } => ResponseSpecific::Store,
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                contacts: contacts_from_serde(arguments.nodes)?,
                            })
                        }
                        internal::DHTResponseSpecific::FindValue { arguments } => {
                            ResponseSpecific::FindValue(match (arguments.v, arguments.nodes) {
                                (Some(v), _) => FindValueResponseArguments::Value {
                                    value: Bytes::from(v.into_vec()),
                                    ttl: arguments.ttl.map(Duration::from_millis),
                                },
                                (None, nodes) => FindValueResponseArguments::Contacts(
                                    contacts_from_serde(nodes.unwrap_or_default())?,
                                ),
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        self.clone().into_serde_message().to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeError> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// Returns `true` if the sender id and every id carried in the payload
    /// (keys, targets and contacts) are `bits` wide.
    ///
    /// Messages failing this check must be dropped before any of their ids
    /// reach the XOR metric.
    pub fn has_id_width(&self, bits: usize) -> bool {
        if self.sender_id.bits() != bits {
            return false;
        }

        let contacts_width =
            |contacts: &[Contact]| contacts.iter().all(|contact| contact.id().bits() == bits);

        match &self.message_type {
            MessageType::Request(request) => match request {
                RequestSpecific::Ping => true,
                RequestSpecific::Store(arguments) => arguments.key.bits() == bits,
                RequestSpecific::FindNode(arguments) => arguments.target.bits() == bits,
                RequestSpecific::FindValue(arguments) => arguments.key.bits() == bits,
            },
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping | ResponseSpecific::Store => true,
                ResponseSpecific::FindNode(arguments) => contacts_width(&arguments.contacts),
                ResponseSpecific::FindValue(FindValueResponseArguments::Contacts(contacts)) => {
                    contacts_width(contacts)
                }
                ResponseSpecific::FindValue(FindValueResponseArguments::Value { .. }) => true,
            },
            MessageType::Error(_) => true,
        }
    }

    /// If the response contains closer contacts to the target, return them.
    pub fn get_closer_contacts(&self) -> Option<&[Contact]> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::FindNode(arguments)) => {
                Some(&arguments.contacts)
            }
            MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments::Contacts(contacts),
            )) => Some(contacts),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.message_type, MessageType::Request(_))
    }
}

impl RequestSpecific {
    /// Name of the request as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            RequestSpecific::Ping => "ping",
            RequestSpecific::Store(_) => "store",
            RequestSpecific::FindNode(_) => "find_node",
            RequestSpecific::FindValue(_) => "find_value",
        }
    }
}

// Return the transaction Id as a u32
pub fn transaction_id(bytes: &[u8]) -> Result<u32, DecodeError> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| DecodeError::InvalidTransactionId(bytes.to_vec()))?;

    Ok(u32::from_be_bytes(array))
}

fn id_from_bytes(bytes: &[u8]) -> Result<Id, DecodeError> {
    Id::from_bytes(bytes).ok_or(DecodeError::InvalidId)
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr, DecodeError> {
    let bytes = bytes.as_ref();

    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);

            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let octets: [u8; 16] = bytes[0..16]
                .try_into()
                .map_err(|_| DecodeError::InvalidAddress(bytes.len()))?;
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);

            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        len => Err(DecodeError::InvalidAddress(len)),
    }
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddr) -> Vec<u8> {
    let mut bytes = match sockaddr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };

    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

fn contacts_to_serde(contacts: &[Contact]) -> Vec<internal::DHTContact> {
    contacts
        .iter()
        .map(|contact| internal::DHTContact {
            id: ByteBuf::from(contact.id().to_vec()),
            addr: ByteBuf::from(sockaddr_to_bytes(&contact.address())),
        })
        .collect()
}

fn contacts_from_serde(contacts: Vec<internal::DHTContact>) -> Result<Vec<Contact>, DecodeError> {
    contacts
        .iter()
        .map(|contact| {
            Ok(Contact::new(
                id_from_bytes(&contact.id)?,
                bytes_to_sockaddr(&contact.addr)?,
            ))
        })
        .collect()
}

#[derive(thiserror::Error, Debug)]
/// Failed to decode an inbound message.
pub enum DecodeError {
    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// An id, key or target was empty.
    #[error("Invalid empty id")]
    InvalidId,

    /// A compact address was neither 6 nor 18 bytes long.
    #[error("Wrong number of bytes for sockaddr: {0}")]
    InvalidAddress(usize),

    /// Transaction ids are 4 bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(original_msg: Message) {
        let serde_msg = original_msg.clone().into_serde_message();
        let bytes = serde_msg.to_bytes().unwrap();
        let parsed_serde_msg = internal::DHTMessage::from_bytes(&bytes).unwrap();
        let parsed_msg = Message::from_serde_message(parsed_serde_msg).unwrap();
        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_transaction_id() {
        assert_eq!(transaction_id(&[0, 0, 1, 2]).unwrap(), 258);
        assert_eq!(transaction_id(&[255, 255, 255, 255]).unwrap(), u32::MAX);
        assert!(transaction_id(&[1, 2]).is_err());
        assert!(transaction_id(&[]).is_err());
    }

    #[test]
    fn test_decode_ping_request() {
        let mut bytes = b"d1:ade2:id20:".to_vec();
        bytes.extend([0xaa; 20]);
        bytes.extend(b"1:q4:ping1:t4:");
        bytes.extend([0, 0, 1, 2]);
        bytes.extend(b"1:y1:qe");

        let message = Message::from_bytes(&bytes).unwrap();

        assert_eq!(message.transaction_id, 258);
        assert_eq!(message.sender_id, Id::from([0xaa; 20]));
        assert_eq!(
            message.message_type,
            MessageType::Request(RequestSpecific::Ping)
        );
    }

    #[test]
    fn test_store_request() {
        round_trip(Message {
            transaction_id: 1,
            sender_id: Id::random(160),
            message_type: MessageType::Request(RequestSpecific::Store(StoreRequestArguments {
                key: Id::random(160),
                value: Bytes::from_static(b"hello"),
                ttl: Some(Duration::from_secs(3600)),
            })),
        });

        round_trip(Message {
            transaction_id: 2,
            sender_id: Id::random(64),
            message_type: MessageType::Request(RequestSpecific::Store(StoreRequestArguments {
                key: Id::random(64),
                value: Bytes::new(),
                ttl: None,
            })),
        });
    }

    #[test]
    fn test_find_node_response() {
        round_trip(Message {
            transaction_id: 258,
            sender_id: Id::random(160),
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    contacts: vec![
                        Contact::random(160, "49.50.52.52:5354".parse().unwrap()),
                        Contact::random(160, "[2001:db8::1]:6881".parse().unwrap()),
                    ],
                },
            )),
        });
    }

    #[test]
    fn test_find_value_responses() {
        round_trip(Message {
            transaction_id: 3,
            sender_id: Id::random(160),
            message_type: MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments::Value {
                    value: Bytes::from_static(b"world"),
                    ttl: Some(Duration::from_millis(1500)),
                },
            )),
        });

        round_trip(Message {
            transaction_id: 4,
            sender_id: Id::random(160),
            message_type: MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments::Contacts(vec![]),
            )),
        });
    }

    #[test]
    fn test_error() {
        round_trip(Message {
            transaction_id: 5,
            sender_id: Id::random(160),
            message_type: MessageType::Error(ErrorSpecific {
                code: 203,
                description: "Invalid key length".to_string(),
            }),
        });
    }

    #[test]
    fn test_has_id_width() {
        let message = Message {
            transaction_id: 0,
            sender_id: Id::random(160),
            message_type: MessageType::Request(RequestSpecific::FindValue(
                FindValueRequestArguments {
                    key: Id::random(64),
                },
            )),
        };

        assert!(!message.has_id_width(160));
        assert!(!message.has_id_width(64));

        let message = Message {
            transaction_id: 0,
            sender_id: Id::random(160),
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    contacts: vec![Contact::random(160, "1.1.1.1:1".parse().unwrap())],
                },
            )),
        };

        assert!(message.has_id_width(160));
        assert_eq!(message.get_closer_contacts().map(|c| c.len()), Some(1));
    }

    #[test]
    fn test_sockaddr() {
        for address in ["127.0.0.1:6881", "[::1]:443"] {
            let address: SocketAddr = address.parse().unwrap();
            assert_eq!(
                bytes_to_sockaddr(sockaddr_to_bytes(&address)).unwrap(),
                address
            );
        }

        assert!(matches!(
            bytes_to_sockaddr([0u8; 5]),
            Err(DecodeError::InvalidAddress(5))
        ));
    }

    #[test]
    fn test_malformed() {
        assert!(Message::from_bytes(b"not bencode").is_err());
        assert!(Message::from_bytes(b"de").is_err());
    }
}
