use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    /// Sender id, present on every message including errors.
    pub id: ByteBuf,

    #[serde(flatten)]
    pub variant: DHTMessageVariant,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum DHTMessageVariant {
    #[serde(rename = "q")]
    Request(DHTRequestSpecific),

    #[serde(rename = "r")]
    Response(DHTResponseSpecific),

    #[serde(rename = "e")]
    Error(DHTErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DHTRequestSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: DHTStoreRequestArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: DHTFindNodeRequestArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "a")]
        arguments: DHTFindValueRequestArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum DHTResponseSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "r")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "r")]
        arguments: DHTEmptyArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "r")]
        arguments: DHTFindNodeResponseArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "r")]
        arguments: DHTFindValueResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: (i32, String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTEmptyArguments {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTContact {
    pub id: ByteBuf,

    /// 6 bytes for Ipv4, 18 bytes for Ipv6, port in big endian.
    pub addr: ByteBuf,
}

// === STORE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTStoreRequestArguments {
    pub key: ByteBuf,

    pub v: ByteBuf,

    /// Remaining lifetime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

// === FIND_NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindNodeRequestArguments {
    pub target: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindNodeResponseArguments {
    pub nodes: Vec<DHTContact>,
}

// === FIND_VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindValueRequestArguments {
    pub key: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTFindValueResponseArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<DHTContact>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,

    /// Remaining lifetime of `v` in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}
