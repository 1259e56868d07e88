use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    pub version: Option<Vec<u8>>,

    #[serde(flatten)]
    pub variant: RpcMessageVariant,
}

impl RpcMessage {
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<RpcMessage> {
        let obj = serde_bencode::from_bytes(bytes.as_ref())?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(Error::BencodeError)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "y")]
pub enum RpcMessageVariant {
    #[serde(rename = "q")]
    Request(RpcRequestSpecific),

    #[serde(rename = "r")]
    Response(RpcResponseSpecific),

    #[serde(rename = "e")]
    Error(RpcErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "q")]
pub enum RpcRequestSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: RpcPingArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: RpcFindNodeArguments,
    },

    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(rename = "a")]
        arguments: RpcGetPeersArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)] // This means order matters! Order these from most to least detailed
pub enum RpcResponseSpecific {
    Nodes {
        #[serde(rename = "r")]
        arguments: RpcNodesResponseArguments,
    },

    Ping {
        #[serde(rename = "r")]
        arguments: RpcPingResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcErrorSpecific {
    #[serde(rename = "e")]
    pub error_info: Vec<serde_bencode::value::Value>,
}

// === PING ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcPingArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcPingResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
}

// === FIND_NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcFindNodeArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub target: Vec<u8>,
}

// === GET_PEERS ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcGetPeersArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,
}

// === Nodes response ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcNodesResponseArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    /// Concatenated 26-byte (id ++ compact address) records, kept raw here;
    /// the public layer decides whether the blob is well formed.
    #[serde(with = "serde_bytes")]
    pub nodes: Vec<u8>,
}
