//! Wire messages: bencoded dictionaries with a two-layer representation,
//! ergonomic public structs here and serde-shaped structs in [internal].

mod internal;

use std::convert::TryInto;
use std::net::SocketAddrV4;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// Length of one (id ++ compact address) record in a nodes blob.
pub const NODE_RECORD_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,

    FindNode(FindNodeRequestArguments),

    GetPeers(GetPeersRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetPeersRequestArguments {
    pub info_hash: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),

    Nodes(NodesResponseArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct NodesResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl Message {
    fn into_serde_message(self) -> internal::RpcMessage {
        internal::RpcMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(request) => {
                    let id = request.requester_id.to_vec();
                    internal::RpcMessageVariant::Request(match request.request_type {
                        RequestTypeSpecific::Ping => internal::RpcRequestSpecific::Ping {
                            arguments: internal::RpcPingArguments { id },
                        },
                        RequestTypeSpecific::FindNode(arguments) => {
                            internal::RpcRequestSpecific::FindNode {
                                arguments: internal::RpcFindNodeArguments {
                                    id,
                                    target: arguments.target.to_vec(),
                                },
                            }
                        }
                        RequestTypeSpecific::GetPeers(arguments) => {
                            internal::RpcRequestSpecific::GetPeers {
                                arguments: internal::RpcGetPeersArguments {
                                    id,
                                    info_hash: arguments.info_hash.to_vec(),
                                },
                            }
                        }
                    })
                }

                MessageType::Response(response) => {
                    internal::RpcMessageVariant::Response(match response {
                        ResponseSpecific::Ping(arguments) => internal::RpcResponseSpecific::Ping {
                            arguments: internal::RpcPingResponseArguments {
                                id: arguments.responder_id.to_vec(),
                            },
                        },
                        ResponseSpecific::Nodes(arguments) => internal::RpcResponseSpecific::Nodes {
                            arguments: internal::RpcNodesResponseArguments {
                                id: arguments.responder_id.to_vec(),
                                nodes: nodes_to_bytes(&arguments.nodes),
                            },
                        },
                    })
                }

                MessageType::Error(error) => {
                    internal::RpcMessageVariant::Error(internal::RpcErrorSpecific {
                        error_info: vec![
                            serde_bencode::value::Value::Int(error.code.into()),
                            serde_bencode::value::Value::Bytes(error.description.into()),
                        ],
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::RpcMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: transaction_id(&msg.transaction_id)?,
            version: msg.version,

            message_type: match msg.variant {
                internal::RpcMessageVariant::Request(request) => {
                    MessageType::Request(match request {
                        internal::RpcRequestSpecific::Ping { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(&arguments.id)?,
                            request_type: RequestTypeSpecific::Ping,
                        },
                        internal::RpcRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(&arguments.id)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(&arguments.target)?,
                            }),
                        },
                        internal::RpcRequestSpecific::GetPeers { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(&arguments.id)?,
                            request_type: RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                                info_hash: Id::from_bytes(&arguments.info_hash)?,
                            }),
                        },
                    })
                }

                internal::RpcMessageVariant::Response(response) => {
                    MessageType::Response(match response {
                        internal::RpcResponseSpecific::Ping { arguments } => {
                            ResponseSpecific::Ping(PingResponseArguments {
                                responder_id: Id::from_bytes(&arguments.id)?,
                            })
                        }
                        internal::RpcResponseSpecific::Nodes { arguments } => {
                            let responder_id = Id::from_bytes(&arguments.id)?;

                            // A nodes blob that isn't whole 26-byte records
                            // carries no routable information; the reply is
                            // then no more useful than a ping.
                            match bytes_to_nodes(&arguments.nodes) {
                                Ok(nodes) => ResponseSpecific::Nodes(NodesResponseArguments {
                                    responder_id,
                                    nodes,
                                }),
                                Err(_) => ResponseSpecific::Ping(PingResponseArguments {
                                    responder_id,
                                }),
                            }
                        }
                    })
                }

                internal::RpcMessageVariant::Error(error) => {
                    if error.error_info.len() < 2 {
                        return Err(Error::Generic(
                            "Error packet should have at least 2 elements".into(),
                        ));
                    }
                    MessageType::Error(ErrorSpecific {
                        code: match error.error_info[0] {
                            serde_bencode::value::Value::Int(code) => code
                                .try_into()
                                .map_err(|_| Error::Generic("error code out of range".into()))?,
                            _ => {
                                return Err(Error::Generic(
                                    "Expected error code as first element".into(),
                                ))
                            }
                        },
                        description: match &error.error_info[1] {
                            serde_bencode::value::Value::Bytes(description) => {
                                String::from_utf8_lossy(description).to_string()
                            }
                            _ => {
                                return Err(Error::Generic(
                                    "Expected description as second element".into(),
                                ))
                            }
                        },
                    })
                }
            },
        })
    }

    pub fn to_bytes(self) -> Result<Vec<u8>> {
        self.into_serde_message().to_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::RpcMessage::from_bytes(bytes)?)
    }

    /// Return the Id of the sender of the Message, regardless of which
    /// variant carries it. Error messages carry none.
    pub fn get_author_id(&self) -> Option<Id> {
        let id = match &self.message_type {
            MessageType::Request(request) => request.requester_id,
            MessageType::Response(response) => match response {
                ResponseSpecific::Ping(arguments) => arguments.responder_id,
                ResponseSpecific::Nodes(arguments) => arguments.responder_id,
            },
            MessageType::Error(_) => {
                return None;
            }
        };

        Some(id)
    }
}

fn transaction_id(bytes: &[u8]) -> Result<u16> {
    if bytes.len() != 2 {
        return Err(Error::InvalidTransactionId(bytes.to_vec()));
    }

    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Encode nodes as concatenated 26-byte (id ++ compact address) records.
pub fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * NODE_RECORD_SIZE);

    for node in nodes {
        bytes.extend_from_slice(node.id().as_bytes());
        bytes.extend_from_slice(&sockaddr_to_bytes(node.address()));
    }

    bytes
}

/// Decode a nodes blob. Errs unless the length is a whole number of
/// 26-byte records (zero records is fine).
pub fn bytes_to_nodes(bytes: &[u8]) -> Result<Vec<Node>> {
    if bytes.len() % NODE_RECORD_SIZE != 0 {
        return Err(Error::Generic(format!(
            "Nodes blob of {} bytes is not whole records",
            bytes.len()
        )));
    }

    let mut nodes = Vec::with_capacity(bytes.len() / NODE_RECORD_SIZE);
    for record in bytes.chunks_exact(NODE_RECORD_SIZE) {
        let id = Id::from_bytes(&record[..ID_SIZE])?;
        let address = bytes_to_sockaddr(&record[ID_SIZE..]);
        nodes.push(Node::new(id, address));
    }

    Ok(nodes)
}

pub fn sockaddr_to_bytes(sockaddr: SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes[..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn bytes_to_sockaddr(bytes: &[u8]) -> SocketAddrV4 {
    let ip = std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    SocketAddrV4::new(ip, port)
}
