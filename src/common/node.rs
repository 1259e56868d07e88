//! Struct and implementation of the Node entry in the reach-weighted store
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;

use crate::common::Id;

#[derive(Clone, PartialEq)]
/// A known peer: an id, its last observed endpoint, and its reach score.
///
/// Reach is a 32-bit score of how useful this peer has recently been;
/// 0 means unproven or timed out. Dead peers are ignored by the ranking
/// but kept around until they accumulate enough consecutive timeouts.
pub struct Node {
    pub(crate) id: Id,
    pub(crate) address: SocketAddrV4,
    pub(crate) reach: u32,
    pub(crate) consecutive_timeouts: u32,
}

impl Debug for Node {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("reach", &self.reach)
            .finish()
    }
}

impl Node {
    /// Creates a new unproven Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            reach: 0,
            consecutive_timeouts: 0,
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn reach(&self) -> u32 {
        self.reach
    }

    /// Creates a node with random Id for testing purposes.
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    pub fn with_reach(mut self, reach: u32) -> Self {
        self.reach = reach;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_nodes_are_unproven() {
        let node = Node::random();

        assert_eq!(node.reach(), 0);
        assert_eq!(node.consecutive_timeouts, 0);
    }
}
