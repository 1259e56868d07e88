//! # reach-dht
//!
//! A Kademlia-style DHT router that ranks peers by *reach*: a score fed by
//! how much keyspace progress a peer's replies produce and how quickly they
//! arrive. Instead of k-buckets and good/bad node flags, every ranking
//! decision minimizes `distance(node, target) / reach(node)`, so queries
//! flow toward peers that have recently proven useful.

mod common;
mod error;
mod gmrt;
mod node_store;
mod search_store;

pub mod config;
pub mod dht;
pub mod messages;
pub mod router;

pub use common::{Id, Node, ID_SIZE};
pub use config::Config;
pub use dht::Dht;
pub use error::Error;
pub use node_store::NodeStore;
pub use router::{RequestType, Router, SearchStatus};

/// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
