//! Types shared by the node store, the search store and the router.

mod id;
mod node;

pub use id::{Id, ID_SIZE};
pub use node::Node;
