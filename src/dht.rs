//! Dht node: a thread owning a [Router] plus a cheap clonable handle.

use std::net::SocketAddrV4;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender, TryRecvError};

use crate::common::{Id, Node};
use crate::config::Config;
use crate::router::{RequestType, Router, SearchStatus};
use crate::{Error, Result};

/// A handle to a Dht node running on its own actor thread.
///
/// All routing state lives on that thread; handles only pass messages.
#[derive(Debug)]
pub struct Dht {
    handle: Option<JoinHandle<()>>,
    sender: Sender<ActorMessage>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            handle: None,
            sender: self.sender.clone(),
        }
    }
}

impl Dht {
    pub fn new(config: Config) -> Result<Self> {
        // Bind the socket on the caller's thread so setup errors surface
        // here instead of dying silently inside the actor.
        let router = Router::new(config)?;

        let (sender, receiver) = flume::unbounded();
        let handle = thread::spawn(move || run(router, receiver));

        Ok(Dht {
            sender,
            handle: Some(handle),
        })
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> Result<Id> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::Id(tx))
            .map_err(|_| Error::DhtIsShutdown)?;

        rx.recv().map_err(|_| Error::DhtIsShutdown)
    }

    /// Returns the address the node is listening to.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let (tx, rx) = flume::bounded(1);
        self.sender
            .send(ActorMessage::LocalAddr(tx))
            .map_err(|_| Error::DhtIsShutdown)?;

        rx.recv().map_err(|_| Error::DhtIsShutdown)
    }

    // === Public Methods ===

    /// Make a peer known to the router, e.g. a bootstrap node.
    pub fn add_node(&self, id: Id, address: SocketAddrV4) -> Result<()> {
        self.sender
            .send(ActorMessage::AddNode(id, address))
            .map_err(|_| Error::DhtIsShutdown)
    }

    /// Iteratively search for the nodes closest to `target`.
    ///
    /// Each reply's announced nodes arrive as one item; dropping the
    /// returned [Response] terminates the search.
    pub fn find_node(&self, target: Id) -> Result<Response> {
        self.search(RequestType::FindNode, target)
    }

    /// Like [Dht::find_node], with the `get_peers` verb for overlays that
    /// route peer lookups by info hash.
    pub fn get_peers(&self, info_hash: Id) -> Result<Response> {
        self.search(RequestType::GetPeers, info_hash)
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    /// Wait for the actor thread to exit after [Dht::shutdown].
    pub fn block_until_shutdown(self) {
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }

    // === Private Methods ===

    fn search(&self, request_type: RequestType, target: Id) -> Result<Response> {
        let (events_tx, events_rx) = flume::unbounded();
        let (status_tx, status_rx) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Search(
                request_type,
                target,
                events_tx,
                status_tx,
            ))
            .map_err(|_| Error::DhtIsShutdown)?;

        status_rx.recv().map_err(|_| Error::DhtIsShutdown)??;

        Ok(Response {
            receiver: events_rx,
        })
    }
}

/// Discovered nodes, one batch per reply. Ends when the search concludes.
pub struct Response {
    receiver: Receiver<Vec<Node>>,
}

impl Iterator for Response {
    type Item = Vec<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

enum ActorMessage {
    Shutdown,
    Id(Sender<Id>),
    LocalAddr(Sender<SocketAddrV4>),
    AddNode(Id, SocketAddrV4),
    Search(RequestType, Id, Sender<Vec<Node>>, Sender<Result<()>>),
}

fn run(mut router: Router, receiver: Receiver<ActorMessage>) {
    loop {
        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown) => break,
            Ok(ActorMessage::Id(tx)) => {
                let _ = tx.send(router.id());
            }
            Ok(ActorMessage::LocalAddr(tx)) => {
                let _ = tx.send(router.local_addr());
            }
            Ok(ActorMessage::AddNode(id, address)) => {
                router.add_node(id, address);
            }
            Ok(ActorMessage::Search(request_type, target, events, status)) => {
                let result = router.begin_search(
                    request_type,
                    target,
                    Box::new(move |reply| {
                        // A dropped receiver is the consumer saying "done".
                        if events.send(reply.nodes.clone()).is_ok() {
                            SearchStatus::Continue
                        } else {
                            SearchStatus::Terminate
                        }
                    }),
                );
                let _ = status.send(result);
            }
            Err(TryRecvError::Empty) => {}
            // Every handle is gone; nothing can reach this node anymore.
            Err(TryRecvError::Disconnected) => break,
        }

        router.tick();
    }
}
