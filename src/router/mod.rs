//! Router core: answers inbound queries with reach-ranked nodes, drives
//! recursive searches, and folds reply latency and keyspace progress back
//! into per-node reach.
//!
//! Single-threaded by design: every handler and timer runs to completion
//! inside [Router::tick], so the stores are mutated without locks. Hosts
//! that want a thread get one from [crate::Dht].

mod maintenance;
pub(crate) mod socket;

use std::net::SocketAddrV4;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::common::{Id, Node};
use crate::config::Config;
use crate::gmrt::Gmrt;
use crate::messages::{
    FindNodeRequestArguments, GetPeersRequestArguments, Message, MessageType,
    NodesResponseArguments, PingResponseArguments, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific,
};
use crate::node_store::NodeStore;
use crate::search_store::{SearchId, SearchStore};
use crate::{Error, Result};

use maintenance::Maintenance;
use socket::RpcSocket;

/// How many recently served inbound search targets to remember for the
/// global maintenance search.
const MAX_SERVED_TARGETS: usize = 64;

/// Verdict a search callback returns for each reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    /// Keep going: fan out one more probe.
    Continue,
    /// Done: attribute reach along the winning chain and drop the search.
    Terminate,
}

/// The query verb a search sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    FindNode,
    GetPeers,
}

impl RequestType {
    fn to_request(self, target: Id) -> RequestTypeSpecific {
        match self {
            RequestType::FindNode => {
                RequestTypeSpecific::FindNode(FindNodeRequestArguments { target })
            }
            RequestType::GetPeers => {
                RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash: target })
            }
        }
    }
}

/// Callback invoked once per reply within a search; its verdict decides
/// whether the search keeps fanning out.
pub type SearchCallback = Box<dyn FnMut(&NodesResponseArguments) -> SearchStatus + Send>;

/// The DHT router: a node store, a search store, and the scoring that
/// ties them together.
pub struct Router {
    id: Id,
    config: Config,
    socket: RpcSocket,
    node_store: NodeStore,
    search_store: SearchStore,
    gmrt: Gmrt,
    maintenance: Maintenance,
    /// Targets of recently answered queries, re-searched by the global
    /// maintenance loop so unproven peers get work.
    served_targets: LruCache<Id, ()>,
}

impl Router {
    pub fn new(config: Config) -> Result<Self> {
        let id = config.id.unwrap_or_else(Id::random);
        let socket = RpcSocket::new(config.port)?;

        let mut gmrt = Gmrt::new(config.gmrt_window_seconds);
        gmrt.update(Instant::now(), config.gmrt_initial_millis);

        Ok(Router {
            id,
            socket,
            node_store: NodeStore::new(id, &config),
            search_store: SearchStore::new(),
            gmrt,
            maintenance: Maintenance::new(),
            served_targets: LruCache::new(NonZeroUsize::new(MAX_SERVED_TARGETS).unwrap()),
            config,
        })
    }

    // === Options ===

    /// Override the router's Id, which is random by default. Distances are
    /// measured from this id, so set it before adding any nodes.
    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self.node_store = NodeStore::new(id, &self.config);
        self
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn node_store(&self) -> &NodeStore {
        &self.node_store
    }

    // === Public Methods ===

    /// Advance per-search timers, run periodic maintenance, then receive
    /// and dispatch at most one incoming message.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Make a peer known to the router. New peers start unproven.
    pub fn add_node(&mut self, id: Id, address: SocketAddrV4) {
        self.node_store.add(id, address);
    }

    /// Start a recursive search toward `target`.
    ///
    /// The callback sees every reply and decides whether to continue.
    /// Errs with [Error::NoReachableNodes] when the store has nothing
    /// strictly closer to the target than this router.
    pub fn begin_search(
        &mut self,
        request_type: RequestType,
        target: Id,
        callback: SearchCallback,
    ) -> Result<()> {
        self.begin_search_at(request_type, target, callback, Instant::now())
    }

    // === Private Methods ===

    fn tick_at(&mut self, now: Instant) {
        for search_id in self.search_store.due_searches(now) {
            self.search_step(search_id, now);
        }

        let decisions = self.maintenance.decisions_at(now, &self.config);
        if let Some(seconds) = decisions.decay_seconds {
            self.node_store.decay_all(seconds);
        }
        if decisions.local_search_due {
            self.local_maintenance_search(now);
        }
        if decisions.global_search_due {
            self.global_maintenance_search(now);
        }

        if let Some((message, from)) = self.socket.recv_from() {
            self.handle_message(message, from, now);
        }
    }

    fn begin_search_at(
        &mut self,
        request_type: RequestType,
        target: Id,
        callback: SearchCallback,
        now: Instant,
    ) -> Result<()> {
        let seeds = self.node_store.closest_k(&target, self.config.return_size);
        if seeds.is_empty() {
            return Err(Error::NoReachableNodes);
        }

        let search_id = self
            .search_store
            .new_search(target, request_type, callback, now);

        let evict_after = now + self.probe_timeout();
        for seed in &seeds {
            self.search_store
                .add_probe(search_id, None, *seed.id(), seed.address(), evict_after);
        }

        debug!(?target, seeds = seeds.len(), "Starting search");
        self.search_step(search_id, now);

        Ok(())
    }

    fn handle_message(&mut self, message: Message, from: SocketAddrV4, now: Instant) {
        match message.message_type {
            MessageType::Request(request) => {
                self.handle_request(from, message.transaction_id, request)
            }
            MessageType::Response(response) => {
                self.handle_response(from, message.transaction_id, response, now)
            }
            MessageType::Error(error) => {
                debug!(?error, ?from, "RPC error response");
            }
        }
    }

    /// Answer an inbound query. Every query teaches us its sender; search
    /// queries are answered with the closest-ranked nodes we may hand out.
    fn handle_request(&mut self, from: SocketAddrV4, transaction_id: u16, request: RequestSpecific) {
        self.node_store.add(request.requester_id, from);

        match request.request_type {
            RequestTypeSpecific::Ping => {
                self.socket.response(
                    from,
                    transaction_id,
                    ResponseSpecific::Ping(PingResponseArguments {
                        responder_id: self.id,
                    }),
                );
            }
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                self.answer_with_nodes(from, transaction_id, target);
            }
            RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }) => {
                self.answer_with_nodes(from, transaction_id, info_hash);
            }
        }
    }

    fn answer_with_nodes(&mut self, from: SocketAddrV4, transaction_id: u16, target: Id) {
        let nodes = self.node_store.closest_k(&target, self.config.return_size);
        trace!(?target, count = nodes.len(), "Answering search query");

        self.served_targets.put(target, ());

        self.socket.response(
            from,
            transaction_id,
            ResponseSpecific::Nodes(NodesResponseArguments {
                responder_id: self.id,
                nodes,
            }),
        );
    }

    fn handle_response(
        &mut self,
        from: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
        now: Instant,
    ) {
        let Some(probe_ref) = self.search_store.lookup_by_tid(transaction_id) else {
            trace!(transaction_id, ?from, "Response to unknown transaction id");
            return;
        };

        let response = match response {
            ResponseSpecific::Ping(arguments) => {
                // Address-discovery reply; remember the sender, nothing to
                // fan out from.
                self.node_store.add(arguments.responder_id, from);
                return;
            }
            ResponseSpecific::Nodes(arguments) => arguments,
        };

        match self.search_store.get(probe_ref.search) {
            Some(search) if search.probe(probe_ref.index).replied_at.is_none() => {}
            _ => {
                trace!(transaction_id, "Duplicate reply");
                return;
            }
        }

        self.node_store.add(response.responder_id, from);
        self.node_store.mark_replied(&response.responder_id, 0);
        self.search_store.mark_replied(probe_ref, now);

        let evict_after = now + self.probe_timeout();
        for node in &response.nodes {
            if *node.id() == self.id {
                continue;
            }

            self.node_store.add(*node.id(), node.address());
            self.search_store.add_probe(
                probe_ref.search,
                Some(probe_ref.index),
                *node.id(),
                node.address(),
                evict_after,
            );
        }

        let status = match self.search_store.get_mut(probe_ref.search) {
            Some(search) => (search.callback)(&response),
            None => return,
        };

        match status {
            SearchStatus::Continue => self.search_step(probe_ref.search, now),
            SearchStatus::Terminate => {
                self.attribute_reach(probe_ref.search, probe_ref.index, now);
                if let Some(search) = self.search_store.remove_search(probe_ref.search) {
                    debug!(target = ?search.target, "Search terminated by callback");
                }
            }
        }
    }

    /// One step of the search driver: charge expired probes, then put the
    /// next-closest candidate on the wire and rearm the timer.
    fn search_step(&mut self, search_id: SearchId, now: Instant) {
        let timed_out = match self.search_store.get_mut(search_id) {
            Some(search) => search.take_newly_timed_out(now),
            None => return,
        };
        for peer_id in &timed_out {
            self.node_store.mark_timeout(peer_id);
        }

        let (target, request_type) = match self.search_store.get(search_id) {
            Some(search) => (search.target, search.request_type),
            None => return,
        };
        let rearm_after = self.try_next_node_after();

        if let Some(sent) = self.search_store.next_probe(search_id, now) {
            trace!(?target, peer_id = ?sent.peer_id, "Probing next node");
            self.socket.request(
                sent.peer_address,
                sent.transaction_id,
                RequestSpecific {
                    requester_id: self.id,
                    request_type: request_type.to_request(target),
                },
            );

            if let Some(search) = self.search_store.get_mut(search_id) {
                search.next_probe_at = now + rearm_after;
            }
        } else {
            let in_flight = self
                .search_store
                .get(search_id)
                .map(|search| search.has_in_flight())
                .unwrap_or(false);

            if in_flight {
                // Out of candidates but replies may still land; check back
                // after they would have expired.
                if let Some(search) = self.search_store.get_mut(search_id) {
                    search.next_probe_at = now + rearm_after;
                }
            } else {
                self.conclude_search(search_id, now);
            }
        }
    }

    /// A search ran dry: credit the chain that got the furthest, then
    /// release everything the search held.
    fn conclude_search(&mut self, search_id: SearchId, now: Instant) {
        let leaf = self
            .search_store
            .get(search_id)
            .and_then(|search| search.last_replied);

        if let Some(leaf) = leaf {
            self.attribute_reach(search_id, leaf, now);
        }

        if let Some(search) = self.search_store.remove_search(search_id) {
            debug!(target = ?search.target, probes = search.probes().len(), "Search concluded");
        }
    }

    /// Trace-back attribution: walk from `leaf` up to the root seed and
    /// bump each parent's reach by how much progress its referral made,
    /// discounted by how slowly it replied.
    ///
    /// The leaf itself is paired with a synthetic child sitting at the
    /// target, so the hop that produced the final answer is credited with
    /// the full remaining distance.
    fn attribute_reach(&mut self, search_id: SearchId, leaf: usize, now: Instant) {
        let Some(search) = self.search_store.get(search_id) else {
            return;
        };

        let target_prefix = search.target.prefix();
        let mut child_prefix = target_prefix;
        let mut credits = Vec::new();

        for index in search.back_trace(leaf) {
            let probe = search.probe(index);
            let (Some(sent_at), Some(replied_at)) = (probe.sent_at, probe.replied_at) else {
                child_prefix = probe.peer_id.prefix();
                continue;
            };

            let response_time = replied_at
                .duration_since(sent_at)
                .as_millis()
                .min(u32::MAX as u128) as u32;
            let progress =
                calculate_distance(probe.peer_id.prefix(), target_prefix, child_prefix);

            credits.push((probe.peer_id, response_time, progress));
            child_prefix = probe.peer_id.prefix();
        }

        for (peer_id, response_time, progress) in credits {
            let ratio = calculate_response_time_ratio(&mut self.gmrt, now, response_time);

            if progress == 0 {
                // The peer referred us away from the target; its standing
                // is forfeit.
                self.node_store.zero_reach(&peer_id);
            } else {
                let bump =
                    ((progress as u64 * (u32::MAX - ratio) as u64) / u32::MAX as u64) as u32;
                trace!(?peer_id, progress, response_time, bump, "Crediting reach");
                self.node_store.mark_replied(&peer_id, bump);
            }
        }
    }

    /// Self-training: search for a random id, but only when this router
    /// would itself be the best handler it knows for it. Tapers off as the
    /// store accumulates proven peers.
    fn local_maintenance_search(&mut self, now: Instant) {
        let target = Id::random();

        if self.node_store.is_self_winner(&target) {
            debug!(?target, "Starting local maintenance search");
            let _ = self.begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                now,
            );
        }
    }

    /// Re-issue the oldest recently served target ourselves, giving
    /// unproven peers a chance to participate and earn reach.
    fn global_maintenance_search(&mut self, now: Instant) {
        if let Some((target, ())) = self.served_targets.pop_lru() {
            debug!(?target, "Re-issuing recently served search");
            let _ = self.begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                now,
            );
        }
    }

    /// Sent probes are written off after twice the global mean response
    /// time, bounded by the configured cap.
    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(2 * self.gmrt.average() as u64).min(self.config.search_timeout)
    }

    /// How long to wait for a reply before widening the fan-out by one.
    fn try_next_node_after(&self) -> Duration {
        self.probe_timeout()
    }
}

/// How far along toward the target a referral got us, in 32-bit prefix
/// space.
///
/// A child farther from the target than the node that named it is a
/// backpedal and earns 0. A child past the target earns the covered
/// distance minus the overshoot. A child between node and target earns
/// the full node-to-child distance.
fn calculate_distance(node_prefix: u32, target_prefix: u32, child_prefix: u32) -> u32 {
    // Distance between the node and the target.
    let at = node_prefix ^ target_prefix;

    // Distance between the child and the target.
    let bt = child_prefix ^ target_prefix;

    if bt > at {
        return 0;
    }

    // Distance between the node and the child.
    let ab = node_prefix ^ child_prefix;

    if at < ab {
        return ab - bt;
    }

    ab
}

/// Where `response_time` sits relative to the global mean: 0 for instant,
/// half of u32::MAX at the mean, saturated at twice the mean or worse.
///
/// Updates the rolling mean as a side effect; call exactly once per
/// measured response time.
fn calculate_response_time_ratio(gmrt: &mut Gmrt, now: Instant, response_time: u32) -> u32 {
    let mean = gmrt.update(now, response_time);
    if mean == 0 {
        return 0;
    }

    if response_time as u64 > 2 * mean as u64 {
        u32::MAX
    } else {
        ((u32::MAX / 2 / mean) as u64 * response_time as u64).min(u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id_with_first_byte(byte: u8) -> Id {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        Id(bytes)
    }

    fn test_router(self_byte: u8) -> Router {
        Router::new(Config::default())
            .unwrap()
            .with_id(id_with_first_byte(self_byte))
    }

    fn nodes_reply(responder_id: Id, transaction_id: u16, nodes: Vec<Node>) -> Message {
        Message {
            transaction_id,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Nodes(
                NodesResponseArguments { responder_id, nodes },
            )),
        }
    }

    // === calculate_distance ===

    #[test]
    fn distance_zero_on_backpedal() {
        // Child is farther from the target than the node itself.
        assert_eq!(calculate_distance(0x1000, 0, 0x2000), 0);
    }

    #[test]
    fn distance_between_node_and_target() {
        // at = 0x1100, bt = 0x0100, ab = 0x1000 <= at.
        assert_eq!(calculate_distance(0x1100, 0, 0x0100), 0x1000);
    }

    #[test]
    fn distance_discounts_overshoot() {
        // at = 0x80, bt = 0x40 <= at, ab = 0xC0 > at.
        assert_eq!(calculate_distance(0x0100, 0x0180, 0x01C0), 0xC0 - 0x40);
    }

    #[test]
    fn distance_is_zero_only_for_backpedals() {
        for (node, target, child) in [
            (0x8000u32, 0x0010u32, 0x0818u32),
            (0xfff0, 0x000f, 0x0f0f),
            (0x4000, 0x4fff, 0x4321),
        ] {
            let at = node ^ target;
            let bt = child ^ target;
            let distance = calculate_distance(node, target, child);

            if bt > at {
                assert_eq!(distance, 0);
            } else {
                assert!(distance > 0);
            }
        }
    }

    // === calculate_response_time_ratio ===

    #[test]
    fn ratio_is_zero_for_instant_replies() {
        let mut gmrt = Gmrt::new(256);
        gmrt.update(Instant::now(), 100);

        assert_eq!(calculate_response_time_ratio(&mut gmrt, Instant::now(), 0), 0);
    }

    #[test]
    fn ratio_is_about_half_at_the_mean() {
        let mut gmrt = Gmrt::new(256);
        let now = Instant::now();
        gmrt.update(now, 100);

        // A 100ms reply keeps the mean at 100ms.
        let ratio = calculate_response_time_ratio(&mut gmrt, now, 100);

        let half = u32::MAX / 2;
        assert!(half - ratio < 100);
    }

    #[test]
    fn ratio_saturates_past_twice_the_mean() {
        let mut gmrt = Gmrt::new(256);
        let now = Instant::now();
        for _ in 0..8 {
            gmrt.update(now, 100);
        }

        let ratio = calculate_response_time_ratio(&mut gmrt, now, 1000);

        assert_eq!(ratio, u32::MAX);
    }

    #[test]
    fn ratio_is_non_decreasing_in_response_time() {
        let mut previous = 0;

        for response_time in [0u32, 10, 50, 100, 150, 200, 500, 5000] {
            let mut gmrt = Gmrt::new(256);
            let now = Instant::now();
            for _ in 0..64 {
                gmrt.update(now, 100);
            }

            let ratio = calculate_response_time_ratio(&mut gmrt, now, response_time);
            assert!(ratio >= previous);
            previous = ratio;
        }
    }

    // === end-to-end scenarios ===

    #[test]
    fn search_with_empty_store_fails() {
        let mut router = test_router(0);

        let result = router.begin_search(
            RequestType::FindNode,
            id_with_first_byte(0x01),
            Box::new(|_| SearchStatus::Continue),
        );

        assert!(matches!(result, Err(Error::NoReachableNodes)));
    }

    #[test]
    fn begin_search_probes_the_best_seed() {
        let mut peer = RpcSocket::new(None).unwrap();
        let peer_id = id_with_first_byte(0x80);

        let mut router = test_router(0);
        router.add_node(peer_id, peer.local_addr());
        router.node_store.mark_replied(&peer_id, 1000);

        let target = id_with_first_byte(0xc0);
        router
            .begin_search(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
            )
            .unwrap();

        let (message, _) = loop {
            if let Some(received) = peer.recv_from() {
                break received;
            }
        };

        assert_eq!(
            message.message_type,
            MessageType::Request(RequestSpecific {
                requester_id: router.id(),
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            })
        );
        assert!(router
            .search_store
            .lookup_by_tid(message.transaction_id)
            .is_some());
    }

    #[test]
    fn reply_fans_out_to_the_closest_announced_node() {
        let mut peer = RpcSocket::new(None).unwrap();
        let peer_id = id_with_first_byte(0x80);

        let mut router = test_router(0);
        router.add_node(peer_id, peer.local_addr());
        router.node_store.mark_replied(&peer_id, 1000);

        let target = id_with_first_byte(0xc0);
        let now = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                now,
            )
            .unwrap();

        let (request, _) = loop {
            if let Some(received) = peer.recv_from() {
                break received;
            }
        };

        let near = Node::new(id_with_first_byte(0xe0), "127.0.0.1:2001".parse().unwrap());
        let far = Node::new(id_with_first_byte(0xa0), "127.0.0.1:2002".parse().unwrap());
        let reply = nodes_reply(peer_id, request.transaction_id, vec![far.clone(), near.clone()]);

        router.handle_message(reply, peer.local_addr(), now + Duration::from_millis(40));

        let search = router.search_store.get(0).unwrap();
        let probe_of = |id: &Id| {
            search
                .probes()
                .iter()
                .find(|probe| probe.peer_id == *id)
                .unwrap()
        };

        // 0xe0 xor 0xc0 = 0x20 beats 0xa0 xor 0xc0 = 0x60, so 0xe0 went
        // out first and 0xa0 stays queued.
        assert!(probe_of(near.id()).sent_at.is_some());
        assert!(probe_of(far.id()).sent_at.is_none());

        // Both referrals are now known nodes.
        assert!(router.node_store.get(near.id()).is_some());
        assert!(router.node_store.get(far.id()).is_some());
    }

    #[test]
    fn timer_fire_charges_timeouts_and_probes_next_seed() {
        let mut first_peer = RpcSocket::new(None).unwrap();
        let second_peer = RpcSocket::new(None).unwrap();

        let first_id = id_with_first_byte(0xc8);
        let second_id = id_with_first_byte(0x90);

        let mut router = test_router(0);
        router.add_node(first_id, first_peer.local_addr());
        router.add_node(second_id, second_peer.local_addr());
        router.node_store.mark_replied(&first_id, 1000);
        router.node_store.mark_replied(&second_id, 500);

        let target = id_with_first_byte(0xc0);
        let start = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                start,
            )
            .unwrap();

        // Closest seed went out first.
        let (request, _) = loop {
            if let Some(received) = first_peer.recv_from() {
                break received;
            }
        };
        assert!(matches!(request.message_type, MessageType::Request(_)));

        // GMRT was seeded at 100ms, so the probe expires at start+200ms;
        // no reply by start+210ms fires the timer.
        router.tick_at(start + Duration::from_millis(210));

        assert_eq!(
            router
                .node_store
                .get(&first_id)
                .unwrap()
                .consecutive_timeouts,
            1
        );
        assert_eq!(router.node_store.get(&first_id).unwrap().reach(), 0);

        let search = router.search_store.get(0).unwrap();
        let second_probe = search
            .probes()
            .iter()
            .find(|probe| probe.peer_id == second_id)
            .unwrap();
        assert!(second_probe.sent_at.is_some());
    }

    #[test]
    fn query_is_answered_with_closer_nodes_only() {
        let mut asker = RpcSocket::new(None).unwrap();
        let asker_id = id_with_first_byte(0x77);

        // Router at 0x40; target at 0x00 puts the router at distance 0x40.
        let mut router = test_router(0x40);
        let target = id_with_first_byte(0);

        let closer_a = id_with_first_byte(0x08);
        let closer_b = id_with_first_byte(0x20);
        let farther = id_with_first_byte(0x90);
        for id in [closer_a, closer_b, farther] {
            router.add_node(id, "127.0.0.1:3000".parse().unwrap());
            router.node_store.mark_replied(&id, 100);
        }

        let query = Message {
            transaction_id: 21,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: asker_id,
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            }),
        };

        router.handle_message(query, asker.local_addr(), Instant::now());

        let (reply, _) = loop {
            if let Some(received) = asker.recv_from() {
                break received;
            }
        };

        let arguments = match reply.message_type {
            MessageType::Response(ResponseSpecific::Nodes(arguments)) => arguments,
            other => panic!("expected nodes response, got {:?}", other),
        };

        assert_eq!(reply.transaction_id, 21);
        assert_eq!(arguments.responder_id, router.id());

        let self_distance = router.id().xor(&target);
        assert!(!arguments.nodes.is_empty());
        for node in &arguments.nodes {
            assert!(node.id().xor(&target) < self_distance);
        }
        assert!(!arguments.nodes.iter().any(|node| *node.id() == farther));

        // The asker itself became a known node.
        assert!(router.node_store.get(&asker_id).is_some());
    }

    #[test]
    fn query_reply_matches_closest_k_in_order() {
        let mut asker = RpcSocket::new(None).unwrap();

        let mut router = test_router(0xff);
        let target = id_with_first_byte(0);

        for i in 1..32u8 {
            let id = id_with_first_byte(i);
            router.add_node(id, "127.0.0.1:4000".parse().unwrap());
            router.node_store.mark_replied(&id, (i as u32) * 13);
        }

        let expected: Vec<Id> = router
            .node_store
            .closest_k(&target, router.config.return_size)
            .iter()
            .map(|node| *node.id())
            .collect();

        let query = Message {
            transaction_id: 5,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                    info_hash: target,
                }),
            }),
        };
        router.handle_message(query, asker.local_addr(), Instant::now());

        let (reply, _) = loop {
            if let Some(received) = asker.recv_from() {
                break received;
            }
        };

        let arguments = match reply.message_type {
            MessageType::Response(ResponseSpecific::Nodes(arguments)) => arguments,
            other => panic!("expected nodes response, got {:?}", other),
        };

        let replied: Vec<Id> = arguments.nodes.iter().map(|node| *node.id()).collect();
        assert_eq!(replied, expected);
    }

    #[test]
    fn reply_records_become_nodes_and_probes() {
        let mut peer = RpcSocket::new(None).unwrap();
        let peer_id = id_with_first_byte(0x80);

        let mut router = test_router(0);
        router.add_node(peer_id, peer.local_addr());
        router.node_store.mark_replied(&peer_id, 1000);

        let now = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                id_with_first_byte(0xc0),
                Box::new(|_| SearchStatus::Continue),
                now,
            )
            .unwrap();

        let (request, _) = loop {
            if let Some(received) = peer.recv_from() {
                break received;
            }
        };

        let announced: Vec<Node> = (0..5)
            .map(|i| {
                Node::new(
                    id_with_first_byte(0xc1 + i),
                    format!("127.0.0.1:{}", 5000 + i as u16).parse().unwrap(),
                )
            })
            .collect();

        let nodes_before = router.node_store.len();
        let reply = nodes_reply(peer_id, request.transaction_id, announced.clone());
        router.handle_message(reply, peer.local_addr(), now + Duration::from_millis(10));

        assert_eq!(router.node_store.len(), nodes_before + announced.len());

        let search = router.search_store.get(0).unwrap();
        for node in &announced {
            assert!(search
                .probes()
                .iter()
                .any(|probe| probe.peer_id == *node.id()
                    && probe.parent == Some(0)));
        }
    }

    #[test]
    fn terminate_attributes_reach_along_the_chain() {
        let mut first_hop = RpcSocket::new(None).unwrap();
        let mut second_hop = RpcSocket::new(None).unwrap();

        // Target 0x00..; the first hop at 0xf0 refers us to 0x30, which
        // lies between it and the target.
        let first_id = id_with_first_byte(0xf0);
        let second_id = id_with_first_byte(0x30);

        let mut router = test_router(0xff);
        router.add_node(first_id, first_hop.local_addr());
        router.node_store.mark_replied(&first_id, 10);

        let target = id_with_first_byte(0);
        let start = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                start,
            )
            .unwrap();

        let (first_request, _) = loop {
            if let Some(received) = first_hop.recv_from() {
                break received;
            }
        };

        let reply = nodes_reply(
            first_id,
            first_request.transaction_id,
            vec![Node::new(second_id, second_hop.local_addr())],
        );
        router.handle_message(reply, first_hop.local_addr(), start + Duration::from_millis(50));

        let (second_request, _) = loop {
            if let Some(received) = second_hop.recv_from() {
                break received;
            }
        };

        // The second hop's answer satisfies the consumer.
        if let Some(search) = router.search_store.get_mut(0) {
            search.callback = Box::new(|_| SearchStatus::Terminate);
        }
        let reply = nodes_reply(second_id, second_request.transaction_id, vec![]);
        router.handle_message(
            reply,
            second_hop.local_addr(),
            start + Duration::from_millis(90),
        );

        // Both hops earned reach beyond the baseline, and the search is gone.
        assert!(router.node_store.get(&first_id).unwrap().reach() > 10);
        assert!(router.node_store.get(&second_id).unwrap().reach() > 0);
        assert_eq!(router.search_store.len(), 0);
    }

    #[test]
    fn backpedal_referral_forfeits_reach_on_termination() {
        let mut first_hop = RpcSocket::new(None).unwrap();
        let mut second_hop = RpcSocket::new(None).unwrap();

        // The first hop at 0x10 refers us to 0x70: farther from the
        // target than itself.
        let first_id = id_with_first_byte(0x10);
        let second_id = id_with_first_byte(0x70);

        let mut router = test_router(0xff);
        router.add_node(first_id, first_hop.local_addr());
        router.node_store.mark_replied(&first_id, 5000);

        let target = id_with_first_byte(0);
        let start = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                target,
                Box::new(|_| SearchStatus::Continue),
                start,
            )
            .unwrap();

        let (first_request, _) = loop {
            if let Some(received) = first_hop.recv_from() {
                break received;
            }
        };

        let reply = nodes_reply(
            first_id,
            first_request.transaction_id,
            vec![Node::new(second_id, second_hop.local_addr())],
        );
        router.handle_message(reply, first_hop.local_addr(), start + Duration::from_millis(20));

        let (second_request, _) = loop {
            if let Some(received) = second_hop.recv_from() {
                break received;
            }
        };

        if let Some(search) = router.search_store.get_mut(0) {
            search.callback = Box::new(|_| SearchStatus::Terminate);
        }
        let reply = nodes_reply(second_id, second_request.transaction_id, vec![]);
        router.handle_message(
            reply,
            second_hop.local_addr(),
            start + Duration::from_millis(60),
        );

        assert_eq!(router.node_store.get(&first_id).unwrap().reach(), 0);
    }

    #[test]
    fn late_replies_drop_after_termination() {
        let mut peer = RpcSocket::new(None).unwrap();
        let peer_id = id_with_first_byte(0x80);

        let mut router = test_router(0);
        router.add_node(peer_id, peer.local_addr());
        router.node_store.mark_replied(&peer_id, 1000);

        let now = Instant::now();
        router
            .begin_search_at(
                RequestType::FindNode,
                id_with_first_byte(0xc0),
                Box::new(|_| SearchStatus::Terminate),
                now,
            )
            .unwrap();

        let (request, _) = loop {
            if let Some(received) = peer.recv_from() {
                break received;
            }
        };

        let reply = nodes_reply(peer_id, request.transaction_id, vec![]);
        router.handle_message(reply.clone(), peer.local_addr(), now + Duration::from_millis(10));

        assert_eq!(router.search_store.len(), 0);
        assert!(router
            .search_store
            .lookup_by_tid(request.transaction_id)
            .is_none());

        // Replaying the reply resolves nothing and changes nothing.
        let reach_before = router.node_store.get(&peer_id).unwrap().reach();
        router.handle_message(reply, peer.local_addr(), now + Duration::from_millis(20));
        assert_eq!(router.node_store.get(&peer_id).unwrap().reach(), reach_before);
    }

    #[test]
    fn served_targets_feed_the_global_maintenance_search() {
        let mut asker = RpcSocket::new(None).unwrap();

        let mut router = test_router(0xff);
        let target = id_with_first_byte(0x05);

        let helper = id_with_first_byte(0x09);
        router.add_node(helper, "127.0.0.1:6000".parse().unwrap());
        router.node_store.mark_replied(&helper, 50);

        let query = Message {
            transaction_id: 9,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
            }),
        };
        router.handle_message(query, asker.local_addr(), Instant::now());
        let _ = asker.recv_from();

        assert_eq!(router.search_store.len(), 0);
        let now = Instant::now();
        router.global_maintenance_search(now);

        // The served target was re-issued as our own search.
        assert_eq!(router.search_store.len(), 1);
    }
}
