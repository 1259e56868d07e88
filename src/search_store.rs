//! In-flight recursive searches: probe DAGs and transaction-id matching.
//!
//! Every outgoing request within a search is a [Probe] holding a link to
//! the probe whose reply suggested it. When a search terminates, walking
//! that chain backwards tells us exactly which peers moved us forward and
//! how fast, which is what feeds reach attribution.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::Instant;

use crate::common::Id;
use crate::router::{RequestType, SearchCallback};

pub(crate) type SearchId = u64;

/// Stable handle to one probe of one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProbeRef {
    pub search: SearchId,
    pub index: usize,
}

/// Everything the router needs to put a freshly dequeued probe on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SentProbe {
    pub index: usize,
    pub peer_id: Id,
    pub peer_address: SocketAddrV4,
    pub transaction_id: u16,
}

/// One outgoing request within a search.
#[derive(Debug)]
pub(crate) struct Probe {
    /// The probe whose reply suggested this peer; None for the initial
    /// seeds taken from the node store.
    pub parent: Option<usize>,
    pub peer_id: Id,
    pub peer_address: SocketAddrV4,
    pub transaction_id: Option<u16>,
    pub sent_at: Option<Instant>,
    pub replied_at: Option<Instant>,
    /// Deadline past which a sent, unreplied probe counts as timed out.
    pub evict_after: Instant,
    /// Whether the timeout was already charged to the peer.
    pub timed_out: bool,
}

impl Probe {
    fn unsent(&self) -> bool {
        self.sent_at.is_none()
    }

    fn in_flight(&self) -> bool {
        self.sent_at.is_some() && self.replied_at.is_none() && !self.timed_out
    }
}

/// One active recursive lookup.
pub(crate) struct Search {
    pub target: Id,
    pub request_type: RequestType,
    pub callback: SearchCallback,
    /// When the next-probe timer fires for this search.
    pub next_probe_at: Instant,
    /// The most recently replied probe; trace-back starts here.
    pub last_replied: Option<usize>,
    probes: Vec<Probe>,
}

impl Search {
    pub fn probe(&self, index: usize) -> &Probe {
        &self.probes[index]
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Sent probes still waiting for a reply within their deadline.
    pub fn has_in_flight(&self) -> bool {
        self.probes.iter().any(Probe::in_flight)
    }

    /// Charge every expired in-flight probe and return the affected peers.
    pub fn take_newly_timed_out(&mut self, now: Instant) -> Vec<Id> {
        let mut peers = Vec::new();

        for probe in self.probes.iter_mut() {
            if probe.in_flight() && probe.evict_after <= now {
                probe.timed_out = true;
                peers.push(probe.peer_id);
            }
        }

        peers
    }

    /// Probe indices from `leaf` up through its parents to a root seed.
    pub fn back_trace(&self, leaf: usize) -> Vec<usize> {
        let mut chain = vec![leaf];
        let mut current = leaf;

        while let Some(parent) = self.probes[current].parent {
            chain.push(parent);
            current = parent;
        }

        chain
    }
}

/// All live searches, plus the store-wide transaction-id registry used to
/// match replies back to probes.
pub(crate) struct SearchStore {
    searches: HashMap<SearchId, Search>,
    by_tid: HashMap<u16, ProbeRef>,
    next_search_id: SearchId,
    next_tid: u16,
}

impl SearchStore {
    pub fn new() -> Self {
        SearchStore {
            searches: HashMap::new(),
            by_tid: HashMap::new(),
            next_search_id: 0,
            next_tid: 0,
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn get(&self, search_id: SearchId) -> Option<&Search> {
        self.searches.get(&search_id)
    }

    pub fn get_mut(&mut self, search_id: SearchId) -> Option<&mut Search> {
        self.searches.get_mut(&search_id)
    }

    pub fn lookup_by_tid(&self, tid: u16) -> Option<ProbeRef> {
        self.by_tid.get(&tid).copied()
    }

    /// Searches whose next-probe timer has fired.
    pub fn due_searches(&self, now: Instant) -> Vec<SearchId> {
        let mut due: Vec<SearchId> = self
            .searches
            .iter()
            .filter(|(_, search)| search.next_probe_at <= now)
            .map(|(id, _)| *id)
            .collect();

        due.sort_unstable();
        due
    }

    // === Public Methods ===

    pub fn new_search(
        &mut self,
        target: Id,
        request_type: RequestType,
        callback: SearchCallback,
        now: Instant,
    ) -> SearchId {
        let search_id = self.next_search_id;
        self.next_search_id += 1;

        self.searches.insert(
            search_id,
            Search {
                target,
                request_type,
                callback,
                next_probe_at: now,
                last_replied: None,
                probes: Vec::new(),
            },
        );

        search_id
    }

    /// Enqueue a candidate probe.
    ///
    /// A peer already probed (or queued) in this search is deduplicated:
    /// whichever deadline evicts later wins, and only unsent probes may
    /// have their deadline and parent refreshed.
    pub fn add_probe(
        &mut self,
        search_id: SearchId,
        parent: Option<usize>,
        peer_id: Id,
        peer_address: SocketAddrV4,
        evict_after: Instant,
    ) {
        let Some(search) = self.searches.get_mut(&search_id) else {
            return;
        };

        if let Some(existing) = search.probes.iter_mut().find(|p| p.peer_id == peer_id) {
            if existing.unsent() && existing.evict_after < evict_after {
                existing.evict_after = evict_after;
                existing.parent = parent;
            }
            return;
        }

        search.probes.push(Probe {
            parent,
            peer_id,
            peer_address,
            transaction_id: None,
            sent_at: None,
            replied_at: None,
            evict_after,
            timed_out: false,
        });
    }

    /// Dequeue the unsent probe closest to the search target, give it a
    /// fresh transaction id, and stamp it sent.
    pub fn next_probe(&mut self, search_id: SearchId, now: Instant) -> Option<SentProbe> {
        let tid = self.fresh_tid();

        let search = self.searches.get_mut(&search_id)?;
        let target = search.target;

        let index = search
            .probes
            .iter()
            .enumerate()
            .filter(|(_, probe)| probe.unsent())
            .min_by_key(|(_, probe)| probe.peer_id.xor(&target))
            .map(|(index, _)| index)?;

        let probe = &mut search.probes[index];
        probe.transaction_id = Some(tid);
        probe.sent_at = Some(now);

        self.by_tid.insert(
            tid,
            ProbeRef {
                search: search_id,
                index,
            },
        );

        Some(SentProbe {
            index,
            peer_id: probe.peer_id,
            peer_address: probe.peer_address,
            transaction_id: tid,
        })
    }

    pub fn mark_replied(&mut self, probe_ref: ProbeRef, now: Instant) {
        if let Some(search) = self.searches.get_mut(&probe_ref.search) {
            search.probes[probe_ref.index].replied_at = Some(now);
            search.last_replied = Some(probe_ref.index);
        }
    }

    /// Release a search: its probes and every transaction-id registration
    /// they held go away together, so late replies no longer resolve.
    pub fn remove_search(&mut self, search_id: SearchId) -> Option<Search> {
        let search = self.searches.remove(&search_id)?;

        for probe in &search.probes {
            if let Some(tid) = probe.transaction_id {
                self.by_tid.remove(&tid);
            }
        }

        Some(search)
    }

    // === Private Methods ===

    /// Next unused transaction id. Wraps around; ids still held by live
    /// probes are skipped, and with 65536 ids to pick from this cannot
    /// spin for long.
    fn fresh_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);

            if !self.by_tid.contains_key(&tid) {
                return tid;
            }
        }
    }
}
