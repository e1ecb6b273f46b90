//! S/Kademlia peer protocol: handshake, liveness, and disjoint lookups.
//!
//! A [`Protocol`] owns the routing table and the peer registry and drives
//! every per-session interaction:
//!
//! - **Handshake** ([`Protocol::handshake`]): serve loop registration, an
//!   authenticating ping, address reconciliation, registry and table
//!   admission, then error interceptors and a receive hook that keeps the
//!   peer's bucket position fresh. Completion emits
//!   [`SIGNAL_HANDSHAKE_COMPLETE`] on the session.
//! - **Admission** ([`Protocol::update`]): when a bucket is full the
//!   least-recently-seen occupant is probed; only a dead or lying occupant
//!   is evicted to admit the newcomer, otherwise the newcomer is rejected
//!   with [`ProtocolError::BucketRejected`].
//! - **Discovery** ([`Protocol::find_node`]): `d` disjoint frontiers with a
//!   shared visited set, each running `alpha` concurrent Lookup RPCs. The
//!   shared dedup is what makes the paths disjoint: no two frontiers query
//!   the same node, so an adversary must subvert every path at once.
//!
//! `Protocol` is a cheap-to-clone handle; clones share one table and
//! registry. Session hooks hold only weak references back into the shared
//! state, so sessions never keep a dead protocol alive. No lock is ever
//! held across I/O; buckets, registry, and lookup state each have their own
//! narrow mutex.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::identity::{
    prefix_diff, verify_puzzle, Checksum, Keypair, NodeId, DEFAULT_C1, DEFAULT_C2,
};
use crate::table::{BucketFull, RoutingTable, DEFAULT_BUCKET_SIZE};
use crate::transport::{Session, SessionEvents, Transport};
use crate::wire::{marshal_id, marshal_ids, unmarshal_id, unmarshal_ids, OP_LOOKUP, OP_PING};

/// Bits of checksum prefix compared by the similarity gate.
pub const DEFAULT_PREFIX_DIFF_LEN: usize = 128;

/// Minimum differing bits required within the compared prefix.
pub const DEFAULT_PREFIX_DIFF_MIN: usize = 32;

/// Concurrent Lookup RPCs per disjoint path.
pub const DEFAULT_ALPHA: usize = 3;

/// Disjoint paths explored by an iterative FindNode.
pub const DEFAULT_DISJOINT_PATHS: usize = 8;

/// Default deadline for the handshake ping and the LRU probe.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default deadline for a single Lookup RPC.
pub const DEFAULT_FIND_NODE_TIMEOUT: Duration = Duration::from_secs(3);

/// Latched session signal emitted once registration succeeds.
pub const SIGNAL_HANDSHAKE_COMPLETE: &str = "skademlia.handshake";

struct LookupState {
    visited: HashSet<Checksum>,
    results: Vec<NodeId>,
}

struct Inner {
    table: RoutingTable,
    keys: Keypair,
    c1: usize,
    c2: usize,
    prefix_diff_len: usize,
    prefix_diff_min: usize,
    handshake_timeout: Duration,
    find_node_timeout: Duration,
    peers: Mutex<HashMap<Checksum, Arc<Session>>>,
}

/// The membership core of one overlay node. Cheap to clone; all clones
/// share the same routing table and peer registry.
#[derive(Clone)]
pub struct Protocol {
    inner: Arc<Inner>,
}

impl Protocol {
    /// Build a protocol around puzzle-solved keys and the address remote
    /// peers should reach us at.
    pub fn new(keys: Keypair, external_address: impl Into<String>) -> Self {
        let self_id = keys.id(external_address);
        Self {
            inner: Arc::new(Inner {
                table: RoutingTable::new(self_id, DEFAULT_BUCKET_SIZE),
                keys,
                c1: DEFAULT_C1,
                c2: DEFAULT_C2,
                prefix_diff_len: DEFAULT_PREFIX_DIFF_LEN,
                prefix_diff_min: DEFAULT_PREFIX_DIFF_MIN,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
                find_node_timeout: DEFAULT_FIND_NODE_TIMEOUT,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn configure(&mut self) -> &mut Inner {
        Arc::get_mut(&mut self.inner).expect("configure the protocol before cloning or serving it")
    }

    pub fn with_c1(mut self, c1: usize) -> Self {
        self.configure().c1 = c1;
        self
    }

    pub fn with_c2(mut self, c2: usize) -> Self {
        self.configure().c2 = c2;
        self
    }

    pub fn with_prefix_diff_len(mut self, bits: usize) -> Self {
        self.configure().prefix_diff_len = bits;
        self
    }

    pub fn with_prefix_diff_min(mut self, bits: usize) -> Self {
        self.configure().prefix_diff_min = bits;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.configure().handshake_timeout = timeout;
        self
    }

    pub fn with_find_node_timeout(mut self, timeout: Duration) -> Self {
        self.configure().find_node_timeout = timeout;
        self
    }

    pub fn with_bucket_size(mut self, k: usize) -> Self {
        let inner = self.configure();
        inner.table = RoutingTable::new(inner.table.self_id().clone(), k);
        self
    }

    pub fn self_id(&self) -> &NodeId {
        self.inner.table.self_id()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.inner.table
    }

    pub fn keys(&self) -> &Keypair {
        &self.inner.keys
    }

    /// Number of sessions currently registered by checksum.
    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().expect("peer registry poisoned").len()
    }

    /// Whether a registered session exists for `checksum`.
    pub fn has_peer(&self, checksum: &Checksum) -> bool {
        self.inner
            .peers
            .lock()
            .expect("peer registry poisoned")
            .contains_key(checksum)
    }

    /// Accept-pump: run one handshake per incoming session until the
    /// transport's event stream closes. Failed handshakes disconnect the
    /// session with the wrapped cause.
    pub fn serve(
        &self,
        net: Arc<dyn Transport>,
        mut incoming: SessionEvents,
    ) -> tokio::task::JoinHandle<()> {
        let protocol = self.clone();
        tokio::spawn(async move {
            while let Some(session) = incoming.recv().await {
                let protocol = protocol.clone();
                let net = net.clone();
                tokio::spawn(async move {
                    match protocol.handshake(&net, &session).await {
                        Ok(id) => debug!(peer = %id, "handshake complete"),
                        Err(err) => {
                            debug!(
                                addr = %session.remote_addr(),
                                error = %err,
                                "handshake failed"
                            );
                            session.disconnect(Some(err));
                        }
                    }
                });
            }
        })
    }

    /// Authenticate and register the peer on `session`.
    ///
    /// Runs once per session (the serve loop is claimed on first entry).
    /// On success the peer is in the registry and, unless its bucket was
    /// full of live peers, in the routing table.
    pub async fn handshake(
        &self,
        net: &Arc<dyn Transport>,
        session: &Arc<Session>,
    ) -> Result<NodeId, ProtocolError> {
        let signal = session.register_signal(SIGNAL_HANDSHAKE_COMPLETE);
        self.spawn_server_loop(session);

        let id = self.ping(session).await?;

        let already_registered = {
            self.inner
                .peers
                .lock()
                .expect("peer registry poisoned")
                .contains_key(id.checksum())
        };

        // The peer dialed us from an ephemeral endpoint: prove the address
        // it advertises actually accepts connections before trusting it.
        if !already_registered && session.remote_addr() != id.address() {
            match self.peer_by_id(net, &id).await {
                None => return Err(ProtocolError::Timeout("reachability dial")),
                Some(reachable) => {
                    if !Arc::ptr_eq(&reachable, session) {
                        reachable.disconnect(None);
                    }
                }
            }
        }

        self.inner
            .peers
            .lock()
            .expect("peer registry poisoned")
            .insert(*id.checksum(), session.clone());

        if let Err(err) = self.update(&id).await {
            // Interceptors are not installed yet; compensate by hand.
            self.deregister(id.checksum(), session);
            return Err(err);
        }

        self.install_session_hooks(session, &id);

        signal.emit();
        info!(peer = %id, "registered s/kademlia peer");
        Ok(id)
    }

    /// Liveness probe: returns the peer's validated identity.
    ///
    /// Validates both puzzles and the prefix-diff gate; any failure is a
    /// hard error that the caller turns into a disconnect.
    pub async fn ping(&self, session: &Arc<Session>) -> Result<NodeId, ProtocolError> {
        let mut mux = session.mux();
        mux.send(OP_PING, Vec::new()).await?;

        let cancelled = session.cancellation();
        let buf = tokio::select! {
            _ = cancelled.cancelled() => return Err(ProtocolError::Disconnect),
            _ = sleep(self.inner.handshake_timeout) => return Err(ProtocolError::Timeout("pong")),
            frame = mux.recv(OP_PING) => frame.ok_or(ProtocolError::Disconnect)?,
        };

        let id = unmarshal_id(&buf)?;
        verify_puzzle(id.checksum(), id.nonce(), self.inner.c1, self.inner.c2)?;

        let got = prefix_diff(
            self.self_id().checksum(),
            id.checksum(),
            self.inner.prefix_diff_len,
        );
        if got < self.inner.prefix_diff_min {
            return Err(ProtocolError::PrefixTooSimilar {
                got,
                min: self.inner.prefix_diff_min,
            });
        }

        Ok(id)
    }

    /// Single find-node RPC: ask the peer for its closest IDs to `target`.
    pub async fn lookup(
        &self,
        session: &Arc<Session>,
        target: &NodeId,
    ) -> Result<Vec<NodeId>, ProtocolError> {
        let mut mux = session.mux();
        mux.send(OP_LOOKUP, marshal_id(target)).await?;

        let cancelled = session.cancellation();
        let buf = tokio::select! {
            _ = cancelled.cancelled() => return Err(ProtocolError::Disconnect),
            _ = sleep(self.inner.find_node_timeout) => {
                return Err(ProtocolError::Timeout("lookup response"))
            }
            frame = mux.recv(OP_LOOKUP) => frame.ok_or(ProtocolError::Disconnect)?,
        };

        let ids = unmarshal_ids(&buf)?;
        if ids.len() > self.inner.table.bucket_size() {
            return Err(ProtocolError::Decode(format!(
                "lookup returned {} ids, bucket size is {}",
                ids.len(),
                self.inner.table.bucket_size()
            )));
        }
        Ok(ids)
    }

    /// Admit `id` into the routing table, probing the least-recently-seen
    /// bucket occupant when the bucket is full.
    ///
    /// Stale occupants (no registered session, a failed probe, or a probe
    /// answered with the wrong identity) are evicted and admission retried.
    /// A bucket full of live, truthful peers rejects the newcomer.
    pub async fn update(&self, id: &NodeId) -> Result<(), ProtocolError> {
        loop {
            match self.inner.table.update(id.clone()) {
                Ok(()) => return Ok(()),
                Err(BucketFull) => {}
            }

            let Some(last) = self.inner.table.last_seen_in_bucket_of(id) else {
                // Raced with a concurrent eviction; the bucket has room now.
                continue;
            };

            let probe_session = {
                self.inner
                    .peers
                    .lock()
                    .expect("peer registry poisoned")
                    .get(last.checksum())
                    .cloned()
            };
            let Some(probe_session) = probe_session else {
                self.inner.table.delete(&last);
                continue;
            };

            match self.ping(&probe_session).await {
                Err(_) => {
                    probe_session
                        .disconnect(Some(ProtocolError::Timeout("bucket occupant probe")));
                    continue;
                }
                Ok(probed) => {
                    if probed.checksum() != last.checksum()
                        || probed.nonce() != last.nonce()
                        || probed.address() != last.address()
                    {
                        probe_session.disconnect(Some(ProtocolError::Timeout(
                            "bucket occupant identity mismatch",
                        )));
                        continue;
                    }
                    debug!(
                        peer = %id,
                        occupant = %last,
                        "bucket full of live peers, rejecting newcomer"
                    );
                    return Err(ProtocolError::BucketRejected);
                }
            }
        }
    }

    /// Resolve an ID to a session: registry first, then any session the
    /// transport already has to the advertised address, then a fresh dial.
    /// A failed dial evicts the ID.
    pub async fn peer_by_id(
        &self,
        net: &Arc<dyn Transport>,
        id: &NodeId,
    ) -> Option<Arc<Session>> {
        let recorded = {
            self.inner
                .peers
                .lock()
                .expect("peer registry poisoned")
                .get(id.checksum())
                .cloned()
        };
        if let Some(session) = recorded {
            return Some(session);
        }

        if let Some(session) = net.session_to(id.address()) {
            return Some(session);
        }

        match net.dial(id.address()).await {
            Ok(session) => Some(session),
            Err(err) => {
                debug!(peer = %id, error = %err, "dial failed");
                self.evict(id);
                None
            }
        }
    }

    /// Sessions to the closest known peers, dialing where necessary.
    pub async fn peers(&self, net: &Arc<dyn Transport>) -> Vec<Arc<Session>> {
        let ids = self
            .inner
            .table
            .find_closest(self.self_id(), self.inner.table.bucket_size());
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.peer_by_id(net, &id).await {
                sessions.push(session);
            }
        }
        sessions
    }

    /// Iterative find-node over `disjoint_paths` independent frontiers.
    ///
    /// The visited set is shared across every path so no node is queried
    /// twice, while each path expands only through its own frontier.
    /// Returns up to `k` IDs sorted by ascending XOR distance to `target`.
    pub async fn find_node(
        &self,
        net: &Arc<dyn Transport>,
        target: &NodeId,
        k: usize,
        alpha: usize,
        disjoint_paths: usize,
    ) -> Vec<NodeId> {
        let paths = disjoint_paths.max(1);
        let alpha = alpha.max(1);

        let state = Arc::new(Mutex::new(LookupState {
            visited: HashSet::new(),
            results: Vec::new(),
        }));
        let mut frontiers: Vec<VecDeque<NodeId>> = (0..paths).map(|_| VecDeque::new()).collect();
        {
            let mut state = state.lock().expect("lookup state poisoned");
            state.visited.insert(*self.self_id().checksum());
            state.visited.insert(*target.checksum());
            for (i, id) in self
                .inner
                .table
                .find_closest(target, k)
                .into_iter()
                .enumerate()
            {
                state.visited.insert(*id.checksum());
                state.results.push(id.clone());
                frontiers[i % paths].push_back(id);
            }
        }

        let mut groups = JoinSet::new();
        for frontier in frontiers {
            let protocol = self.clone();
            let net = net.clone();
            let target = target.clone();
            let state = state.clone();
            groups.spawn(async move {
                protocol
                    .run_lookup_path(net, target, frontier, alpha, state)
                    .await;
            });
        }
        while groups.join_next().await.is_some() {}

        let mut results = {
            let mut state = state.lock().expect("lookup state poisoned");
            std::mem::take(&mut state.results)
        };
        results.sort_unstable_by(|a, b| {
            a.distance_to(target.checksum())
                .cmp(&b.distance_to(target.checksum()))
        });
        results.truncate(k);
        results
    }

    /// One disjoint path: keep up to `alpha` Lookups in flight, feeding new
    /// IDs back into this path's private frontier. Finishes when the
    /// frontier is empty and nothing is in flight.
    async fn run_lookup_path(
        self,
        net: Arc<dyn Transport>,
        target: NodeId,
        mut frontier: VecDeque<NodeId>,
        alpha: usize,
        state: Arc<Mutex<LookupState>>,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.len() < alpha {
                let Some(id) = frontier.pop_front() else { break };
                let protocol = self.clone();
                let net = net.clone();
                let target = target.clone();
                in_flight.spawn(async move {
                    let session = protocol.peer_by_id(&net, &id).await?;
                    match protocol.lookup(&session, &target).await {
                        Ok(ids) => Some(ids),
                        Err(err) => {
                            session.disconnect(Some(err));
                            None
                        }
                    }
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let Ok(Some(ids)) = joined else { continue };

            let mut state = state.lock().expect("lookup state poisoned");
            for id in ids {
                if state.visited.insert(*id.checksum()) {
                    state.results.push(id.clone());
                    frontier.push_back(id);
                }
            }
        }
    }

    /// Populate the table by searching for ourselves.
    pub async fn bootstrap(&self, net: &Arc<dyn Transport>) -> Vec<NodeId> {
        let target = self.self_id().clone();
        self.find_node(
            net,
            &target,
            self.inner.table.bucket_size(),
            DEFAULT_ALPHA,
            DEFAULT_DISJOINT_PATHS,
        )
        .await
    }

    fn evict(&self, id: &NodeId) {
        warn!(peer = %id, "peer unreachable, evicting from routing table");
        self.inner.table.delete(id);
    }

    /// Drop the registry entry for `checksum`, but only while it still maps
    /// to `session`: a later handshake may have re-registered the peer over
    /// a fresh session, and its entry must survive this one's teardown.
    fn deregister(&self, checksum: &Checksum, session: &Arc<Session>) {
        let mut peers = self.inner.peers.lock().expect("peer registry poisoned");
        if let Some(current) = peers.get(checksum) {
            if Arc::ptr_eq(current, session) {
                peers.remove(checksum);
            }
        }
    }

    /// Answer inbound pings and lookups for the session's lifetime.
    fn spawn_server_loop(&self, session: &Arc<Session>) {
        let (Some(mut pings), Some(mut lookups)) = (
            session.recv_queue(OP_PING),
            session.recv_queue(OP_LOOKUP),
        ) else {
            // Another handshake already owns this session's loop.
            return;
        };

        let protocol = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let cancelled = session.cancellation();
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    request = pings.recv() => {
                        let Some(request) = request else { break };
                        let body = marshal_id(protocol.self_id());
                        if let Err(err) = request.reply(OP_PING, body).await {
                            session.disconnect(Some(err));
                            break;
                        }
                    }
                    request = lookups.recv() => {
                        let Some(request) = request else { break };
                        let target = match unmarshal_id(request.bytes()) {
                            Ok(target) => target,
                            Err(err) => {
                                session.disconnect(Some(err));
                                break;
                            }
                        };
                        let closest = protocol
                            .inner
                            .table
                            .find_closest(&target, protocol.inner.table.bucket_size());
                        if let Err(err) = request.reply(OP_LOOKUP, marshal_ids(&closest)).await {
                            session.disconnect(Some(err));
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Install the post-registration hooks: registry cleanup plus eviction
    /// on timeout-kind errors, and a bucket-position refresh per inbound
    /// frame. Hooks hold weak references only; the registry owns sessions,
    /// sessions never own the registry.
    fn install_session_hooks(&self, session: &Arc<Session>, id: &NodeId) {
        let state = Arc::downgrade(&self.inner);
        let weak_session = Arc::downgrade(session);
        let peer = id.clone();
        session.intercept_errors(Box::new(move |err| {
            let Some(inner) = state.upgrade() else {
                return;
            };
            let protocol = Protocol { inner };
            if let Some(session) = weak_session.upgrade() {
                protocol.deregister(peer.checksum(), &session);
            }
            if err.is_timeout() {
                protocol.evict(&peer);
            }
        }));

        let state = Arc::downgrade(&self.inner);
        let weak_session = Arc::downgrade(session);
        let peer = id.clone();
        session.after_recv(Box::new(move || {
            let Some(inner) = state.upgrade() else {
                return;
            };
            let Some(session) = weak_session.upgrade() else {
                return;
            };
            let protocol = Protocol { inner };
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(err) = protocol.update(&peer).await {
                    session.disconnect(Some(err));
                }
            });
        }));
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("self_id", self.self_id())
            .field("table_len", &self.inner.table.len())
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}
