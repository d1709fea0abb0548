//! Path context
//!
//! The process-wide registry tying everything together: transit hops this
//! router relays for others, paths it owns itself, the transit admission
//! pipeline, and the per-message forwarding logic.
//!
//! Threading: [`handle_message`](PathContext::handle_message) is the link
//! layer's receive callback and may run on any thread; it only decodes the
//! type tag and posts work. Build-frame opening and status-record crypto
//! run on the worker pool. Every state transition happens on the logic
//! queue. The two maps (and the per-source limiter) are the only state
//! touched from more than one context and sit behind a single mutex;
//! the duplicate-hop check and hop insertion are atomic under it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use x25519_dalek::StaticSecret;

use crate::builder::Builder;
use crate::contact::{PathId, RouterContact, RouterId};
use crate::error::{Result, VeilError};
use crate::link::{LinkLayer, SendStatus};
use crate::messages::commit::CommitRecord;
use crate::messages::relay::{RelayDownstream, RelayUpstream};
use crate::messages::status::{status_to_string, StatusCode, StatusMessage};
use crate::messages::{BuildRequest, LinkMessage};
use crate::nodedb::NodeDb;
use crate::path::{Path, StatusOutcome};
use crate::routing::{self, RoutingHandler, RoutingMessage};
use crate::runtime::{Clock, Logic, WorkerPool};
use crate::transit::{TransitHop, TransitHopInfo};
use crate::SESSION_GRACE_MS;

/// Policy knobs for acting as a transit relay
#[derive(Clone)]
pub struct TransitConfig {
    /// Whether to accept transit at all on startup
    pub allow_transit: bool,
    /// Concurrent builds allowed per client source within the window
    pub per_source_build_limit: usize,
    /// Length of the per-source accounting window, milliseconds
    pub limit_window_ms: u64,
    /// Next-hop identities we refuse to forward builds to
    pub denied_next_hops: HashSet<RouterId>,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            allow_transit: false,
            per_source_build_limit: 8,
            limit_window_ms: 10_000,
            denied_next_hops: HashSet::new(),
        }
    }
}

/// Everything a path context needs injected
pub struct RouterParams {
    pub our_id: RouterId,
    pub enc_secret: StaticSecret,
    pub link: Arc<dyn LinkLayer>,
    pub nodedb: Arc<dyn NodeDb>,
    pub handler: Arc<dyn RoutingHandler>,
    pub clock: Arc<dyn Clock>,
    pub logic: Logic,
    pub workers: WorkerPool,
    pub transit: TransitConfig,
}

struct OwnedEntry {
    path: Weak<Mutex<Path>>,
    owner: Weak<Mutex<Builder>>,
}

#[derive(Debug, Clone, Copy)]
struct SourceWindow {
    count: usize,
    window_start: u64,
}

#[derive(Default)]
struct ContextInner {
    /// (neighbor, path id at that neighbor's side) → hop; every hop is
    /// registered twice, once per direction
    transit: HashMap<(RouterId, PathId), Arc<Mutex<TransitHop>>>,
    /// path id at our first hop → owning path; registered under both the
    /// rx and tx ids of hop 0
    owned: HashMap<PathId, OwnedEntry>,
    /// decaying per-source build accounting
    sources: HashMap<RouterId, SourceWindow>,
}

/// Process-wide path registry and relay engine
pub struct PathContext {
    our_id: RouterId,
    enc_secret: StaticSecret,
    link: Arc<dyn LinkLayer>,
    nodedb: Arc<dyn NodeDb>,
    handler: Arc<dyn RoutingHandler>,
    clock: Arc<dyn Clock>,
    logic: Logic,
    workers: WorkerPool,
    allow_transit: AtomicBool,
    config: TransitConfig,
    inner: Mutex<ContextInner>,
    /// Back-reference so queued closures can keep the context alive
    self_ref: Weak<PathContext>,
}

impl PathContext {
    pub fn new(params: RouterParams) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            our_id: params.our_id,
            enc_secret: params.enc_secret,
            link: params.link,
            nodedb: params.nodedb,
            handler: params.handler,
            clock: params.clock,
            logic: params.logic,
            workers: params.workers,
            allow_transit: AtomicBool::new(params.transit.allow_transit),
            config: params.transit,
            inner: Mutex::new(ContextInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("context outlives its own method call")
    }

    pub fn our_id(&self) -> RouterId {
        self.our_id
    }

    pub fn logic(&self) -> &Logic {
        &self.logic
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn nodedb(&self) -> &Arc<dyn NodeDb> {
        &self.nodedb
    }

    pub fn allow_transit(&self) {
        self.allow_transit.store(true, Ordering::Relaxed);
    }

    pub fn reject_transit(&self) {
        self.allow_transit.store(false, Ordering::Relaxed);
    }

    pub fn transit_allowed(&self) -> bool {
        self.allow_transit.load(Ordering::Relaxed)
    }

    /// Number of distinct transit paths currently carried
    pub fn transit_path_count(&self) -> usize {
        self.inner.lock().transit.len() / 2
    }

    // ===== Registry =====

    /// Whether a hop with either of this info's (neighbor, id) pairs is
    /// already live
    pub fn has_transit_hop(&self, info: &TransitHopInfo) -> bool {
        let inner = self.inner.lock();
        inner
            .transit
            .contains_key(&(info.downstream, info.rx_id))
            || inner.transit.contains_key(&(info.upstream, info.tx_id))
    }

    /// Atomically check-and-register a hop under both of its keys.
    /// Returns the shared handle, or `None` on id collision (the original
    /// hop is left untouched).
    pub fn put_transit_hop(&self, hop: TransitHop) -> Option<Arc<Mutex<TransitHop>>> {
        let info = hop.info;
        let mut inner = self.inner.lock();
        if inner.transit.contains_key(&(info.downstream, info.rx_id))
            || inner.transit.contains_key(&(info.upstream, info.tx_id))
        {
            return None;
        }
        let hop = Arc::new(Mutex::new(hop));
        inner
            .transit
            .insert((info.downstream, info.rx_id), hop.clone());
        inner
            .transit
            .insert((info.upstream, info.tx_id), hop.clone());
        Some(hop)
    }

    /// Hop whose creator-side segment matches (`peer`, `id`): traffic
    /// arriving from downstream, flowing away from the creator
    pub fn get_by_downstream(&self, peer: &RouterId, id: &PathId) -> Option<Arc<Mutex<TransitHop>>> {
        let inner = self.inner.lock();
        let hop = inner.transit.get(&(*peer, *id))?;
        {
            let h = hop.lock();
            if h.info.downstream != *peer || h.info.rx_id != *id {
                return None;
            }
        }
        Some(hop.clone())
    }

    /// Hop whose far-side segment matches (`peer`, `id`): traffic arriving
    /// from upstream, flowing toward the creator
    pub fn get_by_upstream(&self, peer: &RouterId, id: &PathId) -> Option<Arc<Mutex<TransitHop>>> {
        let inner = self.inner.lock();
        let hop = inner.transit.get(&(*peer, *id))?;
        {
            let h = hop.lock();
            if h.info.upstream != *peer || h.info.tx_id != *id {
                return None;
            }
        }
        Some(hop.clone())
    }

    /// Register a path we own, under both ids of its first hop, with a
    /// back-reference to its builder. The builder stays the canonical
    /// owner; the context only holds weak handles for lookup.
    pub fn add_owned_path(&self, owner: &Arc<Mutex<Builder>>, path: &Arc<Mutex<Path>>) {
        let (rx, tx) = {
            let p = path.lock();
            (p.rx_id(), p.tx_id())
        };
        let mut inner = self.inner.lock();
        for id in [rx, tx] {
            inner.owned.insert(
                id,
                OwnedEntry {
                    path: Arc::downgrade(path),
                    owner: Arc::downgrade(owner),
                },
            );
        }
    }

    pub fn get_owned_path(&self, id: &PathId) -> Option<Arc<Mutex<Path>>> {
        self.inner.lock().owned.get(id).and_then(|e| e.path.upgrade())
    }

    fn get_owned_entry(
        &self,
        id: &PathId,
    ) -> Option<(Arc<Mutex<Path>>, Weak<Mutex<Builder>>)> {
        let inner = self.inner.lock();
        let entry = inner.owned.get(id)?;
        Some((entry.path.upgrade()?, entry.owner.clone()))
    }

    pub fn remove_owned_path(&self, path: &Arc<Mutex<Path>>) {
        let (rx, tx) = {
            let p = path.lock();
            (p.rx_id(), p.tx_id())
        };
        let mut inner = self.inner.lock();
        inner.owned.remove(&rx);
        inner.owned.remove(&tx);
    }

    /// Expiry sweep, driven from the logic thread's timer
    pub fn tick(&self, now: u64) {
        let mut inner = self.inner.lock();
        let before = inner.transit.len();
        inner.transit.retain(|_, hop| !hop.lock().expired(now));
        let dropped = before - inner.transit.len();
        if dropped > 0 {
            log::debug!("expired {} transit hop entries", dropped);
        }
        inner.owned.retain(|_, e| e.path.strong_count() > 0);
        let window = self.config.limit_window_ms;
        inner
            .sources
            .retain(|_, w| now < w.window_start + window);
    }

    /// Count a build attempt against `source` and say whether it is over
    /// its allowance for the current window
    fn build_source_limited(&self, source: RouterId, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let w = inner.sources.entry(source).or_insert(SourceWindow {
            count: 0,
            window_start: now,
        });
        if now >= w.window_start + self.config.limit_window_ms {
            w.count = 0;
            w.window_start = now;
        }
        w.count += 1;
        w.count > self.config.per_source_build_limit
    }

    fn forward_allowed(&self, next_hop: &RouterId) -> bool {
        !self.config.denied_next_hops.contains(next_hop)
    }

    pub(crate) fn send_link(&self, peer: &RouterId, msg: &LinkMessage) -> SendStatus {
        self.link.send_to(peer, msg.to_bytes())
    }

    // ===== Message intake =====

    /// The link layer's message-received callback. Never blocks and never
    /// mutates state directly; malformed input is dropped with no reply.
    pub fn handle_message(&self, peer: RouterId, bytes: &[u8]) {
        let msg = match LinkMessage::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("undecodable link message from {peer}: {err}");
                return;
            }
        };
        let ctx = self.arc();
        match msg {
            LinkMessage::Build(req) => {
                if !self.transit_allowed() {
                    log::warn!("got build request from {peer} while not permitting transit");
                    return;
                }
                // frame opening is the expensive part; straight to a worker
                self.workers.submit(move || ctx.open_build_frame(peer, req));
            }
            LinkMessage::Status(msg) => self.logic.call(move || ctx.route_status(peer, msg)),
            LinkMessage::RelayUp(msg) => self.logic.call(move || ctx.route_upstream(peer, msg)),
            LinkMessage::RelayDown(msg) => {
                self.logic.call(move || ctx.route_downstream(peer, msg))
            }
        }
    }

    // ===== Transit admission =====

    /// Worker-side half of admission: open our frame, decode the record,
    /// run the server DH. Every failure here is a silent drop.
    fn open_build_frame(self: Arc<Self>, from: RouterId, req: BuildRequest) {
        let body = match req.frames[0].open_dh(&self.enc_secret) {
            Ok(body) => body,
            Err(_) => {
                log::debug!("build frame from {from} did not open, dropping");
                return;
            }
        };
        let record = match CommitRecord::decode(&body) {
            Ok(record) => record,
            Err(err) => {
                log::debug!("malformed commit record from {from}: {err}, dropping");
                return;
            }
        };
        let now = self.clock.now_ms();
        let hop = match TransitHop::from_commit(&record, from, &self.enc_secret, now) {
            Ok(hop) => hop,
            Err(err) => {
                log::debug!("commit record from {from} rejected: {err}, dropping");
                return;
            }
        };
        let next_rc = record.next_rc;
        let ctx = self.arc();
        self.logic
            .call(move || ctx.admit_transit_hop(hop, req, next_rc));
    }

    /// Logic-side half of admission: policy checks in order, first failure
    /// wins and is answered with a status record; then commit and either
    /// confirm (endpoint) or forward.
    fn admit_transit_hop(
        &self,
        hop: TransitHop,
        mut req: BuildRequest,
        next_rc: Option<RouterContact>,
    ) {
        let now = self.clock.now_ms();
        let info = hop.info;
        let path_key = hop.path_key.clone();
        let endpoint = hop.is_endpoint(&self.our_id);

        if self.has_transit_hop(&info) {
            log::warn!("duplicate transit hop {info}");
            self.send_status_downstream(info, path_key, StatusCode::DuplicateHop.bit(), false);
            return;
        }

        if !self.nodedb.is_relay(&info.downstream) && self.build_source_limited(info.downstream, now)
        {
            log::warn!("client {} over path build limit", info.downstream);
            self.send_status_downstream(info, path_key, StatusCode::Congestion.bit(), false);
            return;
        }

        if !endpoint && !self.forward_allowed(&info.upstream) {
            log::warn!(
                "path to {} not allowed, refusing build request",
                info.upstream
            );
            self.send_status_downstream(info, path_key, StatusCode::DestinationInvalid.bit(), false);
            return;
        }

        // bootstrap knowledge of the next hop from the record itself
        if let Some(rc) = next_rc {
            if rc.verify().is_ok() && !rc.expired(now) {
                self.nodedb.store(rc);
            }
        }

        let session_deadline = hop.expire_time() + SESSION_GRACE_MS;
        if self.put_transit_hop(hop).is_none() {
            // raced with another admission for the same ids
            log::warn!("duplicate transit hop {info}");
            self.send_status_downstream(info, path_key, StatusCode::DuplicateHop.bit(), false);
            return;
        }
        self.link
            .persist_session_until(&info.downstream, session_deadline);

        if endpoint {
            log::debug!("we are the far endpoint for {info}");
            self.send_status_downstream(info, path_key, StatusCode::Success.bit(), false);
            return;
        }

        self.link
            .persist_session_until(&info.upstream, session_deadline);
        req.shift_after_consume();
        let send = self.forward_build_request(&info.upstream, req);
        if let Some(code) = send.status_code() {
            log::warn!("forwarding build request to {} failed: {send:?}", info.upstream);
            self.send_status_downstream(info, path_key, code.bit(), true);
        }
    }

    /// Seal our status record on a worker, then send it downstream from
    /// the logic queue. `destroy_hop` additionally flags the (registered)
    /// hop for teardown, used when we answer with a failure after commit.
    fn send_status_downstream(
        &self,
        info: TransitHopInfo,
        path_key: crate::crypto::SharedKey,
        status: u64,
        destroy_hop: bool,
    ) {
        let ctx = self.arc();
        self.workers.submit(move || {
            let msg = match StatusMessage::create(info.rx_id, &path_key, status) {
                Ok(msg) => msg,
                Err(err) => {
                    log::error!("failed to build status record for {info}: {err}");
                    return;
                }
            };
            let ctx2 = ctx.clone();
            ctx.logic.call(move || {
                log::debug!(
                    "sending status {} for {info} to {}",
                    status_to_string(status),
                    info.downstream
                );
                ctx2.send_link(&info.downstream, &LinkMessage::Status(msg));
                if destroy_hop {
                    if let Some(hop) = ctx2.get_by_downstream(&info.downstream, &info.rx_id) {
                        hop.lock().set_destroy();
                    }
                }
            });
        });
    }

    // ===== Status routing =====

    fn route_status(&self, peer: RouterId, msg: StatusMessage) {
        // a reply for a path we own?
        if let Some((path, owner)) = self.get_owned_entry(&msg.path_id) {
            if path.lock().upstream() != peer {
                log::debug!("status for {} from wrong neighbor {peer}", msg.path_id);
                return;
            }
            let ctx = self.arc();
            self.workers.submit(move || {
                let outcome = {
                    let mut p = path.lock();
                    p.handle_status(&msg, ctx.clock.now_ms())
                };
                let ctx2 = ctx.clone();
                ctx.logic.call(move || {
                    let Some(owner) = owner.upgrade() else { return };
                    match outcome {
                        StatusOutcome::Established { .. } => {
                            owner.lock().handle_path_built(&path);
                        }
                        StatusOutcome::Failed { status } => {
                            owner.lock().handle_path_build_failed(&path, status);
                            ctx2.remove_owned_path(&path);
                        }
                        StatusOutcome::Ignored => {}
                    }
                });
            });
            return;
        }

        // a reply passing through one of our transit hops
        if let Some(hop) = self.get_by_upstream(&peer, &msg.path_id) {
            let ctx = self.arc();
            self.workers.submit(move || {
                let (path_key, rx_id, downstream) = {
                    let h = hop.lock();
                    (h.path_key.clone(), h.info.rx_id, h.info.downstream)
                };
                let mut msg = msg;
                let status = msg.status;
                if let Err(err) = msg.add_frame(&path_key, status) {
                    log::error!("failed to add status frame: {err}");
                    return;
                }
                msg.path_id = rx_id;
                let ctx2 = ctx.clone();
                ctx.logic.call(move || {
                    ctx2.send_link(&downstream, &LinkMessage::Status(msg));
                    if !StatusCode::Success.present_in(status) {
                        hop.lock().set_destroy();
                    }
                });
            });
            return;
        }

        log::debug!("status from {peer} for unknown path {}", msg.path_id);
    }

    // ===== Steady-state relay =====

    fn route_upstream(&self, peer: RouterId, msg: RelayUpstream) {
        let Some(hop) = self.get_by_downstream(&peer, &msg.path_id) else {
            log::debug!("upstream traffic from {peer} for unknown path {}", msg.path_id);
            return;
        };
        let now = self.clock.now_ms();
        let endpoint = {
            let mut h = hop.lock();
            h.mark_active(now);
            h.is_endpoint(&self.our_id)
        };
        if endpoint {
            let opened = {
                let h = hop.lock();
                h.open_routing_message(msg.payload, &msg.nonce)
            };
            match opened {
                Ok(routing_msg) => self.dispatch_at_endpoint(&hop, routing_msg),
                Err(err) => {
                    // bad traffic on an admitted hop: tear it down, no retry
                    let info = hop.lock().info;
                    log::warn!("undecodable routing message on {info}: {err}, destroying hop");
                    hop.lock().set_destroy();
                }
            }
        } else {
            let (fwd, upstream) = {
                let h = hop.lock();
                (h.relay_upstream(msg.payload, &msg.nonce), h.info.upstream)
            };
            self.send_link(&upstream, &LinkMessage::RelayUp(fwd));
        }
    }

    fn dispatch_at_endpoint(&self, hop: &Arc<Mutex<TransitHop>>, msg: RoutingMessage) {
        let from = hop.lock().info.rx_id;
        let mut replies = Vec::new();
        routing::dispatch(&*self.handler, from, msg, &mut |reply| replies.push(reply));
        for reply in replies {
            let (down_msg, downstream) = {
                let h = hop.lock();
                (h.make_downstream_reply(&reply), h.info.downstream)
            };
            self.send_link(&downstream, &LinkMessage::RelayDown(down_msg));
        }
    }

    fn route_downstream(&self, peer: RouterId, msg: RelayDownstream) {
        let now = self.clock.now_ms();
        // terminates at a path we own?
        if let Some(path) = self.get_owned_path(&msg.path_id) {
            let mut p = path.lock();
            if p.upstream() != peer {
                log::debug!("downstream traffic for {} from wrong neighbor {peer}", msg.path_id);
                return;
            }
            if let Err(err) = p.handle_downstream(&msg, now) {
                log::debug!("dropping downstream traffic on {}: {err}", p.short_name());
            }
            return;
        }

        if let Some(hop) = self.get_by_upstream(&peer, &msg.path_id) {
            let (fwd, downstream) = {
                let mut h = hop.lock();
                h.mark_active(now);
                (h.relay_downstream(msg.payload, &msg.nonce), h.info.downstream)
            };
            self.send_link(&downstream, &LinkMessage::RelayDown(fwd));
            return;
        }

        log::debug!("downstream traffic from {peer} for unknown path {}", msg.path_id);
    }

    // ===== Owned-path sends =====

    /// Onion-wrap and send one routing message over an owned path
    pub fn send_routing_message(
        &self,
        path: &Arc<Mutex<Path>>,
        msg: &RoutingMessage,
    ) -> Result<()> {
        let (upstream, relay) = {
            let p = path.lock();
            (p.upstream(), p.make_upstream(msg)?)
        };
        match self.send_link(&upstream, &LinkMessage::RelayUp(relay)) {
            SendStatus::Success => Ok(()),
            status => Err(VeilError::Transport(format!("{status:?}"))),
        }
    }

    /// Hand an already-shifted build request to the next hop up
    pub fn forward_build_request(&self, next_hop: &RouterId, req: BuildRequest) -> SendStatus {
        self.send_link(next_hop, &LinkMessage::Build(req))
    }

    /// Send a finished build request to its first hop, keeping the session
    /// alive for the path's whole lifetime
    pub fn send_build_request(
        &self,
        first_hop: &RouterId,
        req: BuildRequest,
        path_expire: u64,
    ) -> SendStatus {
        self.link
            .persist_session_until(first_hop, path_expire + SESSION_GRACE_MS);
        self.send_link(first_hop, &LinkMessage::Build(req))
    }
}
