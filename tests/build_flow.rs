//! End-to-end path build and relay tests
//!
//! Several routers wired together over an in-process message switch, with
//! inline worker pools and one hand-drained logic queue, so every scenario
//! runs deterministically: build a path hop by hop, collide on a duplicate
//! hop, run exit traffic over an established path, and time a build out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use veilnet::builder::{Builder, BuilderConfig};
use veilnet::contact::{identity_keygen, PathId, RouterContact, RouterId};
use veilnet::context::{PathContext, RouterParams, TransitConfig};
use veilnet::crypto;
use veilnet::link::{LinkLayer, SendStatus};
use veilnet::messages::commit::CommitRecord;
use veilnet::messages::status::StatusCode;
use veilnet::nodedb::{MemNodeDb, NodeDb};
use veilnet::path::{PathStatus, ROLE_ANY};
use veilnet::profiling::MemRouterProfile;
use veilnet::routing::{RoutingHandler, RoutingMessage};
use veilnet::runtime::{Clock, Logic, ManualClock, WorkerPool};
use veilnet::transit::TransitHop;
use veilnet::{BUILD_TIMEOUT_MS, MAX_BUILD_INTERVAL_MS, MIN_BUILD_INTERVAL_MS};

// ===== Harness =====

#[derive(Default)]
struct Switch {
    contexts: Mutex<HashMap<RouterId, Arc<PathContext>>>,
    wire: Mutex<VecDeque<(RouterId, RouterId, Vec<u8>)>>,
}

impl Switch {
    fn register(&self, id: RouterId, ctx: Arc<PathContext>) {
        self.contexts.lock().insert(id, ctx);
    }

    fn deliver_next(&self) -> bool {
        let Some((from, to, bytes)) = self.wire.lock().pop_front() else {
            return false;
        };
        let ctx = self.contexts.lock().get(&to).cloned();
        if let Some(ctx) = ctx {
            ctx.handle_message(from, &bytes);
        }
        true
    }
}

struct SwitchLink {
    our_id: RouterId,
    switch: Arc<Switch>,
}

impl LinkLayer for SwitchLink {
    fn send_to(&self, peer: &RouterId, message: Vec<u8>) -> SendStatus {
        if !self.switch.contexts.lock().contains_key(peer) {
            return SendStatus::RouterNotFound;
        }
        self.switch
            .wire
            .lock()
            .push_back((self.our_id, *peer, message));
        SendStatus::Success
    }

    fn persist_session_until(&self, _peer: &RouterId, _until: u64) {}
}

struct NullHandler;
impl RoutingHandler for NullHandler {}

/// Exit handler that grants every session it is asked for
#[derive(Default)]
struct ExitGranter {
    opens: AtomicUsize,
}

impl RoutingHandler for ExitGranter {
    fn on_exit_open(
        &self,
        _from: PathId,
        seq_no: u64,
        _flags: u64,
        _token: &[u8],
        reply: &mut dyn FnMut(RoutingMessage),
    ) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        reply(RoutingMessage::ExitGrant {
            seq_no,
            session_id: 42,
        });
    }
}

struct TestRouter {
    id: RouterId,
    rc: RouterContact,
    ctx: Arc<PathContext>,
    nodedb: Arc<MemNodeDb>,
}

struct Net {
    switch: Arc<Switch>,
    logic: Logic,
    clock: Arc<ManualClock>,
}

impl Net {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            switch: Arc::new(Switch::default()),
            logic: Logic::new(),
            clock: Arc::new(ManualClock::at(100_000)),
        }
    }

    fn add_router(&self, allow_transit: bool, handler: Arc<dyn RoutingHandler>) -> TestRouter {
        let identity = identity_keygen();
        let (enc_secret, enc_pub) = crypto::keygen();
        let rc = RouterContact::new_signed(
            &identity,
            enc_pub,
            "203.0.113.1:7100".parse().unwrap(),
            u64::MAX,
        );
        let id = rc.router_id;
        let nodedb = Arc::new(MemNodeDb::new());
        let ctx = PathContext::new(RouterParams {
            our_id: id,
            enc_secret,
            link: Arc::new(SwitchLink {
                our_id: id,
                switch: self.switch.clone(),
            }),
            nodedb: nodedb.clone(),
            handler,
            clock: self.clock.clone(),
            logic: self.logic.clone(),
            workers: WorkerPool::inline(),
            transit: TransitConfig::default(),
        });
        if allow_transit {
            ctx.allow_transit();
        }
        self.switch.register(id, ctx.clone());
        TestRouter {
            id,
            rc,
            ctx,
            nodedb,
        }
    }

    /// Teach every router every relay's contact
    fn introduce(&self, routers: &[&TestRouter]) {
        for a in routers {
            for b in routers {
                if a.id != b.id {
                    a.nodedb.store(b.rc.clone());
                }
            }
        }
    }

    /// Deliver wire messages and drain logic until nothing moves
    fn pump(&self) {
        loop {
            let mut progressed = self.logic.drain();
            while self.switch.deliver_next() {
                progressed += 1;
                self.logic.drain();
            }
            if progressed == 0 {
                break;
            }
        }
    }
}

fn client_builder(
    client: &TestRouter,
    target_paths: usize,
    hop_count: usize,
) -> Arc<Mutex<Builder>> {
    Builder::new(
        client.ctx.clone(),
        Arc::new(MemRouterProfile::new()),
        BuilderConfig {
            target_paths,
            hop_count,
            role: ROLE_ANY,
        },
    )
}

// ===== Scenario A: 3-hop build succeeds end to end =====

#[test]
fn three_hop_build_establishes() {
    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(NullHandler));
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let h3 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &h3, &client]);

    let builder = client_builder(&client, 1, 3);
    Builder::build(
        &builder,
        vec![h1.rc.clone(), h2.rc.clone(), h3.rc.clone()],
    );
    net.pump();

    {
        let b = builder.lock();
        assert_eq!(b.stats().attempts, 1);
        assert_eq!(b.stats().success, 1);
        assert_eq!(b.paths().len(), 1);

        let path = b.paths()[0].lock();
        assert_eq!(path.status(), PathStatus::Established);
        assert_eq!(path.endpoint(), h3.id);
        assert!(path.latency_ms().is_some());
    }

    // each relay holds exactly one transit hop for this path
    assert_eq!(h1.ctx.transit_path_count(), 1);
    assert_eq!(h2.ctx.transit_path_count(), 1);
    assert_eq!(h3.ctx.transit_path_count(), 1);
    // nothing stuck on the wire
    assert!(net.switch.wire.lock().is_empty());
}

// ===== Scenario B: duplicate hop id collision rejects the build =====

#[test]
fn duplicate_hop_rejected_without_clobbering() {
    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(NullHandler));
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let h3 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &h3, &client]);

    let builder = client_builder(&client, 1, 3);
    Builder::build(
        &builder,
        vec![h1.rc.clone(), h2.rc.clone(), h3.rc.clone()],
    );
    // run the pipeline so the request is on the wire, but hold delivery
    net.logic.drain();

    // occupy H2's (downstream=H1, rx) slot with an unrelated hop
    let collided_rx = builder.lock().paths()[0].lock().hops[1].rx_id;
    let (_, stranger_pub) = crypto::keygen();
    let (any_secret, _) = crypto::keygen();
    let squatter = TransitHop::from_commit(
        &CommitRecord {
            commit_key: stranger_pub,
            tx_id: PathId::random(),
            rx_id: collided_rx,
            tunnel_nonce: crypto::TunnelNonce::random(),
            next_hop: h3.id,
            next_rc: None,
            work: None,
            lifetime_override_ms: None,
        },
        h1.id,
        &any_secret,
        net.clock.now_ms(),
    )
    .unwrap();
    let original = h2.ctx.put_transit_hop(squatter).unwrap();

    net.pump();

    {
        let b = builder.lock();
        assert_eq!(b.stats().fails, 1);
        let path = b.paths()[0].lock();
        assert_eq!(path.status(), PathStatus::Failed);
    }
    // H2 still holds only the squatter, untouched
    assert_eq!(h2.ctx.transit_path_count(), 1);
    let found = h2.ctx.get_by_downstream(&h1.id, &collided_rx).unwrap();
    assert!(Arc::ptr_eq(&original, &found));
    // the request never reached H3
    assert_eq!(h3.ctx.transit_path_count(), 0);
    // and the failure backed the builder off
    assert!(builder.lock().cooldown_ms() > MIN_BUILD_INTERVAL_MS);
}

// ===== Scenario C: exit traffic over an established 2-hop path =====

#[test]
fn exit_open_round_trip() {
    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(NullHandler));
    let exit_handler = Arc::new(ExitGranter::default());
    let h2 = net.add_router(true, exit_handler.clone());
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &client]);

    let builder = client_builder(&client, 1, 2);
    Builder::build(&builder, vec![h1.rc.clone(), h2.rc.clone()]);
    net.pump();

    let path = builder.lock().paths()[0].clone();
    assert_eq!(path.lock().status(), PathStatus::Established);

    // capture exit replies arriving at the client
    let replies: Arc<Mutex<Vec<RoutingMessage>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = replies.clone();
        path.lock().hooks.on_exit_update = Some(Box::new(move |msg| {
            sink.lock().push(msg.clone());
        }));
    }

    let seq_no = path.lock().next_seq_no();
    client
        .ctx
        .send_routing_message(
            &path,
            &RoutingMessage::ExitOpen {
                seq_no,
                flags: 0,
                token: b"open sesame".to_vec(),
            },
        )
        .unwrap();
    net.pump();

    // the endpoint decoded and dispatched exactly one open
    assert_eq!(exit_handler.opens.load(Ordering::SeqCst), 1);
    // and the grant came back through the exit-update hook
    let replies = replies.lock();
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        RoutingMessage::ExitGrant {
            seq_no: reply_seq,
            session_id,
        } => {
            assert_eq!(*reply_seq, seq_no);
            assert_eq!(*session_id, 42);
        }
        other => panic!("expected ExitGrant, got {other:?}"),
    }
    // H1 only relayed; it never parsed the payload or kept routing state
    assert_eq!(h1.ctx.transit_path_count(), 1);
}

// ===== Scenario D: build timeout drives backoff =====

#[test]
fn build_timeout_increases_cooldown() {
    let net = Net::new();
    // H1 exists but does not permit transit: build requests vanish
    let h1 = net.add_router(false, Arc::new(NullHandler));
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &client]);

    // target 0 so ticks only drive timers, never replacement builds
    let builder = client_builder(&client, 0, 2);
    let mut previous_cooldown = builder.lock().cooldown_ms();

    for round in 1..=3u64 {
        Builder::build(&builder, vec![h1.rc.clone(), h2.rc.clone()]);
        net.pump();
        assert_eq!(builder.lock().stats().attempts, round);

        net.clock.advance(BUILD_TIMEOUT_MS + 1);
        Builder::tick(&builder, net.clock.now_ms());
        net.pump();

        let b = builder.lock();
        assert_eq!(b.stats().timeouts, round);
        let cooldown = b.cooldown_ms();
        assert!(
            cooldown > previous_cooldown || cooldown == MAX_BUILD_INTERVAL_MS,
            "cooldown must strictly increase until capped"
        );
        assert!(cooldown <= MAX_BUILD_INTERVAL_MS);
        previous_cooldown = cooldown;
    }

    // no transit state ever appeared anywhere
    assert_eq!(h1.ctx.transit_path_count(), 0);
    assert_eq!(h2.ctx.transit_path_count(), 0);
}

// ===== Relay transparency =====

#[test]
fn intermediate_hop_never_parses_payload() {
    // a 3-hop path where the middle hop's handler would panic if asked to
    // decode anything
    struct PanicHandler;
    impl RoutingHandler for PanicHandler {
        fn on_dht(
            &self,
            _from: PathId,
            _seq: u64,
            _body: &[u8],
            _reply: &mut dyn FnMut(RoutingMessage),
        ) {
            panic!("non-endpoint hop dispatched a routing message");
        }
    }

    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(PanicHandler));
    let h2 = net.add_router(true, Arc::new(PanicHandler));
    let h3 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &h3, &client]);

    let builder = client_builder(&client, 1, 3);
    Builder::build(
        &builder,
        vec![h1.rc.clone(), h2.rc.clone(), h3.rc.clone()],
    );
    net.pump();

    let path = builder.lock().paths()[0].clone();
    assert_eq!(path.lock().status(), PathStatus::Established);

    let seq_no = path.lock().next_seq_no();
    client
        .ctx
        .send_routing_message(
            &path,
            &RoutingMessage::DhtRelay {
                seq_no,
                body: vec![1, 2, 3],
            },
        )
        .unwrap();
    // would panic inside pump if H1 or H2 tried to dispatch
    net.pump();
}

// ===== Expiry sweep across the whole relay =====

#[test]
fn transit_hops_expire_after_lifetime() {
    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(NullHandler));
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &client]);

    let builder = client_builder(&client, 1, 2);
    Builder::build(&builder, vec![h1.rc.clone(), h2.rc.clone()]);
    net.pump();
    assert_eq!(h1.ctx.transit_path_count(), 1);

    let expire_at = builder.lock().paths()[0].lock().expire_time();
    net.clock.set(expire_at + 1);
    h1.ctx.tick(net.clock.now_ms());
    h2.ctx.tick(net.clock.now_ms());
    // stop so the sweep is not immediately followed by a replacement build
    builder.lock().stop();
    Builder::tick(&builder, net.clock.now_ms());
    net.pump();

    assert_eq!(h1.ctx.transit_path_count(), 0);
    assert_eq!(h2.ctx.transit_path_count(), 0);
    assert!(builder.lock().paths().is_empty());
}

// ===== Status codes survive the trip back =====

#[test]
fn disallowed_next_hop_reports_destination_invalid() {
    let net = Net::new();
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let h3 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));

    // H1 refuses to forward toward H2
    let identity = identity_keygen();
    let (enc_secret, enc_pub) = crypto::keygen();
    let h1_rc = RouterContact::new_signed(
        &identity,
        enc_pub,
        "203.0.113.2:7100".parse().unwrap(),
        u64::MAX,
    );
    let h1_id = h1_rc.router_id;
    let h1_nodedb = Arc::new(MemNodeDb::new());
    let mut transit = TransitConfig {
        allow_transit: true,
        ..Default::default()
    };
    transit.denied_next_hops.insert(h2.rc.router_id);
    let h1_ctx = PathContext::new(RouterParams {
        our_id: h1_id,
        enc_secret,
        link: Arc::new(SwitchLink {
            our_id: h1_id,
            switch: net.switch.clone(),
        }),
        nodedb: h1_nodedb.clone(),
        handler: Arc::new(NullHandler),
        clock: net.clock.clone(),
        logic: net.logic.clone(),
        workers: WorkerPool::inline(),
        transit,
    });
    net.switch.register(h1_id, h1_ctx.clone());
    let h1 = TestRouter {
        id: h1_id,
        rc: h1_rc,
        ctx: h1_ctx,
        nodedb: h1_nodedb,
    };
    net.introduce(&[&h1, &h2, &h3, &client]);

    let builder = client_builder(&client, 1, 3);
    Builder::build(
        &builder,
        vec![h1.rc.clone(), h2.rc.clone(), h3.rc.clone()],
    );
    net.pump();

    {
        let b = builder.lock();
        let path = b.paths()[0].lock();
        assert_eq!(path.status(), PathStatus::Failed);
    }
    // H1 refused before creating durable forward state toward H2
    assert_eq!(h2.ctx.transit_path_count(), 0);
    assert_eq!(h3.ctx.transit_path_count(), 0);
}

// ===== Aligned builds =====

#[test]
fn aligned_build_reuses_fast_path() {
    let net = Net::new();
    let h1 = net.add_router(true, Arc::new(NullHandler));
    let h2 = net.add_router(true, Arc::new(NullHandler));
    let client = net.add_router(false, Arc::new(NullHandler));
    net.introduce(&[&h1, &h2, &client]);

    let builder = client_builder(&client, 2, 2);
    Builder::build(&builder, vec![h1.rc.clone(), h2.rc.clone()]);
    net.pump();
    assert_eq!(builder.lock().stats().success, 1);

    // clear the cooldown, then ask for an urgent path to H2
    net.clock.advance(MAX_BUILD_INTERVAL_MS);
    assert!(Builder::build_one_aligned_to(&builder, h2.id));
    net.pump();

    let b = builder.lock();
    assert_eq!(b.stats().success, 2);
    // the reused hop list ends at the same endpoint
    for path in b.paths() {
        assert_eq!(path.lock().endpoint(), h2.id);
    }
}

#[test]
fn status_code_bits_for_congestion_path() {
    // unit-ish sanity on the wire constants used above
    assert!(StatusCode::DuplicateHop.present_in(StatusCode::DuplicateHop.bit()));
    assert!(!StatusCode::Success.present_in(StatusCode::DuplicateHop.bit()));
}
