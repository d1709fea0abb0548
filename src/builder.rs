//! Path builder
//!
//! Per-endpoint policy object: keeps a target number of established paths
//! alive, picks hop candidates, starts key exchange pipelines, and applies
//! linear backoff when builds time out or fail. One builder per logical
//! client/service endpoint; all of its state lives on the logic thread.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::contact::{RouterContact, RouterId};
use crate::context::PathContext;
use crate::error::{Result, VeilError};
use crate::messages::status::status_to_string;
use crate::messages::LinkMessage;
use crate::path::{Path, PathEvent, PathRole, PathStatus, ROLE_ANY};
use crate::pipeline;
use crate::profiling::RouterProfile;
use crate::runtime::Clock;
use crate::{LATENCY_INTERVAL_MS, MAX_BUILD_INTERVAL_MS, MIN_BUILD_INTERVAL_MS};

/// Hop-selection retries before a build is abandoned
const SELECT_RETRIES: usize = 5;

/// An established path ending at the right router is reused for an
/// aligned build only if it is at least this fast
const ALIGNED_LATENCY_MAX_MS: u64 = 1_000;

/// Warn when the success ratio drops below this after enough attempts
const MIN_GOOD_BUILD_RATIO: f64 = 0.25;

/// Builder policy knobs
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Established paths to keep available
    pub target_paths: usize,
    /// Hops per path
    pub hop_count: usize,
    /// Roles new paths are built with
    pub role: PathRole,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            target_paths: 3,
            hop_count: 3,
            role: ROLE_ANY,
        }
    }
}

/// Stats about all our path builds
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct BuildStats {
    pub attempts: u64,
    pub success: u64,
    pub fails: u64,
    pub timeouts: u64,
}

impl BuildStats {
    pub fn success_ratio(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        self.success as f64 / self.attempts as f64
    }
}

/// Maintains a pool of paths for one endpoint
pub struct Builder {
    ctx: Arc<PathContext>,
    profile: Arc<dyn RouterProfile>,
    config: BuilderConfig,
    paths: Vec<Arc<Mutex<Path>>>,
    /// Current build cooldown; grows linearly on failure, resets on success
    cooldown_ms: u64,
    last_build: u64,
    stopped: bool,
    stats: BuildStats,
    build_seq: u64,
    last_warn: u64,
}

impl Builder {
    pub fn new(
        ctx: Arc<PathContext>,
        profile: Arc<dyn RouterProfile>,
        config: BuilderConfig,
    ) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            ctx,
            profile,
            config,
            paths: Vec::new(),
            cooldown_ms: MIN_BUILD_INTERVAL_MS,
            last_build: 0,
            stopped: false,
            stats: BuildStats::default(),
            build_seq: 0,
            last_warn: 0,
        }))
    }

    /// Stop future tick-driven builds. An in-flight key exchange is not
    /// aborted; its completion sees this flag and discards the result.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    pub fn paths(&self) -> &[Arc<Mutex<Path>>] {
        &self.paths
    }

    pub fn established_count(&self, now: u64) -> usize {
        self.paths
            .iter()
            .filter(|p| p.lock().is_ready(now))
            .count()
    }

    fn live_count(&self, now: u64) -> usize {
        self.paths
            .iter()
            .filter(|p| !p.lock().defunct(now))
            .count()
    }

    fn cooldown_hit(&self, now: u64) -> bool {
        now < self.last_build + self.cooldown_ms
    }

    /// Below target and not cooling down
    pub fn should_build_more(&self, now: u64) -> bool {
        !self.stopped && !self.cooldown_hit(now) && self.live_count(now) < self.config.target_paths
    }

    /// linear backoff
    fn do_build_backoff(&mut self) {
        self.cooldown_ms = (self.cooldown_ms + MIN_BUILD_INTERVAL_MS).min(MAX_BUILD_INTERVAL_MS);
        log::warn!("build interval is now {}ms", self.cooldown_ms);
    }

    /// Drive timers: expire dead paths, kick off builds, send latency
    /// probes. Call from the logic thread.
    pub fn tick(this: &Arc<Mutex<Self>>, now: u64) {
        let mut probes = Vec::new();
        let should_build;
        {
            let mut b = this.lock();

            // collect tick events, then apply their bookkeeping
            let mut timeouts = Vec::new();
            for path in &b.paths {
                let mut p = path.lock();
                match p.tick(now) {
                    Some(PathEvent::BuildTimeout) => timeouts.push(p.hop_routers()),
                    Some(PathEvent::Expired) => {}
                    None => {}
                }
                if p.is_ready(now) && p.latency_probe_due(now, LATENCY_INTERVAL_MS) {
                    if let Ok(probe) = p.make_latency_probe(now) {
                        probes.push((p.upstream(), probe));
                    }
                }
            }
            for routers in timeouts {
                b.stats.timeouts += 1;
                b.profile.mark_timeout(&routers);
                b.do_build_backoff();
            }

            // drop defunct paths from the pool and the registry
            let ctx = b.ctx.clone();
            b.paths.retain(|path| {
                let dead = path.lock().defunct(now);
                if dead {
                    ctx.remove_owned_path(path);
                }
                !dead
            });

            if b.stats.attempts > 50
                && b.stats.success_ratio() <= MIN_GOOD_BUILD_RATIO
                && now.saturating_sub(b.last_warn) > 5_000
            {
                log::warn!(
                    "low path build success: {}/{} attempts",
                    b.stats.success,
                    b.stats.attempts
                );
                b.last_warn = now;
            }

            should_build = b.should_build_more(now);
        }

        if !probes.is_empty() {
            let ctx = this.lock().ctx.clone();
            for (upstream, probe) in probes {
                ctx.send_link(&upstream, &LinkMessage::RelayUp(probe));
            }
        }

        if should_build {
            Self::build_one(this, None);
        }
    }

    /// Pick hops and start one build. Returns false when selection failed;
    /// no network activity happens in that case.
    pub fn build_one(this: &Arc<Mutex<Self>>, forced_endpoint: Option<RouterContact>) -> bool {
        let contacts = {
            let b = this.lock();
            match b.select_hops(b.config.hop_count, forced_endpoint) {
                Ok(contacts) => contacts,
                Err(err) => {
                    log::warn!("hop selection failed: {err}");
                    return false;
                }
            }
        };
        Self::build(this, contacts);
        true
    }

    /// Urgent build that must end at `remote`. Reuses the hop list of an
    /// existing fast established path to that router when one exists,
    /// skipping selection entirely.
    pub fn build_one_aligned_to(this: &Arc<Mutex<Self>>, remote: RouterId) -> bool {
        let contacts = {
            let b = this.lock();
            let now = b.ctx.clock().now_ms();
            let reusable = b.paths.iter().find_map(|path| {
                let p = path.lock();
                let fast = p.latency_ms().is_some_and(|l| l <= ALIGNED_LATENCY_MAX_MS);
                (p.is_ready(now) && p.endpoint() == remote && fast).then(|| p.hop_contacts())
            });
            match reusable {
                Some(contacts) => {
                    log::info!("aligned build to {remote} reusing existing hop list");
                    contacts
                }
                None => {
                    let Some(endpoint_rc) = b.ctx.nodedb().get(&remote) else {
                        log::warn!("aligned build: no contact for {remote}");
                        return false;
                    };
                    match b.select_hops(b.config.hop_count, Some(endpoint_rc)) {
                        Ok(contacts) => contacts,
                        Err(err) => {
                            log::warn!("aligned hop selection failed: {err}");
                            return false;
                        }
                    }
                }
            }
        };
        Self::build(this, contacts);
        true
    }

    /// Rebuild n fresh paths immediately
    pub fn manual_rebuild(this: &Arc<Mutex<Self>>, n: usize) {
        log::debug!("manual rebuild of {n} paths");
        for _ in 0..n {
            if !Self::build_one(this, None) {
                break;
            }
        }
    }

    /// Build a fresh path over the same hop list as `path` (new ids, new
    /// key material)
    pub fn rebuild_path(this: &Arc<Mutex<Self>>, path: &Arc<Mutex<Path>>) {
        let contacts = path.lock().hop_contacts();
        Self::build(this, contacts);
    }

    /// Random candidates, excluding repeats and routers with a poor
    /// reliability profile. A forced endpoint occupies the last slot.
    fn select_hops(
        &self,
        hop_count: usize,
        forced_endpoint: Option<RouterContact>,
    ) -> Result<Vec<RouterContact>> {
        let mut exclude: HashSet<RouterId> = HashSet::new();
        exclude.insert(self.ctx.our_id());
        if let Some(rc) = &forced_endpoint {
            exclude.insert(rc.router_id);
        }
        let picks = hop_count - usize::from(forced_endpoint.is_some());

        let mut hops = Vec::with_capacity(hop_count);
        for _ in 0..picks {
            let mut found = None;
            for _ in 0..SELECT_RETRIES {
                let Some(rc) = self.ctx.nodedb().select_random_excluding(&exclude) else {
                    break;
                };
                if self.profile.is_bad_for_path(&rc.router_id) {
                    exclude.insert(rc.router_id);
                    continue;
                }
                found = Some(rc);
                break;
            }
            let rc = found.ok_or_else(|| {
                VeilError::SelectionExhausted(format!(
                    "no usable hop candidate after {SELECT_RETRIES} tries"
                ))
            })?;
            exclude.insert(rc.router_id);
            hops.push(rc);
        }
        if let Some(rc) = forced_endpoint {
            hops.push(rc);
        }
        Ok(hops)
    }

    /// Create the path, register it, and run the key exchange pipeline;
    /// the finished request goes to the first hop from the completion
    /// callback (which discards everything if the builder stopped).
    pub fn build(this: &Arc<Mutex<Self>>, contacts: Vec<RouterContact>) {
        let (ctx, path) = {
            let mut b = this.lock();
            if b.stopped {
                log::info!("builder is stopped, aborting path build");
                return;
            }
            let now = b.ctx.clock().now_ms();
            b.last_build = now;
            b.build_seq += 1;
            let name = format!("[path {}-{}]", b.ctx.our_id(), b.build_seq);
            let path = match Path::new(contacts, b.config.role, name, now) {
                Ok(path) => Arc::new(Mutex::new(path)),
                Err(err) => {
                    log::error!("refusing path build: {err}");
                    return;
                }
            };
            b.stats.attempts += 1;
            b.paths.push(path.clone());
            (b.ctx.clone(), path)
        };
        ctx.add_owned_path(this, &path);

        let this2 = this.clone();
        let ctx2 = ctx.clone();
        let path2 = path.clone();
        pipeline::start_key_exchange(
            path,
            ctx.workers().clone(),
            ctx.logic().clone(),
            move |maybe_req| {
                if this2.lock().is_stopped() {
                    log::debug!("builder stopped mid-exchange, discarding build");
                    return;
                }
                let now = ctx2.clock().now_ms();
                let Some(req) = maybe_req else {
                    // crypto failure: abort locally, no wire traffic
                    path2.lock().enter_state(PathStatus::Failed, now);
                    let mut b = this2.lock();
                    b.stats.fails += 1;
                    return;
                };
                let (upstream, expire, name) = {
                    let p = path2.lock();
                    (p.upstream(), p.expire_time(), p.short_name().to_string())
                };
                log::info!("sending build request for {name} via {upstream}");
                let send = ctx2.send_build_request(&upstream, req, expire);
                if send.status_code().is_some() {
                    log::warn!("build request send failed for {name}: {send:?}");
                    path2.lock().enter_state(PathStatus::Failed, now);
                    let mut b = this2.lock();
                    b.stats.fails += 1;
                    b.do_build_backoff();
                }
            },
        );
    }

    /// A status reply established the path
    pub fn handle_path_built(&mut self, path: &Arc<Mutex<Path>>) {
        self.cooldown_ms = MIN_BUILD_INTERVAL_MS;
        self.stats.success += 1;
        let (routers, name, latency) = {
            let p = path.lock();
            (p.hop_routers(), p.short_name().to_string(), p.latency_ms())
        };
        self.profile.mark_success(&routers);
        log::info!("{name} built, latency={:?}ms", latency.unwrap_or(0));
    }

    /// A status reply rejected the path
    pub fn handle_path_build_failed(&mut self, path: &Arc<Mutex<Path>>, status: u64) {
        self.stats.fails += 1;
        let routers = path.lock().hop_routers();
        self.profile.mark_failure(&routers);
        self.do_build_backoff();
        log::warn!(
            "{} build failed: {}",
            path.lock().short_name(),
            status_to_string(status)
        );
    }

    /// Introspection snapshot
    pub fn snapshot(&self, now: u64) -> serde_json::Value {
        json!({
            "targetPaths": self.config.target_paths,
            "hopCount": self.config.hop_count,
            "cooldownMs": self.cooldown_ms,
            "stopped": self.stopped,
            "stats": self.stats,
            "paths": self.paths.iter().map(|p| p.lock().snapshot(now)).collect::<Vec<_>>(),
        })
    }
}
