//! Client-side path state machine
//!
//! A path the local router built for itself: an ordered list of hops, a
//! status that moves Building → {Established, Timeout} → terminal, and the
//! layered-encryption send/receive plumbing for routing messages. Terminal
//! states are sticky; nothing resurrects a dead path, the builder makes a
//! new one instead.

use serde_json::json;

use crate::contact::{PathId, RouterContact, RouterId};
use crate::crypto::{self, TunnelNonce};
use crate::error::{Result, VeilError};
use crate::hop::HopConfig;
use crate::messages::relay::{RelayDownstream, RelayUpstream};
use crate::messages::status::{status_to_string, StatusMessage};
use crate::routing::RoutingMessage;
use crate::{BUILD_TIMEOUT_MS, MAX_HOPS, MIN_HOPS};

/// Traffic classes a path may carry, as a bitmask
pub type PathRole = u8;

/// Capable of any role
pub const ROLE_ANY: PathRole = 0;
/// Exit traffic capable
pub const ROLE_EXIT: PathRole = 1 << 0;
/// Hidden-service traffic capable
pub const ROLE_HIDDEN_SERVICE: PathRole = 1 << 1;
/// DHT message capable
pub const ROLE_DHT: PathRole = 1 << 2;

/// Status of an owned path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Timeout,
    Expired,
    Failed,
}

impl PathStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PathStatus::Timeout | PathStatus::Expired | PathStatus::Failed
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            PathStatus::Building => "building",
            PathStatus::Established => "established",
            PathStatus::Timeout => "timeout",
            PathStatus::Expired => "expired",
            PathStatus::Failed => "failed",
        }
    }
}

/// What a tick decided about a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    /// No status reply arrived within the build budget
    BuildTimeout,
    /// An established path ran out its lifetime
    Expired,
}

/// Outcome of feeding a status message to a building path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Every hop reported success
    Established { latency_ms: u64 },
    /// Some hop reported a failure; aggregated bits attached
    Failed { status: u64 },
    /// Not for us in this state, or records did not open; dropped
    Ignored,
}

/// Callbacks the path's owner wires in
#[derive(Default)]
pub struct PathHooks {
    /// Called once when the path establishes, with the measured latency
    pub on_built: Option<Box<dyn FnMut(u64) + Send>>,
    /// Exit session results (grant/reject/update) arriving on this path
    pub on_exit_update: Option<Box<dyn FnMut(&RoutingMessage) + Send>>,
    /// All other inbound routing traffic
    pub on_data: Option<Box<dyn FnMut(&RoutingMessage) + Send>>,
}

/// A path we made
pub struct Path {
    pub hops: Vec<HopConfig>,
    pub build_started: u64,
    status: PathStatus,
    role: PathRole,
    latency_ms: Option<u64>,
    seq_no: u64,
    last_recv: u64,
    /// Outstanding latency probe: (seq_no, sent_at)
    pending_probe: Option<(u64, u64)>,
    last_probe_at: u64,
    short_name: String,
    pub hooks: PathHooks,
}

impl Path {
    /// Start a new path over `contacts`, hop count in [MIN_HOPS, MAX_HOPS].
    ///
    /// Adjacent hops share the id of the link segment between them: hop i's
    /// tx id is hop i+1's rx id.
    pub fn new(
        contacts: Vec<RouterContact>,
        role: PathRole,
        short_name: String,
        now: u64,
    ) -> Result<Self> {
        if contacts.len() < MIN_HOPS || contacts.len() > MAX_HOPS {
            return Err(VeilError::InvalidState(format!(
                "path wants {} hops, allowed {}..={}",
                contacts.len(),
                MIN_HOPS,
                MAX_HOPS
            )));
        }
        let mut hops: Vec<HopConfig> = contacts.into_iter().map(HopConfig::new).collect();
        for i in 0..hops.len() - 1 {
            hops[i].tx_id = hops[i + 1].rx_id;
            hops[i].upstream = hops[i + 1].router_id();
        }
        log::info!("path {short_name} is building");
        Ok(Self {
            hops,
            build_started: now,
            status: PathStatus::Building,
            role,
            latency_ms: None,
            seq_no: 0,
            last_recv: 0,
            pending_probe: None,
            last_probe_at: 0,
            short_name,
            hooks: PathHooks::default(),
        })
    }

    pub fn status(&self) -> PathStatus {
        self.status
    }

    pub fn role(&self) -> PathRole {
        self.role
    }

    /// True if ALL of the asked-for roles are supported
    pub fn supports_all_roles(&self, roles: PathRole) -> bool {
        (self.role & roles) == roles
    }

    /// True if ANY of the asked-for roles is supported
    pub fn supports_any_roles(&self, roles: PathRole) -> bool {
        roles == ROLE_ANY || (self.role & roles) != 0
    }

    pub fn grant_role(&mut self, roles: PathRole) {
        self.role |= roles;
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    /// The first hop's forwarding id (its segment toward hop 2)
    pub fn tx_id(&self) -> PathId {
        self.hops[0].tx_id
    }

    /// The id of our own segment to the first hop; all traffic we send or
    /// receive on this path carries it
    pub fn rx_id(&self) -> PathId {
        self.hops[0].rx_id
    }

    /// First hop's router
    pub fn upstream(&self) -> RouterId {
        self.hops[0].router_id()
    }

    /// Far-end router
    pub fn endpoint(&self) -> RouterId {
        self.hops[self.hops.len() - 1].router_id()
    }

    pub fn is_endpoint(&self, router: &RouterId, id: &PathId) -> bool {
        let last = &self.hops[self.hops.len() - 1];
        last.router_id() == *router && last.tx_id == *id
    }

    /// Contacts of every hop, for an on-the-same-hops rebuild
    pub fn hop_contacts(&self) -> Vec<RouterContact> {
        self.hops.iter().map(|h| h.rc.clone()).collect()
    }

    /// Identities of every hop, for reliability bookkeeping
    pub fn hop_routers(&self) -> Vec<RouterId> {
        self.hops.iter().map(|h| h.router_id()).collect()
    }

    pub fn expire_time(&self) -> u64 {
        self.build_started + self.hops[0].lifetime_ms
    }

    /// Once true for some `now`, stays true for every later `now`
    pub fn expired(&self, now: u64) -> bool {
        self.status == PathStatus::Expired || now >= self.expire_time()
    }

    pub fn expires_soon(&self, now: u64, margin_ms: u64) -> bool {
        now + margin_ms >= self.expire_time()
    }

    /// Dead for the owner's purposes: terminal or past lifetime
    pub fn defunct(&self, now: u64) -> bool {
        self.status.is_terminal() || self.expired(now)
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.status == PathStatus::Established && !self.expired(now)
    }

    pub fn mark_active(&mut self, now: u64) {
        self.last_recv = self.last_recv.max(now);
    }

    /// Next per-path sequence number, used to correlate control replies
    pub fn next_seq_no(&mut self) -> u64 {
        self.seq_no += 1;
        self.seq_no
    }

    /// Apply a state transition if it is legal; terminal states are
    /// sticky and Building→Established happens at most once.
    pub fn enter_state(&mut self, next: PathStatus, now: u64) -> bool {
        let legal = matches!(
            (self.status, next),
            (PathStatus::Building, PathStatus::Established)
                | (PathStatus::Building, PathStatus::Timeout)
                | (PathStatus::Building, PathStatus::Failed)
                | (PathStatus::Established, PathStatus::Expired)
                | (PathStatus::Established, PathStatus::Failed)
        );
        if !legal {
            if self.status != next {
                log::warn!(
                    "path {} refusing transition {:?} -> {:?}",
                    self.short_name,
                    self.status,
                    next
                );
            }
            return false;
        }
        match next {
            PathStatus::Established => {
                log::info!(
                    "path {} is built, took {}ms",
                    self.short_name,
                    now.saturating_sub(self.build_started)
                );
            }
            PathStatus::Timeout => {
                log::warn!("path {} build timed out", self.short_name);
            }
            PathStatus::Failed => log::warn!("path {} failed", self.short_name),
            PathStatus::Expired => log::info!("path {} expired", self.short_name),
            PathStatus::Building => {}
        }
        self.status = next;
        true
    }

    /// Cooperative timer check
    pub fn tick(&mut self, now: u64) -> Option<PathEvent> {
        match self.status {
            PathStatus::Building => {
                if now >= self.build_started + BUILD_TIMEOUT_MS {
                    self.enter_state(PathStatus::Timeout, now);
                    return Some(PathEvent::BuildTimeout);
                }
            }
            PathStatus::Established => {
                if now >= self.expire_time() {
                    self.enter_state(PathStatus::Expired, now);
                    return Some(PathEvent::Expired);
                }
            }
            _ => {}
        }
        None
    }

    /// Feed the status reply for this path's build
    pub fn handle_status(&mut self, msg: &StatusMessage, now: u64) -> StatusOutcome {
        if self.status != PathStatus::Building {
            return StatusOutcome::Ignored;
        }
        let mut keys = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            match hop.shared_key() {
                Ok(key) => keys.push(key.clone()),
                Err(_) => return StatusOutcome::Ignored,
            }
        }
        // a failure partway up the path leaves later frames unopenable;
        // judge only the records that are actually there
        let records = msg.read_records(&keys);
        let opened: Vec<_> = records.iter().flatten().collect();
        let failure = opened.iter().any(|r| !r.success());

        if failure {
            let status = opened
                .iter()
                .filter(|r| !r.success())
                .fold(0u64, |acc, r| acc | r.status);
            log::warn!(
                "path {} build rejected: {}",
                self.short_name,
                status_to_string(status)
            );
            self.enter_state(PathStatus::Failed, now);
            StatusOutcome::Failed { status }
        } else if opened.len() == self.hops.len() {
            let latency_ms = now.saturating_sub(self.build_started);
            self.enter_state(PathStatus::Established, now);
            self.latency_ms = Some(latency_ms);
            self.mark_active(now);
            if let Some(hook) = self.hooks.on_built.as_mut() {
                hook(latency_ms);
            }
            StatusOutcome::Established { latency_ms }
        } else {
            // forged or truncated reply; the build timeout will judge it
            log::warn!(
                "path {} status reply opened {}/{} records, ignoring",
                self.short_name,
                opened.len(),
                self.hops.len()
            );
            StatusOutcome::Ignored
        }
    }

    /// Wrap a routing message for the first hop: pad, then add one onion
    /// layer per hop with the nonce mixed hop-to-hop. The wire carries the
    /// initial nonce; each relay peels with what it receives and forwards
    /// the mixed value.
    pub fn make_upstream(&self, msg: &RoutingMessage) -> Result<RelayUpstream> {
        let mut payload = msg.to_padded_bytes();
        let initial = TunnelNonce::random();
        let mut nonce = initial;
        for hop in &self.hops {
            nonce = crypto::onion_step(&mut payload, hop.shared_key()?, &nonce, &hop.nonce_xor);
        }
        Ok(RelayUpstream {
            path_id: self.rx_id(),
            nonce: initial,
            payload,
        })
    }

    /// Unwrap downstream traffic: mirror of [`make_upstream`], peeling one
    /// layer per hop with the nonce un-mixed before each. Dispatches the
    /// decoded message to the owner's hooks and returns it.
    pub fn handle_downstream(&mut self, msg: &RelayDownstream, now: u64) -> Result<RoutingMessage> {
        let mut payload = msg.payload.clone();
        let mut nonce = msg.nonce;
        for hop in &self.hops {
            nonce = nonce.mixed(&hop.nonce_xor);
            crypto::apply_stream(&mut payload, hop.shared_key()?, &nonce);
        }
        let decoded = RoutingMessage::from_padded_bytes(&payload)?;
        self.mark_active(now);
        self.dispatch_inbound(&decoded, now);
        Ok(decoded)
    }

    fn dispatch_inbound(&mut self, msg: &RoutingMessage, now: u64) {
        match msg {
            RoutingMessage::LatencyProbe { seq_no, sent_at } => {
                if let Some((expected, _)) = self.pending_probe {
                    if expected == *seq_no {
                        self.latency_ms = Some(now.saturating_sub(*sent_at));
                        self.pending_probe = None;
                        log::debug!(
                            "path {} latency {}ms",
                            self.short_name,
                            self.latency_ms.unwrap_or(0)
                        );
                    }
                }
            }
            RoutingMessage::ExitGrant { .. }
            | RoutingMessage::ExitReject { .. }
            | RoutingMessage::ExitUpdate { .. } => {
                if let Some(hook) = self.hooks.on_exit_update.as_mut() {
                    hook(msg);
                }
            }
            RoutingMessage::DataDiscard { dropped, .. } => {
                log::debug!("path {} peer discarded traffic for {dropped}", self.short_name);
            }
            _ => {
                if let Some(hook) = self.hooks.on_data.as_mut() {
                    hook(msg);
                }
            }
        }
    }

    /// Build a latency probe and remember it for correlation
    pub fn make_latency_probe(&mut self, now: u64) -> Result<RelayUpstream> {
        let seq_no = self.next_seq_no();
        self.pending_probe = Some((seq_no, now));
        self.last_probe_at = now;
        self.make_upstream(&RoutingMessage::LatencyProbe {
            seq_no,
            sent_at: now,
        })
    }

    /// Whether the owner should measure latency again
    pub fn latency_probe_due(&self, now: u64, interval_ms: u64) -> bool {
        self.pending_probe.is_none() && now >= self.last_probe_at + interval_ms
    }

    /// Introspection snapshot
    pub fn snapshot(&self, now: u64) -> serde_json::Value {
        json!({
            "name": self.short_name,
            "status": self.status.as_str(),
            "buildStarted": self.build_started,
            "expiresAt": self.expire_time(),
            "expired": self.expired(now),
            "ready": self.is_ready(now),
            "latencyMs": self.latency_ms,
            "lastRecv": self.last_recv,
            "role": self.role,
            "hops": self.hops.iter().map(|h| json!({
                "router": h.router_id().to_string(),
                "txid": h.tx_id.to_string(),
                "rxid": h.rx_id.to_string(),
                "lifetimeMs": h.lifetime_ms,
            })).collect::<Vec<_>>(),
        })
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("name", &self.short_name)
            .field("status", &self.status)
            .field("hops", &self.hops.len())
            .finish()
    }
}
