//! veilnet: anonymity-network router core
//!
//! The path-construction and relay-forwarding engine of an onion-routed
//! overlay: clients build multi-hop encrypted paths through other routers
//! hop by hop, each hop learning only its immediate neighbors, and every
//! router relays control and data traffic for the paths it participates
//! in. This crate is the core engine only; the node database, link/session
//! transport, DHT, exit handling and configuration are external
//! collaborators consumed through traits.
//!
//! - [`builder::Builder`] keeps a pool of established [`path::Path`]s
//! - [`pipeline`] runs the per-hop key exchange on the worker pool
//! - [`context::PathContext`] is the process-wide registry: transit hops,
//!   owned paths, admission, forwarding
//! - [`transit::TransitHop`] is one router's share of someone else's path
//! - [`messages`] and [`frame`] define the fixed-size wire structures
//!
//! Anonymity invariants the wire layer upholds: build requests and status
//! replies always carry exactly [`MAX_HOPS`] frames regardless of the real
//! hop count, every frame of a given role is byte-length identical no
//! matter which optional fields it carries, and frames that fail to open
//! are dropped without a reply.

pub mod builder;
pub mod contact;
pub mod context;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod hop;
pub mod link;
pub mod messages;
pub mod nodedb;
pub mod path;
pub mod pipeline;
pub mod profiling;
pub mod routing;
pub mod runtime;
pub mod transit;

pub use builder::{Builder, BuilderConfig, BuildStats};
pub use contact::{PathId, RouterContact, RouterId};
pub use context::{PathContext, RouterParams, TransitConfig};
pub use error::{Result, VeilError};
pub use link::{LinkLayer, SendStatus};
pub use messages::{BuildRequest, LinkMessage, StatusCode, StatusMessage};
pub use nodedb::{MemNodeDb, NodeDb};
pub use path::{Path, PathStatus};
pub use profiling::{MemRouterProfile, RouterProfile};
pub use routing::{RoutingHandler, RoutingMessage};
pub use runtime::{Clock, Logic, ManualClock, SystemClock, WorkerPool};
pub use transit::{TransitHop, TransitHopInfo};

/// Fewest hops a path may have
pub const MIN_HOPS: usize = 2;

/// Most hops a path may have; also the fixed frame count of build
/// requests and status replies
pub const MAX_HOPS: usize = 8;

/// Default path/hop lifetime
pub const DEFAULT_LIFETIME_MS: u64 = 10 * 60 * 1000;

/// Shortest honored hop lifetime
pub const MIN_LIFETIME_MS: u64 = 10 * 1000;

/// How long a build may wait for its status reply
pub const BUILD_TIMEOUT_MS: u64 = 30 * 1000;

/// Extra time link sessions outlive the hops that use them
pub const SESSION_GRACE_MS: u64 = 10 * 1000;

/// Builder cooldown floor; also the linear backoff increment
pub const MIN_BUILD_INTERVAL_MS: u64 = 500;

/// Builder cooldown ceiling
pub const MAX_BUILD_INTERVAL_MS: u64 = 30 * 1000;

/// Routing messages are padded to a multiple of this before encryption
pub const PAD_SIZE: usize = 128;

/// How often established paths get a latency probe
pub const LATENCY_INTERVAL_MS: u64 = 20 * 1000;
