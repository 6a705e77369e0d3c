//! TabSync - Cross-Instance Session Coordination
//!
//! Keeps several independent instances of one application (browser tabs of
//! the same origin, or anything sharing a broadcast medium) in agreement
//! without a server round-trip per instance.
//!
//! # Architecture
//!
//! Each instance owns a `Store` of state modules. A `CoordinationBus`
//! elects one leader among the instances and replicates the broadcast-
//! eligible operations of every shareable module over one channel per
//! module. The session logic uses the leader to hand an existing sign-in
//! to newly opened instances.
//!
//! # Features
//!
//! - Apply/tell/death leader election with dual-leader repair
//! - Per-module replication with echo and duplicate suppression
//! - Leader-answered session hand-over with a bounded wait
//! - Bearer-token API client with a single 401 retry
//! - In-memory broadcast hub for tests and simulation

pub mod config;
pub mod error;
pub mod id;
pub mod deferred;
pub mod transport;
pub mod store;
pub mod channel;
pub mod bus;
pub mod identity;
pub mod session;
pub mod telemetry;
pub mod api;
pub mod instance;

pub use config::TabSyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TabSyncConfig;
    pub use crate::error::{Error, Result};
    pub use crate::deferred::{BoundedDeferred, Settlement};
    pub use crate::transport::{Action, BroadcastTransport, ChannelHandle, Envelope, MemoryHub};
    pub use crate::store::{ModuleDefinition, Origin, StateModule, Store};
    pub use crate::bus::{BusConfig, CoordinationBus};
    pub use crate::identity::IdentityProvider;
    pub use crate::session::{SessionPhase, SessionSync};
    pub use crate::instance::Instance;
    pub use crate::id::InstanceId;
}
