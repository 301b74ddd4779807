//! Session state management.
//!
//! Contains the Hub (shared server state) and the components it owns.

pub mod breaker;
pub mod connection;
mod dashmap_ext;
pub mod heartbeat;
pub mod hub;
pub mod presence;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod tabs;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dashmap_ext::DashMapExt;
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatPhase, HeartbeatState, IdleChange};
pub use hub::{
    ActionHandler, ActionOutcome, ActionRequest, Hub, HubStats, LoggingActionHandler, SweepReport,
};
pub use presence::{PresenceEvent, PresenceManager, PresenceState, UserSession};
pub use queue::{DeliveryQueue, ExpiryReason, FlushHalt, FlushOutcome, MessageState, QueuedMessage};
pub use reconnect::{Backoff, ReconnectAttempt, ReconnectPolicy, ReconnectTracker};
pub use registry::{ConnectionObserver, ConnectionRegistry, Registration};
pub use tabs::{SharedStateSnapshot, TabCoordinator, TabEvent, TabRegistered, TabRegistration, TabUnregistered};
