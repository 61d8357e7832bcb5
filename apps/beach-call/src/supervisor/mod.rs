//! Timer-driven supervision: the reconnection grace window, its waiting tick,
//! the transport retry budget, and the cancellable task primitive they share
//! with the transport heartbeat.

pub mod grace;
pub mod reconnect;
pub mod task;

pub use grace::{
    DEFAULT_GRACE_WINDOW, DEFAULT_WAITING_TICK, PeerLossOutcome, ReconnectionSupervisor,
    SupervisorEvent,
};
pub use reconnect::{MAX_RECONNECT_ATTEMPTS, ReconnectBudget, ReconnectDecision};
pub use task::ScheduledTask;
