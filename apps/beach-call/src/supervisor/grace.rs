use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::task::ScheduledTask;

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_WAITING_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    GraceExpired { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLossOutcome {
    GraceWindowStarted,
    AlreadyWaiting,
    /// The first negotiation never completed, so there is nothing to resume.
    NotYetConnected,
}

/// Watches peer presence once a call has connected and bounds how long a
/// vanished peer may take to come back.
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    grace_window: Duration,
    tick_interval: Duration,
    ever_connected: bool,
    generation: u64,
    window: Option<ScheduledTask>,
    ticker: Option<ScheduledTask>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ReconnectionSupervisor {
    pub fn new(
        grace_window: Duration,
        tick_interval: Duration,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            grace_window,
            tick_interval,
            ever_connected: false,
            generation: 0,
            window: None,
            ticker: None,
            events,
        }
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    pub fn is_waiting(&self) -> bool {
        self.window.is_some()
    }

    /// Records a successful connection. Returns true if a pending window was cancelled.
    pub fn mark_connected(&mut self) -> bool {
        self.ever_connected = true;
        self.cancel_window("ice connected")
    }

    pub fn peer_left(&mut self) -> PeerLossOutcome {
        if !self.ever_connected {
            tracing::debug!(
                target = "supervisor",
                "peer left before first connection; no grace window"
            );
            return PeerLossOutcome::NotYetConnected;
        }
        if self.window.is_some() {
            return PeerLossOutcome::AlreadyWaiting;
        }

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        self.window = Some(ScheduledTask::after(
            "reconnection-window",
            self.grace_window,
            async move {
                let _ = events.send(SupervisorEvent::GraceExpired { generation });
            },
        ));

        let deadline = Instant::now() + self.grace_window;
        self.ticker = Some(ScheduledTask::every(
            "reconnection-tick",
            self.tick_interval,
            move || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tracing::info!(
                    target = "supervisor",
                    generation,
                    remaining_secs = remaining.as_secs(),
                    "still waiting for peer to return"
                );
                !remaining.is_zero()
            },
        ));

        tracing::info!(
            target = "supervisor",
            generation,
            grace_secs = self.grace_window.as_secs(),
            "peer left; reconnection window opened"
        );
        PeerLossOutcome::GraceWindowStarted
    }

    /// PEER_JOINED arrived. Returns true if a pending window was cancelled.
    pub fn peer_returned(&mut self) -> bool {
        self.cancel_window("peer rejoined")
    }

    /// Consumes an expiry notice. Stale notices from a cancelled window are rejected.
    pub fn accept_expiry(&mut self, generation: u64) -> bool {
        if self.window.is_none() || generation != self.generation {
            tracing::debug!(
                target = "supervisor",
                generation,
                current = self.generation,
                "ignoring stale reconnection expiry"
            );
            return false;
        }
        self.window = None;
        if let Some(mut ticker) = self.ticker.take() {
            ticker.cancel();
        }
        tracing::warn!(
            target = "supervisor",
            generation,
            "reconnection window elapsed without peer"
        );
        true
    }

    pub fn cancel_all(&mut self) {
        self.cancel_window("teardown");
    }

    fn cancel_window(&mut self, reason: &'static str) -> bool {
        let Some(mut window) = self.window.take() else {
            return false;
        };
        window.cancel();
        if let Some(mut ticker) = self.ticker.take() {
            ticker.cancel();
        }
        self.generation += 1;
        tracing::info!(
            target = "supervisor",
            reason,
            "reconnection window cancelled"
        );
        true
    }
}
