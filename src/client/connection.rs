//! Connection state machine and reconnect policy
//!
//! Pure transition logic lives in [`ConnectionManager::determine_next_state`]
//! and [`ConnectionManager::decide_reconnection`]; the manager itself only
//! records the current state, publishes it on a `watch` channel and keeps the
//! cancelable retry deadline the engine sleeps on.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Connected and ready for publish/subscribe
    Connected,
    /// Last attempt failed, a retry is scheduled
    Reconnecting,
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    RetryTimerFired,
    AttemptSucceeded,
    AttemptFailed { will_retry: bool },
    TransportLost,
    DisconnectRequested,
    RetriesExhausted,
}

/// Reconnect configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    /// Fixed delay between attempts once `backoff_pattern` is exhausted
    pub reconnect_timeout: Duration,
    /// Optional per-attempt delays tried before falling back to `reconnect_timeout`
    pub backoff_pattern: Vec<Duration>,
    /// Maximum attempts per outage (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_timeout: Duration::from_secs(5),
            backoff_pattern: Vec::new(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects on its own
    pub fn manual() -> Self {
        Self {
            auto_reconnect: false,
            ..Self::default()
        }
    }

    /// Fixed-delay policy
    pub fn fixed(reconnect_timeout: Duration) -> Self {
        Self {
            reconnect_timeout,
            ..Self::default()
        }
    }

    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.reconnect_timeout)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.auto_reconnect && self.reconnect_timeout.is_zero() {
            return Err("reconnect timeout must be greater than zero".to_string());
        }
        if self.max_attempts == Some(0) {
            return Err("max attempts must be greater than zero when set".to_string());
        }
        Ok(())
    }
}

/// Outcome of asking whether to reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortDisabled,
    AbortMaxAttemptsExceeded,
}

/// Owner of the connection state
#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
    retry_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                state: ConnectionState::Disconnected,
                policy,
                attempts: 0,
                retry_at: None,
                state_tx,
            },
            state_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts made during the current outage
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Next state for an event (pure function)
    pub fn determine_next_state(
        current: ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;
        match (current, event) {
            (Connected, ConnectionEvent::ConnectRequested) => Connected,
            (_, ConnectionEvent::ConnectRequested) => Connecting,
            (Connected, ConnectionEvent::RetryTimerFired) => Connected,
            (_, ConnectionEvent::RetryTimerFired) => Connecting,
            (_, ConnectionEvent::AttemptSucceeded) => Connected,
            (_, ConnectionEvent::AttemptFailed { will_retry: true }) => Reconnecting,
            (_, ConnectionEvent::AttemptFailed { will_retry: false }) => Disconnected,
            (_, ConnectionEvent::TransportLost) => Disconnected,
            (_, ConnectionEvent::DisconnectRequested) => Disconnected,
            (_, ConnectionEvent::RetriesExhausted) => Disconnected,
        }
    }

    /// Whether another attempt should be scheduled (pure function)
    pub fn decide_reconnection(policy: &ReconnectPolicy, attempts_so_far: u32) -> ReconnectionDecision {
        if !policy.auto_reconnect {
            return ReconnectionDecision::AbortDisabled;
        }
        if let Some(max_attempts) = policy.max_attempts {
            if attempts_so_far >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }
        let attempt = attempts_so_far + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.delay_for(attempt),
        }
    }

    /// Apply an event, publish the new state and return it
    pub fn transition(&mut self, event: ConnectionEvent) -> ConnectionState {
        let next = Self::determine_next_state(self.state, event);
        if next != self.state {
            Self::log_state_transition(self.state, next);
            self.state = next;
            self.state_tx.send_replace(next);
        }
        if next == ConnectionState::Connected {
            self.attempts = 0;
        }
        next
    }

    /// Arm the retry timer if the policy allows another attempt
    pub fn schedule_retry(&mut self) -> ReconnectionDecision {
        let decision = Self::decide_reconnection(&self.policy, self.attempts);
        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.attempts = attempt;
                self.retry_at = Some(Instant::now() + delay);
                let max_display = self
                    .policy
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Scheduling reconnection attempt {}/{} in {}ms",
                    attempt,
                    max_display,
                    delay.as_millis()
                );
            }
            ReconnectionDecision::AbortDisabled => {
                debug!("Auto-reconnect disabled, staying disconnected");
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                warn!(attempts = self.attempts, "Reconnection attempts exhausted");
            }
        }
        decision
    }

    /// Disarm the retry timer; returns whether one was pending
    pub fn cancel_retry(&mut self) -> bool {
        self.retry_at.take().is_some()
    }

    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (_, ConnectionState::Connected) => info!(?from, "Connection established"),
            (ConnectionState::Connected, _) => warn!(?to, "Connection lost or closed"),
            _ => debug!(?from, ?to, "Connection state transition"),
        }
    }
}
