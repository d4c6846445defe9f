//! Session lifecycle states and the reconnection policy.

use std::time::Duration;

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The microphone could not be opened. Carries the user-facing message.
    Capture(String),
    /// The offer/answer exchange failed before the first connection.
    Signaling(String),
    /// The peer connection failed before the first connection.
    Transport(String),
    /// The connection was lost too many times in a row.
    ReconnectExhausted { attempts: u32 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture(msg) => f.write_str(msg),
            Self::Signaling(msg) => write!(f, "Connection failed: {msg}"),
            Self::Transport(msg) => write!(f, "Connection failed: {msg}"),
            Self::ReconnectExhausted { .. } => f.write_str(
                "Failed to reconnect after multiple attempts. Please refresh the page.",
            ),
        }
    }
}

/// Observable session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    RequestingMedia,
    Negotiating,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Disconnected,
    Failed(FailureReason),
    Stopped,
}

impl SessionState {
    /// Whether a session (or an attempt at one) currently holds resources.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::RequestingMedia
                | Self::Negotiating
                | Self::Connecting
                | Self::Connected
                | Self::Reconnecting { .. }
        )
    }

    /// Short status line for display.
    pub fn status_text(&self) -> String {
        match self {
            Self::Idle => "Idle".to_owned(),
            Self::RequestingMedia => "Requesting microphone access...".to_owned(),
            Self::Negotiating => "Establishing connection...".to_owned(),
            Self::Connecting => "Connecting to AI service...".to_owned(),
            Self::Connected => "Connected: start speaking!".to_owned(),
            Self::Reconnecting { attempt } => format!("Reconnecting... (attempt {attempt})"),
            Self::Disconnected => "Disconnected".to_owned(),
            Self::Failed(FailureReason::ReconnectExhausted { .. }) => {
                "Connection Failed".to_owned()
            }
            Self::Failed(_) => "Error".to_owned(),
            Self::Stopped => "Stopping...".to_owned(),
        }
    }
}

/// Linear backoff bounded by an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

/// What to do after losing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Connection-loss bookkeeping for one session.
///
/// Every loss counts against the budget: a drop while connected and a failed
/// reconnection attempt alike. Reconnecting does not refund it; only
/// [`SessionMachine::on_stable`] (the connection stayed up long enough) or a
/// fresh start does. The loss that reaches `max_attempts` gives up.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    policy: ReconnectPolicy,
    attempts: u32,
    ever_connected: bool,
}

impl SessionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            ever_connected: false,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Consecutive losses since the last stable connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    pub fn on_connected(&mut self) {
        self.ever_connected = true;
    }

    /// The connection has stayed up long enough to count as recovered.
    pub fn on_stable(&mut self) {
        self.attempts = 0;
    }

    /// The connection was lost, or a reconnection attempt failed.
    pub fn on_connection_lost(&mut self) -> ReconnectDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }

    /// Forget everything, as for a fresh `start`.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.ever_connected = false;
    }
}
