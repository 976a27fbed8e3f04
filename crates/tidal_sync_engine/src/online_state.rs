//! Connectivity state tracking.
//!
//! The tracker turns raw watch stream outcomes into a coarse
//! [`OnlineState`]. A single failed connection does not flip the client to
//! Offline; it takes [`OnlineStateConfig::max_watch_stream_failures`]
//! consecutive failures, or a connection attempt that stays silent past
//! [`OnlineStateConfig::online_state_timeout`].

use crate::config::OnlineStateConfig;
use crate::timer::{DelayedOperation, Scheduler, TimerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tidal_sync_protocol::Status;
use tracing::{debug, warn};

/// Coarse network connectivity as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineState {
    /// Connectivity has not been established either way.
    Unknown,
    /// The watch stream is delivering messages.
    Online,
    /// Connection attempts keep failing.
    Offline,
}

impl fmt::Display for OnlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnlineState::Unknown => "unknown",
            OnlineState::Online => "online",
            OnlineState::Offline => "offline",
        })
    }
}

/// Tri-state connectivity machine with failure hysteresis.
///
/// Every transition method returns the new state only if it differs from the
/// previous one, so callers publish each distinct value once.
#[derive(Debug)]
pub struct OnlineStateTracker {
    config: OnlineStateConfig,
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    /// Creates a tracker in the Unknown state.
    pub fn new(config: OnlineStateConfig) -> Self {
        Self {
            config,
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            should_warn_client_is_offline: true,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Returns the consecutive failure count.
    pub fn watch_stream_failures(&self) -> u32 {
        self.watch_stream_failures
    }

    /// Returns true while the connection attempt timeout is armed.
    pub fn has_online_state_timer(&self) -> bool {
        self.online_state_timer.is_some()
    }

    /// Records that a watch stream start attempt began.
    ///
    /// Never changes the state. On a first attempt that is not already
    /// Online, arms the connection attempt timeout.
    pub fn handle_watch_stream_start(&mut self, scheduler: &dyn Scheduler) {
        if self.watch_stream_failures != 0 || self.state == OnlineState::Online {
            return;
        }
        let Some(timeout) = self.config.online_state_timeout else {
            return;
        };
        if self.online_state_timer.is_none() {
            debug!(timeout_ms = timeout.as_millis() as u64, "Arming online state timeout");
            self.online_state_timer =
                Some(scheduler.enqueue_after_delay(TimerId::OnlineStateTimeout, timeout));
        }
    }

    /// Handles expiry of the connection attempt timeout.
    pub fn handle_online_state_timeout(&mut self) -> Option<OnlineState> {
        self.online_state_timer = None;
        let timeout = self.config.online_state_timeout.unwrap_or_default();
        self.log_client_offline_warning_if_necessary(&format!(
            "backend didn't respond within {} seconds",
            timeout.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Records a failed watch stream connection.
    ///
    /// Below the failure threshold the state is kept.
    pub fn handle_watch_stream_failure(&mut self, status: &Status) -> Option<OnlineState> {
        self.watch_stream_failures += 1;
        debug!(
            failures = self.watch_stream_failures,
            status = %status,
            "Watch stream failed"
        );
        if self.watch_stream_failures >= self.config.max_watch_stream_failures {
            self.clear_online_state_timer();
            self.log_client_offline_warning_if_necessary(&format!(
                "connection failed {} times, most recent error: {}",
                self.config.max_watch_stream_failures, status
            ));
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicitly transitions to `state`.
    ///
    /// Cancels the connection attempt timeout and resets the failure count.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = true;
        }
        self.set_and_broadcast(state)
    }

    /// Cancels any armed timer.
    pub fn shutdown(&mut self) {
        self.clear_online_state_timer();
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        debug!(from = %self.state, to = %state, "Online state changed");
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning_if_necessary(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            warn!(
                details,
                "Could not reach the backend; the client will operate in offline mode until a connection succeeds"
            );
            self.should_warn_client_is_offline = false;
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }
}
