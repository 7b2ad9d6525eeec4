//! Client and session configuration.

use flexsync_protocol::{ProtocolEnvelope, SessionReason};
use rand::Rng;
use std::time::Duration;

/// Whether the client reconnects on its own after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectMode {
    /// Reconnect after the backoff delay.
    #[default]
    Normal,
    /// Never reconnect automatically; wait for `cancel_reconnect_delay`.
    Testing,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per failed attempt.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl ReconnectBackoff {
    /// Creates a backoff starting at `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before reconnect attempt `attempt` (0 = first connection).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay + jitter)
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Configuration of a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconnect behavior.
    pub reconnect_mode: ReconnectMode,
    /// Delays between reconnect attempts.
    pub reconnect_backoff: ReconnectBackoff,
    /// Give every session its own connection instead of sharing one per
    /// server endpoint.
    pub one_connection_per_session: bool,
    /// How long a connection may take to establish.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            reconnect_mode: ReconnectMode::Normal,
            reconnect_backoff: ReconnectBackoff::default(),
            one_connection_per_session: false,
            connect_timeout: Duration::from_secs(120),
        }
    }

    /// Sets the reconnect mode.
    pub fn with_reconnect_mode(mut self, mode: ReconnectMode) -> Self {
        self.reconnect_mode = mode;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Gives each session a dedicated connection.
    pub fn with_one_connection_per_session(mut self, enabled: bool) -> Self {
        self.one_connection_per_session = enabled;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Default size of one bootstrap integration batch.
pub const DEFAULT_FLX_BOOTSTRAP_BATCH_SIZE: usize = 1024 * 1024;

/// Configuration of a [`Session`](crate::Session), fixed at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server host name or address.
    pub server_address: String,
    /// Server port; 0 selects the envelope's default port.
    pub server_port: u16,
    /// Virtual path of the server-side file.
    pub realm_identifier: String,
    /// Transport envelope.
    pub protocol_envelope: ProtocolEnvelope,
    /// Access token.
    pub signed_user_token: String,
    /// Largest amount of bootstrap data integrated in one transaction.
    pub flx_bootstrap_batch_size_bytes: usize,
    /// Fail the next integration of downloaded changesets (testing only).
    pub simulate_integration_error: bool,
    /// Why the session is opened.
    pub session_reason: SessionReason,
}

impl SessionConfig {
    /// Creates a configuration for `realm_identifier` on `server_address`.
    pub fn new(server_address: impl Into<String>, realm_identifier: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            server_port: 0,
            realm_identifier: realm_identifier.into(),
            protocol_envelope: ProtocolEnvelope::Realm,
            signed_user_token: String::new(),
            flx_bootstrap_batch_size_bytes: DEFAULT_FLX_BOOTSTRAP_BATCH_SIZE,
            simulate_integration_error: false,
            session_reason: SessionReason::Sync,
        }
    }

    /// Sets the server port.
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Sets the envelope.
    pub fn with_protocol_envelope(mut self, envelope: ProtocolEnvelope) -> Self {
        self.protocol_envelope = envelope;
        self
    }

    /// Sets the access token.
    pub fn with_signed_user_token(mut self, token: impl Into<String>) -> Self {
        self.signed_user_token = token.into();
        self
    }

    /// Sets the bootstrap batch size.
    pub fn with_flx_bootstrap_batch_size_bytes(mut self, bytes: usize) -> Self {
        self.flx_bootstrap_batch_size_bytes = bytes;
        self
    }

    /// Enables integration fault injection.
    pub fn with_simulate_integration_error(mut self, enabled: bool) -> Self {
        self.simulate_integration_error = enabled;
        self
    }

    /// Sets the session reason.
    pub fn with_session_reason(mut self, reason: SessionReason) -> Self {
        self.session_reason = reason;
        self
    }

    /// The port to connect to.
    pub fn effective_port(&self) -> u16 {
        if self.server_port == 0 {
            self.protocol_envelope.default_port()
        } else {
            self.server_port
        }
    }
}
