use std::time::Duration;

use serde::Deserialize;

use crate::signaling::RetryPolicy;
use crate::utils::{ConnectionType, STUN_SERVER};
use crate::Result;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:9001/ws";
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Covers the full default reconnect schedule of the signaling client.
pub const DEFAULT_PEER_REJOIN_GRACE: Duration = Duration::from_secs(20);

/// Per-deployment call settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    /// Relay endpoint, `roomId` and `userId` are appended as query parameters.
    pub signaling_url: String,
    /// How long an invite rings before it is marked missed.
    pub ring_timeout: Duration,
    /// How long an accepted call may stay connecting before it fails.
    pub connect_timeout: Duration,
    /// How long a peer whose media link is still up may stay out of the room
    /// before the link is dropped.
    pub peer_rejoin_grace: Duration,
    pub retry: RetryPolicy,
    pub connection_type: ConnectionType,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            ring_timeout: DEFAULT_RING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            peer_rejoin_grace: DEFAULT_PEER_REJOIN_GRACE,
            retry: RetryPolicy::default(),
            connection_type: ConnectionType::default(),
        }
    }
}

impl CallConfig {
    /// Reads `PEERCALL_*` variables from the process environment, falling back
    /// to the defaults for everything that is not set.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] when a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`CallConfig::from_env`] over an explicit set of variables.
    ///
    /// # Errors
    /// Returns [`crate::Error::Config`] when a variable cannot be parsed.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env: Env = envy::prefixed("PEERCALL_").from_iter(vars)?;
        Ok(env.into())
    }
}

#[derive(Deserialize, Debug)]
struct Env {
    signaling_url: Option<String>,
    ring_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    peer_rejoin_grace_secs: Option<u64>,
    reconnect_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_multiplier: Option<u32>,
    #[serde(default)]
    ice_local: bool,
    stun_url: Option<String>,
    turn_url: Option<String>,
    turn_username: Option<String>,
    turn_credential: Option<String>,
}

impl From<Env> for CallConfig {
    fn from(env: Env) -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            max_attempts: env
                .reconnect_attempts
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: env
                .reconnect_base_delay_ms
                .map_or(defaults.retry.base_delay, Duration::from_millis),
            multiplier: env
                .reconnect_multiplier
                .unwrap_or(defaults.retry.multiplier),
        };
        let stun_url = env.stun_url.unwrap_or_else(|| STUN_SERVER.to_owned());
        let connection_type = match (env.turn_url, env.turn_username, env.turn_credential) {
            _ if env.ice_local => ConnectionType::Local,
            (Some(turn_url), Some(username), Some(credential)) => ConnectionType::StunAndTurn {
                stun_url,
                turn_url,
                username,
                credential,
            },
            _ => ConnectionType::Stun { url: stun_url },
        };
        Self {
            signaling_url: env.signaling_url.unwrap_or(defaults.signaling_url),
            ring_timeout: env
                .ring_timeout_secs
                .map_or(defaults.ring_timeout, Duration::from_secs),
            connect_timeout: env
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            peer_rejoin_grace: env
                .peer_rejoin_grace_secs
                .map_or(defaults.peer_rejoin_grace, Duration::from_secs),
            retry,
            connection_type,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|&(key, value)| (key.to_owned(), value.to_owned()))
            .collect()
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = CallConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config, CallConfig::default());
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = CallConfig::from_vars(vars(&[
            ("PEERCALL_SIGNALING_URL", "wss://relay.example.org/ws"),
            ("PEERCALL_RING_TIMEOUT_SECS", "45"),
            ("PEERCALL_RECONNECT_ATTEMPTS", "3"),
            ("PEERCALL_RECONNECT_BASE_DELAY_MS", "250"),
            ("PEERCALL_PEER_REJOIN_GRACE_SECS", "8"),
            ("UNRELATED", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.org/ws");
        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.multiplier, 2);
        assert_eq!(config.peer_rejoin_grace, Duration::from_secs(8));
    }

    #[test]
    fn test_turn_requires_all_credentials() {
        let partial = CallConfig::from_vars(vars(&[(
            "PEERCALL_TURN_URL",
            "turn:turn.example.org",
        )]))
        .unwrap();
        assert!(matches!(partial.connection_type, ConnectionType::Stun { .. }));

        let full = CallConfig::from_vars(vars(&[
            ("PEERCALL_TURN_URL", "turn:turn.example.org"),
            ("PEERCALL_TURN_USERNAME", "alice"),
            ("PEERCALL_TURN_CREDENTIAL", "secret"),
        ]))
        .unwrap();
        assert!(matches!(
            full.connection_type,
            ConnectionType::StunAndTurn { .. }
        ));
    }

    #[test]
    fn test_unparsable_value_is_a_config_error() {
        let error = CallConfig::from_vars(vars(&[("PEERCALL_RING_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }
}
