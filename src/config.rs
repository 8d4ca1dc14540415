//! Configuration for Lectern
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Fallback HMAC secret for development mode. Refused in production.
pub const DEV_SECRET: &str = "dev-only-insecure-session-secret";

/// Minimum acceptable length of the HMAC secret in production
const MIN_SECRET_LEN: usize = 32;

/// Lectern - session gateway for teacher-run classroom activities
#[derive(Parser, Debug, Clone)]
#[command(name = "lectern")]
#[command(about = "Session persistence and coordination gateway for classroom activities")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Valkey (Redis-protocol) connection URL.
    /// When unset, sessions live in an in-process store (single instance only).
    #[arg(long, env = "VALKEY_URL")]
    pub valkey_url: Option<String>,

    /// Session time-to-live in milliseconds
    #[arg(long, env = "SESSION_TTL_MS", default_value = "1800000")]
    pub session_ttl_ms: u64,

    /// Server-wide HMAC key for persistent-link hashes.
    /// Required in production; must be at least 32 characters and not the dev default.
    #[arg(long, env = "PERSISTENT_SESSION_SECRET")]
    pub persistent_session_secret: Option<String>,

    /// Enable development mode (relaxes the secret requirement, verbose auth logging)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum number of sessions held in the write-back cache
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value = "1000")]
    pub cache_max_entries: usize,

    /// How long a cache entry is served without consulting the store, in milliseconds
    #[arg(long, env = "CACHE_TTL_MS", default_value = "10000")]
    pub cache_ttl_ms: u64,

    /// Interval between write-back flushes of dirty cache entries, in milliseconds
    #[arg(long, env = "CACHE_FLUSH_INTERVAL_MS", default_value = "5000")]
    pub cache_flush_interval_ms: u64,

    /// Interval between liveness pings on open WebSocket connections, in milliseconds
    #[arg(long, env = "WS_PING_INTERVAL_MS", default_value = "30000")]
    pub ws_ping_interval_ms: u64,

    /// Grace period before a disconnected socket's session is cleaned up, in milliseconds
    #[arg(long, env = "CLEANUP_GRACE_MS", default_value = "5000")]
    pub cleanup_grace_ms: u64,
}

impl Args {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cache_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cache_flush_interval_ms)
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_millis(self.ws_ping_interval_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    /// Get the effective HMAC secret (falls back to an insecure default in dev mode)
    pub fn persistent_session_secret(&self) -> String {
        match &self.persistent_session_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("PERSISTENT_SESSION_SECRET not set, using insecure dev default");
                DEV_SECRET.to_string()
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            match &self.persistent_session_secret {
                None => {
                    return Err("PERSISTENT_SESSION_SECRET is required in production mode".into());
                }
                Some(secret) if secret == DEV_SECRET => {
                    return Err(
                        "PERSISTENT_SESSION_SECRET must not be the development default".into(),
                    );
                }
                Some(secret) if secret.len() < MIN_SECRET_LEN => {
                    return Err(format!(
                        "PERSISTENT_SESSION_SECRET must be at least {MIN_SECRET_LEN} characters"
                    ));
                }
                Some(_) => {}
            }
        }

        if self.session_ttl_ms == 0 {
            return Err("SESSION_TTL_MS must be positive".into());
        }

        if self.cache_flush_interval_ms == 0 || self.cache_ttl_ms == 0 {
            return Err("cache intervals must be positive".into());
        }

        if self.cache_max_entries == 0 {
            return Err("CACHE_MAX_ENTRIES must be positive".into());
        }

        // A dirty entry must get a flush opportunity before it can go stale.
        if self.cache_flush_interval_ms > self.cache_ttl_ms {
            return Err("CACHE_FLUSH_INTERVAL_MS must not exceed CACHE_TTL_MS".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["lectern"])
    }

    #[test]
    fn test_production_requires_secret() {
        let args = base_args();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_production_rejects_short_secret() {
        let mut args = base_args();
        args.persistent_session_secret = Some("short".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_production_rejects_dev_default() {
        let mut args = base_args();
        args.persistent_session_secret = Some(DEV_SECRET.to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_production_accepts_long_secret() {
        let mut args = base_args();
        args.persistent_session_secret = Some("a".repeat(MIN_SECRET_LEN));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_dev_mode_allows_missing_secret() {
        let mut args = base_args();
        args.dev_mode = true;
        assert!(args.validate().is_ok());
        assert_eq!(args.persistent_session_secret(), DEV_SECRET);
    }

    #[test]
    fn test_flush_interval_bounded_by_cache_ttl() {
        let mut args = base_args();
        args.dev_mode = true;
        args.cache_flush_interval_ms = 60_000;
        args.cache_ttl_ms = 10_000;
        assert!(args.validate().is_err());
    }
}
