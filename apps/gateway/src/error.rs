//! Domain error types for the shard gateway
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All application code returns Result<T, GatewayError>.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gateway domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// On-call engineers can pattern-match on the variant to understand
/// the failure mode without parsing error message strings.
///
/// Example log output:
/// ```text
/// GatewayError::Decompress { shard_id: 3, .. }
/// → "zlib-stream inflate failed on shard 3"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The bootstrap call failed; the token is invalid or the API is unreachable.
    /// Fatal to cluster startup.
    #[error("invalid credential, cannot bootstrap the cluster")]
    BadCredential(#[source] BoxError),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested shard layout is impossible (empty, out of range, ...)
    #[error("invalid sharding: {0}")]
    InvalidSharding(String),

    /// Shard ID overflow: u64 value exceeds u32::MAX (Twilight API boundary)
    #[error("shard ID overflow: {value} exceeds u32::MAX")]
    ShardIdOverflow { value: u64 },

    /// Opening the gateway socket failed
    #[error("shard {shard_id} could not connect to {url}")]
    Connect {
        shard_id: u32,
        url: String,
        #[source]
        source: BoxError,
    },

    /// A single inbound frame could not be decoded
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// A single outbound payload could not be encoded
    #[error("payload encode failed: {0}")]
    Encode(String),

    /// The zlib-stream inflate context is corrupt
    #[error("zlib-stream inflate failed on shard {shard_id}")]
    Decompress {
        shard_id: u32,
        #[source]
        source: flate2::DecompressError,
    },

    /// Session store backend failure
    #[error("session store operation '{op}' failed for shard {shard_id}")]
    SessionStore {
        op: &'static str,
        shard_id: u32,
        #[source]
        source: BoxError,
    },

    /// Identify lock backend failure
    #[error("identify lock for bucket {bucket} failed")]
    IdentifyLock {
        bucket: u16,
        #[source]
        source: BoxError,
    },

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] BoxError),

    /// A command addressed a shard this process does not own
    #[error("shard {shard_id} is not owned by this process")]
    UnknownShard { shard_id: u32 },
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total` counter,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::BadCredential(_) => "bad_credential",
            Self::Config(_) => "config",
            Self::InvalidSharding(_) => "invalid_sharding",
            Self::ShardIdOverflow { .. } => "shard_overflow",
            Self::Connect { .. } => "connect",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Decompress { .. } => "decompress",
            Self::SessionStore { .. } => "session_store",
            Self::IdentifyLock { .. } => "identify_lock",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::UnknownShard { .. } => "unknown_shard",
        }
    }

    /// Startup failures abort the cluster; everything else is absorbed per shard.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BadCredential(_) | Self::Config(_) | Self::InvalidSharding(_) | Self::ShardIdOverflow { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> BoxError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    fn inflate_error() -> flate2::DecompressError {
        let mut inflate = flate2::Decompress::new(true);
        let mut out = Vec::with_capacity(64);
        inflate
            .decompress_vec(b"definitely not zlib", &mut out, flate2::FlushDecompress::Sync)
            .unwrap_err()
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::BadCredential(test_error()).error_type_label(),
            GatewayError::Config("test".to_string()).error_type_label(),
            GatewayError::InvalidSharding("test".to_string()).error_type_label(),
            GatewayError::ShardIdOverflow { value: u64::MAX }.error_type_label(),
            GatewayError::Connect {
                shard_id: 0,
                url: "wss://gateway.discord.gg".to_string(),
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::Decode("test".to_string()).error_type_label(),
            GatewayError::Encode("test".to_string()).error_type_label(),
            GatewayError::Decompress {
                shard_id: 0,
                source: inflate_error(),
            }
            .error_type_label(),
            GatewayError::SessionStore {
                op: "get",
                shard_id: 0,
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::IdentifyLock {
                bucket: 0,
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::NatsPublishFailed {
                subject: "test".to_string(),
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::NatsConnectionFailed(test_error()).error_type_label(),
            GatewayError::UnknownShard { shard_id: 7 }.error_type_label(),
        ];

        // All labels are unique
        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn error_messages_contain_context() {
        let err = GatewayError::Connect {
            shard_id: 3,
            url: "wss://gateway.discord.gg".to_string(),
            source: test_error(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"), "message should contain shard_id");
        assert!(msg.contains("wss://gateway.discord.gg"), "message should contain url");

        let err = GatewayError::NatsPublishFailed {
            subject: "events.ready".to_string(),
            source: test_error(),
        };
        assert!(err.to_string().contains("events.ready"));

        let err = GatewayError::IdentifyLock {
            bucket: 12,
            source: test_error(),
        };
        assert!(err.to_string().contains("bucket 12"));
    }

    #[test]
    fn only_startup_errors_are_fatal() {
        assert!(GatewayError::BadCredential(test_error()).is_fatal());
        assert!(GatewayError::InvalidSharding("empty".to_string()).is_fatal());
        assert!(!GatewayError::Decode("bad json".to_string()).is_fatal());
        assert!(!GatewayError::UnknownShard { shard_id: 1 }.is_fatal());
    }

    #[test]
    fn shard_id_overflow_at_boundary() {
        // u32::MAX should NOT overflow
        let val = u32::MAX as u64;
        assert!(u32::try_from(val).is_ok());

        // u32::MAX + 1 SHOULD overflow
        let val = u32::MAX as u64 + 1;
        assert!(u32::try_from(val).is_err());
    }
}
