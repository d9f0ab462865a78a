//! Key rotation and caching policy.

use std::time::Duration;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Controls key expiry, cache behavior, and adapter timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptoPolicy {
    /// Age after which SKs and IKs are no longer used for new encryptions.
    pub expire_key_after_secs: i64,

    /// How long a cached key is trusted before re-reading it from the
    /// metastore (to observe revocation or newer versions).
    pub revoke_check_interval_secs: i64,

    /// New key timestamps are truncated to this precision so concurrent
    /// creators collide on the same `(id, created)`.
    pub create_date_precision_secs: i64,

    pub cache_system_keys: bool,
    pub cache_intermediate_keys: bool,

    pub cache_sessions: bool,
    pub session_cache_max_size: usize,
    /// Idle time after which a cached session is discarded.
    pub session_cache_duration_secs: i64,

    /// Upper bound on any single KMS or metastore call.
    pub adapter_timeout: Option<Duration>,
}

impl Default for CryptoPolicy {
    fn default() -> Self {
        Self {
            expire_key_after_secs: 90 * DAY_SECS,
            revoke_check_interval_secs: 60 * 60,
            create_date_precision_secs: 60,
            cache_system_keys: true,
            cache_intermediate_keys: true,
            cache_sessions: true,
            session_cache_max_size: 1000,
            session_cache_duration_secs: 2 * 60 * 60,
            adapter_timeout: None,
        }
    }
}

impl CryptoPolicy {
    pub fn is_key_expired(&self, created: i64, now: i64) -> bool {
        now - created >= self.expire_key_after_secs
    }

    pub fn needs_recheck(&self, loaded_at: i64, now: i64) -> bool {
        now - loaded_at >= self.revoke_check_interval_secs
    }

    /// Timestamp for a newly created SK or IK.
    pub fn new_key_timestamp(&self, now: i64) -> i64 {
        if self.create_date_precision_secs <= 1 {
            return now;
        }
        now - now.rem_euclid(self.create_date_precision_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = CryptoPolicy::default();
        assert_eq!(policy.expire_key_after_secs, 7_776_000);
        assert_eq!(policy.revoke_check_interval_secs, 3600);
        assert_eq!(policy.session_cache_max_size, 1000);
        assert_eq!(policy.session_cache_duration_secs, 7200);
        assert!(policy.adapter_timeout.is_none());
    }

    #[test]
    fn expiry_boundary() {
        let policy = CryptoPolicy {
            expire_key_after_secs: 100,
            ..CryptoPolicy::default()
        };
        assert!(!policy.is_key_expired(1000, 1099));
        assert!(policy.is_key_expired(1000, 1100));
    }

    #[test]
    fn new_key_timestamp_truncates() {
        let policy = CryptoPolicy::default();
        assert_eq!(policy.new_key_timestamp(1_700_000_059), 1_700_000_040);

        let exact = CryptoPolicy {
            create_date_precision_secs: 0,
            ..CryptoPolicy::default()
        };
        assert_eq!(exact.new_key_timestamp(1_700_000_059), 1_700_000_059);
    }
}
