//! Admission rate limiting.
//!
//! One governor token bucket per client IP, checked before the WebSocket
//! upgrade so a reconnect storm from one address cannot starve the rest.

use dashmap::DashMap;
use governor::{Quota, RateLimiter as GovRateLimiter};
use nonzero_ext::nonzero;
use std::net::IpAddr;
use std::num::NonZeroU32;
use tracing::debug;

use crate::config::LimitsConfig;

/// Type alias for governor's direct rate limiter.
type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Limiter tables kept before a sweep clears them.
const MAX_ENTRIES: usize = 10_000;

#[derive(Debug)]
pub struct AdmissionLimiter {
    connection_limiters: DashMap<IpAddr, DirectRateLimiter>,
    quota: Quota,
}

impl AdmissionLimiter {
    pub fn new(limits: &LimitsConfig) -> Self {
        let rate = NonZeroU32::new(limits.connection_rate_per_second).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(limits.connection_burst_per_ip).unwrap_or(nonzero!(3u32));
        Self {
            connection_limiters: DashMap::new(),
            quota: Quota::per_second(rate).allow_burst(burst),
        }
    }

    /// Check if `ip` may open a new connection.
    ///
    /// Returns `true` if allowed, `false` if rate limited.
    pub fn check_connection_rate(&self, ip: IpAddr) -> bool {
        if self.connection_limiters.len() > MAX_ENTRIES {
            self.connection_limiters.clear();
            debug!("cleared connection rate limiters (exceeded {} entries)", MAX_ENTRIES);
        }

        let limiter = self
            .connection_limiters
            .entry(ip)
            .or_insert_with(|| GovRateLimiter::direct(self.quota));

        let allowed = limiter.check().is_ok();
        if !allowed {
            debug!(ip = %ip, "connection rate limit exceeded");
        }
        allowed
    }

    pub fn tracked(&self) -> usize {
        self.connection_limiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn burst_then_reject() {
        let limits = LimitsConfig {
            connection_rate_per_second: 1,
            connection_burst_per_ip: 3,
            ..LimitsConfig::default()
        };
        let limiter = AdmissionLimiter::new(&limits);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert!(limiter.check_connection_rate(ip));
        assert!(limiter.check_connection_rate(ip));
        assert!(limiter.check_connection_rate(ip));
        assert!(!limiter.check_connection_rate(ip));

        // Other addresses have their own bucket.
        assert!(limiter.check_connection_rate(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn zero_config_falls_back() {
        let limits = LimitsConfig {
            connection_rate_per_second: 0,
            connection_burst_per_ip: 0,
            ..LimitsConfig::default()
        };
        let limiter = AdmissionLimiter::new(&limits);
        assert!(limiter.check_connection_rate(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }
}
