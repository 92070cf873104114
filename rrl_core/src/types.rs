//! Data structures for the rate limiter

use crate::constants::{RRL_V4_PREFIXES_CNT, RRL_V4_RATE_MULT, RRL_V6_PREFIXES_CNT, RRL_V6_RATE_MULT, TC_LIMIT_DISABLED_PERC};
use crate::errors::Error;
use crate::kru::{KruApi, KruPrice, KruVariant, KRU_LIMIT};
use crate::mmapped::MmappedRegion;
use crate::policy::Verdict;
use memoffset::offset_of;
use std::ptr::NonNull;

/// Shared-region header (aligned to cache line). The counter table follows
/// at the next cache line.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub capacity: u64,
    pub instant_limit: u32,
    pub rate_limit: u32,
    /// Q0.16 load above which UDP queries get TC; `u16::MAX` disables it.
    pub tc_limit: u16,
    /// [`KruVariant`] tag of the process that laid out the table.
    pub using_avx2: u8,
    pub _reserved: [u8; 5],
    pub v4_prices: [KruPrice; RRL_V4_PREFIXES_CNT],
    pub v6_prices: [KruPrice; RRL_V6_PREFIXES_CNT],
}

/// Peers must agree on every byte before the price arrays.
pub const IDENTITY_LEN: usize = offset_of!(Header, v4_prices);

impl Header {
    pub fn new(config: &RateLimitConfig, variant: KruVariant) -> Self {
        Header {
            capacity: config.capacity as u64,
            instant_limit: config.instant_limit,
            rate_limit: config.rate_limit,
            tc_limit: config.tc_limit(),
            using_avx2: variant.tag(),
            _reserved: [0; 5],
            v4_prices: config.prices(&RRL_V4_RATE_MULT),
            v6_prices: config.prices(&RRL_V6_RATE_MULT),
        }
    }

    pub fn identity(&self) -> &[u8] {
        // SAFETY: repr(C) with no padding before `v4_prices`
        unsafe { std::slice::from_raw_parts(self as *const Header as *const u8, IDENTITY_LEN) }
    }
}

/// The five scalar knobs, minus the region path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Distinct keys to track; rounded up to a power of two.
    pub capacity: usize,
    /// Burst allowed from one /32 or /128.
    pub instant_limit: u32,
    /// Sustained queries per second from one /32 or /128.
    pub rate_limit: u32,
    /// Percentage of a full bucket above which UDP clients get TC; 100 turns
    /// truncation off.
    pub tc_limit_perc: u32,
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be at least 1".into()));
        }
        if self.instant_limit == 0 {
            return Err(Error::InvalidConfig("instant_limit must be at least 1".into()));
        }
        if self.rate_limit == 0 {
            return Err(Error::InvalidConfig("rate_limit must be at least 1".into()));
        }
        if self.tc_limit_perc > 100 {
            return Err(Error::InvalidConfig(format!(
                "tc_limit_perc must be within 0..=100, got {}",
                self.tc_limit_perc
            )));
        }
        Ok(())
    }

    pub fn tc_limit(&self) -> u16 {
        if self.tc_limit_perc >= TC_LIMIT_DISABLED_PERC {
            u16::MAX
        } else {
            ((self.tc_limit_perc << 16) / 100) as u16
        }
    }

    pub fn base_price(&self) -> KruPrice {
        KRU_LIMIT / self.instant_limit.max(1)
    }

    /// Per-millisecond decay of a full bucket.
    pub fn max_decay(&self) -> KruPrice {
        let base = self.base_price() as u64;
        if self.rate_limit as u64 > 1000 * self.instant_limit as u64 {
            base as KruPrice
        } else {
            (base * self.rate_limit as u64 / 1000) as KruPrice
        }
    }

    pub fn prices<const N: usize>(&self, multipliers: &[KruPrice; N]) -> [KruPrice; N] {
        let base = self.base_price();
        multipliers.map(|m| base / m)
    }
}

/// Outcome of charging one source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Before any transport downgrade.
    pub verdict: Verdict,
    pub limited_prefix: Option<u8>,
    pub max_final_load: u16,
}

/// Rate limiter handle over a shared region.
pub struct RateLimiter {
    pub(crate) region: MmappedRegion,
    pub(crate) hdr: NonNull<Header>,
    pub(crate) kru_base: NonNull<u8>,
    pub(crate) kru: &'static dyn KruApi,
}

// SAFETY: the header is immutable after publication and the counter table
// is only touched through the engine's atomics.
unsafe impl Send for RateLimiter {}
unsafe impl Sync for RateLimiter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(instant_limit: u32, rate_limit: u32, tc_limit_perc: u32) -> RateLimitConfig {
        RateLimitConfig { capacity: 1024, instant_limit, rate_limit, tc_limit_perc }
    }

    #[test]
    fn header_layout() {
        assert_eq!(IDENTITY_LEN, 24);
        assert_eq!(std::mem::size_of::<Header>(), 64);
    }

    #[test]
    fn prices_follow_multipliers() {
        let c = config(10, 100, 50);
        let base = KRU_LIMIT / 10;
        assert_eq!(c.base_price(), base);
        assert_eq!(c.prices(&RRL_V4_RATE_MULT), [base / 768, base / 256, base / 32, base]);
        assert_eq!(c.prices(&RRL_V6_RATE_MULT), [base / 64, base / 4, base / 3, base / 2, base]);
    }

    #[test]
    fn decay_tracks_rate_per_millisecond() {
        let base = (KRU_LIMIT / 10) as u64;
        assert_eq!(config(10, 100, 50).max_decay() as u64, base * 100 / 1000);
        // a rate beyond 1000x the burst caps out at one full price per ms
        assert_eq!(config(10, 10_001, 50).max_decay() as u64, base);
        assert_eq!(config(10, 10_000, 50).max_decay() as u64, base * 10);
    }

    #[test]
    fn tc_limit_encoding() {
        assert_eq!(config(10, 100, 100).tc_limit(), u16::MAX);
        assert_eq!(config(10, 100, 50).tc_limit(), 32768);
        assert_eq!(config(10, 100, 0).tc_limit(), 0);
    }

    #[test]
    fn validation() {
        assert!(config(10, 100, 50).validate().is_ok());
        assert!(config(0, 100, 50).validate().is_err());
        assert!(config(10, 0, 50).validate().is_err());
        assert!(config(10, 100, 101).validate().is_err());
        let zero_cap = RateLimitConfig { capacity: 0, ..config(10, 100, 50) };
        assert!(matches!(zero_cap.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn identity_excludes_prices() {
        let c = config(10, 100, 50);
        let a = Header::new(&c, KruVariant::Generic);
        let mut b = a;
        b.v4_prices[0] += 1;
        assert_eq!(a.identity(), b.identity());
        let other = Header::new(&c, KruVariant::Avx2);
        assert_ne!(a.identity(), other.identity());
        let wider = Header::new(&config(20, 100, 50), KruVariant::Generic);
        assert_ne!(a.identity(), wider.identity());
    }
}
