//! Constants and configuration for the rate limiter

use crate::kru::KruPrice;
use std::time::Duration;

// Prefix schedules, shortest (most aggregated) first.
pub const RRL_V4_PREFIXES: [u8; 4] = [18, 20, 24, 32];
pub const RRL_V4_RATE_MULT: [KruPrice; 4] = [768, 256, 32, 1];

pub const RRL_V6_PREFIXES: [u8; 5] = [32, 48, 56, 64, 128];
pub const RRL_V6_RATE_MULT: [KruPrice; 5] = [64, 4, 3, 2, 1];

pub const RRL_V4_PREFIXES_CNT: usize = RRL_V4_PREFIXES.len();
pub const RRL_V6_PREFIXES_CNT: usize = RRL_V6_PREFIXES.len();

/// Namespaces passed to the counter engine so equal key bytes of different
/// families never share a bucket.
pub const NAMESPACE_V4: u8 = 0;
pub const NAMESPACE_V6: u8 = 1;

pub const CACHE_LINE: usize = 64;

/// Identifies a region laid out by this crate's shared-region manager.
pub const REGION_MAGIC: u64 = 0x5252_4C5F_4D4D_4150; // "RRL_MMAP"

/// How long a late attacher waits for the first process to publish.
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
pub const ATTACH_POLL: Duration = Duration::from_millis(1);

/// Percentage that disables the truncate-on-UDP tier entirely.
pub const TC_LIMIT_DISABLED_PERC: u32 = 100;

// DNS wire header bits touched by the truncate verdict.
pub const DNS_HEADER_LEN: usize = 12;
pub const DNS_FLAGS1_OFFSET: usize = 2;
pub const DNS_FLAGS2_OFFSET: usize = 3;
pub const DNS_TC_MASK: u8 = 0x02;
pub const DNS_AD_MASK: u8 = 0x20;
