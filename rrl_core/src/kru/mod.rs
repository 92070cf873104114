//! Fixed-capacity sliding-window counter table ("KRU").
//!
//! The table lives in an opaque, cache-line aligned byte region that may be
//! shared between processes. Each key is hashed into one cache line in each
//! of two tables; a line tracks ten keys by 16-bit id together with their
//! load. Loads decay exponentially with time, so a bucket that is charged at
//! a steady rate settles where inflow equals decay.
//!
//! Two variants exist. They hash differently, which means a region written
//! by one variant is garbage to the other; callers must record the variant
//! next to the region and refuse to mix them.

use once_cell::sync::OnceCell;
use std::ptr::NonNull;

#[cfg(target_arch = "x86_64")]
mod avx2;
mod generic;
mod table;

pub use table::{KruHeader, LoadLine, LOADS_LEN, TABLE_COUNT};

/// Price of one charge, in units where [`KRU_LIMIT`] is a full bucket.
pub type KruPrice = u32;

/// A full bucket. Loads reported to callers are this scale shifted down by
/// 16 bits, so a full bucket reads as `u16::MAX`.
pub const KRU_LIMIT: KruPrice = u32::MAX - u16::MAX as u32;

/// Identifies an engine implementation; stored in shared headers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KruVariant {
    Generic = 0,
    Avx2 = 1,
}

impl KruVariant {
    /// Best variant this CPU supports, decided once per process.
    pub fn detect() -> Self {
        static ACTIVE: OnceCell<KruVariant> = OnceCell::new();
        *ACTIVE.get_or_init(|| {
            if KruVariant::Avx2.is_available() {
                KruVariant::Avx2
            } else {
                KruVariant::Generic
            }
        })
    }

    pub fn is_available(self) -> bool {
        match self {
            KruVariant::Generic => true,
            KruVariant::Avx2 => avx2_supported(),
        }
    }

    /// Engine for this variant, or `None` when the CPU lacks it.
    pub fn api(self) -> Option<&'static dyn KruApi> {
        match self {
            KruVariant::Generic => Some(&generic::KRU_GENERIC),
            #[cfg(target_arch = "x86_64")]
            KruVariant::Avx2 if avx2_supported() => Some(&avx2::KRU_AVX2),
            KruVariant::Avx2 => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KruVariant::Generic),
            1 => Some(KruVariant::Avx2),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KruVariant::Generic => "generic",
            KruVariant::Avx2 => "AVX2",
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn avx2_supported() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("aes")
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_supported() -> bool {
    false
}

/// Result of charging several prefixes of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefixCharge {
    /// First prefix length, in the order given, whose bucket overflowed.
    pub limited_prefix: Option<u8>,
    /// Highest post-charge load across the prefixes; `u16::MAX` is full.
    pub max_final_load: u16,
}

impl PrefixCharge {
    pub fn is_limited(&self) -> bool {
        self.limited_prefix.is_some()
    }
}

/// Counter-engine contract.
pub trait KruApi: Send + Sync {
    fn variant(&self) -> KruVariant;

    /// Bytes needed for a table targeting `2^capacity_log` keys, or `None`
    /// if the engine cannot address that many lines.
    fn size_of(&self, capacity_log: u32) -> Option<usize>;

    /// Lay out a fresh table with the given per-millisecond decay of a full
    /// bucket.
    ///
    /// # Safety
    /// `region` must be 64-byte aligned, valid for `size_of(capacity_log)`
    /// bytes of writes and not yet visible to any other user.
    unsafe fn initialize(&self, region: NonNull<u8>, capacity_log: u32, max_decay: KruPrice) -> bool;

    /// Age, then charge `prices[i]` against prefix `prefixes[i]` of `key`
    /// for every `i`. All prefixes are charged even once one is limited.
    ///
    /// # Safety
    /// `region` must hold a table initialized by the same variant and stay
    /// mapped for the duration of the call.
    unsafe fn limited_multi_prefix_or(
        &self,
        region: NonNull<u8>,
        now: u32,
        namespace: u8,
        key: &[u8; 16],
        prefixes: &[u8],
        prices: &[KruPrice],
    ) -> PrefixCharge;
}
