use super::{KruApi, KruPrice, KruVariant, PrefixCharge, KRU_LIMIT};
use crate::constants::CACHE_LINE;
use crate::helpers::{align_up, canonical};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Keys tracked per cache line.
pub const LOADS_LEN: usize = 10;
/// Each key has one candidate line in each table.
pub const TABLE_COUNT: usize = 2;

const DECAY_STEPS: usize = 32;
// Roughly 16 keys per line pair at the requested capacity.
const CAPACITY_SHIFT: u32 = 4;
const MAX_LOADS_BITS: u32 = 24;
/// Readings up to this far behind a line's stamp are treated as races
/// between workers, not as clock wrap.
const FUTURE_TOLERANCE_MS: u32 = 1 << 12;

/// Immutable after initialization.
#[repr(C, align(64))]
pub struct KruHeader {
    pub hash_key: [u64; 2],
    pub loads_bits: u32,
    pub max_decay: KruPrice,
    /// Entry `k` is the surviving fraction after `2^k` ms, in Q0.32.
    pub decay_pow2: [u32; DECAY_STEPS],
}

#[repr(C, align(64))]
pub struct LoadLine {
    pub time: AtomicU32,
    pub ids: [AtomicU16; LOADS_LEN],
    pub loads: [AtomicU32; LOADS_LEN],
}

const _: () = assert!(size_of::<LoadLine>() == CACHE_LINE);
const _: () = assert!(size_of::<KruHeader>() % CACHE_LINE == 0);

pub(crate) const LINES_OFFSET: usize = align_up(size_of::<KruHeader>(), CACHE_LINE);

/// Hashing and id search are what the variants specialize.
pub(crate) trait KeyHasher: 'static {
    const VARIANT: KruVariant;

    fn hash(hash_key: &[u64; 2], namespace: u8, prefix: u8, masked: u128) -> u64;

    fn find_id(ids: &[u16; LOADS_LEN], id: u16) -> Option<usize> {
        ids.iter().position(|&x| x == id)
    }
}

pub(crate) struct Engine<H>(PhantomData<fn() -> H>);

impl<H> Engine<H> {
    pub(crate) const fn new() -> Self {
        Engine(PhantomData)
    }
}

fn loads_bits(capacity_log: u32) -> u32 {
    capacity_log.saturating_sub(CAPACITY_SHIFT)
}

fn decay_table(max_decay: KruPrice) -> [u32; DECAY_STEPS] {
    let keep = (1.0 - max_decay as f64 / KRU_LIMIT as f64).clamp(0.0, 1.0);
    let mut table = [0u32; DECAY_STEPS];
    for (k, slot) in table.iter_mut().enumerate() {
        let frac = keep.powf((1u64 << k) as f64);
        *slot = (frac * 4_294_967_296.0).min(u32::MAX as f64) as u32;
    }
    table
}

#[inline]
fn decay_load(load: u32, mut ticks: u32, pow2: &[u32; DECAY_STEPS]) -> u32 {
    let mut v = load as u64;
    let mut k = 0;
    while ticks != 0 && v != 0 {
        if ticks & 1 != 0 {
            v = (v * pow2[k] as u64) >> 32;
        }
        ticks >>= 1;
        k += 1;
    }
    v as u32
}

/// Returns `(overflowed, load after charge)`.
#[inline]
fn charge(load: &AtomicU32, price: KruPrice) -> (bool, KruPrice) {
    let before = match load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| {
        Some(l.saturating_add(price).min(KRU_LIMIT))
    }) {
        Ok(v) | Err(v) => v,
    };
    let limited = before as u64 + price as u64 > KRU_LIMIT as u64;
    (limited, before.saturating_add(price).min(KRU_LIMIT))
}

struct Table<'a> {
    hdr: &'a KruHeader,
    lines: &'a [LoadLine],
}

impl<'a> Table<'a> {
    /// # Safety
    /// `region` must hold an initialized table that outlives `'a`.
    unsafe fn from_region(region: NonNull<u8>) -> Self {
        let hdr = &*(region.as_ptr() as *const KruHeader);
        let lines_ptr = region.as_ptr().add(LINES_OFFSET) as *const LoadLine;
        let lines = std::slice::from_raw_parts(lines_ptr, TABLE_COUNT << hdr.loads_bits);
        Table { hdr, lines }
    }

    fn age(&self, line: &LoadLine, now: u32) {
        let mut stamp = line.time.load(Ordering::Acquire);
        let elapsed = loop {
            let elapsed = now.wrapping_sub(stamp);
            if elapsed == 0 || elapsed.wrapping_neg() <= FUTURE_TOLERANCE_MS {
                return;
            }
            match line
                .time
                .compare_exchange_weak(stamp, now, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break elapsed,
                Err(cur) => stamp = cur,
            }
        };
        for load in &line.loads {
            let _ = load.fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| {
                (l != 0).then(|| decay_load(l, elapsed, &self.hdr.decay_pow2))
            });
        }
    }

    fn charge_prefix<H: KeyHasher>(
        &self,
        now: u32,
        namespace: u8,
        prefix: u8,
        masked: u128,
        price: KruPrice,
    ) -> (bool, KruPrice) {
        let bits = self.hdr.loads_bits;
        let h = H::hash(&self.hdr.hash_key, namespace, prefix, masked);
        let mask = (1usize << bits) - 1;
        let i0 = h as usize & mask;
        let i1 = (h >> bits) as usize & mask;
        let id = ((h >> 48) as u16).max(1);
        let candidates = [
            &self.lines[i0 * TABLE_COUNT],
            &self.lines[i1 * TABLE_COUNT + 1],
        ];

        for line in candidates {
            self.age(line, now);
        }
        for line in candidates {
            let mut ids = [0u16; LOADS_LEN];
            for (dst, src) in ids.iter_mut().zip(&line.ids) {
                *dst = src.load(Ordering::Acquire);
            }
            if let Some(slot) = H::find_id(&ids, id) {
                return charge(&line.loads[slot], price);
            }
        }

        // Not tracked: take over the lightest slot if this charge would
        // outweigh it, otherwise wear it down.
        let mut best = (candidates[0], 0usize, u32::MAX);
        for line in candidates {
            for (slot, load) in line.loads.iter().enumerate() {
                let l = load.load(Ordering::Acquire);
                if l < best.2 {
                    best = (line, slot, l);
                }
            }
        }
        let (line, slot, min) = best;
        if min <= price {
            if line.loads[slot]
                .compare_exchange(min, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                line.ids[slot].store(id, Ordering::Release);
                return charge(&line.loads[slot], price);
            }
        } else {
            let _ = line.loads[slot].fetch_update(Ordering::AcqRel, Ordering::Acquire, |l| {
                Some(l.saturating_sub(price))
            });
        }
        (price > KRU_LIMIT, price.min(KRU_LIMIT))
    }
}

impl<H: KeyHasher> KruApi for Engine<H> {
    fn variant(&self) -> KruVariant {
        H::VARIANT
    }

    fn size_of(&self, capacity_log: u32) -> Option<usize> {
        let bits = loads_bits(capacity_log);
        if bits > MAX_LOADS_BITS {
            return None;
        }
        let lines = TABLE_COUNT.checked_shl(bits)?;
        LINES_OFFSET.checked_add(lines.checked_mul(size_of::<LoadLine>())?)
    }

    unsafe fn initialize(&self, region: NonNull<u8>, capacity_log: u32, max_decay: KruPrice) -> bool {
        let Some(size) = self.size_of(capacity_log) else {
            return false;
        };
        if region.as_ptr() as usize % CACHE_LINE != 0 {
            return false;
        }
        ptr::write_bytes(region.as_ptr(), 0, size);
        ptr::write(
            region.as_ptr() as *mut KruHeader,
            KruHeader {
                hash_key: [rand::random(), rand::random()],
                loads_bits: loads_bits(capacity_log),
                max_decay,
                decay_pow2: decay_table(max_decay),
            },
        );
        true
    }

    unsafe fn limited_multi_prefix_or(
        &self,
        region: NonNull<u8>,
        now: u32,
        namespace: u8,
        key: &[u8; 16],
        prefixes: &[u8],
        prices: &[KruPrice],
    ) -> PrefixCharge {
        let table = Table::from_region(region);
        let mut out = PrefixCharge::default();
        let mut max_final = 0;
        for (&prefix, &price) in prefixes.iter().zip(prices) {
            let (limited, after) =
                table.charge_prefix::<H>(now, namespace, prefix, canonical(key, prefix), price);
            if limited && out.limited_prefix.is_none() {
                out.limited_prefix = Some(prefix);
            }
            max_final = max_final.max(after);
        }
        out.max_final_load = (max_final >> 16) as u16;
        out
    }
}
