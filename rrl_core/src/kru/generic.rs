//! Portable variant: xxh3 keyed by the table's random seed.

use super::table::{Engine, KeyHasher};
use super::KruVariant;
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub(crate) struct Xxh3Hasher;

impl KeyHasher for Xxh3Hasher {
    const VARIANT: KruVariant = KruVariant::Generic;

    #[inline]
    fn hash(hash_key: &[u64; 2], namespace: u8, prefix: u8, masked: u128) -> u64 {
        let mut buf = [0u8; 18];
        buf[..16].copy_from_slice(&masked.to_be_bytes());
        buf[16] = namespace;
        buf[17] = prefix;
        xxh3_64_with_seed(&buf, hash_key[0] ^ hash_key[1].rotate_left(32))
    }
}

pub(crate) static KRU_GENERIC: Engine<Xxh3Hasher> = Engine::new();
