//! AES-NI hashing with AVX2 id search.
//!
//! Only reachable through [`KruVariant::api`], which checks the CPU first.

use super::table::{Engine, KeyHasher, LOADS_LEN};
use super::KruVariant;
use std::arch::x86_64::*;

pub(crate) struct AesHasher;

impl KeyHasher for AesHasher {
    const VARIANT: KruVariant = KruVariant::Avx2;

    #[inline]
    fn hash(hash_key: &[u64; 2], namespace: u8, prefix: u8, masked: u128) -> u64 {
        unsafe { aes_hash(hash_key, namespace, prefix, masked) }
    }

    #[inline]
    fn find_id(ids: &[u16; LOADS_LEN], id: u16) -> Option<usize> {
        unsafe { find_id_avx2(ids, id) }
    }
}

pub(crate) static KRU_AVX2: Engine<AesHasher> = Engine::new();

#[target_feature(enable = "aes,sse2")]
unsafe fn aes_hash(hash_key: &[u64; 2], namespace: u8, prefix: u8, masked: u128) -> u64 {
    let tweak = ((namespace as u64) << 8) | prefix as u64;
    let k0 = _mm_set_epi64x(hash_key[1] as i64, (hash_key[0] ^ tweak) as i64);
    let k1 = _mm_shuffle_epi32(k0, 0x4E);
    let mut s = _mm_set_epi64x((masked >> 64) as u64 as i64, masked as u64 as i64);
    s = _mm_xor_si128(s, k0);
    s = _mm_aesenc_si128(s, k1);
    s = _mm_aesenc_si128(s, k0);
    s = _mm_aesenc_si128(s, k1);
    let lo = _mm_cvtsi128_si64(s) as u64;
    let hi = _mm_cvtsi128_si64(_mm_unpackhi_epi64(s, s)) as u64;
    lo ^ hi
}

#[target_feature(enable = "avx2")]
unsafe fn find_id_avx2(ids: &[u16; LOADS_LEN], id: u16) -> Option<usize> {
    // pad lanes stay 0, which no tracked id uses
    let mut lanes = [0u16; 16];
    lanes[..LOADS_LEN].copy_from_slice(ids);
    let v = _mm256_loadu_si256(lanes.as_ptr() as *const __m256i);
    let eq = _mm256_cmpeq_epi16(v, _mm256_set1_epi16(id as i16));
    let bits = _mm256_movemask_epi8(eq) as u32;
    (bits != 0).then(|| (bits.trailing_zeros() / 2) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported() -> bool {
        KruVariant::Avx2.is_available()
    }

    #[test]
    fn simd_search_matches_scalar() {
        if !supported() {
            return;
        }
        let ids = [5u16, 9, 0, 9, 1, 65535, 7, 7, 3, 2];
        for probe in [1u16, 2, 3, 5, 7, 9, 65535, 4, 100] {
            let scalar = ids.iter().position(|&x| x == probe);
            assert_eq!(AesHasher::find_id(&ids, probe), scalar, "probe {probe}");
        }
    }

    #[test]
    fn hash_separates_prefixes_and_namespaces() {
        if !supported() {
            return;
        }
        let key = [0xdead_beef, 0xfeed_face];
        let net = 0x2001_0db8u128 << 96;
        let base = AesHasher::hash(&key, 1, 32, net);
        assert_eq!(base, AesHasher::hash(&key, 1, 32, net));
        assert_ne!(base, AesHasher::hash(&key, 0, 32, net));
        assert_ne!(base, AesHasher::hash(&key, 1, 48, net));
    }
}
