//! Helper functions for key construction, layout and DNS wire flags

use crate::constants::{
    DNS_AD_MASK, DNS_FLAGS1_OFFSET, DNS_FLAGS2_OFFSET, DNS_HEADER_LEN, DNS_TC_MASK,
};
use std::net::IpAddr;

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Smallest `log` with `2^log >= capacity`, never below 1.
pub fn capacity_log(capacity: usize) -> u32 {
    let mut log = 0u32;
    let mut c = capacity.saturating_sub(1);
    while c > 0 {
        log += 1;
        c >>= 1;
    }
    log.max(1)
}

/// 16-byte engine key: IPv4 occupies the first 4 bytes, IPv6 all 16.
/// The port is never part of the key.
#[inline]
pub fn ip_key(ip: &IpAddr) -> [u8; 16] {
    let mut key = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => key[..4].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => key.copy_from_slice(&v6.octets()),
    }
    key
}

#[inline]
pub fn mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        !0u128
    } else {
        !(!0u128 >> prefix_len)
    }
}

// Canonicalise a key: zero host bits beyond `plen`.
#[inline(always)]
pub fn canonical(key: &[u8; 16], plen: u8) -> u128 {
    u128::from_be_bytes(*key) & mask(plen)
}

/// Set TC in a DNS wire header. Returns `false` if `wire` is too short.
#[inline]
pub fn wire_set_tc(wire: &mut [u8]) -> bool {
    if wire.len() < DNS_HEADER_LEN {
        return false;
    }
    wire[DNS_FLAGS1_OFFSET] |= DNS_TC_MASK;
    true
}

#[inline]
pub fn wire_clear_ad(wire: &mut [u8]) -> bool {
    if wire.len() < DNS_HEADER_LEN {
        return false;
    }
    wire[DNS_FLAGS2_OFFSET] &= !DNS_AD_MASK;
    true
}

/// Millisecond clock shared by every process on the host, truncated to the
/// engine's 32-bit wrapping timestamps.
#[inline]
pub fn now_ms() -> u32 {
    crate::platform::unix::monotonic_ms() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn capacity_log_rounds_up() {
        assert_eq!(capacity_log(1), 1);
        assert_eq!(capacity_log(2), 1);
        assert_eq!(capacity_log(3), 2);
        assert_eq!(capacity_log(1024), 10);
        assert_eq!(capacity_log(1025), 11);
    }

    #[test]
    fn v4_key_uses_leading_bytes() {
        let key = ip_key(&IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(&key[..4], &[192, 0, 2, 7]);
        assert!(key[4..].iter().all(|b| *b == 0));
        // a v4 /24 masks the last octet
        assert_eq!(canonical(&key, 24) >> 96, 0xC000_0200);
    }

    #[test]
    fn v6_prefix_masking() {
        let ip: Ipv6Addr = "2001:db8:aa:bbcc::1".parse().unwrap();
        let key = ip_key(&IpAddr::V6(ip));
        let net: Ipv6Addr = "2001:db8:aa:bb00::".parse().unwrap();
        assert_eq!(canonical(&key, 56), u128::from(net));
        assert_eq!(canonical(&key, 128), u128::from(ip));
        assert_eq!(canonical(&key, 0), 0);
    }

    #[test]
    fn wire_flags() {
        let mut wire = [0u8; DNS_HEADER_LEN];
        wire[DNS_FLAGS2_OFFSET] = 0xFF;
        assert!(wire_set_tc(&mut wire));
        assert!(wire_clear_ad(&mut wire));
        assert_eq!(wire[DNS_FLAGS1_OFFSET], DNS_TC_MASK);
        assert_eq!(wire[DNS_FLAGS2_OFFSET], 0xFF & !DNS_AD_MASK);

        let mut short = [0u8; 3];
        assert!(!wire_set_tc(&mut short));
    }
}
