use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use rrl_core::{kru::KruVariant, Error, RateLimitConfig, RateLimiter, Verdict};

const NOW: u32 = 50_000;

fn region(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(format!("test_{name}_{}", std::process::id()))
}

fn config() -> RateLimitConfig {
    RateLimitConfig { capacity: 1024, instant_limit: 10, rate_limit: 100, tc_limit_perc: 50 }
}

#[test]
fn second_handle_sees_first_handles_counters() {
    let dir = tempfile::tempdir().unwrap();
    let path = region(&dir, "reattach");
    let a = RateLimiter::init(&path, &config()).unwrap();
    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    for _ in 0..10 {
        assert_ne!(a.evaluate(ip, NOW).verdict, Verdict::Drop);
    }

    let b = RateLimiter::init(&path, &config()).unwrap();
    assert_eq!(a.peers(), 2);
    assert_eq!(b.capacity(), 1024);
    assert_eq!(b.v4_prices(), a.v4_prices());
    assert_eq!(b.evaluate(ip, NOW).verdict, Verdict::Drop);

    b.deinit();
    assert_eq!(a.peers(), 1);
    assert!(path.exists());
    a.deinit();
    assert!(!path.exists());
}

#[test]
fn differing_limits_are_an_identity_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = region(&dir, "mismatch");
    let a = RateLimiter::init(&path, &config()).unwrap();

    let wider = RateLimitConfig { instant_limit: 20, ..config() };
    assert!(matches!(RateLimiter::init(&path, &wider), Err(Error::HeaderMismatch)));

    let faster = RateLimitConfig { rate_limit: 200, ..config() };
    assert!(matches!(RateLimiter::init(&path, &faster), Err(Error::HeaderMismatch)));

    let bigger = RateLimitConfig { capacity: 4096, ..config() };
    assert!(matches!(RateLimiter::init(&path, &bigger), Err(Error::HeaderMismatch)));

    // capacity that rounds to the same table is still a different identity
    let rounded = RateLimitConfig { capacity: 1000, ..config() };
    assert!(matches!(RateLimiter::init(&path, &rounded), Err(Error::HeaderMismatch)));

    assert_eq!(a.peers(), 1);
}

#[test]
fn variants_never_share_a_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = region(&dir, "variant");
    if KruVariant::Avx2.is_available() {
        let a = RateLimiter::init_with_variant(&path, &config(), KruVariant::Avx2).unwrap();
        assert!(matches!(
            RateLimiter::init_with_variant(&path, &config(), KruVariant::Generic),
            Err(Error::HeaderMismatch)
        ));
        drop(a);
        let b = RateLimiter::init_with_variant(&path, &config(), KruVariant::Generic).unwrap();
        assert!(matches!(
            RateLimiter::init_with_variant(&path, &config(), KruVariant::Avx2),
            Err(Error::HeaderMismatch)
        ));
        drop(b);
    } else {
        assert!(matches!(
            RateLimiter::init_with_variant(&path, &config(), KruVariant::Avx2),
            Err(Error::VariantUnavailable)
        ));
        assert!(!path.exists());
    }
}

#[test]
fn region_is_recreated_after_last_peer_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let path = region(&dir, "recreate");
    let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 77));

    let a = RateLimiter::init(&path, &config()).unwrap();
    for _ in 0..11 {
        a.evaluate(ip, NOW);
    }
    assert_eq!(a.evaluate(ip, NOW).verdict, Verdict::Drop);
    a.deinit();

    // a fresh group starts from empty counters and may use new limits
    let wider = RateLimitConfig { instant_limit: 20, ..config() };
    let b = RateLimiter::init(&path, &wider).unwrap();
    assert_eq!(b.instant_limit(), 20);
    assert_eq!(b.evaluate(ip, NOW).verdict, Verdict::Allow);
}

#[test]
fn handles_are_usable_from_other_threads() {
    let dir = tempfile::tempdir().unwrap();
    let path = region(&dir, "threads");
    let rl = RateLimiter::init(&path, &config()).unwrap();
    let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 78));
    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..10 {
                rl.evaluate(ip, NOW);
            }
        });
    });
    assert_eq!(rl.evaluate(ip, NOW).verdict, Verdict::Drop);
}
