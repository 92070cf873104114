//! Deciding on a request must not touch the heap once the limiter is warm.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rrl_core::{QuerySource, RateLimitConfig, RateLimiter, RequestState, ResolverRequest};

struct CountingAlloc;

thread_local! {
    static ALLOCS: Cell<usize> = const { Cell::new(0) };
}

fn bump() {
    let _ = ALLOCS.try_with(|c| c.set(c.get() + 1));
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        bump();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        bump();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        bump();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

const NOW: u32 = 30_000;

fn allocations_during(f: impl FnOnce()) -> usize {
    let before = ALLOCS.with(Cell::get);
    f();
    ALLOCS.with(Cell::get) - before
}

fn open(dir: &tempfile::TempDir, name: &str, instant_limit: u32, tc_limit_perc: u32) -> RateLimiter {
    let path = dir.path().join(format!("test_{name}_{}", std::process::id()));
    let cfg = RateLimitConfig { capacity: 1024, instant_limit, rate_limit: 1000, tc_limit_perc };
    RateLimiter::init(path, &cfg).unwrap()
}

fn udp(ip: IpAddr) -> ResolverRequest {
    ResolverRequest::new(Some(QuerySource::udp(SocketAddr::new(ip, 40000))))
}

fn tcp(ip: IpAddr) -> ResolverRequest {
    ResolverRequest::new(Some(QuerySource::tcp(SocketAddr::new(ip, 40000))))
}

#[test]
fn allowed_requests_do_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let rl = open(&dir, "alloc_allow", 1000, 100);
    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    // first request registers the counters
    assert!(!rl.request_begin_at(&mut udp(ip), NOW));

    let n = allocations_during(|| {
        for _ in 0..100 {
            let mut req = udp(ip);
            assert!(!rl.request_begin_at(&mut req, NOW));
        }
    });
    assert_eq!(n, 0);
}

#[test]
fn dropped_requests_do_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let rl = open(&dir, "alloc_drop", 1, 100);
    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
    assert!(!rl.request_begin_at(&mut udp(ip), NOW));
    assert!(rl.request_begin_at(&mut udp(ip), NOW));

    let n = allocations_during(|| {
        for _ in 0..100 {
            let mut req = udp(ip);
            assert!(rl.request_begin_at(&mut req, NOW));
            assert_eq!(req.state, RequestState::Fail);
        }
    });
    assert_eq!(n, 0);
}

#[test]
fn truncated_requests_do_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let rl = open(&dir, "alloc_tc", 1000, 0);
    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3));
    // answers are attached up front; only the limiter's work is measured
    let mut udp_reqs: Vec<_> = (0..51)
        .map(|_| {
            let mut req = udp(ip);
            req.answer = Some(vec![0u8; 12]);
            req
        })
        .collect();
    let mut tcp_reqs: Vec<_> = (0..51).map(|_| tcp(ip)).collect();
    assert!(rl.request_begin_at(&mut udp_reqs[0], NOW));
    assert!(!rl.request_begin_at(&mut tcp_reqs[0], NOW));

    let n = allocations_during(|| {
        for req in &mut udp_reqs[1..] {
            assert!(rl.request_begin_at(req, NOW));
        }
        for req in &mut tcp_reqs[1..] {
            assert!(!rl.request_begin_at(req, NOW));
        }
    });
    assert_eq!(n, 0);
    assert!(udp_reqs.iter().all(|r| r.answer_tc() == Some(true)));
}
