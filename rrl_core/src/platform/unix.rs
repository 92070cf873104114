//! Unix-specific platform code for rrl

use log::warn;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Remove a POSIX shared-memory object left behind by a dead peer group.
pub fn platform_drop(os_id: &str) {
    use std::ffi::CString;
    unsafe {
        if let Ok(c_name) = CString::new(os_id) {
            let _ = libc::shm_unlink(c_name.as_ptr());
        }
    }
}

/// POSIX shm name for a region; short enough for macOS' 31-byte limit.
pub fn make_os_id(prefix: &str, hash: u64) -> String {
    format!("/{prefix}_{hash:016x}")
}

/// `false` only when `pid` definitely no longer exists. A process owned by
/// another user still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || errno::errno().0 != libc::ESRCH
}

/// `CLOCK_MONOTONIC` in milliseconds; one timeline for all local processes.
pub fn monotonic_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        warn!("[CLOCK] clock_gettime failed: {}", errno::errno());
        return 0;
    }
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

/// Decode a C socket address. `None` for null or non-IP families.
///
/// # Safety
/// `sa` must be null or point at a valid `sockaddr_in`/`sockaddr_in6`
/// as indicated by its family field.
pub unsafe fn sockaddr_to_std(sa: *const libc::sockaddr) -> Option<SocketAddr> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Inverse of [`sockaddr_to_std`]; used by C-ABI tests and embedders that
/// build requests from Rust.
pub fn std_to_sockaddr(addr: &SocketAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
        }
    }
    storage
}
