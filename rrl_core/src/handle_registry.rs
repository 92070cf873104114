//! Process-wide limiter slot behind the C ABI.
//!
//! Readers pin an epoch and borrow the installed limiter; teardown swaps the
//! slot to null and destroys the old limiter once no reader can still see it.

use crate::constants::ATTACH_TIMEOUT;
use crate::errors::Error;
use crate::RateLimiter;
use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static ACTIVE: Atomic<RateLimiter> = Atomic::null();

pub fn is_installed() -> bool {
    let guard = epoch::pin();
    !ACTIVE.load(Ordering::Acquire, &guard).is_null()
}

/// Publish `limiter` as the process-wide one. Fails, dropping `limiter`, if
/// another is already installed.
pub fn install(limiter: RateLimiter) -> Result<(), Error> {
    let guard = epoch::pin();
    match ACTIVE.compare_exchange(
        Shared::null(),
        Owned::new(limiter),
        Ordering::AcqRel,
        Ordering::Acquire,
        &guard,
    ) {
        Ok(_) => Ok(()),
        Err(e) => {
            drop(e.new);
            Err(Error::AlreadyInitialized)
        }
    }
}

/// Run `f` against the installed limiter, if any.
pub fn with_handle<T, F>(f: F) -> Option<T>
where
    F: FnOnce(&RateLimiter) -> T,
{
    let guard = epoch::pin();
    let shared = ACTIVE.load(Ordering::Acquire, &guard);
    // SAFETY: destruction is deferred until no pinned reader remains
    unsafe { shared.as_ref() }.map(f)
}

/// Clear the slot and wait for the old limiter to be destroyed. Returns
/// `false` if nothing was installed.
pub fn uninstall() -> bool {
    let guard = epoch::pin();
    let old = ACTIVE.swap(Shared::null(), Ordering::AcqRel, &guard);
    if old.is_null() {
        return false;
    }
    let destroyed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&destroyed);
    // SAFETY: `old` is unreachable from ACTIVE now
    unsafe {
        guard.defer_unchecked(move || {
            drop(old.into_owned());
            flag.store(true, Ordering::Release);
        });
    }
    drop(guard);

    let deadline = Instant::now() + ATTACH_TIMEOUT;
    while !destroyed.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            warn!("[DEINIT] limiter still borrowed; it will detach when readers finish");
            return true;
        }
        epoch::pin().flush();
        std::thread::sleep(Duration::from_micros(100));
    }
    debug!("[DEINIT] process-wide limiter destroyed");
    true
}
