use crate::{
    errors::{map_error, set_last_error, ErrorCode},
    handle_registry,
    platform::unix::sockaddr_to_std,
    request::{QuerySource, QuerySourceFlags, Request, RequestState},
    RateLimitConfig, RateLimiter,
};
use std::{
    ffi::{c_void, CStr},
    os::raw::{c_char, c_int},
};

/// Attach (or return) the answer buffer of `ctx`'s request and store its
/// length in `*out_len`. Returns null when no buffer can be attached.
pub type EnsureAnswerFn = unsafe extern "C" fn(ctx: *mut c_void, out_len: *mut usize) -> *mut u8;

/// Resolver request as seen through the C ABI.
#[repr(C)]
pub struct RrlRequestT {
    /// Source address; null for internally originated queries.
    pub addr: *const libc::sockaddr,
    pub tcp: bool,
    pub tls: bool,
    pub ensure_answer: Option<EnsureAnswerFn>,
    pub ctx: *mut c_void,
    /// Set by the limiter when the query must get no answer at all.
    pub no_answer: bool,
    pub state: RequestState,
}

struct CRequest<'a> {
    raw: &'a mut RrlRequestT,
    source: Option<QuerySource>,
}

impl Request for CRequest<'_> {
    fn source(&self) -> Option<QuerySource> {
        self.source
    }

    fn ensure_answer(&mut self) -> Option<&mut [u8]> {
        let cb = self.raw.ensure_answer?;
        let mut len = 0usize;
        let wire = unsafe { cb(self.raw.ctx, &mut len) };
        if wire.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(wire, len) })
    }

    fn set_no_answer(&mut self) {
        self.raw.no_answer = true;
    }

    fn set_state(&mut self, state: RequestState) {
        self.raw.state = state;
    }
}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => {
        set_last_error(e);
        return e;
    }
}}}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Initialize the process-wide limiter over the region linked at `path_utf8`.
#[no_mangle]
pub extern "C" fn rrl_init(
    path_utf8: *const c_char,
    capacity: usize,
    instant_limit: u32,
    rate_limit: u32,
    tc_limit_perc: c_int,
) -> ErrorCode {
    let path = try_c!(cstr(path_utf8));
    if handle_registry::is_installed() {
        set_last_error(ErrorCode::AlreadyInitialized);
        return ErrorCode::AlreadyInitialized;
    }
    let tc_limit_perc = try_c!(u32::try_from(tc_limit_perc).map_err(|_| ErrorCode::InvalidConfig));
    let config = RateLimitConfig { capacity, instant_limit, rate_limit, tc_limit_perc };
    let limiter = try_c!(RateLimiter::init(path, &config).map_err(|e| map_error(&e)));
    try_c!(handle_registry::install(limiter).map_err(|e| map_error(&e)));
    set_last_error(ErrorCode::Success);
    ErrorCode::Success
}

/// Detach the process-wide limiter. Safe to call when none is installed.
#[no_mangle]
pub extern "C" fn rrl_deinit() {
    handle_registry::uninstall();
}

#[no_mangle]
pub extern "C" fn rrl_is_initialized() -> bool {
    handle_registry::is_installed()
}

// ───────────────────────── per request ───────────────────────────────── //

/// Returns `true` when the limiter finalized `req` and the resolver must
/// stop processing it.
#[no_mangle]
pub extern "C" fn rrl_request_begin(req: *mut RrlRequestT) -> bool {
    let Some(raw) = (unsafe { req.as_mut() }) else {
        return false;
    };
    let source = unsafe { sockaddr_to_std(raw.addr) }.map(|addr| QuerySource {
        addr,
        flags: QuerySourceFlags { tcp: raw.tcp, tls: raw.tls },
    });
    let mut creq = CRequest { raw, source };
    handle_registry::with_handle(|rl| rl.request_begin(&mut creq)).unwrap_or(false)
}
