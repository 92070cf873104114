//! Error handling and C-ABI error codes for rrl

use shared_memory::ShmemError;
use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_char;

/// Error type for limiter initialization and the shared-region manager.
///
/// The per-request path never produces one of these; it only passes a
/// request through or finalizes it.
#[derive(Debug)]
pub enum Error {
    /// Creating, opening or mapping the shared region failed.
    Shmem(ShmemError),
    /// A peer initialized the region with a different identity header.
    HeaderMismatch,
    SizeMismatch { expected: usize, found: usize },
    /// The first process never published the region.
    AttachTimeout,
    InvalidConfig(String),
    /// The counter engine cannot address a table of the requested capacity.
    CapacityTooLarge,
    EngineInit,
    /// The requested counter-engine variant is not supported by this CPU.
    VariantUnavailable,
    AlreadyInitialized,
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Shmem(e) => write!(f, "shared memory error: {e}"),
            Error::HeaderMismatch => f.write_str("shared region was initialized with an incompatible header"),
            Error::SizeMismatch { expected, found } => {
                write!(f, "shared region size mismatch: expected {expected} bytes, found {found}")
            }
            Error::AttachTimeout => f.write_str("timed out waiting for the shared region to be published"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::CapacityTooLarge => f.write_str("capacity too large for the counter table"),
            Error::EngineInit => f.write_str("counter table initialization failed"),
            Error::VariantUnavailable => f.write_str("counter table variant not supported on this CPU"),
            Error::AlreadyInitialized => f.write_str("rate limiting is already initialized"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Shmem(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmemError> for Error {
    fn from(e: ShmemError) -> Self {
        Error::Shmem(e)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidConfig = 1,
    ShmemOpenFailed = 2,
    HeaderMismatch = 3,
    AttachTimeout = 4,
    CapacityTooLarge = 5,
    EngineInitFailed = 6,
    VariantUnavailable = 7,
    AlreadyInitialized = 8,
    Utf8Error = 9,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::InvalidConfig => "Invalid configuration",
            ErrorCode::ShmemOpenFailed => "Shared memory open failed",
            ErrorCode::HeaderMismatch => "Shared region header mismatch",
            ErrorCode::AttachTimeout => "Timed out attaching to shared region",
            ErrorCode::CapacityTooLarge => "Capacity too large",
            ErrorCode::EngineInitFailed => "Counter table initialization failed",
            ErrorCode::VariantUnavailable => "Counter table variant unavailable",
            ErrorCode::AlreadyInitialized => "Already initialized",
            ErrorCode::Utf8Error => "UTF-8 conversion error",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    /// NUL-terminated variant of [`ErrorCode::as_str`] for C callers.
    pub fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::InvalidConfig => b"Invalid configuration\0",
            ErrorCode::ShmemOpenFailed => b"Shared memory open failed\0",
            ErrorCode::HeaderMismatch => b"Shared region header mismatch\0",
            ErrorCode::AttachTimeout => b"Timed out attaching to shared region\0",
            ErrorCode::CapacityTooLarge => b"Capacity too large\0",
            ErrorCode::EngineInitFailed => b"Counter table initialization failed\0",
            ErrorCode::VariantUnavailable => b"Counter table variant unavailable\0",
            ErrorCode::AlreadyInitialized => b"Already initialized\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn rrl_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn rrl_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::Shmem(_) | Error::SizeMismatch { .. } => ErrorCode::ShmemOpenFailed,
        Error::HeaderMismatch => ErrorCode::HeaderMismatch,
        Error::AttachTimeout => ErrorCode::AttachTimeout,
        Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
        Error::CapacityTooLarge => ErrorCode::CapacityTooLarge,
        Error::EngineInit => ErrorCode::EngineInitFailed,
        Error::VariantUnavailable => ErrorCode::VariantUnavailable,
        Error::AlreadyInitialized => ErrorCode::AlreadyInitialized,
        Error::Other(_) => ErrorCode::Unknown,
    }
}
