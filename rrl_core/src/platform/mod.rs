//! Platform-specific module for rrl

#[cfg(unix)]
pub mod unix;
