//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process registers a raw callback that
//! receives NUL-terminated metric names with their values.

use metrics::{counter, Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::{Lazy, OnceCell};
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C. Only the first registration sticks.
#[no_mangle]
pub extern "C" fn rrl_register_stats_callback(cb: StatsCallback) -> bool {
    CALLBACK.set(cb).is_ok()
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct FfiRecorder;

/// One registered metric; counters, gauges and histograms all forward the
/// same way.
struct FfiMetric {
    name: Option<CString>,
}

impl FfiMetric {
    fn from_key(key: &Key) -> Arc<Self> {
        Arc::new(Self { name: CString::new(key.name()).ok() })
    }

    fn emit(&self, value: c_ulonglong) {
        if let (Some(cb), Some(name)) = (CALLBACK.get(), self.name.as_ref()) {
            unsafe { cb(name.as_ptr(), value) };
        }
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(FfiMetric::from_key(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(FfiMetric::from_key(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(FfiMetric::from_key(key))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value as c_ulonglong);
    }
    fn absolute(&self, value: u64) {
        self.emit(value as c_ulonglong);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.emit(value as c_ulonglong);
    }
    fn increment(&self, value: f64) {
        self.emit(value as c_ulonglong);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as c_ulonglong);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as c_ulonglong);
    }
}

/// Counters bumped per request. Registration allocates, so it happens once
/// here and requests only increment the stored handles.
pub(crate) struct RequestCounters {
    pub requests: Counter,
    pub truncated: Counter,
    pub tc_upgraded: Counter,
    pub dropped: Counter,
    pub answer_alloc_failed: Counter,
}

pub(crate) static COUNTERS: Lazy<RequestCounters> = Lazy::new(|| {
    // handles registered before a recorder exists would stay no-ops
    init();
    RequestCounters {
        requests: counter!("rrl_requests_total"),
        truncated: counter!("rrl_truncated_total"),
        tc_upgraded: counter!("rrl_tc_upgraded_total"),
        dropped: counter!("rrl_dropped_total"),
        answer_alloc_failed: counter!("rrl_answer_alloc_failed_total"),
    }
});

/// Install exactly **once** – called from crate root.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_nul_terminated() {
        let metric = FfiMetric::from_key(&Key::from_name("rrl_requests_total"));
        let name = metric.name.as_ref().unwrap();
        assert_eq!(name.as_bytes_with_nul().last(), Some(&0));
        assert_eq!(name.to_str().unwrap(), "rrl_requests_total");
    }

    #[test]
    fn interior_nul_names_are_skipped() {
        let metric = FfiMetric::from_key(&Key::from_name("bad\0name"));
        assert!(metric.name.is_none());
        // must not call anything
        metric.emit(1);
    }
}
