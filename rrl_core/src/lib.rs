#[cfg(not(unix))]
compile_error!("rrl_core relies on POSIX shared memory and supports unix targets only");

pub mod constants;
pub mod errors;
pub mod handle_registry;
pub mod helpers;
pub mod kru;
pub mod mmapped;
pub mod platform;
pub mod policy;
pub mod request;
pub mod telemetry;
pub mod types;

use constants::*;
use helpers::*;
use kru::{KruPrice, KruVariant};
use log::{error, info, trace};
use metrics::counter;
use mmapped::{InitOutcome, MmappedRegion};
use once_cell::sync::OnceCell;
use policy::{classify, enforce};
use request::Request;
use std::{
    net::IpAddr,
    path::Path,
    ptr::{self, NonNull},
};

pub use errors::{Error, ErrorCode};
pub use policy::Verdict;
pub use request::{QuerySource, QuerySourceFlags, RequestState, ResolverRequest};
pub use types::{Evaluation, Header, RateLimitConfig, RateLimiter};

// ===== Compile-time assertions for alignment and size =====
const HEADER_PADDED: usize = helpers::align_up(std::mem::size_of::<Header>(), CACHE_LINE);
const _: () = assert!(HEADER_PADDED % CACHE_LINE == 0);
const _: () = assert!(std::mem::align_of::<Header>() == CACHE_LINE);
const _: () = assert!(types::IDENTITY_LEN <= HEADER_PADDED);

impl RateLimiter {
    // ---- logging and metrics bootstrap -------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
            telemetry::init();
        });
    }

    /// Create or attach the limiter whose region is linked at `path`, using
    /// the best counter-table variant this CPU supports.
    pub fn init(path: impl AsRef<Path>, config: &RateLimitConfig) -> Result<Self, Error> {
        Self::init_with_variant(path, config, KruVariant::detect())
    }

    /// Like [`RateLimiter::init`] with a fixed table variant.
    pub fn init_with_variant(
        path: impl AsRef<Path>,
        config: &RateLimitConfig,
        variant: KruVariant,
    ) -> Result<Self, Error> {
        Self::ensure_logging();
        let path = path.as_ref();
        Self::open(path, config, variant).inspect_err(|e| {
            error!("[INIT] rate limiting failed to initialize at {}: {e}", path.display());
            counter!("rrl_init_total", "outcome" => "error").increment(1);
        })
    }

    fn open(path: &Path, config: &RateLimitConfig, variant: KruVariant) -> Result<Self, Error> {
        config.validate()?;
        let kru = variant.api().ok_or(Error::VariantUnavailable)?;
        let capacity_log = capacity_log(config.capacity);
        let payload = kru.size_of(capacity_log).ok_or(Error::CapacityTooLarge)?;
        let size = HEADER_PADDED.checked_add(payload).ok_or(Error::CapacityTooLarge)?;

        let header = Header::new(config, variant);
        let (region, outcome) = MmappedRegion::init(path, size, header.identity())?;
        let hdr = region.as_ptr().cast::<Header>();
        // SAFETY: the region is `size` bytes, so the payload offset is in bounds
        let kru_base = unsafe { NonNull::new_unchecked(region.as_ptr().as_ptr().add(HEADER_PADDED)) };

        match outcome {
            InitOutcome::Created => {
                // SAFETY: we created the region and nobody can attach before
                // `init_continue`
                unsafe {
                    if !kru.initialize(kru_base, capacity_log, config.max_decay()) {
                        return Err(Error::EngineInit);
                    }
                    ptr::write(hdr.as_ptr(), header);
                }
                region.init_continue();
                info!(
                    "[INIT] rate limiting initialized ({}): capacity={} instant={} rate={} tc={}",
                    variant.as_str(),
                    config.capacity,
                    config.instant_limit,
                    config.rate_limit,
                    header.tc_limit
                );
                counter!("rrl_init_total", "outcome" => "created").increment(1);
            }
            InitOutcome::Attached => {
                info!("[ATTACH] rate limiting loaded ({}) from {}", variant.as_str(), path.display());
                counter!("rrl_init_total", "outcome" => "attached").increment(1);
            }
        }

        Ok(Self { region, hdr, kru_base, kru })
    }

    /// Detach from the shared region; the last peer removes it.
    pub fn deinit(self) {
        info!("[DEINIT] detaching from {}", self.region.path().display());
        drop(self);
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.hdr.as_ref() }
    }

    pub fn capacity(&self) -> u64 {
        self.header().capacity
    }

    pub fn instant_limit(&self) -> u32 {
        self.header().instant_limit
    }

    pub fn rate_limit(&self) -> u32 {
        self.header().rate_limit
    }

    pub fn tc_limit(&self) -> u16 {
        self.header().tc_limit
    }

    pub fn variant(&self) -> KruVariant {
        self.kru.variant()
    }

    pub fn v4_prices(&self) -> &[KruPrice] {
        &self.header().v4_prices
    }

    pub fn v6_prices(&self) -> &[KruPrice] {
        &self.header().v6_prices
    }

    /// Peers currently attached to the region, this one included.
    pub fn peers(&self) -> u32 {
        self.region.attached()
    }

    /// Charge every prefix of `ip` at time `now` (ms) and classify the result.
    pub fn evaluate(&self, ip: IpAddr, now: u32) -> Evaluation {
        let hdr = self.header();
        let key = ip_key(&ip);
        let (namespace, prefixes, prices): (u8, &[u8], &[KruPrice]) = match ip {
            IpAddr::V4(_) => (NAMESPACE_V4, &RRL_V4_PREFIXES, &hdr.v4_prices),
            IpAddr::V6(_) => (NAMESPACE_V6, &RRL_V6_PREFIXES, &hdr.v6_prices),
        };
        // SAFETY: `kru_base` was initialized by `self.kru`'s variant, which the
        // identity header pins, and stays mapped while `self` lives
        let charge = unsafe {
            self.kru
                .limited_multi_prefix_or(self.kru_base, now, namespace, &key, prefixes, prices)
        };
        let verdict = classify(charge.is_limited(), charge.max_final_load, hdr.tc_limit);
        trace!(
            "[RRL] {ip} limited={:?} load={} -> {}",
            charge.limited_prefix,
            charge.max_final_load,
            verdict.as_str()
        );
        Evaluation {
            verdict,
            limited_prefix: charge.limited_prefix,
            max_final_load: charge.max_final_load,
        }
    }

    /// Decide on `req`. Returns `true` when the limiter finalized it.
    pub fn request_begin<R: Request + ?Sized>(&self, req: &mut R) -> bool {
        self.request_begin_at(req, now_ms())
    }

    /// [`RateLimiter::request_begin`] with an explicit millisecond clock.
    pub fn request_begin_at<R: Request + ?Sized>(&self, req: &mut R, now: u32) -> bool {
        let Some(source) = req.source() else {
            return false;
        };
        telemetry::COUNTERS.requests.increment(1);
        let eval = self.evaluate(source.addr.ip(), now);
        enforce(req, eval.verdict)
    }
}

// Public module for C API functions
pub mod public_api;

// Re-export all public API functions at the crate root
pub use public_api::*;
