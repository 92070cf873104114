//! Verdict policy: counter state in, DNS-level action out.

use crate::helpers::{wire_clear_ad, wire_set_tc};
use crate::request::{Request, RequestState};
use crate::telemetry::COUNTERS;
use log::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Allow,
    /// Answer with TC=1 so the client retries over a validating transport.
    Truncate,
    /// Produce nothing.
    Drop,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Truncate => "truncate",
            Verdict::Drop => "drop",
        }
    }
}

/// `tc_limit == u16::MAX` can never be exceeded, which disables TRUNCATE.
#[inline]
pub fn classify(limited: bool, max_final_load: u16, tc_limit: u16) -> Verdict {
    if limited {
        Verdict::Drop
    } else if max_final_load > tc_limit {
        Verdict::Truncate
    } else {
        Verdict::Allow
    }
}

/// Apply `verdict` to `req`. Returns `true` when the request is finished and
/// the resolver must not process it further.
pub fn enforce<R: Request + ?Sized>(req: &mut R, verdict: Verdict) -> bool {
    match verdict {
        Verdict::Allow => false,
        Verdict::Truncate => {
            if req.source().is_some_and(|s| s.flags.validated()) {
                // source already validated by the transport
                COUNTERS.tc_upgraded.increment(1);
                return false;
            }
            COUNTERS.truncated.increment(1);
            match req.ensure_answer() {
                Some(wire) => {
                    if wire_set_tc(wire) {
                        wire_clear_ad(wire);
                    } else {
                        error!("[RRL] answer buffer too short for a DNS header ({} bytes)", wire.len());
                        COUNTERS.answer_alloc_failed.increment(1);
                    }
                }
                None => {
                    error!("[RRL] could not attach an answer to a truncated request");
                    COUNTERS.answer_alloc_failed.increment(1);
                }
            }
            debug!("[RRL] truncate {:?}", req.source().map(|s| s.addr));
            req.set_state(RequestState::Done);
            true
        }
        Verdict::Drop => {
            COUNTERS.dropped.increment(1);
            debug!("[RRL] drop {:?}", req.source().map(|s| s.addr));
            req.set_no_answer();
            req.set_state(RequestState::Fail);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{QuerySource, ResolverRequest};

    fn udp() -> ResolverRequest {
        ResolverRequest::new(Some(QuerySource::udp("198.51.100.4:4000".parse().unwrap())))
    }

    #[test]
    fn classification_order() {
        assert_eq!(classify(true, 0, 0), Verdict::Drop);
        assert_eq!(classify(true, u16::MAX, u16::MAX), Verdict::Drop);
        assert_eq!(classify(false, 101, 100), Verdict::Truncate);
        assert_eq!(classify(false, 100, 100), Verdict::Allow);
        assert_eq!(classify(false, u16::MAX, u16::MAX), Verdict::Allow);
    }

    #[test]
    fn truncate_sets_tc_and_clears_ad() {
        let mut req = udp();
        req.answer = Some(vec![0xFF; 12]);
        assert!(enforce(&mut req, Verdict::Truncate));
        assert_eq!(req.answer_tc(), Some(true));
        assert_eq!(req.answer_ad(), Some(false));
        assert_eq!(req.state, RequestState::Done);
        assert!(!req.no_answer);
    }

    #[test]
    fn truncate_over_tcp_passes_through() {
        let mut req = ResolverRequest::new(Some(QuerySource::tcp("198.51.100.4:4000".parse().unwrap())));
        assert!(!enforce(&mut req, Verdict::Truncate));
        assert!(req.answer.is_none());
        assert_eq!(req.state, RequestState::Consume);
    }

    #[test]
    fn truncate_without_answer_is_still_handled() {
        let mut req = udp().with_failing_answer();
        assert!(enforce(&mut req, Verdict::Truncate));
        assert_eq!(req.state, RequestState::Done);

        let mut short = udp();
        short.answer = Some(vec![0; 4]);
        assert!(enforce(&mut short, Verdict::Truncate));
        assert_eq!(short.answer.as_deref(), Some(&[0u8; 4][..]));
    }

    #[test]
    fn drop_sets_no_answer_and_fails() {
        let mut req = udp();
        assert!(enforce(&mut req, Verdict::Drop));
        assert!(req.no_answer);
        assert_eq!(req.state, RequestState::Fail);
        assert!(req.answer.is_none());
    }

    #[test]
    fn allow_touches_nothing() {
        let mut req = udp();
        assert!(!enforce(&mut req, Verdict::Allow));
        assert_eq!(req.state, RequestState::Consume);
        assert!(!req.no_answer);
    }
}
