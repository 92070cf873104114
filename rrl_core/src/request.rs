//! The slice of a resolver request the limiter reads and writes.

use crate::constants::{
    DNS_AD_MASK, DNS_FLAGS1_OFFSET, DNS_FLAGS2_OFFSET, DNS_HEADER_LEN, DNS_TC_MASK,
};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySourceFlags {
    pub tcp: bool,
    pub tls: bool,
}

impl QuerySourceFlags {
    /// The transport has already proven the source address.
    pub fn validated(&self) -> bool {
        self.tcp || self.tls
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySource {
    pub addr: SocketAddr,
    pub flags: QuerySourceFlags,
}

impl QuerySource {
    pub fn udp(addr: SocketAddr) -> Self {
        Self { addr, flags: QuerySourceFlags::default() }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self { addr, flags: QuerySourceFlags { tcp: true, tls: false } }
    }

    pub fn tls(addr: SocketAddr) -> Self {
        Self { addr, flags: QuerySourceFlags { tcp: true, tls: true } }
    }
}

/// Resolver request states, values as the resolver's state machine uses them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Consume = 1,
    Produce = 2,
    Done = 4,
    Fail = 8,
    Yield = 16,
}

pub trait Request {
    /// `None` for internally originated queries.
    fn source(&self) -> Option<QuerySource>;

    /// Attach an answer buffer if there is none yet and return its wire
    /// bytes. `None` when allocation fails.
    fn ensure_answer(&mut self) -> Option<&mut [u8]>;

    fn set_no_answer(&mut self);

    fn set_state(&mut self, state: RequestState);
}

/// Owned request for embedders that do not have their own request type.
#[derive(Debug, Clone)]
pub struct ResolverRequest {
    pub source: Option<QuerySource>,
    pub answer: Option<Vec<u8>>,
    pub no_answer: bool,
    pub state: RequestState,
    answer_alloc_fails: bool,
}

impl ResolverRequest {
    pub fn new(source: Option<QuerySource>) -> Self {
        Self {
            source,
            answer: None,
            no_answer: false,
            state: RequestState::Consume,
            answer_alloc_fails: false,
        }
    }

    pub fn internal() -> Self {
        Self::new(None)
    }

    /// Make every later `ensure_answer` fail, as under memory pressure.
    pub fn with_failing_answer(mut self) -> Self {
        self.answer_alloc_fails = true;
        self
    }

    /// TC bit of the answer header, if an answer is attached.
    pub fn answer_tc(&self) -> Option<bool> {
        self.answer
            .as_deref()
            .filter(|a| a.len() >= DNS_HEADER_LEN)
            .map(|a| a[DNS_FLAGS1_OFFSET] & DNS_TC_MASK != 0)
    }

    pub fn answer_ad(&self) -> Option<bool> {
        self.answer
            .as_deref()
            .filter(|a| a.len() >= DNS_HEADER_LEN)
            .map(|a| a[DNS_FLAGS2_OFFSET] & DNS_AD_MASK != 0)
    }
}

impl Request for ResolverRequest {
    fn source(&self) -> Option<QuerySource> {
        self.source
    }

    fn ensure_answer(&mut self) -> Option<&mut [u8]> {
        if self.answer_alloc_fails {
            return None;
        }
        Some(self.answer.get_or_insert_with(|| vec![0u8; DNS_HEADER_LEN]).as_mut_slice())
    }

    fn set_no_answer(&mut self) {
        self.no_answer = true;
    }

    fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }
}
