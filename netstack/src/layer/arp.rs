//! A generic ARP resolver, parameterized over the data-link and protocol address types it
//! bridges.
//!
//! Concretely this stack only ever resolves IPv4 addresses to Ethernet addresses, but nothing in
//! the resolution state machine below depends on that pairing; the two type parameters keep the
//! cache and pending-request bookkeeping reusable if a second data-link or protocol layer is ever
//! added.

use std::collections::HashMap;
use std::hash::Hash;

use crate::time::{Tick, TimerId, TimerWheel};

/// How long a resolved mapping stays in the cache before it must be re-requested.
pub const CACHE_TIMEOUT: Tick = 3600;
/// How long an unanswered request stays pending before its callbacks are dropped.
pub const REQUEST_TIMEOUT: Tick = 5;

/// A received ARP message, already decoded from whatever wire format the caller used.
pub struct Message<D, P> {
    pub operation: Operation,
    pub source_hw_addr: D,
    pub source_proto_addr: P,
    pub target_hw_addr: D,
    pub target_proto_addr: P,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Request,
    Reply,
}

enum Entry<D> {
    /// `timer` is `None` for a statically configured binding, which never expires.
    Cached { addr: D, timer: Option<TimerId> },
    Pending { callbacks: Vec<Box<dyn FnOnce(Option<D>)>>, timer: TimerId },
}

/// Resolves protocol addresses (`P`) to data-link addresses (`D`), caching successes and
/// coalescing concurrent requests for the same address.
///
/// The cache and pending-request bookkeeping share one map keyed by `P`, since a given protocol
/// address is in exactly one of the two states at a time; resolving that into a single `Entry`
/// enum (rather than two maps with a disjointness invariant to maintain by hand) lets the type
/// system rule out the case the original's "key sets are disjoint" comment has to assert instead.
///
/// Expiry is driven by a [`TimerWheel`] rather than a per-tick scan of the whole table: every
/// cache entry and pending request schedules its own deadline when it's created, and
/// [`Resolver::tick`] only has to look at what the wheel says is actually due.
pub struct Resolver<D, P: Eq + Hash> {
    table: HashMap<P, Entry<D>>,
    wheel: TimerWheel<P>,
}

impl<D: Copy, P: Copy + Eq + Hash> Resolver<D, P> {
    pub fn new() -> Self {
        Resolver { table: HashMap::new(), wheel: TimerWheel::new() }
    }

    /// Look up `proto_addr`. If cached, `on_resolved` runs immediately with the stored address.
    /// Otherwise the caller's interest is queued and `send_request` is invoked to broadcast an
    /// ARP request (only on the first caller for a given address; later callers coalesce onto the
    /// same pending request).
    pub fn resolve(
        &mut self,
        proto_addr: P,
        now: Tick,
        on_resolved: impl FnOnce(Option<D>) + 'static,
        mut send_request: impl FnMut(),
    ) {
        match self.table.get_mut(&proto_addr) {
            Some(Entry::Cached { addr, .. }) => on_resolved(Some(*addr)),
            Some(Entry::Pending { callbacks, .. }) => callbacks.push(Box::new(on_resolved)),
            None => {
                let timer = self.wheel.schedule(now, REQUEST_TIMEOUT, proto_addr);
                self.table.insert(proto_addr, Entry::Pending { callbacks: vec![Box::new(on_resolved)], timer });
                send_request();
            }
        }
    }

    /// Process a received ARP message. Returns a reply to send back, if this was a request for
    /// our own address.
    pub fn receive_message(&mut self, message: &Message<D, P>, our_proto_addr: P, now: Tick) -> Option<(D, P)> {
        self.update_cache(message.source_proto_addr, message.source_hw_addr, now);

        match message.operation {
            Operation::Request if message.target_proto_addr == our_proto_addr => {
                Some((message.source_hw_addr, message.source_proto_addr))
            }
            _ => None,
        }
    }

    /// Insert or refresh a cache entry, and resolve any requests that were waiting on it.
    ///
    /// Pending callbacks run only after the entry is removed from the table, so a callback that
    /// re-enters [`Resolver::resolve`] for the same address never observes a half-updated table.
    pub fn update_cache(&mut self, proto_addr: P, hw_addr: D, now: Tick) {
        let pending = match self.table.remove(&proto_addr) {
            Some(Entry::Pending { callbacks, timer }) => {
                self.wheel.remove(timer);
                Some(callbacks)
            }
            Some(Entry::Cached { timer: Some(timer), .. }) => {
                self.wheel.remove(timer);
                None
            }
            _ => None,
        };

        let timer = self.wheel.schedule(now, CACHE_TIMEOUT, proto_addr);
        self.table.insert(proto_addr, Entry::Cached { addr: hw_addr, timer: Some(timer) });

        if let Some(callbacks) = pending {
            for callback in callbacks {
                callback(Some(hw_addr));
            }
        }
    }

    /// Insert a binding that never expires, for addresses configured at startup rather than
    /// learned from the wire.
    pub fn insert_static(&mut self, proto_addr: P, hw_addr: D) {
        self.table.insert(proto_addr, Entry::Cached { addr: hw_addr, timer: None });
    }

    pub fn cached(&self, proto_addr: P) -> Option<D> {
        match self.table.get(&proto_addr) {
            Some(Entry::Cached { addr, .. }) => Some(*addr),
            _ => None,
        }
    }

    /// Expire every cache entry and pending request whose deadline has passed, running pending
    /// callbacks with `None`. Call this once per worker loop iteration.
    pub fn tick(&mut self, now: Tick) {
        for (_, proto_addr) in self.wheel.tick(now) {
            if let Some(Entry::Pending { callbacks, .. }) = self.table.remove(&proto_addr) {
                for callback in callbacks {
                    callback(None);
                }
            }
        }
    }
}

impl<D: Copy, P: Copy + Eq + Hash> Default for Resolver<D, P> {
    fn default() -> Self {
        Resolver::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn reply_to_our_address_resolves_the_source() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        let reply = resolver.receive_message(
            &Message { operation: Operation::Request, source_hw_addr: 1, source_proto_addr: 10, target_hw_addr: 0, target_proto_addr: 99 },
            99,
            0,
        );
        assert_eq!(reply, Some((1, 10)));
        assert_eq!(resolver.cached(10), Some(1));
    }

    #[test]
    fn request_for_someone_else_still_updates_the_cache_but_yields_no_reply() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        let reply = resolver.receive_message(
            &Message { operation: Operation::Request, source_hw_addr: 1, source_proto_addr: 10, target_hw_addr: 0, target_proto_addr: 200 },
            99,
            0,
        );
        assert_eq!(reply, None);
        assert_eq!(resolver.cached(10), Some(1));
    }

    #[test]
    fn concurrent_resolves_coalesce_onto_one_request() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        let requests = Rc::new(RefCell::new(0));
        let results = Rc::new(RefCell::new(Vec::new()));

        for _ in 0..3 {
            let requests = requests.clone();
            let results = results.clone();
            resolver.resolve(10, 0, move |addr| results.borrow_mut().push(addr), || *requests.borrow_mut() += 1);
        }
        assert_eq!(*requests.borrow(), 1);

        resolver.update_cache(10, 1u8, 0);
        assert_eq!(*results.borrow(), vec![Some(1), Some(1), Some(1)]);
    }

    #[test]
    fn unanswered_request_resolves_to_none_on_timeout() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        let resolved = Rc::new(RefCell::new(None));
        let resolved2 = resolved.clone();
        resolver.resolve(10, 0, move |addr| *resolved2.borrow_mut() = Some(addr), || {});
        resolver.tick(REQUEST_TIMEOUT);
        assert_eq!(*resolved.borrow(), Some(None));
    }

    #[test]
    fn cache_entry_expires_after_its_timeout() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        resolver.update_cache(10, 1u8, 0);
        resolver.tick(CACHE_TIMEOUT - 1);
        assert_eq!(resolver.cached(10), Some(1));
        resolver.tick(CACHE_TIMEOUT);
        assert_eq!(resolver.cached(10), None);
    }

    #[test]
    fn static_entries_survive_ticks_far_past_the_usual_cache_timeout() {
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        resolver.insert_static(10, 1u8);
        resolver.tick(CACHE_TIMEOUT * 1000);
        assert_eq!(resolver.cached(10), Some(1));
    }

    #[test]
    fn a_fresh_reply_cancels_the_pending_requests_timeout() {
        // Regression guard: update_cache must remove the old Pending timer from the wheel, or a
        // stale timer fires later and wrongly expires the entry a reply just installed.
        let mut resolver: Resolver<u8, u8> = Resolver::new();
        resolver.resolve(10, 0, |_| {}, || {});
        resolver.update_cache(10, 1u8, 0);
        resolver.tick(REQUEST_TIMEOUT);
        assert_eq!(resolver.cached(10), Some(1));
    }
}
