//! [`LoopGuard`]: forwarding loop avoidance.
//!
//! Two independent mechanisms:
//!   - [`LoopGuard::already_seen`], a dedup window keyed by the message's
//!     `fragment_id`, so a message that reaches us twice (two relays
//!     forwarded it to us) is only ever processed once. Callers must
//!     check this *before* [`LoopGuard::record_ingress`] — recording
//!     ingress marks the message seen, so checking afterward would
//!     always report a duplicate.
//!   - [`LoopGuard::is_bounce_back`], a per-node last-ingress-address map
//!     consulted once per forwarding candidate, so a message is never
//!     handed straight back out toward the address it just arrived from.
//!
//! Node identity here is the stable [`PeerHint`], not the (possibly
//! rotating) [`PeerAddress`], since the whole point is to recognise "this
//! is the node we just heard from" across an address change.

use std::collections::HashMap;
use std::time::Duration;

use crate::peer::{PeerAddress, PeerHint};

#[derive(Debug)]
pub struct LoopGuard {
    seen_messages: HashMap<[u8; 8], u64>,
    last_ingress: HashMap<PeerHint, PeerAddress>,
    relay_ingress: HashMap<[u8; 8], (PeerAddress, u64)>,
    dedup_window: Duration,
}

impl LoopGuard {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            seen_messages: HashMap::new(),
            last_ingress: HashMap::new(),
            relay_ingress: HashMap::new(),
            dedup_window,
        }
    }

    /// True if `message_id` was already recorded within the dedup window,
    /// i.e. this exact message reached us before via a different relay.
    /// Must be checked before [`Self::record_ingress`] for the same
    /// message.
    pub fn already_seen(&self, message_id: [u8; 8], now_ms: u64) -> bool {
        self.seen_messages
            .get(&message_id)
            .is_some_and(|seen_at| now_ms.saturating_sub(*seen_at) < self.dedup_window.as_millis() as u64)
    }

    /// Records that `message_id` arrived from `ingress_hint` via
    /// `ingress_addr`. Call exactly once per newly-processed message,
    /// after [`Self::already_seen`] has returned `false`.
    pub fn record_ingress(
        &mut self,
        message_id: [u8; 8],
        ingress_hint: PeerHint,
        ingress_addr: PeerAddress,
        now_ms: u64,
    ) {
        self.seen_messages.insert(message_id, now_ms);
        if !ingress_hint.is_no_hint() {
            self.last_ingress.insert(ingress_hint, ingress_addr);
        }
    }

    /// True if `candidate` is the address a message just arrived from, or
    /// is the address the node identified by `ingress_hint` most recently
    /// reached us from — forwarding a message back out toward it would be
    /// a direct bounce-back. The literal-address check applies regardless
    /// of whether a hint is present; the hint lookup is an extra check on
    /// top of it, for when the ingress address has since rotated.
    pub fn is_bounce_back(&self, candidate: &PeerAddress, ingress_addr: &PeerAddress, ingress_hint: PeerHint) -> bool {
        if candidate == ingress_addr {
            return true;
        }
        if ingress_hint.is_no_hint() {
            return false;
        }
        self.last_ingress
            .get(&ingress_hint)
            .is_some_and(|last_addr| last_addr == candidate)
    }

    /// Admits a fragment of `fragment_id` for relay if it is either the
    /// first one seen, or a continuation arriving from the same ingress
    /// address as the first. A later fragment of the same transmission
    /// arriving from a *different* address is a duplicate delivery via
    /// another relay path and must be dropped — unlike
    /// [`Self::already_seen`], which dedups whole reassembled messages,
    /// this dedups at the per-fragment level since `fragment_id` is
    /// shared across every fragment of one transmission.
    pub fn accept_for_relay(&mut self, fragment_id: [u8; 8], ingress_addr: &PeerAddress, now_ms: u64) -> bool {
        let window_ms = self.dedup_window.as_millis() as u64;
        if let Some((addr, seen_at)) = self.relay_ingress.get_mut(&fragment_id) {
            if now_ms.saturating_sub(*seen_at) < window_ms {
                let same = addr == ingress_addr;
                if same {
                    *seen_at = now_ms;
                }
                return same;
            }
        }
        self.relay_ingress.insert(fragment_id, (ingress_addr.clone(), now_ms));
        true
    }

    pub fn evict_stale(&mut self, now_ms: u64) {
        let window_ms = self.dedup_window.as_millis() as u64;
        self.seen_messages
            .retain(|_, seen_at| now_ms.saturating_sub(*seen_at) < window_ms);
        self.relay_ingress
            .retain(|_, (_, seen_at)| now_ms.saturating_sub(*seen_at) < window_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn duplicate_message_within_window_is_detected_before_recording() {
        let mut guard = LoopGuard::new(Duration::from_millis(500));
        let id = [1u8; 8];
        assert!(!guard.already_seen(id, 0));
        guard.record_ingress(id, PeerHint::NO_HINT, addr("a"), 0);
        assert!(guard.already_seen(id, 100));
        assert!(!guard.already_seen(id, 600));
    }

    #[test]
    fn bounce_back_to_ingress_address_is_detected() {
        let mut guard = LoopGuard::new(Duration::from_millis(500));
        let hint = PeerHint::from_bytes([9; 8]);
        guard.record_ingress([2u8; 8], hint, addr("origin"), 0);
        assert!(guard.is_bounce_back(&addr("origin"), &addr("someone-else"), hint));
        assert!(!guard.is_bounce_back(&addr("elsewhere"), &addr("someone-else"), hint));
    }

    #[test]
    fn bounce_back_by_literal_address_applies_even_without_a_hint() {
        let guard = LoopGuard::new(Duration::from_millis(500));
        assert!(guard.is_bounce_back(&addr("origin"), &addr("origin"), PeerHint::NO_HINT));
        assert!(!guard.is_bounce_back(&addr("elsewhere"), &addr("origin"), PeerHint::NO_HINT));
    }

    #[test]
    fn accept_for_relay_allows_continuations_but_not_duplicate_paths() {
        let mut guard = LoopGuard::new(Duration::from_millis(500));
        let id = [3u8; 8];
        assert!(guard.accept_for_relay(id, &addr("relay-a"), 0));
        // A later fragment of the same transmission via the same relay
        // path is a continuation, not a duplicate.
        assert!(guard.accept_for_relay(id, &addr("relay-a"), 10));
        // The same fragment id arriving via a different relay path is a
        // duplicate delivery and must be rejected.
        assert!(!guard.accept_for_relay(id, &addr("relay-b"), 20));

        // Once the window has elapsed a new relay path is accepted again.
        assert!(guard.accept_for_relay(id, &addr("relay-b"), 600));
    }

    #[test]
    fn eviction_drops_entries_outside_the_window() {
        let mut guard = LoopGuard::new(Duration::from_millis(100));
        guard.record_ingress([4u8; 8], PeerHint::NO_HINT, addr("a"), 0);
        guard.evict_stale(50);
        assert!(guard.seen_messages.contains_key(&[4u8; 8]));
        guard.evict_stale(200);
        assert!(!guard.seen_messages.contains_key(&[4u8; 8]));
    }
}
