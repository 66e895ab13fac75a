//! [`CollisionResolver`]: deciding which side of a duplicate client/server
//! link pair survives when both peers dial each other at roughly the same
//! time.
//!
//! Resolution never tears a link down on the spot — it schedules a
//! [`LinkLedger::schedule_deferred_teardown`] so the losing side gets a
//! short grace window in case the "winning" link turns out not to be
//! usable after all.

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::ledger::{LinkLedger, LinkRole};
use crate::peer::PeerAddress;

pub struct CollisionResolver;

impl CollisionResolver {
    /// Inbound-second race: `addr` already has a `ClientLink`, and a fresh
    /// `CentralConnected` just arrived for the same address.
    /// The existing client link is never torn down outright — the new
    /// inbound attempt is admitted and given a grace window in case it
    /// proves itself (subscribes) before the deferred-teardown deadline.
    ///
    /// Returns `false` if a resolution for this exact address is already
    /// in flight, meaning this is a stale re-delivery of an event already
    /// being handled; the caller should ignore it rather than rescheduling.
    pub fn defer_inbound_on_client_collision(
        ledger: &mut LinkLedger,
        addr: PeerAddress,
        now_ms: u64,
        config: &CoreConfig,
    ) -> bool {
        if ledger.deferred_teardown_role(&addr) == Some(LinkRole::Server) {
            return false;
        }
        ledger.schedule_deferred_teardown(
            addr,
            LinkRole::Server,
            now_ms + config.deferred_teardown.as_millis() as u64,
        );
        true
    }

    /// Guards against re-processing a `CharacteristicSubscribed` event for
    /// a central already marked subscribed (drivers occasionally redeliver
    /// the notification-enabled descriptor write).
    pub fn is_duplicate_subscription(ledger: &LinkLedger, addr: &PeerAddress) -> bool {
        ledger.server(addr).is_some_and(|link| link.subscribed)
    }

    /// Inbound-first race: we have just accepted a server (inbound) link
    /// to `addr` while a dial to the same address is still pending.
    /// Rather than disconnecting the outbound attempt outright, schedule
    /// its eventual teardown so it has one more grace window to complete
    /// in case the inbound link is itself about to be resolved away.
    pub fn defer_outbound_on_inbound_collision(
        ledger: &mut LinkLedger,
        addr: PeerAddress,
        now_ms: u64,
        config: &CoreConfig,
    ) {
        if ledger.is_pending_dial(&addr) {
            ledger.schedule_deferred_teardown(
                addr,
                LinkRole::Client,
                now_ms + config.deferred_teardown.as_millis() as u64,
            );
        }
    }

    /// Outbound-finds-inbound race: decides whether a dial already in
    /// flight to `addr` should yield to an existing inbound link, via a
    /// five-step resolution:
    ///   1. a server link already slated for teardown is not a contender
    ///   2. no server link at all means there is nothing to yield to
    ///   3. poll for the inbound link to prove itself subscribed/viable
    ///   4. break the tie between two live contenders with a token compare
    ///   5. fall back to preserving the existing link if tokens collide
    pub async fn should_yield_to_inbound<C: Clock>(
        ledger: &LinkLedger,
        clock: &C,
        addr: &PeerAddress,
        local_token: &str,
        remote_token: &str,
        config: &CoreConfig,
    ) -> bool {
        if ledger.deferred_teardown_role(addr) == Some(LinkRole::Server) {
            return false;
        }
        if !ledger.has_server(addr) {
            return false;
        }

        if !Self::poll_inbound_viability(ledger, clock, addr, config).await {
            return false;
        }

        if local_token != remote_token {
            // The lexicographically larger token yields its outbound dial;
            // evaluated symmetrically on both ends this always leaves
            // exactly one side dialing.
            return local_token > remote_token;
        }
        true
    }

    async fn poll_inbound_viability<C: Clock>(
        ledger: &LinkLedger,
        clock: &C,
        addr: &PeerAddress,
        config: &CoreConfig,
    ) -> bool {
        let poll_ms = config.inbound_viability_poll.as_millis().max(1) as u64;
        let total_polls = (config.inbound_viability_wait.as_millis() as u64 / poll_ms).max(1);
        for _ in 0..total_polls {
            let viable = ledger.is_viable_server(addr)
                && ledger.server(addr).is_some_and(|link| link.subscribed);
            if viable {
                return true;
            }
            clock.sleep(config.inbound_viability_poll).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;

    fn addr() -> PeerAddress {
        PeerAddress::new("peer")
    }

    #[test]
    fn client_collision_schedules_a_deferred_server_teardown_once() {
        let mut ledger = LinkLedger::new();
        let config = CoreConfig::default();
        ledger.add_client(addr(), 0);

        assert!(CollisionResolver::defer_inbound_on_client_collision(
            &mut ledger, addr(), 0, &config
        ));
        assert_eq!(ledger.deferred_teardown_role(&addr()), Some(LinkRole::Server));

        // A second CentralConnected for the same address while resolution
        // is already in flight is a stale re-delivery, not a fresh race.
        assert!(!CollisionResolver::defer_inbound_on_client_collision(
            &mut ledger, addr(), 5, &config
        ));
    }

    #[test]
    fn defer_outbound_only_applies_when_a_dial_is_pending() {
        let mut ledger = LinkLedger::new();
        let config = CoreConfig::default();
        CollisionResolver::defer_outbound_on_inbound_collision(&mut ledger, addr(), 0, &config);
        assert!(ledger.deferred_teardown_role(&addr()).is_none());

        ledger.mark_pending_dial(addr());
        CollisionResolver::defer_outbound_on_inbound_collision(&mut ledger, addr(), 0, &config);
        assert_eq!(ledger.deferred_teardown_role(&addr()), Some(LinkRole::Client));
    }

    #[tokio::test]
    async fn yields_to_inbound_only_once_it_becomes_viable() {
        let mut ledger = LinkLedger::new();
        let clock = SimClock::new();
        let config = CoreConfig::default();
        ledger.add_server(addr(), 0, None);

        let yielded = CollisionResolver::should_yield_to_inbound(
            &ledger, &clock, &addr(), "aaaa", "bbbb", &config,
        )
        .await;
        assert!(!yielded, "not subscribed yet, should not yield");

        ledger.set_subscription(&addr(), LinkRole::Server, true);
        let yielded = CollisionResolver::should_yield_to_inbound(
            &ledger, &clock, &addr(), "bbbb", "aaaa", &config,
        )
        .await;
        assert!(yielded, "larger local token should yield to smaller remote");
    }

    #[tokio::test]
    async fn yields_when_local_token_is_larger() {
        let mut ledger = LinkLedger::new();
        let clock = SimClock::new();
        let config = CoreConfig::default();
        ledger.add_server(addr(), 0, None);
        ledger.set_subscription(&addr(), LinkRole::Server, true);

        let yielded = CollisionResolver::should_yield_to_inbound(
            &ledger, &clock, &addr(), "zzzz", "aaaa", &config,
        )
        .await;
        assert!(yielded, "larger local token should yield its outbound dial");
    }
}
