//! [`LinkLedger`]: the authoritative record of which peers we hold a client
//! (central) or server (peripheral) link to.
//!
//! This module is pure data plus invariants — no I/O, no suspension points.
//! `GattController`, `CapacityEnforcer`, `HealthMonitor`, `CollisionResolver`
//! and `TransportQueue` all read and mutate it, but the ledger itself never
//! calls the driver or the clock directly.

use std::collections::{HashMap, HashSet};

use crate::config::CapacityConfig;
use crate::peer::{PeerAddress, PeerHint};

/// Which side of a dual-role link a mutation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We are the central; the peer is the peripheral.
    Client,
    /// We are the peripheral; the peer is the central.
    Server,
}

/// Our outbound (central) view of a connected peripheral.
#[derive(Debug, Clone)]
pub struct ClientLink {
    pub connected_at_ms: u64,
    pub mtu: usize,
    pub subscribed: bool,
    pub message_characteristic: Option<String>,
}

impl ClientLink {
    fn new(connected_at_ms: u64) -> Self {
        Self {
            connected_at_ms,
            mtu: 0,
            subscribed: false,
            message_characteristic: None,
        }
    }
}

/// Our inbound (peripheral) view of a connected central.
#[derive(Debug, Clone)]
pub struct ServerLink {
    pub connected_at_ms: u64,
    pub mtu: usize,
    pub subscribed: bool,
    /// Until this timestamp, a missing peer hint on this link is treated as
    /// "not yet announced" rather than "genuinely hintless" — this avoids a
    /// spurious collision verdict against a central whose hint write simply
    /// hasn't landed yet.
    pub no_hint_debounce_until: Option<u64>,
}

impl ServerLink {
    fn new(connected_at_ms: u64, no_hint_debounce_until: Option<u64>) -> Self {
        Self {
            connected_at_ms,
            mtu: 0,
            subscribed: false,
            no_hint_debounce_until,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeferredTeardown {
    role: LinkRole,
    deadline_ms: u64,
}

/// Authoritative map of client/server links, pending dials, and hint
/// bookkeeping for one local node.
#[derive(Debug, Default)]
pub struct LinkLedger {
    clients: HashMap<PeerAddress, ClientLink>,
    servers: HashMap<PeerAddress, ServerLink>,
    pending_dials: HashSet<PeerAddress>,
    deferred_teardowns: HashMap<PeerAddress, DeferredTeardown>,
    hint_to_addresses: HashMap<PeerHint, HashSet<PeerAddress>>,
    address_to_hint: HashMap<PeerAddress, PeerHint>,
}

impl LinkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // -- queries -----------------------------------------------------

    pub fn has_client(&self, addr: &PeerAddress) -> bool {
        self.clients.contains_key(addr)
    }

    pub fn has_server(&self, addr: &PeerAddress) -> bool {
        self.servers.contains_key(addr)
    }

    pub fn client(&self, addr: &PeerAddress) -> Option<&ClientLink> {
        self.clients.get(addr)
    }

    pub fn server(&self, addr: &PeerAddress) -> Option<&ServerLink> {
        self.servers.get(addr)
    }

    /// A server link counts as viable relay candidacy only while it is not
    /// already slated for deferred teardown.
    pub fn is_viable_server(&self, addr: &PeerAddress) -> bool {
        self.servers.contains_key(addr) && !self.has_deferred_teardown_for_role(addr, LinkRole::Server)
    }

    pub fn is_viable_client(&self, addr: &PeerAddress) -> bool {
        self.clients.contains_key(addr) && !self.has_deferred_teardown_for_role(addr, LinkRole::Client)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn total_count(&self) -> usize {
        // A peer that holds both a client and a server link to us counts
        // twice: capacity is spent per role, not per distinct peer.
        self.clients.len() + self.servers.len()
    }

    pub fn can_accept_client(&self, capacity: &CapacityConfig) -> bool {
        self.clients.len() < capacity.max_client && self.total_count() < capacity.max_total
    }

    pub fn can_accept_server(&self, capacity: &CapacityConfig) -> bool {
        self.servers.len() < capacity.max_server && self.total_count() < capacity.max_total
    }

    pub fn is_pending_dial(&self, addr: &PeerAddress) -> bool {
        self.pending_dials.contains(addr)
    }

    pub fn addresses_for_hint(&self, hint: &PeerHint) -> Vec<PeerAddress> {
        self.hint_to_addresses
            .get(hint)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer_hint_for(&self, addr: &PeerAddress) -> Option<PeerHint> {
        self.address_to_hint.get(addr).copied()
    }

    /// True while `addr`'s server link falls inside its no-hint debounce
    /// window, i.e. an absent hint should not yet be treated as final.
    pub fn is_within_no_hint_debounce(&self, addr: &PeerAddress, now_ms: u64) -> bool {
        self.servers
            .get(addr)
            .and_then(|link| link.no_hint_debounce_until)
            .is_some_and(|deadline| now_ms < deadline)
    }

    pub fn all_client_addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.clients.keys()
    }

    pub fn all_server_addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.servers.keys()
    }

    fn has_deferred_teardown_for_role(&self, addr: &PeerAddress, role: LinkRole) -> bool {
        self.deferred_teardowns
            .get(addr)
            .is_some_and(|t| t.role == role)
    }

    // -- mutators ------------------------------------------------------

    pub fn add_client(&mut self, addr: PeerAddress, connected_at_ms: u64) -> &mut ClientLink {
        self.pending_dials.remove(&addr);
        self.clients
            .entry(addr)
            .or_insert_with(|| ClientLink::new(connected_at_ms))
    }

    pub fn add_server(
        &mut self,
        addr: PeerAddress,
        connected_at_ms: u64,
        no_hint_debounce_until: Option<u64>,
    ) -> &mut ServerLink {
        self.servers
            .entry(addr)
            .or_insert_with(|| ServerLink::new(connected_at_ms, no_hint_debounce_until))
    }

    pub fn remove_client(&mut self, addr: &PeerAddress) -> Option<ClientLink> {
        self.deferred_teardowns.remove(addr);
        self.clients.remove(addr)
    }

    pub fn remove_server(&mut self, addr: &PeerAddress) -> Option<ServerLink> {
        self.deferred_teardowns.remove(addr);
        self.servers.remove(addr)
    }

    pub fn mark_pending_dial(&mut self, addr: PeerAddress) {
        self.pending_dials.insert(addr);
    }

    pub fn clear_pending_dial(&mut self, addr: &PeerAddress) {
        self.pending_dials.remove(addr);
    }

    pub fn set_mtu(&mut self, addr: &PeerAddress, role: LinkRole, mtu: usize) {
        match role {
            LinkRole::Client => {
                if let Some(link) = self.clients.get_mut(addr) {
                    link.mtu = mtu;
                }
            }
            LinkRole::Server => {
                if let Some(link) = self.servers.get_mut(addr) {
                    link.mtu = mtu;
                }
            }
        }
    }

    pub fn set_subscription(&mut self, addr: &PeerAddress, role: LinkRole, subscribed: bool) {
        match role {
            LinkRole::Client => {
                if let Some(link) = self.clients.get_mut(addr) {
                    link.subscribed = subscribed;
                }
            }
            LinkRole::Server => {
                if let Some(link) = self.servers.get_mut(addr) {
                    link.subscribed = subscribed;
                }
            }
        }
    }

    pub fn set_message_characteristic(&mut self, addr: &PeerAddress, uuid: String) {
        if let Some(link) = self.clients.get_mut(addr) {
            link.message_characteristic = Some(uuid);
        }
    }

    /// Marks `addr`'s `role` link for removal once `deadline_ms` passes,
    /// rather than tearing it down immediately — gives a racing link a
    /// window to prove it is still usable.
    pub fn schedule_deferred_teardown(&mut self, addr: PeerAddress, role: LinkRole, deadline_ms: u64) {
        self.deferred_teardowns
            .insert(addr, DeferredTeardown { role, deadline_ms });
    }

    pub fn cancel_deferred_teardown(&mut self, addr: &PeerAddress) {
        self.deferred_teardowns.remove(addr);
    }

    pub fn deferred_teardown_role(&self, addr: &PeerAddress) -> Option<LinkRole> {
        self.deferred_teardowns.get(addr).map(|t| t.role)
    }

    /// Every address with a deferred teardown still outstanding, for a
    /// caller to poll with [`Self::commit_deferred_teardown`] on a tick.
    pub fn pending_deferred_teardowns(&self) -> Vec<PeerAddress> {
        self.deferred_teardowns.keys().cloned().collect()
    }

    /// If `addr` has a deferred teardown whose deadline has passed, removes
    /// the corresponding link and returns the role that was torn down.
    pub fn commit_deferred_teardown(&mut self, addr: &PeerAddress, now_ms: u64) -> Option<LinkRole> {
        let due = self
            .deferred_teardowns
            .get(addr)
            .filter(|t| now_ms >= t.deadline_ms)?;
        let role = due.role;
        self.deferred_teardowns.remove(addr);
        match role {
            LinkRole::Client => {
                self.clients.remove(addr);
            }
            LinkRole::Server => {
                self.servers.remove(addr);
            }
        }
        Some(role)
    }

    /// Records (or updates) the hint a peer announces, maintaining the
    /// hint -> addresses secondary index used for reconnection matching.
    pub fn cache_peer_hint(&mut self, addr: PeerAddress, hint: PeerHint) {
        if let Some(old_hint) = self.address_to_hint.insert(addr.clone(), hint) {
            if old_hint != hint {
                self.remove_from_hint_index(&old_hint, &addr);
            }
        }
        self.hint_to_addresses.entry(hint).or_default().insert(addr);
    }

    /// Drops `hint` from the index entirely if no link currently present.
    /// Called when a link tears down, so stale hints do not accumulate.
    pub fn clear_peer_hint_if_unused(&mut self, addr: &PeerAddress) {
        if self.has_client(addr) || self.has_server(addr) || self.is_pending_dial(addr) {
            return;
        }
        if let Some(hint) = self.address_to_hint.remove(addr) {
            self.remove_from_hint_index(&hint, addr);
        }
    }

    fn remove_from_hint_index(&mut self, hint: &PeerHint, addr: &PeerAddress) {
        if let Some(set) = self.hint_to_addresses.get_mut(hint) {
            set.remove(addr);
            if set.is_empty() {
                self.hint_to_addresses.remove(hint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn add_and_remove_client_round_trips() {
        let mut ledger = LinkLedger::new();
        ledger.add_client(addr("a"), 100);
        assert!(ledger.has_client(&addr("a")));
        assert_eq!(ledger.client(&addr("a")).unwrap().connected_at_ms, 100);
        ledger.remove_client(&addr("a"));
        assert!(!ledger.has_client(&addr("a")));
    }

    #[test]
    fn capacity_limits_are_enforced_independently_per_role() {
        let mut ledger = LinkLedger::new();
        let capacity = CapacityConfig {
            max_client: 1,
            max_server: 1,
            max_total: 1,
            rssi_floor_dbm: -95,
        };
        assert!(ledger.can_accept_client(&capacity));
        ledger.add_client(addr("a"), 0);
        assert!(!ledger.can_accept_client(&capacity));
        assert!(!ledger.can_accept_server(&capacity));
    }

    #[test]
    fn deferred_teardown_only_fires_past_deadline() {
        let mut ledger = LinkLedger::new();
        ledger.add_server(addr("a"), 0, None);
        ledger.schedule_deferred_teardown(addr("a"), LinkRole::Server, 1000);
        assert!(ledger.commit_deferred_teardown(&addr("a"), 500).is_none());
        assert!(ledger.has_server(&addr("a")));
        assert_eq!(
            ledger.commit_deferred_teardown(&addr("a"), 1000),
            Some(LinkRole::Server)
        );
        assert!(!ledger.has_server(&addr("a")));
    }

    #[test]
    fn hint_index_cleans_up_when_hint_changes() {
        let mut ledger = LinkLedger::new();
        let hint_a = PeerHint::from_bytes([1; 8]);
        let hint_b = PeerHint::from_bytes([2; 8]);
        ledger.cache_peer_hint(addr("a"), hint_a);
        assert_eq!(ledger.addresses_for_hint(&hint_a), vec![addr("a")]);
        ledger.cache_peer_hint(addr("a"), hint_b);
        assert!(ledger.addresses_for_hint(&hint_a).is_empty());
        assert_eq!(ledger.addresses_for_hint(&hint_b), vec![addr("a")]);
    }

    #[test]
    fn hint_is_cleared_only_once_unreferenced() {
        let mut ledger = LinkLedger::new();
        let hint = PeerHint::from_bytes([3; 8]);
        ledger.add_client(addr("a"), 0);
        ledger.cache_peer_hint(addr("a"), hint);
        ledger.clear_peer_hint_if_unused(&addr("a"));
        assert_eq!(ledger.peer_hint_for(&addr("a")), Some(hint));
        ledger.remove_client(&addr("a"));
        ledger.clear_peer_hint_if_unused(&addr("a"));
        assert_eq!(ledger.peer_hint_for(&addr("a")), None);
    }

    #[test]
    fn no_hint_debounce_window_expires() {
        let mut ledger = LinkLedger::new();
        ledger.add_server(addr("a"), 0, Some(300));
        assert!(ledger.is_within_no_hint_debounce(&addr("a"), 0));
        assert!(ledger.is_within_no_hint_debounce(&addr("a"), 299));
        assert!(!ledger.is_within_no_hint_debounce(&addr("a"), 300));
    }
}
