//! [`CapacityEnforcer`]: admission gating and FIFO-oldest-first trimming
//! when the active [`CapacityConfig`] shrinks.
//!
//! Trimming runs whenever the power mode changes to a tighter profile; it
//! never runs speculatively, so a link is only ever dropped because a real
//! capacity ceiling was crossed, not because it looked old.

use tracing::info;

use crate::config::CapacityConfig;
use crate::ledger::{LinkLedger, LinkRole};
use crate::peer::PeerAddress;

pub struct CapacityEnforcer;

impl CapacityEnforcer {
    pub fn can_admit_client(ledger: &LinkLedger, capacity: &CapacityConfig) -> bool {
        ledger.can_accept_client(capacity)
    }

    pub fn can_admit_server(ledger: &LinkLedger, capacity: &CapacityConfig) -> bool {
        ledger.can_accept_server(capacity)
    }

    /// `None` RSSI (some drivers omit it on certain events) is treated as
    /// meeting the floor rather than rejected outright.
    pub fn meets_rssi_floor(rssi: Option<i16>, capacity: &CapacityConfig) -> bool {
        match rssi {
            Some(value) => value >= capacity.rssi_floor_dbm,
            None => true,
        }
    }

    /// Drops the oldest-connected links, per role then overall, until the
    /// ledger satisfies `capacity`. Returns what was dropped, in the order
    /// it was dropped, so callers can disconnect the driver side and log.
    pub fn trim_excess(ledger: &mut LinkLedger, capacity: &CapacityConfig) -> Vec<(PeerAddress, LinkRole)> {
        let mut dropped = Vec::new();

        Self::trim_role(ledger, capacity.max_client, LinkRole::Client, &mut dropped);
        Self::trim_role(ledger, capacity.max_server, LinkRole::Server, &mut dropped);
        Self::trim_total(ledger, capacity.max_total, &mut dropped);

        for (addr, role) in &dropped {
            info!(%addr, ?role, "dropped link to satisfy reduced capacity");
        }
        dropped
    }

    fn trim_role(
        ledger: &mut LinkLedger,
        max: usize,
        role: LinkRole,
        dropped: &mut Vec<(PeerAddress, LinkRole)>,
    ) {
        let mut entries = Self::entries_for_role(ledger, role);
        entries.sort_by_key(|(_, connected_at)| *connected_at);
        let excess = entries.len().saturating_sub(max);
        for (addr, _) in entries.into_iter().take(excess) {
            Self::remove(ledger, &addr, role);
            dropped.push((addr, role));
        }
    }

    fn trim_total(ledger: &mut LinkLedger, max_total: usize, dropped: &mut Vec<(PeerAddress, LinkRole)>) {
        loop {
            if ledger.total_count() <= max_total {
                return;
            }
            let mut entries: Vec<(PeerAddress, LinkRole, u64)> = Self::entries_for_role(ledger, LinkRole::Client)
                .into_iter()
                .map(|(addr, at)| (addr, LinkRole::Client, at))
                .collect();
            entries.extend(
                Self::entries_for_role(ledger, LinkRole::Server)
                    .into_iter()
                    .map(|(addr, at)| (addr, LinkRole::Server, at)),
            );
            let Some((addr, role, _)) = entries.into_iter().min_by_key(|(_, _, at)| *at) else {
                return;
            };
            Self::remove(ledger, &addr, role);
            dropped.push((addr, role));
        }
    }

    fn entries_for_role(ledger: &LinkLedger, role: LinkRole) -> Vec<(PeerAddress, u64)> {
        match role {
            LinkRole::Client => ledger
                .all_client_addresses()
                .filter_map(|addr| ledger.client(addr).map(|link| (addr.clone(), link.connected_at_ms)))
                .collect(),
            LinkRole::Server => ledger
                .all_server_addresses()
                .filter_map(|addr| ledger.server(addr).map(|link| (addr.clone(), link.connected_at_ms)))
                .collect(),
        }
    }

    fn remove(ledger: &mut LinkLedger, addr: &PeerAddress, role: LinkRole) {
        match role {
            LinkRole::Client => {
                ledger.remove_client(addr);
            }
            LinkRole::Server => {
                ledger.remove_server(addr);
            }
        }
        ledger.clear_peer_hint_if_unused(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    #[test]
    fn trims_oldest_client_first_when_role_limit_shrinks() {
        let mut ledger = LinkLedger::new();
        ledger.add_client(addr("old"), 10);
        ledger.add_client(addr("new"), 20);
        let capacity = CapacityConfig {
            max_client: 1,
            max_server: 1,
            max_total: 2,
            rssi_floor_dbm: -95,
        };
        let dropped = CapacityEnforcer::trim_excess(&mut ledger, &capacity);
        assert_eq!(dropped, vec![(addr("old"), LinkRole::Client)]);
        assert!(ledger.has_client(&addr("new")));
        assert!(!ledger.has_client(&addr("old")));
    }

    #[test]
    fn trims_across_roles_to_satisfy_total_ceiling() {
        let mut ledger = LinkLedger::new();
        ledger.add_client(addr("c1"), 10);
        ledger.add_server(addr("s1"), 5, None);
        let capacity = CapacityConfig {
            max_client: 1,
            max_server: 1,
            max_total: 1,
            rssi_floor_dbm: -95,
        };
        let dropped = CapacityEnforcer::trim_excess(&mut ledger, &capacity);
        assert_eq!(dropped.len(), 1);
        assert_eq!(ledger.total_count(), 1);
        assert!(ledger.has_client(&addr("c1")));
        assert!(!ledger.has_server(&addr("s1")));
    }

    #[test]
    fn rssi_floor_rejects_weak_signal_but_allows_unknown() {
        let capacity = CapacityConfig {
            max_client: 4,
            max_server: 4,
            max_total: 8,
            rssi_floor_dbm: -80,
        };
        assert!(CapacityEnforcer::meets_rssi_floor(Some(-70), &capacity));
        assert!(!CapacityEnforcer::meets_rssi_floor(Some(-90), &capacity));
        assert!(CapacityEnforcer::meets_rssi_floor(None, &capacity));
    }
}
