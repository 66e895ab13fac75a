//! [`CoreStats`]: cumulative telemetry counters for the connection core.
//!
//! Plain `u64` counters bumped inline by the components that observe the
//! event, read back as a snapshot rather than pushed anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CoreStats {
    pub client_links_established: AtomicU64,
    pub server_links_established: AtomicU64,
    pub links_dropped_capacity: AtomicU64,
    pub health_checks_sent: AtomicU64,
    pub health_checks_failed: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub reconnect_giveups: AtomicU64,
    pub collisions_resolved: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub fragments_received: AtomicU64,
    pub messages_reassembled: AtomicU64,
    pub messages_forwarded: AtomicU64,
    pub messages_dropped_ttl: AtomicU64,
    pub messages_dropped_loop: AtomicU64,
}

/// Point-in-time snapshot of [`CoreStats`], the shape handed to callers
/// (e.g. over the status watch channel or a diagnostics command).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStatsSnapshot {
    pub client_links_established: u64,
    pub server_links_established: u64,
    pub links_dropped_capacity: u64,
    pub health_checks_sent: u64,
    pub health_checks_failed: u64,
    pub reconnect_attempts: u64,
    pub reconnect_giveups: u64,
    pub collisions_resolved: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub messages_reassembled: u64,
    pub messages_forwarded: u64,
    pub messages_dropped_ttl: u64,
    pub messages_dropped_loop: u64,
}

macro_rules! bump {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed);
    };
}

macro_rules! snapshot_field {
    ($self:expr, $field:ident) => {
        $self.$field.load(Ordering::Relaxed)
    };
}

impl CoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_client_link_established(&self) {
        bump!(self.client_links_established);
    }

    pub fn record_server_link_established(&self) {
        bump!(self.server_links_established);
    }

    pub fn record_links_dropped_capacity(&self, count: u64) {
        self.links_dropped_capacity.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_health_check_sent(&self) {
        bump!(self.health_checks_sent);
    }

    pub fn record_health_check_failed(&self) {
        bump!(self.health_checks_failed);
    }

    pub fn record_reconnect_attempt(&self) {
        bump!(self.reconnect_attempts);
    }

    pub fn record_reconnect_giveup(&self) {
        bump!(self.reconnect_giveups);
    }

    pub fn record_collision_resolved(&self) {
        bump!(self.collisions_resolved);
    }

    pub fn record_fragment_sent(&self) {
        bump!(self.fragments_sent);
    }

    pub fn record_fragment_received(&self) {
        bump!(self.fragments_received);
    }

    pub fn record_message_reassembled(&self) {
        bump!(self.messages_reassembled);
    }

    pub fn record_message_forwarded(&self) {
        bump!(self.messages_forwarded);
    }

    pub fn record_message_dropped_ttl(&self) {
        bump!(self.messages_dropped_ttl);
    }

    pub fn record_message_dropped_loop(&self) {
        bump!(self.messages_dropped_loop);
    }

    pub fn snapshot(&self) -> CoreStatsSnapshot {
        CoreStatsSnapshot {
            client_links_established: snapshot_field!(self, client_links_established),
            server_links_established: snapshot_field!(self, server_links_established),
            links_dropped_capacity: snapshot_field!(self, links_dropped_capacity),
            health_checks_sent: snapshot_field!(self, health_checks_sent),
            health_checks_failed: snapshot_field!(self, health_checks_failed),
            reconnect_attempts: snapshot_field!(self, reconnect_attempts),
            reconnect_giveups: snapshot_field!(self, reconnect_giveups),
            collisions_resolved: snapshot_field!(self, collisions_resolved),
            fragments_sent: snapshot_field!(self, fragments_sent),
            fragments_received: snapshot_field!(self, fragments_received),
            messages_reassembled: snapshot_field!(self, messages_reassembled),
            messages_forwarded: snapshot_field!(self, messages_forwarded),
            messages_dropped_ttl: snapshot_field!(self, messages_dropped_ttl),
            messages_dropped_loop: snapshot_field!(self, messages_dropped_loop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_bump_independently() {
        let stats = CoreStats::new();
        stats.record_client_link_established();
        stats.record_client_link_established();
        stats.record_fragment_sent();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.client_links_established, 2);
        assert_eq!(snapshot.fragments_sent, 1);
        assert_eq!(snapshot.server_links_established, 0);
    }
}
