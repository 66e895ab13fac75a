//! [`HealthMonitor`]: per-peer connection health checking and reconnection
//! backoff.
//!
//! One [`PeerHealth`] record is kept per address we have ever held a client
//! link to. The monitor itself never touches the driver: callers drive it
//! with outcomes (`health_check_succeeded`, `reconnect_failed`, ...) and
//! consult `due_*` predicates to decide when to act.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::driver::AdapterState;
use crate::peer::PeerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Link assumed healthy; waiting for the next scheduled check.
    Idle,
    /// A ping is outstanding; waiting on its response or timeout.
    HealthChecking,
    /// The link is down; attempting to re-establish it with backoff.
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct PeerHealth {
    pub state: HealthState,
    pub interval: Duration,
    pub reconnect_attempts: u32,
    pub next_action_at_ms: u64,
    /// Set while a reconnect attempt is waiting on discovery to turn up
    /// the peer again, rather than dialing a known address directly.
    pub scanning: bool,
}

impl PeerHealth {
    fn fresh(now_ms: u64, interval: Duration) -> Self {
        Self {
            state: HealthState::Idle,
            interval,
            reconnect_attempts: 0,
            next_action_at_ms: now_ms + interval.as_millis() as u64,
            scanning: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    peers: HashMap<PeerAddress, PeerHealth>,
    /// Retained across `BluetoothPoweredOff` so the adapter can be pointed
    /// straight back at the same peer once it powers on; cleared only by
    /// an explicit user-initiated disconnect.
    last_connected_peer: Option<PeerAddress>,
    bluetooth_powered_off_since: Option<u64>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, addr: &PeerAddress) -> Option<HealthState> {
        self.peers.get(addr).map(|p| p.state)
    }

    pub fn last_connected_peer(&self) -> Option<&PeerAddress> {
        self.last_connected_peer.as_ref()
    }

    /// Every address the monitor currently holds a health record for. A
    /// peer reconnecting after a `PoweredOff` cycle is tracked here before
    /// the ledger has a client link for it again, so callers driving
    /// reconnection must iterate this rather than the ledger.
    pub fn tracked_addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.keys()
    }

    /// A peer is a viable relay candidate as long as we are not already
    /// certain its link is down.
    pub fn is_viable_relay(&self, addr: &PeerAddress) -> bool {
        !matches!(
            self.peers.get(addr).map(|p| p.state),
            Some(HealthState::Reconnecting)
        )
    }

    pub fn on_link_established(&mut self, addr: PeerAddress, now_ms: u64, config: &CoreConfig) {
        self.last_connected_peer = Some(addr.clone());
        self.peers
            .insert(addr, PeerHealth::fresh(now_ms, config.health_check_min_interval));
    }

    pub fn on_link_lost(&mut self, addr: &PeerAddress) {
        self.peers.remove(addr);
    }

    pub fn on_explicit_disconnect(&mut self, addr: &PeerAddress) {
        self.peers.remove(addr);
        if self.last_connected_peer.as_ref() == Some(addr) {
            self.last_connected_peer = None;
        }
    }

    pub fn due_for_health_check(&self, addr: &PeerAddress, now_ms: u64) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|p| p.state == HealthState::Idle && now_ms >= p.next_action_at_ms)
    }

    pub fn begin_health_check(&mut self, addr: &PeerAddress, now_ms: u64, config: &CoreConfig) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.state = HealthState::HealthChecking;
            p.next_action_at_ms = now_ms + config.ping_timeout.as_millis() as u64;
        }
    }

    /// Skips a due health-tick without sending a ping, pushing the next
    /// attempt out by `delay`. Used while the tick is paused (a handshake,
    /// pairing flow, or outbound message op is in progress, or the link
    /// doesn't have a usable message characteristic yet).
    pub fn defer_health_check(&mut self, addr: &PeerAddress, now_ms: u64, delay: Duration) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.next_action_at_ms = now_ms + delay.as_millis() as u64;
        }
    }

    pub fn health_check_timed_out(&self, addr: &PeerAddress, now_ms: u64) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|p| p.state == HealthState::HealthChecking && now_ms >= p.next_action_at_ms)
    }

    /// A successful ping response relaxes the check interval, growing it
    /// toward `health_check_max_interval`: a quiet, healthy link can be
    /// polled less aggressively over time.
    pub fn health_check_succeeded(&mut self, addr: &PeerAddress, now_ms: u64, config: &CoreConfig) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.state = HealthState::Idle;
            p.reconnect_attempts = 0;
            p.interval = grow(p.interval, config.health_check_max_interval);
            p.next_action_at_ms = now_ms + p.interval.as_millis() as u64;
        }
    }

    pub fn health_check_failed(&mut self, addr: &PeerAddress, now_ms: u64, config: &CoreConfig) {
        if let Some(p) = self.peers.get_mut(addr) {
            info!(%addr, "health check failed, entering reconnect state");
            p.state = HealthState::Reconnecting;
            p.reconnect_attempts = 0;
            p.next_action_at_ms = now_ms;
            p.interval = config.health_check_min_interval;
            p.scanning = false;
        }
    }

    pub fn due_for_reconnect_attempt(&self, addr: &PeerAddress, now_ms: u64) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|p| p.state == HealthState::Reconnecting && now_ms >= p.next_action_at_ms)
    }

    /// True while a reconnect scan is outstanding for `addr`: discovery has
    /// been (re)started and we are waiting for it to turn the peer up
    /// again, rather than dialing a known address directly.
    pub fn is_scanning(&self, addr: &PeerAddress) -> bool {
        self.peers.get(addr).is_some_and(|p| p.scanning)
    }

    /// Marks a reconnect scan as outstanding, due again after
    /// `config.scan_timeout` if discovery never turns the peer up.
    pub fn begin_scan(&mut self, addr: &PeerAddress, now_ms: u64, config: &CoreConfig) {
        if let Some(p) = self.peers.get_mut(addr) {
            p.scanning = true;
            p.next_action_at_ms = now_ms + config.scan_timeout.as_millis() as u64;
        }
    }

    /// Returns `true` if the caller should keep retrying, `false` once
    /// `max_reconnect_attempts` is exhausted and the peer should be
    /// forgotten entirely.
    pub fn reconnect_failed(&mut self, addr: &PeerAddress, now_ms: u64, config: &CoreConfig) -> bool {
        let Some(p) = self.peers.get_mut(addr) else {
            return false;
        };
        p.reconnect_attempts += 1;
        p.scanning = false;
        if p.reconnect_attempts > config.max_reconnect_attempts {
            debug!(%addr, attempts = p.reconnect_attempts, "giving up reconnecting");
            self.peers.remove(addr);
            return false;
        }
        p.interval = double(p.interval, config.health_check_max_interval);
        p.next_action_at_ms = now_ms + p.interval.as_millis() as u64;
        true
    }

    pub fn reconnect_succeeded(&mut self, addr: PeerAddress, now_ms: u64, config: &CoreConfig) {
        self.on_link_established(addr, now_ms, config);
    }

    /// Bluetooth being powered off never clears `last_connected_peer`:
    /// only an explicit disconnect does. Every tracked link is dropped
    /// since the radio can no longer hold them regardless.
    pub fn on_bluetooth_powered_off(&mut self, now_ms: u64) {
        self.bluetooth_powered_off_since = Some(now_ms);
        self.peers.clear();
    }

    /// On power-on, if we were previously connected, schedules a
    /// reconnect attempt to that peer after the configured settle delay.
    pub fn on_bluetooth_powered_on(&mut self, now_ms: u64, config: &CoreConfig) {
        self.bluetooth_powered_off_since = None;
        if let Some(addr) = self.last_connected_peer.clone() {
            self.peers.insert(
                addr,
                PeerHealth {
                    state: HealthState::Reconnecting,
                    interval: config.health_check_min_interval,
                    reconnect_attempts: 0,
                    next_action_at_ms: now_ms + config.bluetooth_poweron_reconnect_delay.as_millis() as u64,
                    scanning: false,
                },
            );
        }
    }

    pub fn on_adapter_state_changed(&mut self, state: AdapterState, now_ms: u64, config: &CoreConfig) {
        match state {
            AdapterState::PoweredOff => self.on_bluetooth_powered_off(now_ms),
            AdapterState::PoweredOn => self.on_bluetooth_powered_on(now_ms, config),
            AdapterState::Unknown => {}
        }
    }
}

fn double(interval: Duration, max: Duration) -> Duration {
    (interval * 2).min(max)
}

fn grow(interval: Duration, max: Duration) -> Duration {
    interval.mul_f64(1.2).min(max)
}
