//! Dual-role BLE mesh connection core.
//!
//! [`MeshCore`] wires together link bookkeeping ([`ledger`]), outbound
//! dial/discovery ([`gatt`]), admission and capacity trimming
//! ([`capacity`]), reconnection health ([`health`]), inbound/outbound
//! link collision handling ([`collision`]), and the fragment transport
//! queue ([`transport`]) into the single object a caller drives with
//! platform driver events and a periodic tick. Nothing in this crate
//! talks to the radio directly — that happens through the [`driver`]
//! trait, so the whole core runs identically against a real adapter or
//! the bundled [`driver::MockBleDriver`].

pub mod capacity;
pub mod clock;
pub mod collision;
pub mod config;
pub mod driver;
pub mod error;
pub mod gatt;
pub mod health;
pub mod ledger;
pub mod peer;
pub mod stats;
pub mod status;
pub mod transport;

use std::sync::Arc;

use tracing::{info, warn};

use capacity::CapacityEnforcer;
use clock::Clock;
use collision::CollisionResolver;
use config::{CapacityConfig, CoreConfig, PowerMode};
use driver::{AdapterState, Advertisement, BleDriver, BleEvent, DriverError};
use error::{GattError, TransportError};
use gatt::GattController;
use health::{HealthMonitor, HealthState};
use ledger::{LinkLedger, LinkRole};
use peer::{PeerAddress, PeerHint};
use stats::{CoreStats, CoreStatsSnapshot};
use status::{CoreStatus, StatusPublisher};
use transport::{ForwardResult, Fragment, MessageKind, ReassembledMessage, TransportQueue};

/// Reserved `original_type` values for the core's own health-check
/// traffic; never handed to callers as delivered messages.
const PING_MESSAGE_TYPE: u8 = 0xFE;
const PONG_MESSAGE_TYPE: u8 = 0xFD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    DeliveredLocally(ReassembledMessage),
    Forwarded { to: PeerAddress },
    Dropped,
}

/// External collaborator that knows whether a handshake or pairing flow
/// is currently in progress for a peer. The handshake/pairing state
/// itself lives outside the core, reached only through this seam; a
/// health check tick is deferred rather than sent while either is true,
/// so health traffic never collides with either flow.
pub trait HandshakeObserver: Send + Sync {
    fn handshake_in_progress(&self, peer: &PeerAddress) -> bool;
    fn pairing_in_progress(&self, peer: &PeerAddress) -> bool;
}

pub struct MeshCore<D, C> {
    driver: Arc<D>,
    clock: Arc<C>,
    config: Arc<CoreConfig>,
    capacity: CapacityConfig,
    local_address: PeerAddress,
    local_token: String,
    ledger: LinkLedger,
    gatt: GattController<D, C>,
    health: HealthMonitor,
    transport: TransportQueue<D, C>,
    stats: CoreStats,
    status: StatusPublisher,
    handshake_observer: Option<Arc<dyn HandshakeObserver>>,
}

impl<D: BleDriver, C: Clock> MeshCore<D, C> {
    pub fn new(
        driver: Arc<D>,
        clock: Arc<C>,
        config: CoreConfig,
        local_address: PeerAddress,
        local_token: String,
    ) -> (Self, tokio::sync::watch::Receiver<CoreStatus>) {
        let config = Arc::new(config);
        let capacity = config.capacity_config();
        let gatt = GattController::new(driver.clone(), clock.clone(), config.clone());
        let transport = TransportQueue::new(driver.clone(), clock.clone(), config.clone());
        let (status, receiver) = StatusPublisher::new(CoreStatus::Disconnected);
        let core = Self {
            driver,
            clock,
            config,
            capacity,
            local_address,
            local_token,
            ledger: LinkLedger::new(),
            gatt,
            health: HealthMonitor::new(),
            transport,
            stats: CoreStats::new(),
            status,
            handshake_observer: None,
        };
        (core, receiver)
    }

    /// Registers the collaborator consulted to pause health checks while
    /// a handshake or pairing flow is in progress. Health checks run
    /// unpaused by this predicate until one is set.
    pub fn set_handshake_observer(&mut self, observer: Arc<dyn HandshakeObserver>) {
        self.handshake_observer = Some(observer);
    }

    pub fn stats(&self) -> CoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> CoreStatus {
        self.status.current()
    }

    pub fn capacity_config(&self) -> CapacityConfig {
        self.capacity
    }

    pub fn ledger(&self) -> &LinkLedger {
        &self.ledger
    }

    /// Begins scanning for peers and advertising our own service, using
    /// the node's hint so rotated-address peers can still recognise us.
    pub async fn start(&self, hint: [u8; 8]) -> Result<(), DriverError> {
        self.driver
            .start_discovery(&[self.config.service_uuid.clone()])
            .await?;
        self.driver
            .start_advertising(Advertisement {
                service_uuid: self.config.service_uuid.clone(),
                local_hint: Some(hint),
            })
            .await?;
        Ok(())
    }

    /// Applies a new power mode, trimming any links the tighter capacity
    /// no longer allows.
    pub async fn set_power_mode(&mut self, mode: PowerMode, now_ms: u64) {
        let capacity = mode.capacity_config();
        let dropped = CapacityEnforcer::trim_excess(&mut self.ledger, &capacity);
        for (addr, role) in dropped {
            self.stats.record_links_dropped_capacity(1);
            match role {
                LinkRole::Client => {
                    let _ = self.driver.disconnect(&addr).await;
                    self.health.on_link_lost(&addr);
                }
                LinkRole::Server => {
                    let _ = self.driver.disconnect_central(&addr).await;
                }
            }
        }
        self.capacity = capacity;
    }

    /// Drains every event currently queued by the driver, dispatching each
    /// in arrival order. Returns the number processed.
    pub async fn drain_driver_events(&mut self, now_ms: u64) -> usize {
        let mut processed = 0;
        while let Some(event) = self.driver.next_event().await {
            self.dispatch_event(event, now_ms).await;
            processed += 1;
        }
        processed
    }

    /// Top-level driver event dispatch.
    pub async fn dispatch_event(&mut self, event: BleEvent, now_ms: u64) {
        match event {
            BleEvent::StateChanged(state) => self.on_adapter_state_changed(state, now_ms).await,
            BleEvent::Discovered { peer, rssi, hint } => {
                self.on_discovered(peer, rssi, hint, now_ms).await
            }
            BleEvent::CentralConnected { central } => self.on_central_connected(central, now_ms).await,
            BleEvent::CentralDisconnected { central } => self.on_central_disconnected(&central),
            BleEvent::CharacteristicSubscribed { central, .. } => {
                self.on_characteristic_subscribed(&central)
            }
            BleEvent::ServerMtuUpdated { central, mtu } => {
                self.ledger.set_mtu(&central, LinkRole::Server, mtu);
            }
            BleEvent::CharacteristicNotified {
                peer,
                characteristic: _,
                value,
            } => {
                if let Err(err) = self.on_characteristic_notified(peer, &value, now_ms).await {
                    warn!(%err, "failed to process inbound fragment");
                }
            }
        }
    }

    async fn on_discovered(&mut self, peer: PeerAddress, rssi: Option<i16>, hint: Option<[u8; 8]>, now_ms: u64) {
        if !CapacityEnforcer::meets_rssi_floor(rssi, &self.capacity) {
            return;
        }
        if self.ledger.has_client(&peer) || self.ledger.is_pending_dial(&peer) {
            return;
        }
        if !CapacityEnforcer::can_admit_client(&self.ledger, &self.capacity) {
            return;
        }
        if let Some(hint) = hint {
            let hint = PeerHint::from_bytes(hint);
            self.ledger.cache_peer_hint(peer.clone(), hint);

            // A viable inbound link already exists for this peer: this is
            // the outbound-finds-inbound race. The peer's hint doubles as
            // its tie-break token here, since discovery carries no other
            // peer-chosen identifier.
            if self.ledger.has_server(&peer) {
                let remote_token = hint.to_hex();
                if CollisionResolver::should_yield_to_inbound(
                    &self.ledger,
                    self.clock.as_ref(),
                    &peer,
                    &self.local_token,
                    &remote_token,
                    &self.config,
                )
                .await
                {
                    return;
                }
            }
        }

        let was_reconnecting = self.health.state(&peer) == Some(HealthState::Reconnecting);
        self.ledger.mark_pending_dial(peer.clone());
        match self.gatt.connect_with_retry(&peer).await {
            Ok(()) => {
                self.finish_client_setup(peer.clone(), now_ms).await;
                if was_reconnecting && self.ledger.has_client(&peer) {
                    self.stats.record_reconnect_attempt();
                }
            }
            Err(err) => {
                self.ledger.clear_pending_dial(&peer);
                warn!(%peer, %err, "dial failed");
            }
        }
    }

    async fn finish_client_setup(&mut self, peer: PeerAddress, now_ms: u64) {
        let setup: Result<(), GattError> = async {
            let characteristic = self.gatt.discover_message_characteristic(&peer).await?;
            self.gatt.enable_notifications(&peer, &characteristic).await?;
            let mtu = self.gatt.detect_optimal_mtu(&peer).await;

            self.ledger.add_client(peer.clone(), now_ms);
            self.ledger.set_mtu(&peer, LinkRole::Client, mtu);
            self.ledger.set_message_characteristic(&peer, characteristic);
            self.ledger.set_subscription(&peer, LinkRole::Client, true);
            self.ledger.clear_pending_dial(&peer);
            Ok(())
        }
        .await;

        match setup {
            Ok(()) => {
                self.health.on_link_established(peer.clone(), now_ms, &self.config);
                self.stats.record_client_link_established();
                self.status.set(CoreStatus::Ready);
                info!(%peer, "client link established");
            }
            Err(err) => {
                self.ledger.clear_pending_dial(&peer);
                let _ = self.driver.disconnect(&peer).await;
                warn!(%peer, %err, "client setup failed");
            }
        }
    }

    /// Handles an inbound central connecting to us. When `central` already
    /// holds a `ClientLink` (we dialed it first), the new inbound attempt
    /// is admitted and given a grace window rather than torn down outright;
    /// [`Self::commit_collision_resolutions`] later decides the outcome
    /// once that window elapses.
    async fn on_central_connected(&mut self, central: PeerAddress, now_ms: u64) {
        if self.ledger.has_client(&central) {
            if !CollisionResolver::defer_inbound_on_client_collision(
                &mut self.ledger,
                central.clone(),
                now_ms,
                &self.config,
            ) {
                return;
            }
            if !CapacityEnforcer::can_admit_server(&self.ledger, &self.capacity) {
                self.ledger.cancel_deferred_teardown(&central);
                let _ = self.driver.disconnect_central(&central).await;
                return;
            }
            let debounce_until = now_ms + self.config.no_hint_inbound_debounce_window.as_millis() as u64;
            self.ledger.add_server(central, now_ms, Some(debounce_until));
            self.stats.record_server_link_established();
            return;
        }

        CollisionResolver::defer_outbound_on_inbound_collision(
            &mut self.ledger,
            central.clone(),
            now_ms,
            &self.config,
        );
        if !CapacityEnforcer::can_admit_server(&self.ledger, &self.capacity) {
            let _ = self.driver.disconnect_central(&central).await;
            return;
        }
        let debounce_until = now_ms + self.config.no_hint_inbound_debounce_window.as_millis() as u64;
        self.ledger.add_server(central, now_ms, Some(debounce_until));
        self.stats.record_server_link_established();
    }

    fn on_central_disconnected(&mut self, central: &PeerAddress) {
        self.ledger.remove_server(central);
        self.ledger.clear_peer_hint_if_unused(central);
    }

    fn on_characteristic_subscribed(&mut self, central: &PeerAddress) {
        if CollisionResolver::is_duplicate_subscription(&self.ledger, central) {
            return;
        }
        self.ledger.set_subscription(central, LinkRole::Server, true);
        // A server link that proves itself subscribed before its grace
        // window expires is no longer a collision loser.
        self.ledger.cancel_deferred_teardown(central);
    }

    /// Commits any deferred teardown whose grace window has elapsed,
    /// disconnecting the losing side of a resolved collision. Intended to
    /// be called once per tick alongside [`Self::run_health_checks`].
    pub async fn commit_collision_resolutions(&mut self, now_ms: u64) {
        for addr in self.ledger.pending_deferred_teardowns() {
            if let Some(role) = self.ledger.commit_deferred_teardown(&addr, now_ms) {
                match role {
                    LinkRole::Client => {
                        let _ = self.driver.disconnect(&addr).await;
                        self.health.on_link_lost(&addr);
                    }
                    LinkRole::Server => {
                        let _ = self.driver.disconnect_central(&addr).await;
                    }
                }
                self.ledger.clear_peer_hint_if_unused(&addr);
                self.stats.record_collision_resolved();
            }
        }
    }

    async fn on_adapter_state_changed(&mut self, state: AdapterState, now_ms: u64) {
        self.health.on_adapter_state_changed(state, now_ms, &self.config);
        match state {
            AdapterState::PoweredOff => {
                // The radio can no longer hold any link regardless of what
                // the ledger still believes; the hint index is left alone
                // so a later rediscovery can still match this peer by hint
                // once the adapter comes back.
                for addr in self.ledger.all_client_addresses().cloned().collect::<Vec<_>>() {
                    self.ledger.remove_client(&addr);
                }
                for addr in self.ledger.all_server_addresses().cloned().collect::<Vec<_>>() {
                    self.ledger.remove_server(&addr);
                }
                self.status.set(CoreStatus::Disconnected);
            }
            AdapterState::PoweredOn => {
                if self.health.last_connected_peer().is_some() {
                    self.status.set(CoreStatus::Reconnecting);
                } else {
                    self.status.set(CoreStatus::Scanning);
                }
            }
            AdapterState::Unknown => {}
        }
    }

    /// Feeds one inbound wire fragment through ping/pong handling,
    /// loop-avoidance, and local-delivery/forwarding decisions. A
    /// fragment not addressed to us is forwarded raw with its ttl
    /// decremented in place whenever it already fits the next hop's MTU;
    /// full reassembly and re-fragmentation only happens as a fallback
    /// when the next hop's MTU is smaller than the one it arrived over.
    async fn on_characteristic_notified(
        &mut self,
        peer: PeerAddress,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<InboundOutcome, TransportError> {
        self.stats.record_fragment_received();
        let fragment =
            Fragment::decode(bytes).map_err(|_| TransportError::MalformedFragment(peer.clone()))?;
        let recipient = PeerAddress::new(String::from_utf8_lossy(&fragment.recipient).into_owned());
        let ingress_hint = self.ledger.peer_hint_for(&peer).unwrap_or(PeerHint::NO_HINT);

        if recipient == self.local_address {
            let Some(message) = self.transport.ingest_fragment(fragment, now_ms) else {
                return Ok(InboundOutcome::Dropped);
            };
            self.stats.record_message_reassembled();

            if message.original_type == PING_MESSAGE_TYPE {
                let _ = self.transport.send_originating(
                    &self.ledger,
                    &peer,
                    PONG_MESSAGE_TYPE,
                    &[],
                    MessageKind::Handshake,
                    None,
                    message.fragment_id,
                );
                return Ok(InboundOutcome::Dropped);
            }
            if message.original_type == PONG_MESSAGE_TYPE {
                self.health.health_check_succeeded(&peer, now_ms, &self.config);
                return Ok(InboundOutcome::Dropped);
            }

            if self.transport.is_duplicate_message(&message, now_ms) {
                self.stats.record_message_dropped_loop();
                return Ok(InboundOutcome::Dropped);
            }
            self.transport.record_ingress(&message, peer.clone(), ingress_hint, now_ms);
            return Ok(InboundOutcome::DeliveredLocally(message));
        }

        if !self
            .transport
            .should_forward_to(fragment.ttl, &recipient, &peer, ingress_hint)
        {
            self.stats.record_message_dropped_loop();
            return Ok(InboundOutcome::Dropped);
        }
        if !self.transport.accept_for_relay(fragment.fragment_id, &peer, now_ms) {
            self.stats.record_message_dropped_loop();
            return Ok(InboundOutcome::Dropped);
        }

        match self
            .transport
            .enqueue_forward_fragment(&self.ledger, fragment, bytes, &recipient, now_ms)?
        {
            ForwardResult::RawForwarded | ForwardResult::Reassembled => {
                self.stats.record_message_forwarded();
                Ok(InboundOutcome::Forwarded { to: recipient })
            }
            ForwardResult::TtlExpired => {
                self.stats.record_message_dropped_ttl();
                Ok(InboundOutcome::Dropped)
            }
            ForwardResult::Buffered => Ok(InboundOutcome::Dropped),
        }
    }

    /// Sends an already-encrypted (or handshake) payload to `recipient`.
    pub fn send_message(
        &mut self,
        recipient: &PeerAddress,
        original_type: u8,
        payload: &[u8],
        kind: MessageKind,
        cipher: Option<&dyn transport::CryptoCipher>,
        fragment_id: [u8; 8],
    ) -> Result<(), TransportError> {
        self.transport
            .send_originating(&self.ledger, recipient, original_type, payload, kind, cipher, fragment_id)?;
        self.stats.record_fragment_sent();
        Ok(())
    }

    /// Writes the next queued fragment to the driver, if any.
    pub async fn pump_transport(&mut self) -> Result<bool, TransportError> {
        self.transport.pump_once(&self.ledger).await
    }

    /// Drives health checks and reconnection attempts for every tracked
    /// client link. Intended to be called once per scheduler tick.
    pub async fn run_health_checks(&mut self, now_ms: u64) {
        // Driven by the health monitor's own tracked addresses rather than
        // the ledger's client list: a peer reconnecting after a powered-off
        // cycle is tracked here before the ledger has a client link for it
        // again.
        let addrs: Vec<PeerAddress> = self.health.tracked_addresses().cloned().collect();
        for addr in addrs {
            if self.health.due_for_health_check(&addr, now_ms) {
                if self.health_tick_paused(&addr) {
                    self.health
                        .defer_health_check(&addr, now_ms, self.config.health_check_min_interval);
                } else {
                    self.health.begin_health_check(&addr, now_ms, &self.config);
                    self.stats.record_health_check_sent();
                    let sent = self.transport.send_originating(
                        &self.ledger,
                        &addr,
                        PING_MESSAGE_TYPE,
                        &[],
                        MessageKind::Handshake,
                        None,
                        ping_fragment_id(&addr, now_ms),
                    );
                    if sent.is_err() {
                        self.health.health_check_failed(&addr, now_ms, &self.config);
                        self.stats.record_health_check_failed();
                        self.ledger.remove_client(&addr);
                    }
                }
            }
            if self.health.health_check_timed_out(&addr, now_ms) {
                self.health.health_check_failed(&addr, now_ms, &self.config);
                self.stats.record_health_check_failed();
                self.ledger.remove_client(&addr);
            }
            if self.health.due_for_reconnect_attempt(&addr, now_ms) {
                self.reconnect(&addr, now_ms).await;
            }
        }
    }

    /// True while health-check traffic for `addr` must be held off: a
    /// handshake or pairing flow is in progress, outbound message traffic
    /// is still in flight or queued, there is no usable client link at
    /// all, or the link has no message characteristic resolved yet.
    fn health_tick_paused(&self, addr: &PeerAddress) -> bool {
        let handshake_or_pairing = self
            .handshake_observer
            .as_ref()
            .is_some_and(|observer| observer.handshake_in_progress(addr) || observer.pairing_in_progress(addr));
        let message_characteristic_absent = self
            .ledger
            .client(addr)
            .map(|link| link.message_characteristic.is_none())
            .unwrap_or(true);
        handshake_or_pairing
            || self.transport.has_pending_work()
            || !self.ledger.has_client(addr)
            || message_characteristic_absent
    }

    /// Reconnection to a peer whose link has failed is driven by
    /// rediscovery rather than dialing its last-known address directly:
    /// discovery is (re)started and the actual reconnect completes
    /// through the normal [`Self::on_discovered`] path once a matching
    /// advertisement turns up, or this scan itself times out.
    async fn reconnect(&mut self, addr: &PeerAddress, now_ms: u64) {
        if self.health.is_scanning(addr) {
            if !self.health.reconnect_failed(addr, now_ms, &self.config) {
                self.stats.record_reconnect_giveup();
                self.ledger.remove_client(addr);
                self.ledger.clear_peer_hint_if_unused(addr);
            }
            return;
        }

        if let Err(err) = self
            .driver
            .start_discovery(&[self.config.service_uuid.clone()])
            .await
        {
            warn!(%addr, %err, "failed to start discovery for reconnect scan");
            if !self.health.reconnect_failed(addr, now_ms, &self.config) {
                self.stats.record_reconnect_giveup();
                self.ledger.remove_client(addr);
                self.ledger.clear_peer_hint_if_unused(addr);
            }
            return;
        }
        self.health.begin_scan(addr, now_ms, &self.config);
    }

    /// Periodic maintenance: evicts stale reassembly/loop-guard state.
    /// Separate from [`Self::run_health_checks`] since it never needs
    /// driver I/O and is cheap enough to call every tick unconditionally.
    pub fn evict_stale(&mut self, now_ms: u64) -> usize {
        self.transport.evict_stale_reassemblies(now_ms)
    }

    pub fn local_token(&self) -> &str {
        &self.local_token
    }
}

fn ping_fragment_id(addr: &PeerAddress, now_ms: u64) -> [u8; 8] {
    let digest = blake3::hash(format!("{addr}:{now_ms}").as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    id
}
