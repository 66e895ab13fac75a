//! [`GattController`]: dial, MTU negotiation and characteristic discovery
//! for outbound (central) links.
//!
//! Every method here is a suspension point: retries sleep against the
//! injected [`Clock`] rather than the driver, so backoff is deterministic
//! and instant under [`crate::clock::SimClock`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::driver::{BleDriver, DriverError, WriteType};
use crate::error::GattError;
use crate::peer::PeerAddress;

pub struct GattController<D, C> {
    driver: Arc<D>,
    clock: Arc<C>,
    config: Arc<CoreConfig>,
}

impl<D: BleDriver, C: Clock> GattController<D, C> {
    pub fn new(driver: Arc<D>, clock: Arc<C>, config: Arc<CoreConfig>) -> Self {
        Self {
            driver,
            clock,
            config,
        }
    }

    /// Dials `peer`, retrying transient driver failures up to
    /// `connect_max_attempts` times with `connect_retry_backoff` between
    /// attempts. Each attempt is bounded by `connect_timeout`; a transient
    /// failure or a timed-out attempt both trigger a best-effort
    /// disconnect before the retry, since some drivers leave a half-open
    /// connection behind a failed/timed-out connect. A fatal driver error
    /// aborts immediately.
    pub async fn connect_with_retry(&self, peer: &PeerAddress) -> Result<(), GattError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(self.config.connect_timeout, self.driver.connect(peer))
                .await
                .unwrap_or(Err(DriverError::Timeout));
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.config.connect_max_attempts => {
                    warn!(%peer, attempt, %err, "transient connect failure, retrying");
                    let _ = self.driver.disconnect(peer).await;
                    self.clock.sleep(self.config.connect_retry_backoff).await;
                }
                Err(err) => {
                    warn!(%peer, attempt, %err, "connect failed");
                    return Err(GattError::ConnectFailed(peer.clone()));
                }
            }
        }
    }

    /// Negotiates the largest MTU the driver will grant, capped at
    /// `max_mtu`, falling back to `mtu_fallback` if negotiation itself
    /// fails (some platforms never complete an explicit MTU exchange).
    /// The usable write size is then bound by whichever is smaller: the
    /// driver's current max single-write length, or the negotiated ATT
    /// MTU minus its 3-byte header.
    pub async fn detect_optimal_mtu(&self, peer: &PeerAddress) -> usize {
        let negotiated = match self.driver.request_mtu(peer, self.config.max_mtu).await {
            Ok(mtu) => mtu.min(self.config.max_mtu),
            Err(err) => {
                debug!(%peer, %err, "MTU negotiation failed, using fallback");
                return self.config.mtu_fallback;
            }
        };
        let max_write = self.max_write_length(peer).await;
        let ceiling = negotiated.saturating_sub(3).max(20);
        max_write.clamp(20, ceiling)
    }

    /// Returns the largest single GATT write the driver will accept right
    /// now for `peer`, independent of the negotiated MTU (some backends cap
    /// writes-without-response below the negotiated MTU).
    pub async fn max_write_length(&self, peer: &PeerAddress) -> usize {
        self.driver
            .get_max_write_length(peer, WriteType::WithoutResponse)
            .await
            .unwrap_or(self.config.mtu_fallback)
    }

    /// Discovers GATT services on `peer` and resolves the message
    /// characteristic UUID, retrying transient discovery failures.
    pub async fn discover_message_characteristic(
        &self,
        peer: &PeerAddress,
    ) -> Result<String, GattError> {
        let mut attempt = 0;
        let services = loop {
            attempt += 1;
            match self.driver.discover_gatt(peer).await {
                Ok(services) => break services,
                Err(err) if err.is_transient() && attempt < self.config.discovery_max_attempts => {
                    warn!(%peer, attempt, %err, "transient discovery failure, retrying");
                    self.clock.sleep(self.config.discovery_retry_backoff).await;
                }
                Err(_) => return Err(GattError::DiscoveryFailed(peer.clone())),
            }
        };

        let target = &self.config.message_characteristic_uuid;
        services
            .iter()
            .find(|service| service.uuid == self.config.service_uuid)
            .and_then(|service| service.characteristic(target))
            .map(|c| c.uuid.clone())
            .ok_or_else(|| GattError::CharacteristicMissing(peer.clone()))
    }

    /// Subscribes to notifications on `characteristic` and waits out the
    /// platform's subscription-settle delay before declaring the link
    /// ready for traffic.
    pub async fn enable_notifications(
        &self,
        peer: &PeerAddress,
        characteristic: &str,
    ) -> Result<(), GattError> {
        self.driver
            .set_notify_state(peer, characteristic, true)
            .await
            .map_err(|reason| GattError::Driver {
                peer: peer.clone(),
                reason: reason.to_string(),
            })?;
        self.clock.sleep(self.config.notify_settle_delay).await;
        Ok(())
    }
}
