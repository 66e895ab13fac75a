//! Power modes, per-mode capacity configuration, and the top-level
//! [`CoreConfig`] builder.

use std::time::Duration;

/// Power mode selection. Owned and decided externally (by battery state,
/// user preference, foreground/background transitions, ...); the core
/// only consumes the *result* of a mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerMode {
    Performance,
    Balanced,
    PowerSaver,
    UltraLowPower,
}

/// Immutable per-power-mode connection capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityConfig {
    pub max_client: usize,
    pub max_server: usize,
    pub max_total: usize,
    pub rssi_floor_dbm: i16,
}

impl PowerMode {
    /// Re-derives the `CapacityConfig` for this mode. Called whenever the
    /// mode changes.
    pub fn capacity_config(self) -> CapacityConfig {
        match self {
            PowerMode::Performance => CapacityConfig {
                max_client: 4,
                max_server: 4,
                max_total: 8,
                rssi_floor_dbm: -95,
            },
            PowerMode::Balanced => CapacityConfig {
                max_client: 3,
                max_server: 3,
                max_total: 6,
                rssi_floor_dbm: -85,
            },
            PowerMode::PowerSaver => CapacityConfig {
                max_client: 2,
                max_server: 2,
                max_total: 3,
                rssi_floor_dbm: -75,
            },
            PowerMode::UltraLowPower => CapacityConfig {
                max_client: 1,
                max_server: 1,
                max_total: 1,
                rssi_floor_dbm: -65,
            },
        }
    }
}

/// Top-level tunables for the connection core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub power_mode: PowerMode,

    pub health_check_min_interval: Duration,
    pub health_check_max_interval: Duration,
    pub health_check_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_timeout: Duration,

    pub deferred_teardown: Duration,
    pub inbound_viability_wait: Duration,
    pub inbound_viability_poll: Duration,
    pub peripheral_notify_wait: Duration,
    pub connect_timeout: Duration,
    pub scan_timeout: Duration,
    pub bluetooth_poweron_reconnect_delay: Duration,

    pub default_ttl: u8,
    pub mtu_fallback: usize,
    pub max_mtu: usize,

    pub service_uuid: String,
    pub message_characteristic_uuid: String,

    pub connect_max_attempts: u32,
    pub connect_retry_backoff: Duration,
    pub discovery_max_attempts: u32,
    pub discovery_retry_backoff: Duration,
    pub notify_settle_delay: Duration,

    pub write_queue_idle_delay: Duration,
    pub inter_fragment_delay_central: Duration,
    pub inter_fragment_delay_forward: Duration,

    pub no_hint_inbound_debounce_window: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            power_mode: PowerMode::Balanced,

            health_check_min_interval: Duration::from_millis(3000),
            health_check_max_interval: Duration::from_millis(30000),
            health_check_interval: Duration::from_millis(5000),
            max_reconnect_attempts: 5,
            ping_timeout: Duration::from_secs(3),

            deferred_teardown: Duration::from_millis(1500),
            inbound_viability_wait: Duration::from_millis(2500),
            inbound_viability_poll: Duration::from_millis(50),
            peripheral_notify_wait: Duration::from_millis(1200),
            connect_timeout: Duration::from_secs(20),
            scan_timeout: Duration::from_secs(8),
            bluetooth_poweron_reconnect_delay: Duration::from_millis(800),

            default_ttl: 7,
            mtu_fallback: 20,
            max_mtu: 517,

            service_uuid: "4b1d0f6c-3a5e-4c5f-8f65-7a7f0dbf2a90".to_string(),
            message_characteristic_uuid: "15c06b19-9b4e-4b36-8af6-2f93a7a6fbc0".to_string(),

            connect_max_attempts: 2,
            connect_retry_backoff: Duration::from_millis(1200),
            discovery_max_attempts: 3,
            discovery_retry_backoff: Duration::from_millis(1000),
            notify_settle_delay: Duration::from_millis(200),

            write_queue_idle_delay: Duration::from_millis(50),
            inter_fragment_delay_central: Duration::from_millis(20),
            inter_fragment_delay_forward: Duration::from_millis(10),

            no_hint_inbound_debounce_window: Duration::from_millis(300),
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Preset tuned for a phone expected to stay on a charger / in the
    /// foreground: widest capacity, least aggressive RSSI floor.
    pub fn performance_defaults() -> Self {
        Self::builder().power_mode(PowerMode::Performance).build()
    }

    /// Preset tuned for background operation on battery.
    pub fn power_saver_defaults() -> Self {
        Self::builder().power_mode(PowerMode::PowerSaver).build()
    }

    /// The default power mode, named explicitly for callers that construct
    /// presets symmetrically rather than relying on `Default`.
    pub fn balanced_defaults() -> Self {
        Self::builder().power_mode(PowerMode::Balanced).build()
    }

    pub fn capacity_config(&self) -> CapacityConfig {
        self.power_mode.capacity_config()
    }
}

/// Fluent builder for [`CoreConfig`].
#[derive(Debug, Default, Clone)]
pub struct CoreConfigBuilder {
    config: OptionalOverrides,
}

#[derive(Debug, Default, Clone)]
struct OptionalOverrides {
    power_mode: Option<PowerMode>,
    default_ttl: Option<u8>,
    mtu_fallback: Option<usize>,
}

impl CoreConfigBuilder {
    pub fn power_mode(mut self, mode: PowerMode) -> Self {
        self.config.power_mode = Some(mode);
        self
    }

    pub fn default_ttl(mut self, ttl: u8) -> Self {
        self.config.default_ttl = Some(ttl);
        self
    }

    pub fn mtu_fallback(mut self, mtu: usize) -> Self {
        self.config.mtu_fallback = Some(mtu);
        self
    }

    pub fn build(self) -> CoreConfig {
        let mut cfg = CoreConfig::default();
        if let Some(mode) = self.config.power_mode {
            cfg.power_mode = mode;
        }
        if let Some(ttl) = self.config.default_ttl {
            cfg.default_ttl = ttl;
        }
        if let Some(mtu) = self.config.mtu_fallback {
            cfg.mtu_fallback = mtu;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_floor_tightens_as_power_mode_tightens() {
        assert!(
            PowerMode::Performance.capacity_config().rssi_floor_dbm
                < PowerMode::Balanced.capacity_config().rssi_floor_dbm
        );
        assert!(
            PowerMode::Balanced.capacity_config().rssi_floor_dbm
                < PowerMode::PowerSaver.capacity_config().rssi_floor_dbm
        );
        assert!(
            PowerMode::PowerSaver.capacity_config().rssi_floor_dbm
                < PowerMode::UltraLowPower.capacity_config().rssi_floor_dbm
        );
    }

    #[test]
    fn builder_overrides_only_touched_fields() {
        let cfg = CoreConfig::builder().default_ttl(3).build();
        assert_eq!(cfg.default_ttl, 3);
        assert_eq!(cfg.mtu_fallback, CoreConfig::default().mtu_fallback);
    }
}
