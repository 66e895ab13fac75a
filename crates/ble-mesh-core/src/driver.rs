//! The platform BLE driver capability.
//!
//! This is the one genuinely external collaborator the core depends on for
//! I/O: the actual radio stack. It is modeled as an abstract async trait so
//! the rest of the crate never references a concrete platform crate
//! directly; the real `btleplug` backend lives behind the `btleplug`
//! Cargo feature as `backend::btleplug` and is not built by default.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::peer::PeerAddress;

/// Write semantics for a characteristic write, mirrored from the GATT spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub uuid: String,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicHandle>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &str) -> Option<&CharacteristicHandle> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service_uuid: String,
    pub local_hint: Option<[u8; 8]>,
}

/// Adapter power state, surfaced via [`BleEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unknown,
}

/// Events the driver delivers to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    StateChanged(AdapterState),
    Discovered {
        peer: PeerAddress,
        rssi: Option<i16>,
        hint: Option<[u8; 8]>,
    },
    CharacteristicNotified {
        peer: PeerAddress,
        characteristic: String,
        value: Vec<u8>,
    },
    CentralConnected {
        central: PeerAddress,
    },
    CentralDisconnected {
        central: PeerAddress,
    },
    CharacteristicSubscribed {
        central: PeerAddress,
        characteristic: String,
    },
    ServerMtuUpdated {
        central: PeerAddress,
        mtu: usize,
    },
}

/// Driver-level failure. [`DriverError::is_transient`] is the predicate
/// `GattController` consults to decide whether to retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("operation timed out")]
    Timeout,
    #[error("peer not connected")]
    NotConnected,
    #[error("transient driver error: {0}")]
    Transient(String),
    #[error("fatal driver error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Timeout | DriverError::Transient(_))
    }
}

/// Abstract capability interface for the platform BLE stack.
///
/// Every method here is a suspension point under the single-writer
/// cooperative scheduling model: callers `.await` them serially and never
/// hold a ledger borrow across the call.
#[async_trait]
pub trait BleDriver: Send + Sync {
    async fn start_discovery(&self, service_uuids: &[String]) -> Result<(), DriverError>;
    async fn stop_discovery(&self) -> Result<(), DriverError>;

    async fn connect(&self, peer: &PeerAddress) -> Result<(), DriverError>;
    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), DriverError>;

    async fn discover_gatt(&self, peer: &PeerAddress) -> Result<Vec<GattService>, DriverError>;
    async fn request_mtu(&self, peer: &PeerAddress, mtu: usize) -> Result<usize, DriverError>;
    async fn get_max_write_length(
        &self,
        peer: &PeerAddress,
        write_type: WriteType,
    ) -> Result<usize, DriverError>;

    async fn write_characteristic(
        &self,
        peer: &PeerAddress,
        characteristic: &str,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), DriverError>;
    async fn set_notify_state(
        &self,
        peer: &PeerAddress,
        characteristic: &str,
        enabled: bool,
    ) -> Result<(), DriverError>;

    async fn start_advertising(&self, advertisement: Advertisement) -> Result<(), DriverError>;
    async fn stop_advertising(&self) -> Result<(), DriverError>;
    async fn notify_characteristic(
        &self,
        central: &PeerAddress,
        characteristic: &str,
        value: &[u8],
    ) -> Result<(), DriverError>;
    async fn disconnect_central(&self, central: &PeerAddress) -> Result<(), DriverError>;

    /// Pops the next queued driver event, if any. Non-blocking.
    async fn next_event(&self) -> Option<BleEvent>;
}

/// In-memory driver double used by tests and the bundled simulation
/// harness, with GATT discovery/MTU bookkeeping and fault injection so the
/// `gatt`/`health`/`collision` modules can be exercised deterministically.
#[derive(Debug)]
pub struct MockBleDriver {
    inner: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    events: VecDeque<BleEvent>,
    outbound_writes: Vec<(PeerAddress, String, Vec<u8>)>,
    notifies: Vec<(PeerAddress, String, Vec<u8>)>,
    connected: std::collections::HashSet<String>,
    services: std::collections::HashMap<String, Vec<GattService>>,
    negotiated_mtu: std::collections::HashMap<String, usize>,
    max_write_length: std::collections::HashMap<String, usize>,
    fail_connect: std::collections::HashSet<String>,
    fail_connect_transiently: std::collections::HashSet<String>,
    disconnect_calls: std::collections::HashMap<String, usize>,
    discovery_started: bool,
    advertising: bool,
}

impl Default for MockBleDriver {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MockState::default()),
        }
    }
}

impl MockBleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: BleEvent) {
        self.inner.lock().unwrap().events.push_back(event);
    }

    pub fn set_services(&self, peer: &PeerAddress, services: Vec<GattService>) {
        self.inner
            .lock()
            .unwrap()
            .services
            .insert(peer.0.clone(), services);
    }

    pub fn set_negotiated_mtu(&self, peer: &PeerAddress, mtu: usize) {
        self.inner
            .lock()
            .unwrap()
            .negotiated_mtu
            .insert(peer.0.clone(), mtu);
    }

    pub fn set_max_write_length(&self, peer: &PeerAddress, len: usize) {
        self.inner
            .lock()
            .unwrap()
            .max_write_length
            .insert(peer.0.clone(), len);
    }

    pub fn fail_connect_permanently(&self, peer: &PeerAddress) {
        self.inner.lock().unwrap().fail_connect.insert(peer.0.clone());
    }

    pub fn fail_connect_once_transiently(&self, peer: &PeerAddress) {
        self.inner
            .lock()
            .unwrap()
            .fail_connect_transiently
            .insert(peer.0.clone());
    }

    pub fn is_connected(&self, peer: &PeerAddress) -> bool {
        self.inner.lock().unwrap().connected.contains(&peer.0)
    }

    pub fn take_outbound_writes(&self) -> Vec<(PeerAddress, String, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().unwrap().outbound_writes)
    }

    pub fn take_notifies(&self) -> Vec<(PeerAddress, String, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().unwrap().notifies)
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.lock().unwrap().advertising
    }

    pub fn disconnect_calls(&self, peer: &PeerAddress) -> usize {
        self.inner
            .lock()
            .unwrap()
            .disconnect_calls
            .get(&peer.0)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BleDriver for MockBleDriver {
    async fn start_discovery(&self, _service_uuids: &[String]) -> Result<(), DriverError> {
        self.inner.lock().unwrap().discovery_started = true;
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), DriverError> {
        self.inner.lock().unwrap().discovery_started = false;
        Ok(())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<(), DriverError> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_connect.contains(&peer.0) {
            return Err(DriverError::Fatal("connect refused".into()));
        }
        if state.fail_connect_transiently.remove(&peer.0) {
            return Err(DriverError::Transient("link busy".into()));
        }
        state.connected.insert(peer.0.clone());
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), DriverError> {
        let mut state = self.inner.lock().unwrap();
        state.connected.remove(&peer.0);
        *state.disconnect_calls.entry(peer.0.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn discover_gatt(&self, peer: &PeerAddress) -> Result<Vec<GattService>, DriverError> {
        let state = self.inner.lock().unwrap();
        state
            .services
            .get(&peer.0)
            .cloned()
            .ok_or(DriverError::Transient("services not yet resolved".into()))
    }

    async fn request_mtu(&self, peer: &PeerAddress, mtu: usize) -> Result<usize, DriverError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .negotiated_mtu
            .get(&peer.0)
            .copied()
            .unwrap_or(mtu.min(23)))
    }

    async fn get_max_write_length(
        &self,
        peer: &PeerAddress,
        _write_type: WriteType,
    ) -> Result<usize, DriverError> {
        let state = self.inner.lock().unwrap();
        Ok(state.max_write_length.get(&peer.0).copied().unwrap_or(182))
    }

    async fn write_characteristic(
        &self,
        peer: &PeerAddress,
        characteristic: &str,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<(), DriverError> {
        let mut state = self.inner.lock().unwrap();
        if !state.connected.contains(&peer.0) {
            return Err(DriverError::NotConnected);
        }
        state
            .outbound_writes
            .push((peer.clone(), characteristic.to_string(), value.to_vec()));
        Ok(())
    }

    async fn set_notify_state(
        &self,
        _peer: &PeerAddress,
        _characteristic: &str,
        _enabled: bool,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start_advertising(&self, _advertisement: Advertisement) -> Result<(), DriverError> {
        self.inner.lock().unwrap().advertising = true;
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), DriverError> {
        self.inner.lock().unwrap().advertising = false;
        Ok(())
    }

    async fn notify_characteristic(
        &self,
        central: &PeerAddress,
        characteristic: &str,
        value: &[u8],
    ) -> Result<(), DriverError> {
        self.inner.lock().unwrap().notifies.push((
            central.clone(),
            characteristic.to_string(),
            value.to_vec(),
        ));
        Ok(())
    }

    async fn disconnect_central(&self, central: &PeerAddress) -> Result<(), DriverError> {
        self.inner.lock().unwrap().connected.remove(&central.0);
        Ok(())
    }

    async fn next_event(&self) -> Option<BleEvent> {
        self.inner.lock().unwrap().events.pop_front()
    }
}

#[cfg(feature = "btleplug")]
pub mod backend;
