//! End-to-end scenario tests driving `MeshCore` purely through its public
//! surface (`dispatch_event`/`drain_driver_events`, `commit_collision_resolutions`,
//! `run_health_checks`, `set_power_mode`), the way a real caller would.

use std::sync::Arc;

use ble_mesh_core::clock::SimClock;
use ble_mesh_core::config::{CoreConfig, PowerMode};
use ble_mesh_core::driver::{
    AdapterState, BleEvent, CharacteristicHandle, CharacteristicProperties, GattService, MockBleDriver,
};
use ble_mesh_core::ledger::LinkRole;
use ble_mesh_core::peer::PeerAddress;
use ble_mesh_core::status::CoreStatus;
use ble_mesh_core::transport::fragment::split_into_fragments;
use ble_mesh_core::MeshCore;

fn node(
    local: &str,
    token: &str,
    config: CoreConfig,
) -> (MeshCore<MockBleDriver, SimClock>, Arc<MockBleDriver>, Arc<SimClock>) {
    let driver = Arc::new(MockBleDriver::new());
    let clock = Arc::new(SimClock::new());
    let (core, _status) = MeshCore::new(
        driver.clone(),
        clock.clone(),
        config,
        PeerAddress::new(local),
        token.to_string(),
    );
    (core, driver, clock)
}

fn with_service(driver: &MockBleDriver, peer: &PeerAddress, config: &CoreConfig) {
    driver.set_services(
        peer,
        vec![GattService {
            uuid: config.service_uuid.clone(),
            characteristics: vec![CharacteristicHandle {
                uuid: config.message_characteristic_uuid.clone(),
                properties: CharacteristicProperties {
                    notify: true,
                    write: true,
                },
            }],
        }],
    );
}

/// S1: our own dial to `peer` completes first (`ClientLink`), then `peer`'s
/// own dial arrives at us as an inbound `CentralConnected`. The inbound
/// attempt is admitted with a grace window rather than rejected outright;
/// with nothing subscribing before the window elapses, the server link
/// loses and the client link we already had survives.
#[tokio::test]
async fn s1_central_connected_after_existing_client_link_resolves_via_grace_window() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("A", "token-a", config.clone());
    let peer = PeerAddress::new("B");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(0).await;
    assert!(core.ledger().has_client(&peer));

    driver.push_event(BleEvent::CentralConnected { central: peer.clone() });
    core.drain_driver_events(10).await;
    assert!(core.ledger().has_server(&peer));
    assert_eq!(core.ledger().deferred_teardown_role(&peer), Some(LinkRole::Server));

    let deadline = 10 + config.deferred_teardown.as_millis() as u64;
    core.commit_collision_resolutions(deadline).await;

    assert!(core.ledger().has_client(&peer), "the client link we already held must survive");
    assert!(!core.ledger().has_server(&peer), "the unconfirmed inbound link must be torn down");
}

/// S1 variant: if the inbound link proves itself (subscribes) before its
/// grace window elapses, it survives alongside the client link instead of
/// being torn down.
#[tokio::test]
async fn s1_subscribing_before_the_grace_window_saves_the_server_link() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("A", "token-a", config.clone());
    let peer = PeerAddress::new("B");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(0).await;

    driver.push_event(BleEvent::CentralConnected { central: peer.clone() });
    driver.push_event(BleEvent::CharacteristicSubscribed {
        central: peer.clone(),
        characteristic: config.message_characteristic_uuid.clone(),
    });
    core.drain_driver_events(10).await;

    let deadline = 10 + config.deferred_teardown.as_millis() as u64;
    core.commit_collision_resolutions(deadline).await;

    assert!(core.ledger().has_client(&peer));
    assert!(core.ledger().has_server(&peer), "a subscribed link must survive its grace window");
}

/// S2: a dial is about to go out to a peer we already hold a viable,
/// subscribed inbound link to. The lexicographically larger token yields
/// its outbound dial, so the side with the smaller token keeps dialing
/// while the other side backs off.
#[tokio::test]
async fn s2_larger_local_token_yields_its_outbound_dial() {
    let config = CoreConfig::default();
    // "zzzzzzzz" sorts after any hex digest, so this node's token always
    // loses the tie-break against the peer's hint-derived token.
    let (mut core, driver, _clock) = node("A", "zzzzzzzz", config.clone());
    let peer = PeerAddress::new("B");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::CentralConnected { central: peer.clone() });
    driver.push_event(BleEvent::CharacteristicSubscribed {
        central: peer.clone(),
        characteristic: config.message_characteristic_uuid.clone(),
    });
    core.drain_driver_events(0).await;
    assert!(core.ledger().has_server(&peer));

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: Some([0x00; 8]),
    });
    core.drain_driver_events(0).await;

    assert!(!core.ledger().has_client(&peer), "larger local token must yield, not dial");
    assert!(!driver.is_connected(&peer));
}

/// S2 counterpart: a smaller local token does not yield, so the dial goes
/// ahead and a client link is established alongside the existing inbound one.
#[tokio::test]
async fn s2_smaller_local_token_proceeds_with_its_dial() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("A", "00000000", config.clone());
    let peer = PeerAddress::new("B");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::CentralConnected { central: peer.clone() });
    driver.push_event(BleEvent::CharacteristicSubscribed {
        central: peer.clone(),
        characteristic: config.message_characteristic_uuid.clone(),
    });
    core.drain_driver_events(0).await;

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: Some([0xff; 8]),
    });
    core.drain_driver_events(0).await;

    assert!(core.ledger().has_client(&peer), "smaller local token must go ahead and dial");
}

/// S3: a live client link whose health check times out enters a reconnect
/// scan; once the peer is rediscovered within that scan window, the normal
/// discovery path reconnects it and the core ends up alive and `Ready` again.
#[tokio::test]
async fn s3_health_check_timeout_drives_a_reconnect() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("R", "token-r", config.clone());
    let peer = PeerAddress::new("peer");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(0).await;
    assert_eq!(core.status(), CoreStatus::Ready);

    // t=3s: the health check fires; send it out.
    core.run_health_checks(3000).await;
    core.pump_transport().await.unwrap();
    assert!(!driver.take_outbound_writes().is_empty(), "a ping must have been written");

    // t=6s: no pong arrived, so the check times out, failure is declared,
    // and a reconnect scan begins.
    core.run_health_checks(6000).await;
    assert!(!core.ledger().has_client(&peer), "a timed-out link must not be treated as still live");

    // The peer is rediscovered inside the scan window; the reconnect
    // completes through the normal discovery path.
    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(7000).await;

    assert_eq!(core.stats().reconnect_attempts, 1);
    assert!(core.ledger().has_client(&peer), "the peer must be reconnected, not abandoned");
    assert_eq!(core.status(), CoreStatus::Ready);
}

/// S4: a node forwarding between a client link and a server link of
/// different MTUs re-fragments at the narrower MTU, decrementing ttl by
/// one for the hop; a ttl-exhausted message is dropped rather than forwarded.
#[tokio::test]
async fn s4_forwards_across_heterogeneous_mtus_and_drops_exhausted_ttl() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("R", "token-r", config.clone());
    let peer_a = PeerAddress::new("A");
    let peer_b = PeerAddress::new("B");

    with_service(&driver, &peer_a, &config);
    driver.set_negotiated_mtu(&peer_a, 244);
    driver.push_event(BleEvent::Discovered {
        peer: peer_a.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(0).await;
    assert_eq!(core.ledger().client(&peer_a).unwrap().mtu, 244);

    driver.push_event(BleEvent::CentralConnected { central: peer_b.clone() });
    core.drain_driver_events(0).await;
    driver.push_event(BleEvent::ServerMtuUpdated {
        central: peer_b.clone(),
        mtu: 23,
    });
    core.drain_driver_events(0).await;
    assert_eq!(core.ledger().server(&peer_b).unwrap().mtu, 23);

    // A splits a 600-byte payload addressed to B at its own 244-byte mtu.
    let payload = vec![0x42u8; 600];
    let fragments = split_into_fragments([11; 8], 1, b"B", config.default_ttl, &payload, 244);
    assert_eq!(fragments.len(), 3);
    for fragment in &fragments {
        assert!(fragment.encode().len() <= 244);
        assert!(fragment.encode().len() > 23);
    }

    for fragment in &fragments {
        driver.push_event(BleEvent::CharacteristicNotified {
            peer: peer_a.clone(),
            characteristic: config.message_characteristic_uuid.clone(),
            value: fragment.encode(),
        });
    }
    core.drain_driver_events(0).await;

    while core.pump_transport().await.unwrap() {}
    let notifies = driver.take_notifies();
    assert!(notifies.len() > fragments.len(), "re-fragmenting to the narrower mtu must yield more pieces");
    assert!(notifies.iter().all(|(to, _, bytes)| *to == peer_b && bytes.len() <= 23));
    assert_eq!(core.stats().messages_forwarded, 1);

    // A message with its ttl already exhausted must never be queued for
    // the next hop at all.
    let exhausted = split_into_fragments([12; 8], 1, b"B", 0, &payload, 244);
    for fragment in &exhausted {
        driver.push_event(BleEvent::CharacteristicNotified {
            peer: peer_a.clone(),
            characteristic: config.message_characteristic_uuid.clone(),
            value: fragment.encode(),
        });
    }
    core.drain_driver_events(0).await;
    assert!(!core.pump_transport().await.unwrap(), "ttl-exhausted message must not be forwarded");
}

/// S5: the adapter powering off clears every tracked link but keeps the
/// last-connected peer on hand; powering back on starts a reconnect scan for
/// that same peer, and rediscovering it within the scan window reconnects it
/// through the normal discovery path.
#[tokio::test]
async fn s5_bluetooth_power_cycle_reconnects_the_last_peer() {
    let config = CoreConfig::default();
    let (mut core, driver, _clock) = node("R", "token-r", config.clone());
    let peer = PeerAddress::new("peer");
    with_service(&driver, &peer, &config);

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(0).await;
    assert!(core.ledger().has_client(&peer));

    core.dispatch_event(BleEvent::StateChanged(AdapterState::PoweredOff), 100).await;
    assert!(!core.ledger().has_client(&peer), "no link can survive the radio powering off");
    assert_eq!(core.status(), CoreStatus::Disconnected);

    core.dispatch_event(BleEvent::StateChanged(AdapterState::PoweredOn), 900).await;
    assert_eq!(core.status(), CoreStatus::Reconnecting);

    let scan_starts_at = 900 + config.bluetooth_poweron_reconnect_delay.as_millis() as u64;
    core.run_health_checks(scan_starts_at).await;

    driver.push_event(BleEvent::Discovered {
        peer: peer.clone(),
        rssi: Some(-40),
        hint: None,
    });
    core.drain_driver_events(scan_starts_at + 10).await;

    assert!(core.ledger().has_client(&peer), "the last-connected peer must be reconnected");
    assert_eq!(core.status(), CoreStatus::Ready);
}

/// S6: tightening the power mode trims client links oldest-first until the
/// new ceiling is satisfied, keeping the most recently connected one.
#[tokio::test]
async fn s6_tightening_power_mode_trims_oldest_clients_first() {
    let config = CoreConfig::performance_defaults();
    let (mut core, driver, _clock) = node("R", "token-r", config.clone());

    let peers: Vec<PeerAddress> = (1..=4).map(|i| PeerAddress::new(format!("L{i}"))).collect();
    for (i, peer) in peers.iter().enumerate() {
        with_service(&driver, peer, &config);
        driver.push_event(BleEvent::Discovered {
            peer: peer.clone(),
            rssi: Some(-40),
            hint: None,
        });
        core.drain_driver_events((i as u64) * 10).await;
        assert!(core.ledger().has_client(peer));
    }
    assert_eq!(core.ledger().client_count(), 4);

    core.set_power_mode(PowerMode::UltraLowPower, 1000).await;

    assert!(!core.ledger().has_client(&peers[0]));
    assert!(!core.ledger().has_client(&peers[1]));
    assert!(!core.ledger().has_client(&peers[2]));
    assert!(core.ledger().has_client(&peers[3]), "the youngest link must be the one kept");
    assert_eq!(core.ledger().client_count(), 1);
    assert_eq!(core.stats().links_dropped_capacity, 3);
}
