use std::sync::Arc;
use std::time::{Duration, SystemTime};
use btleplug::api::BDAddr;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use lighthouse_power::config::types::{Config, DeviceConfig};
use lighthouse_power::device::constants::{V2_IDENTIFY_CHARACTERISTIC, V2_PWR_CHARACTERISTIC};
use lighthouse_power::device::registry::{DeviceStatus, Registry, RegistryEvent};
use lighthouse_power::device::types::{DeviceDescriptor, Generation, PowerState};
use lighthouse_power::error::DeviceError;
use lighthouse_power::transport::fake::{FakeLighthouse, FakeTransport};

fn left() -> BDAddr {
    BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])
}

fn right() -> BDAddr {
    BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02])
}

fn descriptor(address: BDAddr, generation: Generation) -> DeviceDescriptor {
    DeviceDescriptor {
        address,
        generation,
        name: Some(format!("LHB-{:02X}", address.into_inner()[5])),
        rssi: Some(-60),
        last_seen: SystemTime::now(),
    }
}

async fn wait_for(events: &mut Receiver<RegistryEvent>, wanted: impl Fn(&RegistryEvent) -> bool) -> RegistryEvent {
    timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {},
                Err(RecvError::Closed) => panic!("registry events closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

fn drain(events: &mut Receiver<RegistryEvent>) -> Vec<RegistryEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

fn start(fake: &FakeTransport, config: Config) -> Registry {
    let (registry, _handle) = Registry::start(Arc::new(fake.clone()), config, CancellationToken::new());
    registry
}

#[tokio::test(start_paused = true)]
async fn set_power_then_refresh_reports_target() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    let registry = start(&fake, Config::default());
    registry.observe(descriptor(left(), Generation::V2));

    for target in [PowerState::On, PowerState::On, PowerState::Standby, PowerState::Sleep, PowerState::Sleep] {
        registry.set_power(left(), target).await.unwrap();
        assert_eq!(registry.cached_attributes(left()).unwrap().power_state, target);

        let attributes = registry.refresh_attributes(left()).await.unwrap();
        assert_eq!(attributes.power_state, target);
    }

    registry.shutdown().await;
    assert!(!fake.is_connected(left()));
}

#[tokio::test(start_paused = true)]
async fn identify_blinks_v2() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    let registry = start(&fake, Config::default());
    registry.observe(descriptor(left(), Generation::V2));

    registry.identify(left()).await.unwrap();
    assert_eq!(fake.writes(left()), vec![(V2_IDENTIFY_CHARACTERISTIC, vec![0x00])]);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_read_keeps_cached_attributes() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    let registry = start(&fake, Config::default());
    registry.observe(descriptor(left(), Generation::V2));

    let before = registry.refresh_attributes(left()).await.unwrap();
    assert_eq!(before.model.as_deref(), Some("LHB-400"));

    fake.set_characteristic(left(), V2_PWR_CHARACTERISTIC, &[]);
    let result = registry.refresh_attributes(left()).await;
    assert!(matches!(result, Err(DeviceError::MalformedResponse { .. })));

    let cached = registry.cached_attributes(left()).unwrap();
    assert!(cached.stale);
    assert_eq!(cached.model, before.model);
    assert_eq!(cached.power_state, before.power_state);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failures_make_a_device_unavailable_until_it_recovers() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    let registry = start(&fake, Config::default());
    let mut events = registry.subscribe();

    registry.observe(descriptor(left(), Generation::V2));
    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { .. })).await;
    assert!(registry.is_available(left()));

    fake.drop_link(left());
    fake.fail_next_connects(left(), u32::MAX);

    let event = wait_for(&mut events, |event| matches!(event, RegistryEvent::AvailabilityChanged { .. })).await;
    assert_eq!(event, RegistryEvent::AvailabilityChanged { address: left(), available: false });
    assert_eq!(registry.status(left()), Some(DeviceStatus::Unavailable));
    assert!(registry.cached_attributes(left()).unwrap().stale);

    // commands are still tried
    let attempts = fake.connect_attempts(left());
    let result = registry.set_power(left(), PowerState::On).await;
    assert!(matches!(result, Err(DeviceError::ConnectionFailed { attempts: 3, .. })));
    assert!(fake.connect_attempts(left()) > attempts);

    fake.fail_next_connects(left(), 0);
    let event = wait_for(&mut events, |event| matches!(event, RegistryEvent::AvailabilityChanged { .. })).await;
    assert_eq!(event, RegistryEvent::AvailabilityChanged { address: left(), available: true });
    assert!(!registry.cached_attributes(left()).unwrap().stale);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_adapter_is_reported_once() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    fake.add(FakeLighthouse::v2(right(), "LHB-02"));
    let registry = start(&fake, Config::default());
    let mut events = registry.subscribe();

    registry.observe(descriptor(left(), Generation::V2));
    registry.observe(descriptor(right(), Generation::V2));
    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { address, .. } if *address == left())).await;
    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { address, .. } if *address == right())).await;

    fake.set_radio(false);
    wait_for(&mut events, |event| *event == RegistryEvent::TransportUnavailable).await;
    assert!(registry.transport_fault());

    // many failed polls later the adapter is still the only thing reported
    sleep(Duration::from_secs(60)).await;
    let later = drain(&mut events);
    assert!(!later.contains(&RegistryEvent::TransportUnavailable));
    assert!(!later.iter().any(|event| matches!(event, RegistryEvent::AvailabilityChanged { .. })));
    assert!(registry.is_available(left()));
    assert!(registry.is_available(right()));

    let result = registry.set_power(left(), PowerState::On).await;
    assert!(matches!(result, Err(ref err) if err.is_transport_fault()));

    fake.set_radio(true);
    wait_for(&mut events, |event| *event == RegistryEvent::TransportRestored).await;
    assert!(!registry.transport_fault());

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn configured_device_waits_for_discovery() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    fake.add_hidden(FakeLighthouse::v2(right(), "LHB-02"));

    let mut config = Config::default();
    config.discovery_prefix = Some("NOTHING-MATCHES".to_string());
    config.devices.push(DeviceConfig { name: Some("Right".to_string()), ..DeviceConfig::new(right()) });

    let registry = start(&fake, config);
    let mut events = registry.subscribe();
    assert_eq!(registry.status(right()), Some(DeviceStatus::PendingDiscovery));

    let discovery = {
        let registry = registry.clone();
        let scanner = registry.scanner();
        tokio::spawn(async move { registry.discover(scanner).await })
    };

    sleep(Duration::from_secs(1)).await;
    assert!(fake.is_scanning());
    assert_eq!(registry.status(right()), Some(DeviceStatus::PendingDiscovery));
    // the prefix does not match and the address is not configured
    assert_eq!(registry.status(left()), None);
    assert_eq!(fake.connect_attempts(right()), 0);

    fake.reveal(right());
    let event = wait_for(&mut events, |event| matches!(event, RegistryEvent::DeviceActivated { .. })).await;
    assert_eq!(event, RegistryEvent::DeviceActivated { address: right() });
    assert_eq!(registry.status(right()), Some(DeviceStatus::Available));

    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { .. })).await;
    let devices = registry.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("Right"));
    assert_eq!(devices[0].generation, Generation::V2);

    registry.shutdown().await;
    discovery.await.unwrap().unwrap();
    assert!(!fake.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn discovery_adds_new_lighthouses_in_order() {
    let fake = FakeTransport::new();
    let registry = start(&fake, Config::default());
    let mut events = registry.subscribe();

    let discovery = {
        let registry = registry.clone();
        let scanner = registry.scanner();
        tokio::spawn(async move { registry.discover(scanner).await })
    };
    sleep(Duration::from_millis(10)).await;

    fake.add(FakeLighthouse::v1(right(), "HTC BS 000002"));
    wait_for(&mut events, |event| matches!(event, RegistryEvent::DeviceAdded { .. })).await;
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    wait_for(&mut events, |event| matches!(event, RegistryEvent::DeviceAdded { .. })).await;

    let devices = registry.devices();
    let addresses: Vec<BDAddr> = devices.iter().map(|device| device.address).collect();
    assert_eq!(addresses, vec![right(), left()]);
    assert_eq!(devices[0].generation, Generation::V1);

    registry.shutdown().await;
    discovery.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn protocol_mismatch_is_reported_once() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v1(right(), "HTC BS 000002"));

    let mut config = Config::default();
    config.devices.push(DeviceConfig {
        generation: Some(Generation::V2),
        pair_id: Some(0x12345678),
        ..DeviceConfig::new(right())
    });
    let registry = start(&fake, config);
    let mut events = registry.subscribe();

    registry.observe(descriptor(right(), Generation::V1));
    let event = wait_for(&mut events, |event| matches!(event, RegistryEvent::ProtocolMismatch { .. })).await;
    assert_eq!(
        event,
        RegistryEvent::ProtocolMismatch { address: right(), expected: Generation::V2, found: Generation::V1 }
    );

    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { .. })).await;
    assert_eq!(registry.devices()[0].generation, Generation::V1);
    assert!(registry.is_available(right()));

    sleep(Duration::from_secs(30)).await;
    assert!(!drain(&mut events).iter().any(|event| matches!(event, RegistryEvent::ProtocolMismatch { .. })));

    registry.set_power(right(), PowerState::On).await.unwrap();
    assert_eq!(registry.refresh_attributes(right()).await.unwrap().power_state, PowerState::On);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_releases_the_link_between_polls() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    let config = Config::default();
    let interval = config.polling.power_state_interval;
    let registry = start(&fake, config);
    let mut events = registry.subscribe();

    registry.observe(descriptor(left(), Generation::V2));
    wait_for(&mut events, |event| matches!(event, RegistryEvent::AttributesUpdated { .. })).await;

    sleep(interval / 2).await;
    assert!(!fake.is_connected(left()));
    let attempts = fake.connect_attempts(left());

    // the next poll opens the link again and lets go of it afterwards
    sleep(interval).await;
    assert_eq!(fake.connect_attempts(left()), attempts + 1);
    assert!(!fake.is_connected(left()));

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_lighthouse_is_polled_less_often() {
    let fake = FakeTransport::new();
    fake.add(FakeLighthouse::v2(left(), "LHB-01"));
    fake.fail_next_connects(left(), u32::MAX);
    let registry = start(&fake, Config::default());

    registry.observe(descriptor(left(), Generation::V2));
    sleep(Duration::from_secs(600)).await;

    // 3 attempts per poll; 5s, 10s and 20s between the first polls, then 30s
    let attempts = fake.connect_attempts(left());
    assert!((60..=66).contains(&attempts), "{} connect attempts", attempts);
    assert_eq!(registry.status(left()), Some(DeviceStatus::Unavailable));

    // it recovers once the device answers again
    let mut events = registry.subscribe();
    fake.fail_next_connects(left(), 0);
    let event = wait_for(&mut events, |event| matches!(event, RegistryEvent::AvailabilityChanged { .. })).await;
    assert_eq!(event, RegistryEvent::AvailabilityChanged { address: left(), available: true });

    registry.shutdown().await;
}
