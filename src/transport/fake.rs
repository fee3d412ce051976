//! An in-memory radio with scripted lighthouses.
//!
//! Used by the tests and by the `--simulate` mode of the command line tool. Power writes
//! change what the power characteristic reads back, connect failures and stalled
//! operations can be scripted per device, and everything that reaches a device is
//! recorded in an event log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::device::constants::{
    FIRMWARE_CHARACTERISTIC, HARDWARE_CHARACTERISTIC, MANUFACTURER_CHARACTERISTIC, MODEL_CHARACTERISTIC,
    V1_PWR_CHARACTERISTIC, V1_PWR_SERVICE, V2_CHANNEL_CHARACTERISTIC, V2_IDENTIFY_CHARACTERISTIC,
    V2_PWR_CHARACTERISTIC, V2_PWR_ON, V2_PWR_SERVICE, V2_PWR_SLEEP, V2_PWR_STANDBY, V2_STATE_ON,
    V2_STATE_SLEEP, V2_STATE_STANDBY,
};
use crate::error::TransportError;
use crate::transport::{Advertisement, AdvertisementStream, Link, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeLighthouse {
    pub address: BDAddr,
    pub name: String,
    pub services: Vec<Uuid>,
    pub characteristics: HashMap<Uuid, Vec<u8>>,
    pub rssi: i16,
}

impl FakeLighthouse {
    /// A sleeping Valve Index lighthouse on channel 5.
    pub fn v2(address: BDAddr, name: &str) -> Self {
        let characteristics = HashMap::from([
            (V2_PWR_CHARACTERISTIC, vec![V2_STATE_SLEEP]),
            (V2_CHANNEL_CHARACTERISTIC, vec![0x05]),
            (V2_IDENTIFY_CHARACTERISTIC, vec![]),
            (FIRMWARE_CHARACTERISTIC, b"1.0.0".to_vec()),
            (MODEL_CHARACTERISTIC, b"LHB-400".to_vec()),
            (HARDWARE_CHARACTERISTIC, b"0x0200".to_vec()),
            (MANUFACTURER_CHARACTERISTIC, b"Valve Corporation".to_vec()),
        ]);

        FakeLighthouse {
            address,
            name: name.to_string(),
            services: vec![V2_PWR_SERVICE],
            characteristics,
            rssi: -60,
        }
    }

    /// A HTC Vive lighthouse. It has no readable power state.
    pub fn v1(address: BDAddr, name: &str) -> Self {
        let characteristics = HashMap::from([
            (V1_PWR_CHARACTERISTIC, vec![0x00; 20]),
            (FIRMWARE_CHARACTERISTIC, b"436".to_vec()),
            (MODEL_CHARACTERISTIC, b"HTC BS".to_vec()),
            (HARDWARE_CHARACTERISTIC, b"1.0".to_vec()),
            (MANUFACTURER_CHARACTERISTIC, b"HTC".to_vec()),
        ]);

        FakeLighthouse {
            address,
            name: name.to_string(),
            services: vec![V1_PWR_SERVICE],
            characteristics,
            rssi: -70,
        }
    }

    pub fn with_characteristic(mut self, uuid: Uuid, value: &[u8]) -> Self {
        self.characteristics.insert(uuid, value.to_vec());
        self
    }

    pub fn without_characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristics.remove(&uuid);
        self
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            address: self.address,
            local_name: Some(self.name.clone()),
            services: self.services.clone(),
            manufacturer_data: HashMap::new(),
            rssi: Some(self.rssi),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FakeEvent {
    ConnectAttempt { address: BDAddr, at: Instant },
    Connected { address: BDAddr },
    Read { address: BDAddr, characteristic: Uuid },
    WriteStarted { address: BDAddr, characteristic: Uuid, payload: Vec<u8>, at: Instant },
    WriteFinished { address: BDAddr, characteristic: Uuid, at: Instant },
    Disconnected { address: BDAddr },
}

#[derive(Debug)]
struct FakeDevice {
    lighthouse: FakeLighthouse,
    visible: bool,
    connected: bool,
    failing_connects: u32,
    stalled_connects: u32,
    stalled_discoveries: u32,
    stalled_operations: u32,
    operation_delay: Duration,
}

#[derive(Debug)]
struct FakeState {
    devices: HashMap<BDAddr, FakeDevice>,
    radio_on: bool,
    scanning: bool,
    events: Vec<FakeEvent>,
    listeners: Vec<UnboundedSender<Advertisement>>,
}

impl FakeState {
    fn device(&mut self, address: BDAddr) -> Result<&mut FakeDevice, TransportError> {
        self.devices.get_mut(&address).ok_or(TransportError::DeviceNotFound { address })
    }

    fn broadcast(&mut self, advertisement: Advertisement) {
        self.listeners.retain(|listener| listener.unbounded_send(advertisement.clone()).is_ok());
    }
}

#[derive(Debug, Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        FakeTransport::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        let state = FakeState {
            devices: HashMap::new(),
            radio_on: true,
            scanning: false,
            events: Vec::new(),
            listeners: Vec::new(),
        };

        FakeTransport { state: Arc::new(Mutex::new(state)) }
    }

    /// Two lighthouses, one of each generation.
    pub fn demo() -> Self {
        let transport = FakeTransport::new();
        transport.add(FakeLighthouse::v2(BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]), "LHB-4E3C1A20"));
        transport.add(FakeLighthouse::v1(BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]), "HTC BS 9C1A2B"));
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("Failed to lock FakeTransport state")
    }

    /// Adds a lighthouse that is in range and advertising.
    pub fn add(&self, lighthouse: FakeLighthouse) {
        self.insert(lighthouse, true);
    }

    /// Adds a lighthouse that is not advertising yet, see [`FakeTransport::reveal`].
    pub fn add_hidden(&self, lighthouse: FakeLighthouse) {
        self.insert(lighthouse, false);
    }

    fn insert(&self, lighthouse: FakeLighthouse, visible: bool) {
        let mut state = self.lock();
        let advertisement = lighthouse.advertisement();

        state.devices.insert(lighthouse.address, FakeDevice {
            lighthouse,
            visible,
            connected: false,
            failing_connects: 0,
            stalled_connects: 0,
            stalled_discoveries: 0,
            stalled_operations: 0,
            operation_delay: Duration::ZERO,
        });

        if visible {
            state.broadcast(advertisement);
        }
    }

    pub fn reveal(&self, address: BDAddr) {
        let mut state = self.lock();
        let advertisement = match state.devices.get_mut(&address) {
            Some(device) => {
                device.visible = true;
                device.lighthouse.advertisement()
            },
            None => return,
        };
        state.broadcast(advertisement);
    }

    /// Broadcasts an advertisement that does not belong to any simulated lighthouse.
    pub fn advertise(&self, advertisement: Advertisement) {
        self.lock().broadcast(advertisement);
    }

    /// The next `count` connect attempts fail right away.
    pub fn fail_next_connects(&self, address: BDAddr, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.failing_connects = count;
        }
    }

    /// The next `count` connect attempts hang until their deadline.
    pub fn stall_next_connects(&self, address: BDAddr, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.stalled_connects = count;
        }
    }

    /// The next `count` connect attempts get through, but service discovery hangs until the
    /// deadline.
    pub fn stall_next_discoveries(&self, address: BDAddr, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.stalled_discoveries = count;
        }
    }

    /// The next `count` reads or writes never complete.
    pub fn stall_next_operations(&self, address: BDAddr, count: u32) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.stalled_operations = count;
        }
    }

    pub fn set_operation_delay(&self, address: BDAddr, delay: Duration) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.operation_delay = delay;
        }
    }

    pub fn set_characteristic(&self, address: BDAddr, uuid: Uuid, value: &[u8]) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.lighthouse.characteristics.insert(uuid, value.to_vec());
        }
    }

    pub fn characteristic(&self, address: BDAddr, uuid: Uuid) -> Option<Vec<u8>> {
        self.lock().devices.get(&address).and_then(|device| device.lighthouse.characteristics.get(&uuid).cloned())
    }

    /// Simulates the adapter being switched off or unplugged.
    pub fn set_radio(&self, on: bool) {
        self.lock().radio_on = on;
    }

    /// Simulates the device dropping the connection on its side.
    pub fn drop_link(&self, address: BDAddr) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device.connected = false;
        }
    }

    pub fn is_connected(&self, address: BDAddr) -> bool {
        self.lock().devices.get(&address).map(|device| device.connected).unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.lock().events.clone()
    }

    pub fn connect_attempts(&self, address: BDAddr) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| matches!(event, FakeEvent::ConnectAttempt { address: a, .. } if *a == address))
            .count()
    }

    /// Payloads written to `address`, in order.
    pub fn writes(&self, address: BDAddr) -> Vec<(Uuid, Vec<u8>)> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                FakeEvent::WriteStarted { address: a, characteristic, payload, .. } if *a == address => {
                    Some((*characteristic, payload.clone()))
                },
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.radio_on {
            return Err(TransportError::Unavailable);
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn advertisements(&self) -> Result<AdvertisementStream, TransportError> {
        let mut state = self.lock();
        if !state.radio_on {
            return Err(TransportError::Unavailable);
        }

        let (tx, rx) = unbounded();
        // like a real adapter, devices already in the cache are reported first
        for device in state.devices.values().filter(|device| device.visible) {
            let _ = tx.unbounded_send(device.lighthouse.advertisement());
        }
        state.listeners.push(tx);

        Ok(rx.boxed())
    }

    async fn connect(&self, address: BDAddr, deadline: Duration) -> Result<Box<dyn Link>, TransportError> {
        let stall = {
            let mut state = self.lock();
            state.events.push(FakeEvent::ConnectAttempt { address, at: Instant::now() });

            if !state.radio_on {
                return Err(TransportError::Unavailable);
            }

            let device = state.device(address)?;
            if !device.visible {
                return Err(TransportError::DeviceNotFound { address });
            }
            if device.connected {
                return Err(TransportError::Btle {
                    source: btleplug::Error::RuntimeError(format!("{} already has a client", address)),
                });
            }
            if device.failing_connects > 0 {
                device.failing_connects -= 1;
                return Err(TransportError::Timeout);
            }
            if device.stalled_connects > 0 {
                device.stalled_connects -= 1;
                Some(false)
            } else {
                device.connected = true;
                if device.stalled_discoveries > 0 {
                    device.stalled_discoveries -= 1;
                    Some(true)
                } else {
                    None
                }
            }
        };

        if let Some(connected) = stall {
            sleep(deadline).await;
            if connected {
                release(&mut self.lock(), address);
            }
            return Err(TransportError::Timeout);
        }

        self.lock().events.push(FakeEvent::Connected { address });
        Ok(Box::new(FakeLink { address, transport: self.clone() }))
    }
}

fn release(state: &mut FakeState, address: BDAddr) {
    if let Some(device) = state.devices.get_mut(&address) {
        device.connected = false;
    }
    state.events.push(FakeEvent::Disconnected { address });
}

struct FakeLink {
    address: BDAddr,
    transport: FakeTransport,
}

impl FakeLink {
    /// Checks the link and applies the scripted stall or delay for one operation.
    async fn begin(&self) -> Result<(), TransportError> {
        let (stall, delay) = {
            let mut state = self.transport.lock();
            if !state.radio_on {
                return Err(TransportError::Unavailable);
            }
            let device = state.device(self.address)?;
            if !device.connected {
                return Err(TransportError::Disconnected);
            }
            let stall = device.stalled_operations > 0;
            if stall {
                device.stalled_operations -= 1;
            }
            (stall, device.operation_delay)
        };

        if stall {
            futures::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Link for FakeLink {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn services(&self) -> Vec<Uuid> {
        self.transport
            .lock()
            .devices
            .get(&self.address)
            .map(|device| device.lighthouse.services.clone())
            .unwrap_or_default()
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.begin().await?;

        let mut state = self.transport.lock();
        state.events.push(FakeEvent::Read { address: self.address, characteristic });
        let device = state.device(self.address)?;
        device
            .lighthouse
            .characteristics
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::MissingCharacteristic { uuid: characteristic })
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8], _with_response: bool) -> Result<(), TransportError> {
        self.transport.lock().events.push(FakeEvent::WriteStarted {
            address: self.address,
            characteristic,
            payload: payload.to_vec(),
            at: Instant::now(),
        });

        self.begin().await?;

        let mut state = self.transport.lock();
        let device = state.device(self.address)?;
        if !device.lighthouse.characteristics.contains_key(&characteristic) {
            return Err(TransportError::MissingCharacteristic { uuid: characteristic });
        }

        let stored = if characteristic == V2_PWR_CHARACTERISTIC {
            // the lighthouse reports the state it settles in, not the command code
            match payload.first() {
                Some(&V2_PWR_ON) => vec![V2_STATE_ON],
                Some(&V2_PWR_STANDBY) => vec![V2_STATE_STANDBY],
                Some(&V2_PWR_SLEEP) => vec![V2_STATE_SLEEP],
                _ => payload.to_vec(),
            }
        } else {
            payload.to_vec()
        };
        if characteristic != V2_IDENTIFY_CHARACTERISTIC {
            device.lighthouse.characteristics.insert(characteristic, stored);
        }

        state.events.push(FakeEvent::WriteFinished { address: self.address, characteristic, at: Instant::now() });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        release(&mut self.transport.lock(), self.address);
        Ok(())
    }
}
