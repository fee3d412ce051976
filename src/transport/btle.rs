use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{Advertisement, AdvertisementStream, Link, Transport};

/// Maps btleplug failures onto the transport error kinds the connection logic cares about.
fn map_btle_error(err: btleplug::Error) -> TransportError {
    match err {
        btleplug::Error::PermissionDenied => TransportError::Unavailable,
        btleplug::Error::NotConnected => TransportError::Disconnected,
        btleplug::Error::TimedOut(_) => TransportError::Timeout,
        other => TransportError::Btle { source: other },
    }
}

pub struct BtleTransport {
    adapter: Adapter,
}

impl BtleTransport {
    /// Uses the first adapter of the system.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(map_btle_error)?;
        let adapters = manager.adapters().await.map_err(map_btle_error)?;

        let adapter = adapters.into_iter().next().ok_or(TransportError::Unavailable)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(BtleTransport { adapter })
    }

    async fn find_peripheral(&self, address: BDAddr) -> Result<Peripheral, TransportError> {
        let peripherals = self.adapter.peripherals().await.map_err(map_btle_error)?;

        peripherals
            .into_iter()
            .find(|peripheral| peripheral.address() == address)
            .ok_or(TransportError::DeviceNotFound { address })
    }
}

async fn advertisement_from(adapter: &Adapter, event: CentralEvent) -> Option<Advertisement> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => id,
        _ => return None,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Advertisement from unknown peripheral {:?}: {}", id, err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => None,
        Ok(Some(properties)) => Some(Advertisement {
            address: properties.address,
            local_name: properties.local_name,
            services: properties.services,
            manufacturer_data: properties.manufacturer_data,
            rssi: properties.rssi,
        }),
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn start_scan(&self) -> Result<(), TransportError> {
        info!("Scanning using adapter {}...", self.adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        self.adapter.start_scan(ScanFilter::default()).await.map_err(map_btle_error)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await.map_err(map_btle_error)
    }

    async fn advertisements(&self) -> Result<AdvertisementStream, TransportError> {
        let events = self.adapter.events().await.map_err(map_btle_error)?;
        let adapter = self.adapter.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move { advertisement_from(&adapter, event).await }
        });

        Ok(stream.boxed())
    }

    async fn connect(&self, address: BDAddr, deadline: Duration) -> Result<Box<dyn Link>, TransportError> {
        let peripheral = self.find_peripheral(address).await?;

        match timeout(deadline, open_link(&peripheral, address, deadline)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Connecting to {} took longer than {:?}", address, deadline);
                // the connect may have gone through while services were still being discovered
                release(&peripheral, address, deadline).await;
                Err(TransportError::Timeout)
            },
        }
    }
}

async fn open_link(peripheral: &Peripheral, address: BDAddr, deadline: Duration) -> Result<Box<dyn Link>, TransportError> {
    debug!("Connecting to peripheral {}...", address);
    peripheral.connect().await.map_err(map_btle_error)?;

    debug!("Connected to {}; Discovering services...", address);
    if let Err(err) = peripheral.discover_services().await {
        // do not leave a half open connection behind, the device only accepts one client
        release(peripheral, address, deadline).await;
        return Err(map_btle_error(err));
    }

    let services = peripheral.services().iter().map(|service| service.uuid).collect();
    let characteristics = peripheral
        .characteristics()
        .into_iter()
        .map(|characteristic| (characteristic.uuid, characteristic))
        .collect();

    Ok(Box::new(BtleLink { address, peripheral: peripheral.clone(), services, characteristics }))
}

async fn release(peripheral: &Peripheral, address: BDAddr, deadline: Duration) {
    match timeout(deadline, peripheral.is_connected()).await {
        Ok(Ok(false)) => return,
        Ok(_) => {},
        Err(_) => debug!("Could not query the connection state of {}", address),
    }

    match timeout(deadline, peripheral.disconnect()).await {
        Ok(Ok(())) => debug!("Released half open connection to {}", address),
        Ok(Err(err)) => debug!("Failed to disconnect {}: {}", address, err),
        Err(_) => warn!("Disconnecting from {} took too long", address),
    }
}

struct BtleLink {
    address: BDAddr,
    peripheral: Peripheral,
    services: Vec<Uuid>,
    characteristics: HashMap<Uuid, Characteristic>,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics.get(&uuid).ok_or(TransportError::MissingCharacteristic { uuid })
    }
}

#[async_trait]
impl Link for BtleLink {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn services(&self) -> Vec<Uuid> {
        self.services.clone()
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.read(characteristic).await.map_err(map_btle_error)
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if with_response { WriteType::WithResponse } else { WriteType::WithoutResponse };

        self.peripheral.write(characteristic, payload, write_type).await.map_err(map_btle_error)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await.map_err(map_btle_error)
    }
}
