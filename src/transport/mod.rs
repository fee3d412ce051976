use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::stream::BoxStream;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::TransportError;

pub mod btle;
pub mod fake;

pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// A single advertisement as reported by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: BDAddr,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Advertisements observed from now on. Every call returns a fresh stream.
    async fn advertisements(&self) -> Result<AdvertisementStream, TransportError>;

    /// Open a GATT connection and discover the device's services. Gives up with
    /// [`TransportError::Timeout`] after `deadline`, leaving the device disconnected.
    async fn connect(&self, address: BDAddr, deadline: Duration) -> Result<Box<dyn Link>, TransportError>;
}

/// An open GATT connection to one device.
#[async_trait]
pub trait Link: Send + Sync {
    fn address(&self) -> BDAddr;

    fn services(&self) -> Vec<Uuid>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// The process wide radio: the transport plus the permits that bound how many connect
/// attempts run on the adapter at once. Cloned into the scanner and every connection.
#[derive(Clone)]
pub struct Radio {
    transport: Arc<dyn Transport>,
    connect_permits: Arc<Semaphore>,
}

impl Radio {
    pub fn new(transport: Arc<dyn Transport>, max_concurrent_connects: usize) -> Self {
        Radio {
            transport,
            connect_permits: Arc::new(Semaphore::new(max_concurrent_connects.max(1))),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Waiting for a permit does not count against `deadline`.
    pub async fn connect(&self, address: BDAddr, deadline: Duration) -> Result<Box<dyn Link>, TransportError> {
        let _permit = self.connect_permits.acquire().await.map_err(|_| TransportError::Unavailable)?;
        self.transport.connect(address, deadline).await
    }
}
