use std::collections::HashSet;
use std::time::SystemTime;
use btleplug::api::BDAddr;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use log::{debug, trace};
use uuid::Uuid;

use crate::device::constants::{V1_NAME_PREFIX, V1_PWR_SERVICE, V2_NAME_PREFIX, V2_PWR_SERVICE};
use crate::device::types::{DeviceDescriptor, Generation};
use crate::error::DeviceError;
use crate::transport::{Advertisement, Radio};

/// Which advertisements belong to lighthouses we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub prefixes: Vec<String>,
    pub known_addresses: HashSet<BDAddr>,
}

impl ScanFilter {
    /// A configured prefix replaces the built-in V1 and V2 prefixes.
    pub fn new(prefix: Option<String>, known_addresses: impl IntoIterator<Item = BDAddr>) -> Self {
        let prefixes = match prefix {
            Some(prefix) => vec![prefix],
            None => vec![V2_NAME_PREFIX.to_string(), V1_NAME_PREFIX.to_string()],
        };

        ScanFilter { prefixes, known_addresses: known_addresses.into_iter().collect() }
    }

    pub fn matches(&self, address: BDAddr, name: Option<&str>) -> bool {
        if self.known_addresses.contains(&address) {
            return true;
        }

        match name {
            Some(name) => self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())),
            None => false,
        }
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        ScanFilter::new(None, [])
    }
}

pub fn infer_generation(name: Option<&str>, services: &[Uuid]) -> Generation {
    match name {
        Some(name) if name.starts_with(V2_NAME_PREFIX) => return Generation::V2,
        Some(name) if name.starts_with(V1_NAME_PREFIX) => return Generation::V1,
        _ => {},
    }

    if services.contains(&V2_PWR_SERVICE) {
        Generation::V2
    } else if services.contains(&V1_PWR_SERVICE) {
        Generation::V1
    } else {
        Generation::Unknown
    }
}

fn describe(filter: &ScanFilter, advertisement: Advertisement) -> Option<DeviceDescriptor> {
    let name = advertisement.local_name.as_deref();

    if !filter.matches(advertisement.address, name) {
        trace!("Ignoring advertisement from {} ({:?})", advertisement.address, name);
        return None;
    }

    Some(DeviceDescriptor {
        address: advertisement.address,
        generation: infer_generation(name, &advertisement.services),
        name: advertisement.local_name,
        rssi: advertisement.rssi,
        last_seen: SystemTime::now(),
    })
}

/// Turns raw advertisements into lighthouse descriptors. Scanning never connects.
#[derive(Clone)]
pub struct Scanner {
    radio: Radio,
    filter: ScanFilter,
}

impl Scanner {
    pub fn new(radio: Radio, filter: ScanFilter) -> Self {
        Scanner { radio, filter }
    }

    /// Starts scanning. The stream ends only when the adapter goes away; calling `start`
    /// again after [`Scanner::stop`] begins a new scan.
    pub async fn start(&self) -> Result<BoxStream<'static, DeviceDescriptor>, DeviceError> {
        let transport = self.radio.transport();
        let advertisements = transport.advertisements().await?;
        transport.start_scan().await?;
        debug!("Scanning for lighthouses with prefixes {:?}", self.filter.prefixes);

        let filter = self.filter.clone();
        Ok(advertisements
            .filter_map(move |advertisement| future::ready(describe(&filter, advertisement)))
            .boxed())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.radio.transport().stop_scan().await?;
        debug!("Stopped scanning");
        Ok(())
    }
}
