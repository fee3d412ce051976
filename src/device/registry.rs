use std::sync::{Arc, Mutex};
use btleplug::api::BDAddr;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::types::{Config, DeviceConfig, PollConfig};
use crate::device::connection::ConnectionManager;
use crate::device::scanner::{ScanFilter, Scanner};
use crate::device::session::DeviceSession;
use crate::device::types::{DeviceAttributes, DeviceDescriptor, Generation, PowerState};
use crate::error::DeviceError;
use crate::transport::{Radio, Transport};

/**
 * Capacity of the event broadcast. Subscribers that fall further behind miss events.
 */
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Configured by hand but not seen by the scanner yet.
    PendingDiscovery,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    DeviceAdded { address: BDAddr, status: DeviceStatus },
    DeviceActivated { address: BDAddr },
    AttributesUpdated { address: BDAddr, attributes: DeviceAttributes },
    AvailabilityChanged { address: BDAddr, available: bool },
    ProtocolMismatch { address: BDAddr, expected: Generation, found: Generation },
    /// The adapter is gone. Raised once, no matter how many devices notice.
    TransportUnavailable,
    TransportRestored,
}

/// What the registry knows about one lighthouse.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub address: BDAddr,
    pub name: Option<String>,
    pub generation: Generation,
    pub status: DeviceStatus,
    pub rssi: Option<i16>,
    pub attributes: DeviceAttributes,
}

/// The outcome of one poll, sent from a device's poll task to the cache task.
struct DeviceUpdate {
    address: BDAddr,
    result: Result<DeviceAttributes, DeviceError>,
}

struct ActiveDevice {
    session: Arc<DeviceSession>,
    tasks: Vec<JoinHandle<()>>,
}

struct Entry {
    config: DeviceConfig,
    descriptor: Option<DeviceDescriptor>,
    attributes: DeviceAttributes,
    device: Option<ActiveDevice>,
    failures: u32,
    available: bool,
}

impl Entry {
    fn new(config: DeviceConfig) -> Self {
        Entry {
            attributes: DeviceAttributes::new(config.pair_id),
            config,
            descriptor: None,
            device: None,
            failures: 0,
            available: true,
        }
    }

    fn status(&self) -> DeviceStatus {
        match (&self.device, self.available) {
            (None, _) => DeviceStatus::PendingDiscovery,
            (Some(_), true) => DeviceStatus::Available,
            (Some(_), false) => DeviceStatus::Unavailable,
        }
    }

    fn generation(&self) -> Generation {
        if let Some(device) = &self.device {
            return device.session.generation();
        }

        self.config
            .generation
            .or(self.descriptor.as_ref().map(|descriptor| descriptor.generation))
            .unwrap_or(Generation::Unknown)
    }

    fn summary(&self) -> DeviceSummary {
        let descriptor = self.descriptor.as_ref();

        DeviceSummary {
            address: self.config.address,
            name: self.config.name.clone().or_else(|| descriptor.and_then(|descriptor| descriptor.name.clone())),
            generation: self.generation(),
            status: self.status(),
            rssi: descriptor.and_then(|descriptor| descriptor.rssi),
            attributes: self.attributes.clone(),
        }
    }
}

struct Inner {
    entries: IndexMap<BDAddr, Entry>,
    transport_fault: bool,
}

/// Owns a session and a poll task per lighthouse and keeps the last known attributes of
/// each. Cloning gives another handle to the same registry.
#[derive(Clone)]
pub struct Registry {
    radio: Radio,
    config: Arc<Config>,
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<RegistryEvent>,
    updates: Sender<DeviceUpdate>,
    cancel: CancellationToken,
}

impl Registry {
    /// Registers every configured device as pending discovery and starts the cache task.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: Config,
        cancel: CancellationToken,
    ) -> (Registry, JoinHandle<()>) {
        let radio = Radio::new(transport, config.connection.max_concurrent_connects);
        let (updates, receiver) = channel::<DeviceUpdate>(16);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let registry = Registry {
            radio,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner { entries: IndexMap::new(), transport_fault: false })),
            events,
            updates,
            cancel: cancel.child_token(),
        };

        for device in registry.config.devices.clone() {
            registry.add_manual(device);
        }

        let handle = spawn(run_cache(registry.clone(), receiver));
        (registry, handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("Failed to lock registry")
    }

    fn emit(&self, event: RegistryEvent) {
        debug!("Registry event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// The filter a scanner feeding this registry should use: the configured prefix plus
    /// every known address.
    pub fn scan_filter(&self) -> ScanFilter {
        let known: Vec<BDAddr> = self.lock().entries.keys().copied().collect();
        ScanFilter::new(self.config.discovery_prefix.clone(), known)
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.radio.clone(), self.scan_filter())
    }

    /// Adds a device that was configured by hand. It stays pending until the scanner sees
    /// it or a command is sent to it.
    pub fn add_manual(&self, device: DeviceConfig) {
        let address = device.address;
        let mut inner = self.lock();
        if inner.entries.contains_key(&address) {
            debug!("{} is already known", address);
            return;
        }

        inner.entries.insert(address, Entry::new(device));
        drop(inner);

        info!("Waiting for {} to show up", address);
        self.emit(RegistryEvent::DeviceAdded { address, status: DeviceStatus::PendingDiscovery });
    }

    /// Feeds one scan result into the registry.
    pub fn observe(&self, descriptor: DeviceDescriptor) {
        let address = descriptor.address;
        let mut inner = self.lock();

        let event = match inner.entries.get_mut(&address) {
            Some(entry) if entry.device.is_some() => {
                entry.descriptor = Some(descriptor);
                None
            },
            Some(entry) => {
                info!("Found configured lighthouse {}", address);
                entry.descriptor = Some(descriptor);
                self.activate(entry);
                Some(RegistryEvent::DeviceActivated { address })
            },
            None => {
                info!("Found {} lighthouse {} ({:?})", descriptor.generation, address, descriptor.name);
                let mut entry = Entry::new(DeviceConfig::new(address));
                entry.descriptor = Some(descriptor);
                self.activate(&mut entry);
                inner.entries.insert(address, entry);
                Some(RegistryEvent::DeviceAdded { address, status: DeviceStatus::Available })
            },
        };
        drop(inner);

        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Starts the connection and poll tasks of a device.
    fn activate(&self, entry: &mut Entry) {
        let address = entry.config.address;
        let generation = entry.generation();
        let cancel = self.cancel.child_token();

        let (connection, connection_task) =
            ConnectionManager::spawn(address, self.radio.clone(), self.config.connection.clone(), cancel.clone());
        let session = Arc::new(DeviceSession::new(
            address,
            generation,
            entry.config.pair_id,
            connection,
            self.config.connection.command_timeout,
        ));
        let poll_task = spawn(run_poll(
            session.clone(),
            self.updates.clone(),
            self.config.polling.clone(),
            cancel,
        ));

        entry.failures = 0;
        entry.available = true;
        entry.device = Some(ActiveDevice { session, tasks: vec![connection_task, poll_task] });
    }

    /// Scans until cancelled, restarting the scan every scan interval so that devices which
    /// were switched on later are found too.
    pub async fn discover(&self, scanner: Scanner) -> Result<(), DeviceError> {
        let cancel = self.cancel.clone();
        let scan_interval = self.config.polling.scan_interval;

        'mainloop: loop {
            let started = tokio::select! {
                _ = cancel.cancelled() => break 'mainloop,
                started = scanner.start() => started,
            };

            let mut descriptors = match started {
                Ok(descriptors) => descriptors,
                Err(err) => {
                    self.record_failure(None, &err);
                    if !err.is_transport_fault() {
                        return Err(err);
                    }
                    warn!("Can not scan right now: {}", err);

                    tokio::select! {
                        _ = cancel.cancelled() => break 'mainloop,
                        _ = sleep(scan_interval) => continue 'mainloop,
                    }
                },
            };

            let restart_at = Instant::now() + scan_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    _ = tokio::time::sleep_until(restart_at) => break,
                    descriptor = descriptors.next() => match descriptor {
                        Some(descriptor) => self.observe(descriptor),
                        None => {
                            debug!("Scan ended early");
                            tokio::select! {
                                _ = cancel.cancelled() => break 'mainloop,
                                _ = tokio::time::sleep_until(restart_at) => break,
                            }
                        },
                    },
                }
            }

            debug!("Restarting scan");
            if let Err(err) = scanner.stop().await {
                debug!("Error stopping scan: {}", err);
            }
        }

        if let Err(err) = scanner.stop().await {
            debug!("Error stopping scan: {}", err);
        }
        Ok(())
    }

    /// The session of a device, starting it if it was still pending.
    fn session(&self, address: BDAddr) -> Result<Arc<DeviceSession>, DeviceError> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&address).ok_or(DeviceError::UnknownDevice { address })?;

        if entry.device.is_none() {
            debug!("Starting {} before it was discovered", address);
            self.activate(entry);
        }

        match &entry.device {
            Some(device) => Ok(device.session.clone()),
            None => Err(DeviceError::UnknownDevice { address }),
        }
    }

    /// Unavailable devices are still tried.
    pub async fn set_power(&self, address: BDAddr, target: PowerState) -> Result<(), DeviceError> {
        let session = self.session(address)?;
        session.set_power(target).await?;
        self.record(address, &Ok(session.attributes()));
        Ok(())
    }

    pub async fn identify(&self, address: BDAddr) -> Result<(), DeviceError> {
        self.session(address)?.identify().await
    }

    pub async fn refresh_attributes(&self, address: BDAddr) -> Result<DeviceAttributes, DeviceError> {
        let result = self.session(address)?.refresh_attributes().await;
        self.record(address, &result);
        result
    }

    pub fn cached_attributes(&self, address: BDAddr) -> Result<DeviceAttributes, DeviceError> {
        self.lock()
            .entries
            .get(&address)
            .map(|entry| entry.attributes.clone())
            .ok_or(DeviceError::UnknownDevice { address })
    }

    pub fn status(&self, address: BDAddr) -> Option<DeviceStatus> {
        self.lock().entries.get(&address).map(Entry::status)
    }

    pub fn is_available(&self, address: BDAddr) -> bool {
        self.status(address) == Some(DeviceStatus::Available)
    }

    /// In the order the devices became known.
    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.lock().entries.values().map(Entry::summary).collect()
    }

    pub fn transport_fault(&self) -> bool {
        self.lock().transport_fault
    }

    /// Stops every task of the registry and waits for the connections to close.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .lock()
            .entries
            .values_mut()
            .filter_map(|entry| entry.device.as_mut())
            .flat_map(|device| device.tasks.drain(..))
            .collect();

        for task in tasks {
            if let Err(err) = task.await {
                error!("Device task failed: {}", err);
            }
        }
        info!("Registry stopped");
    }

    fn record(&self, address: BDAddr, result: &Result<DeviceAttributes, DeviceError>) {
        match result {
            Ok(attributes) => self.record_success(address, attributes),
            Err(err) => self.record_failure(Some(address), err),
        }
    }

    fn record_success(&self, address: BDAddr, attributes: &DeviceAttributes) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            if inner.transport_fault {
                inner.transport_fault = false;
                events.push(RegistryEvent::TransportRestored);
            }

            if let Some(entry) = inner.entries.get_mut(&address) {
                // the session orders results by when the device produced them, a snapshot that
                // waited in the update channel may be older than what it holds now
                let attributes = match &entry.device {
                    Some(device) => device.session.attributes(),
                    None => attributes.clone(),
                };

                entry.failures = 0;
                if !entry.available {
                    info!("{} is reachable again", address);
                    entry.available = true;
                    events.push(RegistryEvent::AvailabilityChanged { address, available: true });
                }
                if entry.attributes != attributes {
                    entry.attributes = attributes.clone();
                    events.push(RegistryEvent::AttributesUpdated { address, attributes });
                }
            }
        }

        for event in events {
            self.emit(event);
        }
    }

    fn record_failure(&self, address: Option<BDAddr>, err: &DeviceError) {
        let threshold = self.config.polling.unavailable_threshold;
        let mut events = Vec::new();
        {
            let mut inner = self.lock();

            if err.is_transport_fault() {
                if !inner.transport_fault {
                    error!("Bluetooth adapter unavailable: {}", err);
                    inner.transport_fault = true;
                    events.push(RegistryEvent::TransportUnavailable);
                }
            } else if let Some(entry) = address.and_then(|address| inner.entries.get_mut(&address)) {
                let address = entry.config.address;
                match err {
                    DeviceError::Cancelled => {},
                    DeviceError::ProtocolMismatch { expected, found } => {
                        events.push(RegistryEvent::ProtocolMismatch { address, expected: *expected, found: *found });
                    },
                    _ => {
                        entry.attributes.stale = true;
                        entry.failures = entry.failures.saturating_add(1);
                        debug!("{} failed {} time(s) in a row: {}", address, entry.failures, err);

                        if entry.available && entry.failures >= threshold {
                            warn!("{} is unavailable: {}", address, err);
                            entry.available = false;
                            events.push(RegistryEvent::AvailabilityChanged { address, available: false });
                        }
                    },
                }
            }
        }

        for event in events {
            self.emit(event);
        }
    }
}

async fn run_cache(registry: Registry, mut updates: Receiver<DeviceUpdate>) {
    let cancel = registry.cancel.clone();

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            update = updates.next() => {
                let Some(update) = update else {
                    break 'mainloop;
                };
                registry.record(update.address, &update.result);
            },
        }
    }

    debug!("Registry cache task stopped");
}

/// Whether a failed poll counts towards the cooldown of the device. Adapter trouble is not
/// the device's fault and a mismatch is resolved by the next poll.
fn counts_as_poll_failure(err: &DeviceError) -> bool {
    !err.is_transport_fault() && !matches!(err, DeviceError::Cancelled | DeviceError::ProtocolMismatch { .. })
}

/// Polls the power state of one device and refreshes everything on the first poll and
/// then every info interval. A device that keeps failing is polled less often.
async fn run_poll(
    session: Arc<DeviceSession>,
    mut updates: Sender<DeviceUpdate>,
    settings: PollConfig,
    cancel: CancellationToken,
) {
    let address = session.address();
    let mut next_full_refresh = Instant::now();
    let mut failures: u32 = 0;

    'mainloop: loop {
        let full_refresh = Instant::now() >= next_full_refresh;

        let result = tokio::select! {
            _ = cancel.cancelled() => break 'mainloop,
            result = async {
                if full_refresh {
                    session.refresh_attributes().await
                } else {
                    session.refresh_power_state().await
                }
            } => result,
        };

        match &result {
            Ok(_) => {
                failures = 0;
                if full_refresh {
                    next_full_refresh = Instant::now() + settings.info_interval;
                }
            },
            Err(err) if counts_as_poll_failure(err) => failures = failures.saturating_add(1),
            Err(_) => {},
        }

        if updates.send(DeviceUpdate { address, result }).await.is_err() {
            break 'mainloop;
        }

        let delay = settings.poll_delay(failures);
        if failures > 0 {
            debug!("Polling {} again in {:?} after {} failure(s)", address, delay, failures);
        }
        tokio::select! {
            _ = cancel.cancelled() => break 'mainloop,
            _ = sleep(delay) => {},
        }
    }

    debug!("Stopped polling {}", address);
}
