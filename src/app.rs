use std::sync::Arc;
use std::time::Duration;
use btleplug::api::BDAddr;
use futures::StreamExt;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::codec::describe_v2_power_code;
use crate::device::connection::ConnectionManager;
use crate::device::registry::{Registry, RegistryEvent};
use crate::device::scanner::{ScanFilter, Scanner};
use crate::device::session::DeviceSession;
use crate::device::types::{DeviceAttributes, DeviceDescriptor, Generation, PowerState};
use crate::error::{AppRunError, DeviceError};
use crate::transport::btle::BtleTransport;
use crate::transport::fake::FakeTransport;
use crate::transport::{Radio, Transport};

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancellationToken) {
    spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {},
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupted, shutting down"),
                    Err(err) => error!("Failed to listen for Ctrl-C: {}", err),
                }
                cancel.cancel();
            },
        }
    });
}

async fn open_transport(simulate: bool) -> Result<Arc<dyn Transport>, AppRunError> {
    if simulate {
        info!("Using simulated lighthouses");
        return Ok(Arc::new(FakeTransport::demo()));
    }

    let transport = BtleTransport::new().await.map_err(DeviceError::from)?;
    Ok(Arc::new(transport))
}

/// Listens for `duration` and returns every matching device, most recent observation last.
async fn collect(
    scanner: &Scanner,
    duration: Duration,
    cancel: &CancellationToken,
    mut on_found: impl FnMut(&DeviceDescriptor),
) -> Result<IndexMap<BDAddr, DeviceDescriptor>, DeviceError> {
    let mut found: IndexMap<BDAddr, DeviceDescriptor> = IndexMap::new();
    let mut descriptors = scanner.start().await?;
    let deadline = Instant::now() + duration;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'mainloop,
            _ = sleep_until(deadline) => break 'mainloop,
            descriptor = descriptors.next() => {
                let Some(descriptor) = descriptor else {
                    break 'mainloop;
                };
                if !found.contains_key(&descriptor.address) {
                    on_found(&descriptor);
                }
                found.insert(descriptor.address, descriptor);
            },
        }
    }

    scanner.stop().await?;
    Ok(found)
}

fn print_descriptor(descriptor: &DeviceDescriptor) {
    let rssi = descriptor.rssi.map(|rssi| format!("{} dBm", rssi)).unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<7}  {:>8}  {}",
        descriptor.address,
        descriptor.generation.to_string(),
        rssi,
        descriptor.name.as_deref().unwrap_or("")
    );
}

fn print_attributes(address: BDAddr, generation: Generation, attributes: &DeviceAttributes) {
    let unknown = || "unknown".to_string();

    println!("Address:      {}", address);
    println!("Generation:   {}", generation);
    match (generation, attributes.power_code) {
        (Generation::V2, Some(code)) if !attributes.power_state.is_known() => {
            println!("Power:        {} (0x{:02X}, {})", attributes.power_state, code, describe_v2_power_code(code));
        },
        _ => println!("Power:        {}", attributes.power_state),
    }
    println!("Channel:      {}", attributes.channel.map(|channel| channel.to_string()).unwrap_or_else(unknown));
    println!("Firmware:     {}", attributes.firmware.clone().unwrap_or_else(unknown));
    println!("Model:        {}", attributes.model.clone().unwrap_or_else(unknown));
    println!("Hardware:     {}", attributes.hardware.clone().unwrap_or_else(unknown));
    println!("Manufacturer: {}", attributes.manufacturer.clone().unwrap_or_else(unknown));
    if let Some(pair_id) = attributes.pair_id_label() {
        println!("Pair id:      {}", pair_id);
    }
}

/// A session opened for one command, with the connection task that holds the device.
struct OpenSession {
    session: DeviceSession,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl OpenSession {
    /// Stops the connection task and waits until it has let go of the device.
    async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            error!("Connection task for {} failed: {}", self.session.address(), err);
        }
    }
}

/// Scans until `address` shows up so the adapter knows the device, then opens a session.
async fn open_session(
    radio: &Radio,
    config: &Config,
    address: BDAddr,
    cancel: &CancellationToken,
) -> Result<OpenSession, DeviceError> {
    let device = config.device(address);
    let mut generation = device.and_then(|device| device.generation).unwrap_or(Generation::Unknown);

    let scanner = Scanner::new(radio.clone(), ScanFilter::new(config.discovery_prefix.clone(), [address]));
    let mut descriptors = scanner.start().await?;
    let deadline = Instant::now() + config.connection.connection_timeout;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                scanner.stop().await?;
                return Err(DeviceError::Cancelled);
            },
            _ = sleep_until(deadline) => {
                warn!("{} did not advertise, trying to connect anyway", address);
                break 'mainloop;
            },
            descriptor = descriptors.next() => match descriptor {
                Some(descriptor) if descriptor.address == address => {
                    debug!("Found {} ({:?})", address, descriptor.name);
                    if generation == Generation::Unknown {
                        generation = descriptor.generation;
                    }
                    break 'mainloop;
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }
    scanner.stop().await?;

    let cancel = cancel.child_token();
    let (connection, task) = ConnectionManager::spawn(address, radio.clone(), config.connection.clone(), cancel.clone());
    let session = DeviceSession::new(
        address,
        generation,
        device.and_then(|device| device.pair_id),
        connection,
        config.connection.command_timeout,
    );
    Ok(OpenSession { session, cancel, task })
}

async fn set_power(
    radio: &Radio,
    config: &Config,
    address: BDAddr,
    target: PowerState,
    cancel: &CancellationToken,
) -> Result<(), DeviceError> {
    let open = open_session(radio, config, address, cancel).await?;

    let result = match open.session.set_power(target).await {
        // the codec has switched to what the device speaks, try again once
        Err(DeviceError::ProtocolMismatch { expected, found }) => {
            warn!("{} is configured as {} but is a {} lighthouse", address, expected, found);
            open.session.set_power(target).await
        },
        result => result,
    };
    open.close().await;
    result?;

    println!("{} is now {}", address, target);
    Ok(())
}

async fn identify(radio: &Radio, config: &Config, address: BDAddr, cancel: &CancellationToken) -> Result<(), DeviceError> {
    let open = open_session(radio, config, address, cancel).await?;

    let result = match open.session.identify().await {
        Err(DeviceError::ProtocolMismatch { .. }) => open.session.identify().await,
        result => result,
    };
    open.close().await;
    result?;

    println!("{} is blinking", address);
    Ok(())
}

async fn info(radio: &Radio, config: &Config, address: BDAddr, cancel: &CancellationToken) -> Result<(), DeviceError> {
    let open = open_session(radio, config, address, cancel).await?;

    let result = match open.session.refresh_attributes().await {
        Err(DeviceError::ProtocolMismatch { .. }) => open.session.refresh_attributes().await,
        result => result,
    };
    let generation = open.session.generation();
    open.close().await;

    print_attributes(address, generation, &result?);
    Ok(())
}

/// Runs the registry until cancelled, logging what happens to the lighthouses.
async fn run_registry(transport: Arc<dyn Transport>, config: Config, cancel: &CancellationToken) -> Result<(), DeviceError> {
    let (registry, cache_task) = Registry::start(transport, config, cancel.clone());
    let mut events = registry.subscribe();

    let discovery = {
        let registry = registry.clone();
        let scanner = registry.scanner();
        spawn(async move { registry.discover(scanner).await })
    };

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'mainloop,
            event = events.recv() => match event {
                Ok(RegistryEvent::AttributesUpdated { address, attributes }) => {
                    debug!("{}: {} (stale: {})", address, attributes.power_state, attributes.stale);
                },
                Ok(RegistryEvent::AvailabilityChanged { address, available }) => {
                    info!("{} is {}", address, if available { "available" } else { "unavailable" });
                },
                Ok(RegistryEvent::TransportUnavailable) => error!("The bluetooth adapter is unavailable"),
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(count)) => warn!("Missed {} registry events", count),
                Err(RecvError::Closed) => break 'mainloop,
            },
        }
    }

    registry.shutdown().await;
    match discovery.await {
        Ok(result) => result?,
        Err(err) => error!("Discovery task failed: {}", err),
    }
    if let Err(err) = cache_task.await {
        error!("Registry cache task failed: {}", err);
    }

    for device in registry.devices() {
        info!("{} ({}) ended {:?}", device.address, device.generation, device.status);
    }
    Ok(())
}

pub async fn run_command(cli: Cli) -> Result<(), AppRunError> {
    let mut config_io = ConfigIO::open(cli.config.clone())?;
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;
    let mut config = config_io.read().await?;

    let transport = open_transport(cli.simulate).await?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let result = execute(cli.command, transport, &mut config, &config_io, &cancel).await;
    cancel.cancel();
    result
}

/// Runs one subcommand. Returns once every connection it opened is closed again.
async fn execute(
    command: Command,
    transport: Arc<dyn Transport>,
    config: &mut Config,
    config_io: &ConfigIO,
    cancel: &CancellationToken,
) -> Result<(), AppRunError> {
    let radio = Radio::new(transport.clone(), config.connection.max_concurrent_connects);

    match command {
        Command::Scan { prefix, duration } => {
            let prefix = prefix.or_else(|| config.discovery_prefix.clone());
            let known = config.devices.iter().map(|device| device.address);
            let scanner = Scanner::new(radio, ScanFilter::new(prefix, known));

            let found = collect(&scanner, duration, cancel, print_descriptor).await?;
            info!("Found {} lighthouse(s)", found.len());
        },
        Command::On { address } => set_power(&radio, config, address, PowerState::On, cancel).await?,
        Command::Off { address } => set_power(&radio, config, address, PowerState::Sleep, cancel).await?,
        Command::Standby { address } => set_power(&radio, config, address, PowerState::Standby, cancel).await?,
        Command::Identify { address } => identify(&radio, config, address, cancel).await?,
        Command::Info { address } => info(&radio, config, address, cancel).await?,
        Command::Run => run_registry(transport, config.clone(), cancel).await?,
        Command::Discover { duration, save } => {
            let scanner = Scanner::new(radio, ScanFilter::new(config.discovery_prefix.clone(), []));
            let found = collect(&scanner, duration, cancel, print_descriptor).await?;

            let added = found.values().filter(|descriptor| config.add_discovered(descriptor)).count();
            if save && added > 0 {
                config_io.save(config).await?;
                println!("Added {} lighthouse(s) to {}", added, config_io.path().to_string_lossy());
            } else if added > 0 {
                println!("Found {} new lighthouse(s), use --save to remember them", added);
            }
        },
    }

    Ok(())
}
