use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use btleplug::api::BDAddr;
use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::device::codec::{codec_for, decode_services, describe_v2_power_code, power_code_from_bundle, detect_generation, ProtocolCodec, Request};
use crate::device::connection::ConnectionManager;
use crate::device::types::{AttributeReport, ConnectionState, DeviceAttributes, Generation, PowerState};
use crate::error::DeviceError;

struct Protocol {
    generation: Generation,
    codec: Arc<dyn ProtocolCodec>,
}

struct Snapshot {
    attributes: DeviceAttributes,
    /// Sequence of the command the power state was last taken from.
    power_sequence: u64,
    /// The last full refresh failed, firmware and friends may be outdated.
    info_stale: bool,
}

/// Semantic operations on one lighthouse plus the last known attributes.
pub struct DeviceSession {
    address: BDAddr,
    pair_id: Option<u32>,
    connection: ConnectionManager,
    command_timeout: Duration,
    protocol: Mutex<Protocol>,
    detected: OnceCell<()>,
    pending_mismatch: Mutex<Option<(Generation, Generation)>>,
    snapshot: Mutex<Snapshot>,
}

impl DeviceSession {
    pub fn new(
        address: BDAddr,
        generation: Generation,
        pair_id: Option<u32>,
        connection: ConnectionManager,
        command_timeout: Duration,
    ) -> Self {
        DeviceSession {
            address,
            pair_id,
            connection,
            command_timeout,
            protocol: Mutex::new(Protocol { generation, codec: codec_for(generation, pair_id) }),
            detected: OnceCell::new(),
            pending_mismatch: Mutex::new(None),
            snapshot: Mutex::new(Snapshot {
                attributes: DeviceAttributes::new(pair_id),
                power_sequence: 0,
                info_stale: false,
            }),
        }
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    pub fn generation(&self) -> Generation {
        self.protocol.lock().expect("Failed to lock session protocol").generation
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn attributes(&self) -> DeviceAttributes {
        self.snapshot().attributes.clone()
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        self.snapshot.lock().expect("Failed to lock session attributes")
    }

    fn codec(&self) -> Arc<dyn ProtocolCodec> {
        self.protocol.lock().expect("Failed to lock session protocol").codec.clone()
    }

    /// Asks the device which services it has, once per session, and switches to the
    /// matching codec. A mismatch with the configured generation is returned once.
    async fn resolve(&self) -> Result<Arc<dyn ProtocolCodec>, DeviceError> {
        self.detected.get_or_try_init(|| self.detect()).await?;

        if let Some((expected, found)) = self.pending_mismatch.lock().expect("Failed to lock session mismatch").take() {
            return Err(DeviceError::ProtocolMismatch { expected, found });
        }

        Ok(self.codec())
    }

    async fn detect(&self) -> Result<(), DeviceError> {
        let raw = self.connection.dispatch(Request::Services, self.command_timeout).await?;
        let found = detect_generation(&decode_services(&raw)?);

        let mut protocol = self.protocol.lock().expect("Failed to lock session protocol");
        let configured = protocol.generation;

        let resolved = match (configured, found) {
            (_, Generation::Unknown) => {
                warn!("{} does not expose a known lighthouse service", self.address);
                match configured {
                    Generation::Unknown => Generation::V2,
                    configured => configured,
                }
            },
            (Generation::Unknown, found) => {
                debug!("{} is a {} lighthouse", self.address, found);
                found
            },
            (configured, found) if configured != found => {
                warn!("{} was configured as {} but speaks the {} protocol", self.address, configured, found);
                *self.pending_mismatch.lock().expect("Failed to lock session mismatch") = Some((configured, found));
                found
            },
            (_, found) => found,
        };

        protocol.codec = codec_for(resolved, self.pair_id);
        protocol.generation = resolved;
        Ok(())
    }

    /// Encodes a command for the device. A command the configured generation can not
    /// express is only rejected once the device has confirmed that generation.
    async fn encode(
        &self,
        encode: impl Fn(&dyn ProtocolCodec) -> Result<Request, DeviceError>,
    ) -> Result<Request, DeviceError> {
        let rejected = encode(self.codec().as_ref()).err();

        match (self.resolve().await, rejected) {
            (Ok(codec), _) => encode(codec.as_ref()),
            (Err(err @ DeviceError::ProtocolMismatch { .. }), _) => Err(err),
            (Err(err), None) => Err(err),
            (Err(err), Some(rejected)) => {
                debug!("Could not confirm the generation of {}: {}", self.address, err);
                Err(rejected)
            },
        }
    }

    pub async fn set_power(&self, target: PowerState) -> Result<(), DeviceError> {
        let request = self.encode(|codec| codec.encode_set_power(target)).await?;
        let (sequence, _) = self.connection.dispatch_ordered(request, self.command_timeout).await?;
        info!("{} set to {}", self.address, target);

        self.record_power(sequence, target, None);
        Ok(())
    }

    pub async fn identify(&self) -> Result<(), DeviceError> {
        let request = self.encode(|codec| codec.encode_identify()).await?;
        self.connection.dispatch(request, self.command_timeout).await?;
        Ok(())
    }

    /// Reads every attribute the generation exposes. On failure the previous attributes
    /// are kept and marked stale.
    pub async fn refresh_attributes(&self) -> Result<DeviceAttributes, DeviceError> {
        match self.read_attributes().await {
            Ok((codec, sequence, report)) => Ok(self.apply_report(codec.as_ref(), sequence, report)),
            Err(err) => {
                let mut snapshot = self.snapshot();
                snapshot.info_stale = true;
                snapshot.attributes.stale = true;
                Err(err)
            },
        }
    }

    async fn read_attributes(&self) -> Result<(Arc<dyn ProtocolCodec>, u64, AttributeReport), DeviceError> {
        let codec = self.resolve().await?;
        let (sequence, raw) = self.connection.dispatch_ordered(codec.attribute_plan(), self.command_timeout).await?;
        let report = codec.decode_attributes(&raw)?;
        Ok((codec, sequence, report))
    }

    /// Reads only the power state. Generations that cannot report it return the current
    /// attributes without touching the device. Stays stale while the last full refresh failed.
    pub async fn refresh_power_state(&self) -> Result<DeviceAttributes, DeviceError> {
        match self.read_power_state().await {
            Ok(Some((sequence, state, code))) => Ok(self.record_power(sequence, state, Some(code))),
            Ok(None) => Ok(self.attributes()),
            Err(err) => {
                self.snapshot().attributes.stale = true;
                Err(err)
            },
        }
    }

    async fn read_power_state(&self) -> Result<Option<(u64, PowerState, u8)>, DeviceError> {
        if self.codec().power_plan().is_none() {
            return Ok(None);
        }

        let codec = self.resolve().await?;
        let Some(plan) = codec.power_plan() else {
            return Ok(None);
        };

        let (sequence, raw) = self.connection.dispatch_ordered(plan, self.command_timeout).await?;
        let code = power_code_from_bundle(&raw)?;
        Ok(Some((sequence, decode_code(codec.as_ref(), code), code)))
    }

    /// Takes over a power state unless a later command already set or read one.
    fn record_power(&self, sequence: u64, state: PowerState, code: Option<u8>) -> DeviceAttributes {
        let mut snapshot = self.snapshot();

        if sequence > snapshot.power_sequence {
            snapshot.power_sequence = sequence;
            snapshot.attributes.power_state = state;
            snapshot.attributes.power_code = code;
        } else {
            debug!("Ignoring outdated power state {} of {}", state, self.address);
        }
        if code.is_some() {
            let info_stale = snapshot.info_stale;
            snapshot.attributes.last_refresh = Some(SystemTime::now());
            snapshot.attributes.stale = info_stale;
        }

        snapshot.attributes.clone()
    }

    fn apply_report(&self, codec: &dyn ProtocolCodec, sequence: u64, report: AttributeReport) -> DeviceAttributes {
        if let Some(code) = report.power_code {
            self.record_power(sequence, decode_code(codec, code), Some(code));
        }
        // V1 reports no power state, the commanded state stays

        let mut snapshot = self.snapshot();
        let attributes = &mut snapshot.attributes;
        attributes.firmware = report.firmware;
        attributes.model = report.model;
        attributes.hardware = report.hardware;
        attributes.manufacturer = report.manufacturer;
        attributes.channel = report.channel;
        attributes.last_refresh = Some(SystemTime::now());
        attributes.stale = false;
        snapshot.info_stale = false;

        snapshot.attributes.clone()
    }
}

fn decode_code(codec: &dyn ProtocolCodec, code: u8) -> PowerState {
    let state = codec.decode_power_state(&[code]);
    if !state.is_known() && codec.generation() == Generation::V2 {
        debug!("Power code 0x{:02X} ({})", code, describe_v2_power_code(code));
    }
    state
}
