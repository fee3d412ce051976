use std::sync::Arc;
use uuid::Uuid;

use crate::device::constants::{
    FIRMWARE_CHARACTERISTIC, HARDWARE_CHARACTERISTIC, MANUFACTURER_CHARACTERISTIC, MODEL_CHARACTERISTIC,
    V1_COMMAND_LEN, V1_COMMAND_ON, V1_COMMAND_SLEEP, V1_PWR_CHARACTERISTIC, V1_PWR_SERVICE,
    V2_CHANNEL_CHARACTERISTIC, V2_IDENTIFY, V2_IDENTIFY_CHARACTERISTIC, V2_PWR_CHARACTERISTIC, V2_PWR_ON,
    V2_PWR_SERVICE, V2_PWR_SLEEP, V2_PWR_STANDBY, V2_STATE_BOOTING, V2_STATE_BOOTING_ALT, V2_STATE_ON,
    V2_STATE_SLEEP, V2_STATE_STANDBY, V2_STATE_STARTING_UP,
};
use crate::device::types::{AttributeReport, Generation, PowerState};
use crate::error::DeviceError;

/// One characteristic of a read plan. Optional characteristics that the device does not
/// expose come back as an empty frame instead of failing the whole read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRead {
    pub characteristic: Uuid,
    pub optional: bool,
}

impl PlannedRead {
    pub fn required(characteristic: Uuid) -> Self {
        PlannedRead { characteristic, optional: false }
    }

    pub fn optional(characteristic: Uuid) -> Self {
        PlannedRead { characteristic, optional: true }
    }
}

/// What a connection has to do on the device for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    },
    /// Reads every planned characteristic in order and answers with one frame per read.
    Read(Vec<PlannedRead>),
    /// Answers with the 16 byte UUIDs of the services found on the device.
    Services,
}

/**
 * Size of the little endian length prefix in front of every frame of a read response.
 */
const FRAME_HEADER_LEN: usize = 2;

pub fn encode_frames(values: &[Vec<u8>]) -> Result<Vec<u8>, DeviceError> {
    let mut bundle = Vec::with_capacity(values.iter().map(|value| value.len() + FRAME_HEADER_LEN).sum());

    for value in values {
        let len = u16::try_from(value.len())
            .map_err(|_| DeviceError::malformed(format!("characteristic value of {} bytes", value.len())))?;
        bundle.extend_from_slice(&len.to_le_bytes());
        bundle.extend_from_slice(value);
    }

    Ok(bundle)
}

/// Walks the frames of a read response.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        FrameReader { bytes, offset: 0 }
    }

    pub fn next_frame(&mut self) -> Result<&'a [u8], DeviceError> {
        let rest = &self.bytes[self.offset..];
        if rest.len() < FRAME_HEADER_LEN {
            return Err(DeviceError::malformed(format!(
                "response truncated at byte {} of {}",
                self.offset,
                self.bytes.len()
            )));
        }

        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let end = FRAME_HEADER_LEN + len;
        if rest.len() < end {
            return Err(DeviceError::malformed(format!(
                "frame at byte {} declares {} bytes but only {} remain",
                self.offset,
                len,
                rest.len() - FRAME_HEADER_LEN
            )));
        }

        self.offset += end;
        Ok(&rest[FRAME_HEADER_LEN..end])
    }

    /// Fails if anything is left after the last expected frame.
    pub fn finish(self) -> Result<(), DeviceError> {
        if self.offset != self.bytes.len() {
            return Err(DeviceError::malformed(format!(
                "{} unexpected trailing bytes",
                self.bytes.len() - self.offset
            )));
        }
        Ok(())
    }
}

pub fn encode_services(services: &[Uuid]) -> Vec<u8> {
    services.iter().flat_map(|uuid| uuid.as_bytes().to_vec()).collect()
}

pub fn decode_services(raw: &[u8]) -> Result<Vec<Uuid>, DeviceError> {
    if raw.len() % 16 != 0 {
        return Err(DeviceError::malformed(format!("service list of {} bytes", raw.len())));
    }

    Ok(raw
        .chunks_exact(16)
        .map(|chunk| {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(chunk);
            Uuid::from_bytes(bytes)
        })
        .collect())
}

/// Which protocol the services found on a connected device belong to.
pub fn detect_generation(services: &[Uuid]) -> Generation {
    if services.contains(&V2_PWR_SERVICE) {
        Generation::V2
    } else if services.contains(&V1_PWR_SERVICE) {
        Generation::V1
    } else {
        Generation::Unknown
    }
}

/// The raw power code of a single-read power response.
pub fn power_code_from_bundle(raw: &[u8]) -> Result<u8, DeviceError> {
    let mut reader = FrameReader::new(raw);
    let code = power_code(reader.next_frame()?)?;
    reader.finish()?;
    Ok(code)
}

fn power_code(frame: &[u8]) -> Result<u8, DeviceError> {
    match frame {
        [code] => Ok(*code),
        other => Err(DeviceError::malformed(format!("power state of {} bytes, expected 1", other.len()))),
    }
}

fn text(frame: &[u8]) -> Option<String> {
    let value = String::from_utf8_lossy(frame);
    let value = value.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn device_information_plan() -> [PlannedRead; 4] {
    [
        PlannedRead::optional(FIRMWARE_CHARACTERISTIC),
        PlannedRead::optional(MODEL_CHARACTERISTIC),
        PlannedRead::optional(HARDWARE_CHARACTERISTIC),
        PlannedRead::optional(MANUFACTURER_CHARACTERISTIC),
    ]
}

fn read_device_information(reader: &mut FrameReader<'_>, report: &mut AttributeReport) -> Result<(), DeviceError> {
    report.firmware = text(reader.next_frame()?);
    report.model = text(reader.next_frame()?);
    report.hardware = text(reader.next_frame()?);
    report.manufacturer = text(reader.next_frame()?);
    Ok(())
}

/// Human readable name of a V2 power code.
pub fn describe_v2_power_code(code: u8) -> &'static str {
    match code {
        V2_STATE_SLEEP => "sleep",
        V2_STATE_STARTING_UP => "starting up",
        V2_STATE_STANDBY => "standby",
        V2_STATE_BOOTING | V2_STATE_BOOTING_ALT => "booting",
        V2_STATE_ON => "on",
        _ => "undocumented",
    }
}

/// Translation between semantic commands and the bytes of one lighthouse generation.
/// Implementations hold no connection state and can be shared between sessions.
pub trait ProtocolCodec: Send + Sync + std::fmt::Debug {
    fn generation(&self) -> Generation;

    fn encode_set_power(&self, target: PowerState) -> Result<Request, DeviceError>;

    fn encode_identify(&self) -> Result<Request, DeviceError>;

    /// The read a ReadAttributes command performs.
    fn attribute_plan(&self) -> Request;

    /// The read that fetches only the power state, if the generation can report it.
    fn power_plan(&self) -> Option<Request>;

    fn decode_attributes(&self, raw: &[u8]) -> Result<AttributeReport, DeviceError>;

    fn decode_power_state(&self, raw: &[u8]) -> PowerState;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct V2Codec;

impl ProtocolCodec for V2Codec {
    fn generation(&self) -> Generation {
        Generation::V2
    }

    fn encode_set_power(&self, target: PowerState) -> Result<Request, DeviceError> {
        let code = match target {
            PowerState::On => V2_PWR_ON,
            PowerState::Standby => V2_PWR_STANDBY,
            PowerState::Sleep => V2_PWR_SLEEP,
            PowerState::Unknown => {
                return Err(DeviceError::UnsupportedState { generation: Generation::V2, state: target });
            },
        };

        Ok(Request::Write {
            characteristic: V2_PWR_CHARACTERISTIC,
            payload: vec![code],
            with_response: true,
        })
    }

    fn encode_identify(&self) -> Result<Request, DeviceError> {
        // the lighthouse blinks right away and does not acknowledge the write
        Ok(Request::Write {
            characteristic: V2_IDENTIFY_CHARACTERISTIC,
            payload: vec![V2_IDENTIFY],
            with_response: false,
        })
    }

    fn attribute_plan(&self) -> Request {
        let mut plan = vec![
            PlannedRead::required(V2_PWR_CHARACTERISTIC),
            PlannedRead::optional(V2_CHANNEL_CHARACTERISTIC),
        ];
        plan.extend(device_information_plan());
        Request::Read(plan)
    }

    fn power_plan(&self) -> Option<Request> {
        Some(Request::Read(vec![PlannedRead::required(V2_PWR_CHARACTERISTIC)]))
    }

    fn decode_attributes(&self, raw: &[u8]) -> Result<AttributeReport, DeviceError> {
        let mut reader = FrameReader::new(raw);
        let mut report = AttributeReport::default();

        report.power_code = Some(power_code(reader.next_frame()?)?);

        let channel = reader.next_frame()?;
        if channel.len() > 4 {
            return Err(DeviceError::malformed(format!("channel of {} bytes", channel.len())));
        }
        if !channel.is_empty() {
            report.channel = Some(channel.iter().fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)));
        }

        read_device_information(&mut reader, &mut report)?;
        reader.finish()?;

        Ok(report)
    }

    fn decode_power_state(&self, raw: &[u8]) -> PowerState {
        match raw.first() {
            Some(&V2_STATE_ON) => PowerState::On,
            Some(&V2_STATE_STANDBY) => PowerState::Standby,
            Some(&V2_STATE_SLEEP) => PowerState::Sleep,
            // starting up, booting and anything undocumented
            _ => PowerState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct V1Codec {
    pub pair_id: Option<u32>,
}

impl V1Codec {
    fn command(&self, prefix: [u8; 4]) -> Result<Request, DeviceError> {
        let pair_id = self.pair_id.ok_or(DeviceError::MissingPairId)?;

        let mut payload = vec![0u8; V1_COMMAND_LEN];
        payload[0..4].copy_from_slice(&prefix);
        payload[4..8].copy_from_slice(&pair_id.to_le_bytes());

        Ok(Request::Write {
            characteristic: V1_PWR_CHARACTERISTIC,
            payload,
            with_response: true,
        })
    }
}

impl ProtocolCodec for V1Codec {
    fn generation(&self) -> Generation {
        Generation::V1
    }

    fn encode_set_power(&self, target: PowerState) -> Result<Request, DeviceError> {
        match target {
            PowerState::On => self.command(V1_COMMAND_ON),
            PowerState::Sleep => self.command(V1_COMMAND_SLEEP),
            PowerState::Standby | PowerState::Unknown => {
                Err(DeviceError::UnsupportedState { generation: Generation::V1, state: target })
            },
        }
    }

    fn encode_identify(&self) -> Result<Request, DeviceError> {
        Err(DeviceError::UnsupportedOperation { generation: Generation::V1, operation: "identify" })
    }

    fn attribute_plan(&self) -> Request {
        Request::Read(device_information_plan().to_vec())
    }

    fn power_plan(&self) -> Option<Request> {
        None
    }

    fn decode_attributes(&self, raw: &[u8]) -> Result<AttributeReport, DeviceError> {
        let mut reader = FrameReader::new(raw);
        let mut report = AttributeReport::default();

        read_device_information(&mut reader, &mut report)?;
        reader.finish()?;

        Ok(report)
    }

    fn decode_power_state(&self, _raw: &[u8]) -> PowerState {
        PowerState::Unknown
    }
}

/// Unknown devices are driven as V2 until detection says otherwise.
pub fn codec_for(generation: Generation, pair_id: Option<u32>) -> Arc<dyn ProtocolCodec> {
    match generation {
        Generation::V1 => Arc::new(V1Codec { pair_id }),
        Generation::V2 | Generation::Unknown => Arc::new(V2Codec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_bundle() -> Vec<u8> {
        encode_frames(&[
            vec![V2_STATE_ON],
            vec![0x07],
            b"1.0".to_vec(),
            b"LHB".to_vec(),
            vec![],
            vec![],
        ]).unwrap()
    }

    #[test]
    fn test_v2_decode_attributes() {
        let raw = v2_bundle();
        assert_eq!(raw.len(), 20);

        let report = V2Codec.decode_attributes(&raw).unwrap();
        assert_eq!(report.power_code, Some(V2_STATE_ON));
        assert_eq!(report.channel, Some(7));
        assert_eq!(report.firmware.as_deref(), Some("1.0"));
        assert_eq!(report.model.as_deref(), Some("LHB"));
        assert_eq!(report.hardware, None);
        assert_eq!(report.manufacturer, None);
    }

    #[test]
    fn test_v2_truncated_bundle_is_malformed() {
        let raw = v2_bundle();
        let result = V2Codec.decode_attributes(&raw[..12]);
        assert!(matches!(result, Err(DeviceError::MalformedResponse { .. })));
    }

    #[test]
    fn test_oversized_bundle_is_malformed() {
        let mut raw = v2_bundle();
        raw.extend_from_slice(&[0x00, 0x00, 0x41]);
        assert!(matches!(V2Codec.decode_attributes(&raw), Err(DeviceError::MalformedResponse { .. })));

        let mut raw = encode_frames(&[vec![], vec![], vec![], vec![]]).unwrap();
        raw.push(0xFF);
        assert!(matches!(V1Codec::default().decode_attributes(&raw), Err(DeviceError::MalformedResponse { .. })));
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let raw = v2_bundle();
        for len in 0..raw.len() {
            assert!(
                matches!(V2Codec.decode_attributes(&raw[..len]), Err(DeviceError::MalformedResponse { .. })),
                "accepted a bundle truncated to {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_v2_power_field_width() {
        let raw = encode_frames(&[vec![0x0B, 0x00], vec![], vec![], vec![], vec![], vec![]]).unwrap();
        assert!(matches!(V2Codec.decode_attributes(&raw), Err(DeviceError::MalformedResponse { .. })));

        let raw = encode_frames(&[vec![0x0B], vec![0, 0, 0, 0, 1], vec![], vec![], vec![], vec![]]).unwrap();
        assert!(matches!(V2Codec.decode_attributes(&raw), Err(DeviceError::MalformedResponse { .. })));
    }

    #[test]
    fn test_v2_undocumented_values_are_accepted() {
        let raw = encode_frames(&[vec![0x42], vec![0x01, 0x02], vec![0xFF, 0xFE], b" 2.1 \0".to_vec(), vec![], vec![]]).unwrap();
        let report = V2Codec.decode_attributes(&raw).unwrap();

        assert_eq!(report.power_code, Some(0x42));
        assert_eq!(report.channel, Some(0x0102));
        assert!(report.firmware.is_some());
        assert_eq!(report.model.as_deref(), Some("2.1"));
        assert_eq!(V2Codec.decode_power_state(&[0x42]), PowerState::Unknown);
    }

    #[test]
    fn test_v2_decode_power_state() {
        assert_eq!(V2Codec.decode_power_state(&[0x00]), PowerState::Sleep);
        assert_eq!(V2Codec.decode_power_state(&[0x02]), PowerState::Standby);
        assert_eq!(V2Codec.decode_power_state(&[0x0B]), PowerState::On);
        assert_eq!(V2Codec.decode_power_state(&[0x01]), PowerState::Unknown);
        assert_eq!(V2Codec.decode_power_state(&[0x09]), PowerState::Unknown);
        assert_eq!(V2Codec.decode_power_state(&[]), PowerState::Unknown);
        assert_eq!(describe_v2_power_code(0x08), "booting");
    }

    #[test]
    fn test_v2_encode() {
        assert_eq!(
            V2Codec.encode_set_power(PowerState::Standby).unwrap(),
            Request::Write { characteristic: V2_PWR_CHARACTERISTIC, payload: vec![0x02], with_response: true },
        );
        assert_eq!(
            V2Codec.encode_identify().unwrap(),
            Request::Write { characteristic: V2_IDENTIFY_CHARACTERISTIC, payload: vec![0x00], with_response: false },
        );
        assert!(matches!(
            V2Codec.encode_set_power(PowerState::Unknown),
            Err(DeviceError::UnsupportedState { .. })
        ));
    }

    #[test]
    fn test_v1_encode() {
        let codec = V1Codec { pair_id: Some(0x12345678) };

        let on = codec.encode_set_power(PowerState::On).unwrap();
        let Request::Write { characteristic, payload, .. } = on else { panic!("expected a write") };
        assert_eq!(characteristic, V1_PWR_CHARACTERISTIC);
        assert_eq!(payload.len(), 20);
        assert_eq!(&payload[..8], &[0x12, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12]);
        assert!(payload[8..].iter().all(|byte| *byte == 0));

        let Request::Write { payload, .. } = codec.encode_set_power(PowerState::Sleep).unwrap() else {
            panic!("expected a write")
        };
        assert_eq!(&payload[..4], &[0x12, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_v1_capabilities() {
        let codec = V1Codec { pair_id: Some(1) };
        assert!(matches!(
            codec.encode_set_power(PowerState::Standby),
            Err(DeviceError::UnsupportedState { generation: Generation::V1, state: PowerState::Standby })
        ));
        assert!(matches!(codec.encode_identify(), Err(DeviceError::UnsupportedOperation { .. })));
        assert!(codec.power_plan().is_none());

        let codec = V1Codec { pair_id: None };
        assert!(matches!(codec.encode_set_power(PowerState::On), Err(DeviceError::MissingPairId)));
        // capability errors win over configuration errors
        assert!(matches!(codec.encode_set_power(PowerState::Standby), Err(DeviceError::UnsupportedState { .. })));
    }

    #[test]
    fn test_services_and_generation_detection() {
        let raw = encode_services(&[V1_PWR_SERVICE, V2_PWR_SERVICE]);
        let services = decode_services(&raw).unwrap();
        assert_eq!(detect_generation(&services), Generation::V2);
        assert_eq!(detect_generation(&services[..1]), Generation::V1);
        assert_eq!(detect_generation(&[]), Generation::Unknown);
        assert!(decode_services(&raw[..20]).is_err());
    }

    #[test]
    fn test_power_code_from_bundle() {
        assert_eq!(power_code_from_bundle(&encode_frames(&[vec![0x02]]).unwrap()).unwrap(), 0x02);
        assert!(power_code_from_bundle(&encode_frames(&[vec![0; 12]]).unwrap()).is_err());
        assert!(power_code_from_bundle(&encode_frames(&[vec![0x02], vec![]]).unwrap()).is_err());
    }
}
