//! Framing and record decoding for the WS-3000 console protocol.
//!
//! Every request is a frame `0x7b <opcode> [payload...] 0x40 0x7d`. The console
//! answers with a fixed size USB packet (64 bytes) that starts with `0x7b` and
//! ends at the first `0x40 0x7d` pair. The console reuses its transmit buffer,
//! so anything after the terminator is left over from an earlier, longer
//! message and must be ignored.
//!
//! Two firmware generations disagree on where the payload of a response
//! starts and ends, see [`FrameLayout`].

use crate::{error::FrameError, Error};
use std::{fmt, ops::Deref, str::FromStr};

/// First byte of every frame.
pub const FRAME_START: u8 = 0x7b;
/// Two byte end-of-message marker.
pub const FRAME_END: [u8; 2] = [0x40, 0x7d];
/// Default size of one USB bulk packet.
pub const DEFAULT_PACKET_SIZE: usize = 64;

pub const NUMBER_OF_CHANNELS: u8 = 8;
/// A channel triplet with this content has no sensor attached.
pub const CHANNEL_SENTINEL: [u8; 3] = [0x7f, 0xff, 0xff];
/// Humidity byte reported when the sensor has no data.
pub const HUMIDITY_NO_DATA: u8 = 0xff;
pub const HUMIDITY_MAX: u8 = 100;

const TRIPLET_LEN: usize = 3;
const TRIPLETS_LEN: usize = TRIPLET_LEN * NUMBER_OF_CHANNELS as usize;
const UNITS_OFFSET: usize = 7;
const FAHRENHEIT_FLAG: u8 = 1;

/// A device operation, identified on the wire by a one byte opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    SensorValues,
    CalibrationValues,
    IntervalValue,
    Unknown,
    TempAlarmConfig,
    HumidityAlarmConfig,
    DeviceConfiguration,
    SyncTime,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::SensorValues,
        Command::CalibrationValues,
        Command::IntervalValue,
        Command::Unknown,
        Command::TempAlarmConfig,
        Command::HumidityAlarmConfig,
        Command::DeviceConfiguration,
        Command::SyncTime,
    ];

    pub const fn opcode(self) -> u8 {
        match self {
            Command::SensorValues => 0x03,
            Command::CalibrationValues => 0x05,
            Command::IntervalValue => 0x41,
            Command::Unknown => 0x06,
            Command::TempAlarmConfig => 0x08,
            Command::HumidityAlarmConfig => 0x09,
            Command::DeviceConfiguration => 0x04,
            Command::SyncTime => 0x30,
        }
    }

    /// Looks up the command for an opcode, rejecting opcodes outside the table.
    pub fn from_opcode(opcode: u8) -> Result<Self, Error> {
        match opcode {
            0x03 => Ok(Command::SensorValues),
            0x05 => Ok(Command::CalibrationValues),
            0x41 => Ok(Command::IntervalValue),
            0x06 => Ok(Command::Unknown),
            0x08 => Ok(Command::TempAlarmConfig),
            0x09 => Ok(Command::HumidityAlarmConfig),
            0x04 => Ok(Command::DeviceConfiguration),
            0x30 => Ok(Command::SyncTime),
            other => Err(Error::UnknownOpcode(other)),
        }
    }

    /// The stable name used as the `type` of decoded records.
    pub const fn name(self) -> &'static str {
        match self {
            Command::SensorValues => "sensor_values",
            Command::CalibrationValues => "calibration_values",
            Command::IntervalValue => "interval_value",
            Command::Unknown => "unknown",
            Command::TempAlarmConfig => "temp_alarm_configuration",
            Command::HumidityAlarmConfig => "humidity_alarm_configuration",
            Command::DeviceConfiguration => "device_configuration",
            Command::SyncTime => "synctime",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(opcode: u8) -> Result<Self, Self::Error> {
        Self::from_opcode(opcode)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where the payload of a response frame begins and ends.
///
/// * `Stripped` (newer firmware): the payload is everything between the
///   leading `0x7b` and the terminator, both excluded. Sensor values are 24
///   bytes, the device configuration 27 bytes.
/// * `Enclosed` (older firmware): the payload keeps the leading `0x7b` and the
///   two terminator bytes. Sensor values are 27 bytes with the channel
///   triplets starting at offset 1, the device configuration 30 bytes.
///
/// The units flag is read from offset 7 of the payload in both layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameLayout {
    #[default]
    Stripped,
    Enclosed,
}

impl FrameLayout {
    /// The fixed payload length of a command, if it has a known layout.
    pub const fn payload_len(self, command: Command) -> Option<usize> {
        match (self, command) {
            (FrameLayout::Stripped, Command::SensorValues) => Some(TRIPLETS_LEN),
            (FrameLayout::Stripped, Command::DeviceConfiguration) => Some(27),
            (FrameLayout::Enclosed, Command::SensorValues) => Some(TRIPLETS_LEN + 3),
            (FrameLayout::Enclosed, Command::DeviceConfiguration) => Some(30),
            _ => None,
        }
    }

    const fn channel_offset(self) -> usize {
        match self {
            FrameLayout::Stripped => 0,
            FrameLayout::Enclosed => 1,
        }
    }

    /// Checks `payload` against the fixed length of `command`.
    pub fn check_len(self, command: Command, payload: &[u8]) -> Result<(), Error> {
        match self.payload_len(command) {
            Some(expected) if expected != payload.len() => Err(Error::MalformedPayload {
                command,
                expected,
                actual: payload.len(),
            }),
            _ => Ok(()),
        }
    }
}

impl FromStr for FrameLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripped" => Ok(FrameLayout::Stripped),
            "enclosed" => Ok(FrameLayout::Enclosed),
            _ => Err(Error::InvalidLayout(s.to_string())),
        }
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameLayout::Stripped => write!(f, "stripped"),
            FrameLayout::Enclosed => write!(f, "enclosed"),
        }
    }
}

/// Builds the request frame for `command` with an optional payload.
///
/// No padding is applied, see [`crate::session::Platform::pads_packets`].
pub fn encode_request(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(FRAME_START);
    frame.push(command.opcode());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&FRAME_END);
    frame
}

/// Extracts the payload of one response from a raw device buffer.
///
/// The buffer must be at least `packet_size` bytes long, start with
/// [`FRAME_START`] and contain [`FRAME_END`]. The bytes returned depend on
/// `layout`.
pub fn extract_frame(
    buffer: &[u8],
    packet_size: usize,
    layout: FrameLayout,
) -> Result<&[u8], Error> {
    if buffer.is_empty() {
        return Err(FrameError::Empty.into());
    }
    if buffer.len() < packet_size {
        return Err(FrameError::TooShort {
            expected: packet_size,
            actual: buffer.len(),
        }
        .into());
    }
    if buffer[0] != FRAME_START {
        return Err(FrameError::BadLeadByte(buffer[0]).into());
    }
    let end = buffer
        .windows(FRAME_END.len())
        .position(|pair| pair == FRAME_END)
        .ok_or(FrameError::MissingTerminator)?;
    Ok(match layout {
        FrameLayout::Stripped => &buffer[1..end],
        FrameLayout::Enclosed => &buffer[..end + FRAME_END.len()],
    })
}

/// A sensor channel number (1 to 8), as set with the DIP switches of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = NUMBER_OF_CHANNELS;

    pub fn all() -> impl Iterator<Item = Channel> {
        (Self::MIN..=Self::MAX).map(Channel)
    }

    fn index(self) -> usize {
        (self.0 - Self::MIN) as usize
    }
}

impl Deref for Channel {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Channel(value))
        } else {
            Err(Error::ChannelOutOfRange(value))
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The temperature unit the console displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    #[default]
    Celsius,
    Fahrenheit,
}

impl Units {
    pub const fn symbol(self) -> &'static str {
        match self {
            Units::Celsius => "C",
            Units::Fahrenheit => "F",
        }
    }

    /// Converts a temperature in °C into this unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            Units::Celsius => celsius,
            Units::Fahrenheit => ((celsius * 9.0 / 5.0 + 32.0) * 100.0).round() / 100.0,
        }
    }

    /// Formats a temperature in this unit with at least one decimal.
    ///
    /// Celsius values are tenths, Fahrenheit values keep up to two decimals.
    pub fn format_temperature(self, value: f64) -> String {
        match self {
            Units::Celsius => format!("{value:.1}"),
            Units::Fahrenheit => {
                let text = format!("{value:.2}");
                match text.strip_suffix('0') {
                    Some(trimmed) => trimmed.to_string(),
                    None => text,
                }
            }
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Celsius => write!(f, "Celsius"),
            Units::Fahrenheit => write!(f, "Fahrenheit"),
        }
    }
}

/// The values reported for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReading {
    /// Temperature in the units of the enclosing [`SensorValues`].
    pub temperature: f64,
    /// Relative humidity in percent, `None` if the sensor reported a fault.
    pub humidity: Option<u8>,
}

impl ChannelReading {
    fn decode(triplet: &[u8], units: Units) -> Option<Self> {
        if triplet == CHANNEL_SENTINEL || triplet[2] == HUMIDITY_NO_DATA {
            return None;
        }
        // Tenths of a degree Celsius, two's complement.
        let raw = i16::from_be_bytes([triplet[0], triplet[1]]);
        let humidity = triplet[2];
        Some(ChannelReading {
            temperature: units.from_celsius(f64::from(raw) / 10.0),
            humidity: (humidity <= HUMIDITY_MAX).then_some(humidity),
        })
    }
}

/// Current readings of all 8 channels.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorValues {
    units: Units,
    channels: [Option<ChannelReading>; NUMBER_OF_CHANNELS as usize],
}

impl SensorValues {
    /// Decodes a `SensorValues` payload, converting temperatures to `units`.
    pub fn decode(payload: &[u8], units: Units, layout: FrameLayout) -> Result<Self, Error> {
        layout.check_len(Command::SensorValues, payload)?;
        let offset = layout.channel_offset();
        let mut channels = [None; NUMBER_OF_CHANNELS as usize];
        for (reading, triplet) in channels
            .iter_mut()
            .zip(payload[offset..offset + TRIPLETS_LEN].chunks_exact(TRIPLET_LEN))
        {
            *reading = ChannelReading::decode(triplet, units);
        }
        Ok(Self { units, channels })
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn get(&self, channel: Channel) -> Option<&ChannelReading> {
        self.channels[channel.index()].as_ref()
    }

    /// Iterates over the channels that reported data.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &ChannelReading)> {
        Channel::all().filter_map(move |channel| self.get(channel).map(|r| (channel, r)))
    }

    /// Channels that have a sensor attached.
    pub fn active_channels(&self) -> Vec<Channel> {
        self.iter().map(|(channel, _)| channel).collect()
    }

    /// Flattens the readings into `temperature_CH{n}` / `humidity_CH{n}` keys.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![("units".to_string(), self.units.to_string())];
        for (channel, reading) in self.iter() {
            entries.push((
                format!("temperature_CH{channel}"),
                self.units.format_temperature(reading.temperature),
            ));
            if let Some(humidity) = reading.humidity {
                entries.push((format!("humidity_CH{channel}"), humidity.to_string()));
            }
        }
        entries
    }
}

impl fmt::Display for SensorValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for channel in Channel::all() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match self.get(channel) {
                Some(reading) => {
                    write!(f, "CH{channel}: {:.1}°{}", reading.temperature, self.units.symbol())?;
                    if let Some(humidity) = reading.humidity {
                        write!(f, " {humidity}%")?;
                    }
                }
                None => write!(f, "CH{channel}: -")?,
            }
        }
        Ok(())
    }
}

/// The console settings the bridge cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfiguration {
    pub units: Units,
}

impl DeviceConfiguration {
    pub fn decode(payload: &[u8], layout: FrameLayout) -> Result<Self, Error> {
        layout.check_len(Command::DeviceConfiguration, payload)?;
        let units = if payload[UNITS_OFFSET] == FAHRENHEIT_FLAG {
            Units::Fahrenheit
        } else {
            Units::Celsius
        };
        Ok(Self { units })
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        vec![
            (
                "type".to_string(),
                Command::DeviceConfiguration.name().to_string(),
            ),
            ("units".to_string(), self.units.symbol().to_string()),
        ]
    }
}

impl fmt::Display for DeviceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "units: {} ({})", self.units, self.units.symbol())
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    SensorValues(SensorValues),
    DeviceConfiguration(DeviceConfiguration),
    /// The command has no known payload layout.
    Empty(Command),
}

impl Record {
    pub fn command(&self) -> Command {
        match self {
            Record::SensorValues(_) => Command::SensorValues,
            Record::DeviceConfiguration(_) => Command::DeviceConfiguration,
            Record::Empty(command) => *command,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Record::Empty(_))
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        match self {
            Record::SensorValues(values) => values.entries(),
            Record::DeviceConfiguration(config) => config.entries(),
            Record::Empty(_) => Vec::new(),
        }
    }
}

/// Decodes the payload of a response to `command`.
///
/// `units` is the display unit last learned from the device configuration.
/// Commands without a known payload layout decode to [`Record::Empty`].
pub fn decode(
    command: Command,
    payload: &[u8],
    units: Units,
    layout: FrameLayout,
) -> Result<Record, Error> {
    log::debug!("extracting values for {command}: {payload:02x?}");
    match command {
        Command::SensorValues => Ok(Record::SensorValues(SensorValues::decode(
            payload, units, layout,
        )?)),
        Command::DeviceConfiguration => Ok(Record::DeviceConfiguration(
            DeviceConfiguration::decode(payload, layout)?,
        )),
        _ => {
            log::debug!("no payload layout known for {command}, ignoring {payload:02x?}");
            Ok(Record::Empty(command))
        }
    }
}
