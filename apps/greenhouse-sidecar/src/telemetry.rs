use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;

pub const CHANNEL_COUNT: usize = 11;

/// Named sensor channels a greenhouse node may report. Not every node type
/// wires every channel, so each one is optional on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorChannel {
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
}

impl SensorChannel {
    pub const ALL: [SensorChannel; CHANNEL_COUNT] = [
        SensorChannel::S1,
        SensorChannel::S2,
        SensorChannel::S3,
        SensorChannel::S4,
        SensorChannel::S5,
        SensorChannel::S6,
        SensorChannel::S7,
        SensorChannel::S8,
        SensorChannel::S9,
        SensorChannel::S10,
        SensorChannel::S11,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_wire_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.wire_key().eq_ignore_ascii_case(key))
    }

    pub fn wire_key(self) -> &'static str {
        match self {
            SensorChannel::S1 => "S1",
            SensorChannel::S2 => "S2",
            SensorChannel::S3 => "S3",
            SensorChannel::S4 => "S4",
            SensorChannel::S5 => "S5",
            SensorChannel::S6 => "S6",
            SensorChannel::S7 => "S7",
            SensorChannel::S8 => "S8",
            SensorChannel::S9 => "S9",
            SensorChannel::S10 => "S10",
            SensorChannel::S11 => "S11",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SensorChannel::S1 => "temperature",
            SensorChannel::S2 => "humidity",
            SensorChannel::S3 => "soil_moisture",
            SensorChannel::S4 => "light",
            SensorChannel::S5 => "co2",
            SensorChannel::S6 => "air_flow",
            SensorChannel::S7 => "battery",
            SensorChannel::S8 => "signal",
            SensorChannel::S9 => "power",
            SensorChannel::S10 => "ph",
            SensorChannel::S11 => "ec",
        }
    }

    /// Column holding this channel's window mean in `sensor_averages`.
    pub fn column(self) -> &'static str {
        match self {
            SensorChannel::S1 => "s1_average",
            SensorChannel::S2 => "s2_average",
            SensorChannel::S3 => "s3_average",
            SensorChannel::S4 => "s4_average",
            SensorChannel::S5 => "s5_average",
            SensorChannel::S6 => "s6_average",
            SensorChannel::S7 => "s7_average",
            SensorChannel::S8 => "s8_average",
            SensorChannel::S9 => "s9_average",
            SensorChannel::S10 => "s10_average",
            SensorChannel::S11 => "s11_average",
        }
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_key())
    }
}

/// One optional value per channel. `None` means the device did not report
/// the channel, which is not the same as reporting zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelValues([Option<f64>; CHANNEL_COUNT]);

impl ChannelValues {
    pub fn get(&self, channel: SensorChannel) -> Option<f64> {
        self.0[channel.index()]
    }

    pub fn set(&mut self, channel: SensorChannel, value: Option<f64>) {
        self.0[channel.index()] = value;
    }

    #[cfg(test)]
    pub fn with(mut self, channel: SensorChannel, value: f64) -> Self {
        self.set(channel, Some(value));
        self
    }

    pub fn present(&self) -> impl Iterator<Item = (SensorChannel, f64)> + '_ {
        SensorChannel::ALL
            .into_iter()
            .filter_map(|channel| self.get(channel).map(|value| (channel, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }
}

/// Channels a reader asked for. No names, or `all`, keeps every channel;
/// unknown names are ignored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelSelection(Option<Vec<SensorChannel>>);

impl ChannelSelection {
    /// Accepts repeated names as well as comma-separated lists such as `S1,S2`.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Self {
        let names: Vec<&str> = names
            .iter()
            .flat_map(|name| name.as_ref().split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() || names.iter().any(|name| name.eq_ignore_ascii_case("all")) {
            return Self(None);
        }
        let mut channels: Vec<SensorChannel> = names
            .into_iter()
            .filter_map(SensorChannel::from_wire_key)
            .collect();
        channels.sort();
        channels.dedup();
        Self(Some(channels))
    }

    pub fn includes(&self, channel: SensorChannel) -> bool {
        self.0
            .as_ref()
            .map_or(true, |channels| channels.contains(&channel))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub greenhouse_id: String,
    pub node_id: String,
}

impl NodeKey {
    pub fn new(greenhouse_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            greenhouse_id: greenhouse_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.greenhouse_id, self.node_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub key: NodeKey,
    pub timestamp: Option<DateTime<Utc>>,
    pub values: ChannelValues,
}

impl Reading {
    pub fn new(key: NodeKey, values: ChannelValues) -> Self {
        Self {
            key,
            timestamp: None,
            values,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty payload")]
    Empty,
    #[error("invalid reading json: {0}")]
    Json(#[from] simd_json::Error),
    #[error("reading is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    #[serde(default, borrow)]
    greenhouse_id: Option<&'a str>,
    #[serde(default, borrow)]
    node_id: Option<&'a str>,
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    #[serde(default, rename = "S1")]
    s1: Option<WireNumber>,
    #[serde(default, rename = "S2")]
    s2: Option<WireNumber>,
    #[serde(default, rename = "S3")]
    s3: Option<WireNumber>,
    #[serde(default, rename = "S4")]
    s4: Option<WireNumber>,
    #[serde(default, rename = "S5")]
    s5: Option<WireNumber>,
    #[serde(default, rename = "S6")]
    s6: Option<WireNumber>,
    #[serde(default, rename = "S7")]
    s7: Option<WireNumber>,
    #[serde(default, rename = "S8")]
    s8: Option<WireNumber>,
    #[serde(default, rename = "S9")]
    s9: Option<WireNumber>,
    #[serde(default, rename = "S10")]
    s10: Option<WireNumber>,
    #[serde(default, rename = "S11")]
    s11: Option<WireNumber>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Int(i64),
    Float(f64),
}

impl WireNumber {
    fn as_f64(&self) -> f64 {
        match self {
            WireNumber::Int(value) => *value as f64,
            WireNumber::Float(value) => *value,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ms) if ms.is_finite() => millis_to_dt(ms.trunc() as i64),
            BorrowedTimestamp::Float(_) => None,
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Decodes one ESP32 payload, e.g.
/// `{"greenhouse_id":"GH1","node_id":"Node01","S1":12,"S2":48.5}`.
pub fn parse_reading(payload: &mut [u8]) -> Result<Reading, ParseError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let wire: BorrowedReading = simd_json::serde::from_slice(payload)?;

    let greenhouse_id = wire
        .greenhouse_id
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField("greenhouse_id"))?;
    let node_id = wire
        .node_id
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField("node_id"))?;

    let raw = [
        wire.s1, wire.s2, wire.s3, wire.s4, wire.s5, wire.s6, wire.s7, wire.s8, wire.s9,
        wire.s10, wire.s11,
    ];
    let mut values = ChannelValues::default();
    for (channel, value) in SensorChannel::ALL.into_iter().zip(raw.iter()) {
        values.set(channel, value.as_ref().map(WireNumber::as_f64));
    }

    let mut reading = Reading::new(NodeKey::new(greenhouse_id, node_id), values);
    reading.timestamp = wire.timestamp.as_ref().and_then(|t| t.to_datetime());
    Ok(reading)
}
