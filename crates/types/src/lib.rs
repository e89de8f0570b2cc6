use serde::{Deserialize, Serialize};

/// Size of the energy payload served after a successful energy read.
pub const ENERGY_PAYLOAD_LEN: usize = 24;

/// Two-level plug address: IP group, then sub-plug behind that IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub group: u8,
    pub sub: u8,
}

impl DeviceAddress {
    pub const fn new(group: u8, sub: u8) -> Self {
        Self { group, sub }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.sub)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn is_on(self) -> bool {
        matches!(self, PowerState::On)
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

/// Last logical level seen on a control pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinLevel {
    High,
    Low,
    #[default]
    Unknown,
}

impl From<bool> for PinLevel {
    fn from(high: bool) -> Self {
        if high {
            PinLevel::High
        } else {
            PinLevel::Low
        }
    }
}

/// Snapshot of a plug's energy meter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergySample {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub today: f32,
    pub yesterday: f32,
    pub total: f32,
}

impl EnergySample {
    /// Wire layout: voltage, current, power, total, yesterday, today as
    /// little-endian f32, no framing.
    pub fn to_bytes(&self) -> [u8; ENERGY_PAYLOAD_LEN] {
        let mut out = [0u8; ENERGY_PAYLOAD_LEN];
        let fields = [
            self.voltage,
            self.current,
            self.power,
            self.total,
            self.yesterday,
            self.today,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Returns `None` unless `bytes` is exactly one payload long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENERGY_PAYLOAD_LEN {
            return None;
        }
        let mut fields = [0f32; 6];
        for (value, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let [voltage, current, power, total, yesterday, today] = fields;
        Some(Self {
            voltage,
            current,
            power,
            today,
            yesterday,
            total,
        })
    }
}

/// Signed one-byte result codes shared by the bridge and the bus master.
pub mod code {
    pub const SUCCESS: i8 = 0;
    pub const URL_PREPARATION_FAILED: i8 = -1;
    pub const HTTP_REQUEST_FAILED: i8 = -2;
    pub const UNHANDLED_CASE: i8 = -3;
    pub const MASTER_TIMEOUT: i8 = -100;
    pub const JSON_ERROR: i8 = -101;
    pub const UNKNOWN_STATE: i8 = -102;
    pub const PLUG_NOT_CONNECTED: i8 = -103;
    pub const TASMOTA_REQUEST_FAILED: i8 = -104;
    pub const PLUG_REF_INVALID: i8 = -105;
    pub const BUS_TIMEOUT: i8 = -106;
    pub const UNKNOWN_COMMAND: i8 = -107;
    pub const BUSY: i8 = -108;
}

pub fn describe_code(value: i8) -> &'static str {
    match value {
        code::SUCCESS => "success",
        code::URL_PREPARATION_FAILED => "URL preparation failed",
        code::HTTP_REQUEST_FAILED => "HTTP request failed",
        code::UNHANDLED_CASE => "unhandled case",
        code::MASTER_TIMEOUT => "no response before master timeout",
        code::JSON_ERROR => "JSON parsing error",
        code::UNKNOWN_STATE => "unknown state",
        code::PLUG_NOT_CONNECTED => "plug not connected",
        code::TASMOTA_REQUEST_FAILED => "Tasmota request failed",
        code::PLUG_REF_INVALID => "invalid plug reference",
        code::BUS_TIMEOUT => "bus timeout",
        code::UNKNOWN_COMMAND => "unknown command",
        code::BUSY => "busy",
        v if v > 0 => "value",
        _ => "unknown error",
    }
}
