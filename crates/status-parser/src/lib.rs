//! Decoders for the JSON bodies Tasmota returns from `/cm?cmnd=...`.
//!
//! Decoding is deliberately loose: a power field reads as on only when it is
//! exactly `"ON"`, and absent energy entries read as zero. Errors are reserved
//! for bodies that are not JSON or lack the object a command is about.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use types::{EnergySample, PowerState};

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(String),
    #[error("field {0} is not a number")]
    NotANumber(String),
}

/// Decodes the reply to `Power` / `Power<n>`.
pub fn parse_power(body: &str, relay: Option<u16>) -> Result<PowerState, ParserError> {
    let root: Value = serde_json::from_str(body)?;
    let field = match relay {
        Some(n) => {
            let indexed = format!("POWER{n}");
            // single-relay firmware answers Power1 with plain POWER
            if root.get(&indexed).is_some() {
                indexed
            } else {
                "POWER".to_string()
            }
        }
        None => "POWER".to_string(),
    };
    let value = root
        .get(&field)
        .ok_or_else(|| ParserError::MissingField(field.clone()))?;

    Ok(match value.as_str() {
        Some("ON") => PowerState::On,
        _ => PowerState::Off,
    })
}

/// Decodes `StatusSTS.Wifi.RSSI` from the reply to `Status 11`.
pub fn parse_rssi(body: &str) -> Result<i32, ParserError> {
    let root: Value = serde_json::from_str(body)?;
    let rssi = root
        .pointer("/StatusSTS/Wifi/RSSI")
        .ok_or_else(|| ParserError::MissingField("StatusSTS.Wifi.RSSI".to_string()))?;
    let rssi = rssi
        .as_i64()
        .ok_or_else(|| ParserError::NotANumber("StatusSTS.Wifi.RSSI".to_string()))?;
    Ok(rssi.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
}

/// Decodes `StatusSNS.ENERGY` from the reply to `Status 10`.
pub fn parse_energy(body: &str) -> Result<EnergySample, ParserError> {
    let root: Value = serde_json::from_str(body)?;
    let energy = root
        .pointer("/StatusSNS/ENERGY")
        .filter(|value| value.is_object())
        .ok_or_else(|| ParserError::MissingField("StatusSNS.ENERGY".to_string()))?;

    Ok(EnergySample {
        voltage: energy_field(energy, "Voltage"),
        current: energy_field(energy, "Current"),
        power: energy_field(energy, "Power"),
        today: energy_field(energy, "Today"),
        yesterday: energy_field(energy, "Yesterday"),
        total: energy_field(energy, "Total"),
    })
}

fn energy_field(energy: &Value, name: &str) -> f32 {
    match energy.get(name) {
        Some(Value::Number(number)) => number.as_f64().unwrap_or_default() as f32,
        Some(Value::Array(channels)) => {
            // multi-channel meters report one value per channel
            warn!(field = name, channels = channels.len(), "using first energy channel");
            channels
                .first()
                .and_then(Value::as_f64)
                .unwrap_or_default() as f32
        }
        Some(Value::String(text)) => text.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}
