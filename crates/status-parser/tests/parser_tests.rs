use status_parser::{parse_energy, parse_power, parse_rssi, ParserError};
use types::PowerState;

#[test]
fn power_reply_on_and_off() {
    assert_eq!(parse_power(r#"{"POWER":"ON"}"#, None).expect("parse"), PowerState::On);
    assert_eq!(parse_power(r#"{"POWER":"OFF"}"#, None).expect("parse"), PowerState::Off);
}

#[test]
fn power_reply_anything_but_on_is_off() {
    assert_eq!(parse_power(r#"{"POWER":"on"}"#, None).expect("parse"), PowerState::Off);
    assert_eq!(parse_power(r#"{"POWER":"TOGGLE"}"#, None).expect("parse"), PowerState::Off);
    assert_eq!(parse_power(r#"{"POWER":1}"#, None).expect("parse"), PowerState::Off);
}

#[test]
fn power_reply_for_relay_prefers_indexed_field() {
    let body = r#"{"POWER1":"OFF","POWER2":"ON"}"#;
    assert_eq!(parse_power(body, Some(2)).expect("parse"), PowerState::On);
    assert_eq!(parse_power(body, Some(1)).expect("parse"), PowerState::Off);
    assert_eq!(parse_power(r#"{"POWER":"ON"}"#, Some(1)).expect("parse"), PowerState::On);
}

#[test]
fn power_reply_without_field_is_decode_error() {
    let err = parse_power(r#"{"Command":"Unknown"}"#, None).expect_err("missing");
    assert!(matches!(err, ParserError::MissingField(_)));
    let err = parse_power("<html>busy</html>", None).expect_err("not json");
    assert!(matches!(err, ParserError::Json(_)));
}

#[test]
fn rssi_from_status_11_fixture() {
    let data = include_str!("fixtures/status11.json");
    assert_eq!(parse_rssi(data).expect("parse"), 78);
}

#[test]
fn rssi_missing_is_decode_error() {
    let err = parse_rssi(r#"{"StatusSTS":{"Wifi":{}}}"#).expect_err("missing");
    assert!(matches!(err, ParserError::MissingField(_)));
}

#[test]
fn energy_from_status_10_fixture() {
    let data = include_str!("fixtures/status10.json");
    let sample = parse_energy(data).expect("parse");
    assert_eq!(sample.voltage, 120.1);
    assert_eq!(sample.current, 0.5);
    assert_eq!(sample.power, 60.0);
    assert_eq!(sample.total, 12.3);
    assert_eq!(sample.yesterday, 1.1);
    assert_eq!(sample.today, 0.4);
}

#[test]
fn energy_multichannel_uses_first_channel() {
    let data = include_str!("fixtures/status10_multichannel.json");
    let sample = parse_energy(data).expect("parse");
    assert_eq!(sample.power, 12.0);
    assert_eq!(sample.current, 0.08);
    assert_eq!(sample.voltage, 230.0);
}

#[test]
fn energy_missing_entries_read_as_zero() {
    let sample = parse_energy(r#"{"StatusSNS":{"ENERGY":{"Voltage":229}}}"#).expect("parse");
    assert_eq!(sample.voltage, 229.0);
    assert_eq!(sample.power, 0.0);
    assert_eq!(sample.total, 0.0);
}

#[test]
fn energy_without_meter_object_is_decode_error() {
    let err = parse_energy(r#"{"StatusSNS":{"Time":"2024-04-02T10:15:03"}}"#).expect_err("missing");
    assert!(matches!(err, ParserError::MissingField(_)));
}
