use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use bridge_app::BridgeConfig;
use device_registry::ControlMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: &[&str] = &[
    "PLUGBRIDGE_CONFIG",
    "PLUGBRIDGE_MODE",
    "PLUGBRIDGE_PLUGS_FILE",
    "PLUGBRIDGE_PLUG_IPS",
    "PLUGBRIDGE_BUS_ADDRESS",
    "PLUGBRIDGE_TIMEOUT_MS",
    "PLUGBRIDGE_PINS",
];

fn clear_env() {
    for key in ENV_KEYS {
        env::remove_var(key);
    }
}

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_CONFIG", fixture_path("config-valid.toml"));

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.mode, ControlMode::Bus);
    assert_eq!(config.bus.address, 0x55);
    assert_eq!(config.bus.service_interval_ms, 25);
    assert_eq!(config.transport.timeout_ms, 2_500);
    assert_eq!(config.plugs.plugs_per_ip, vec![1, 3]);

    clear_env();
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_CONFIG", fixture_path("config-valid.json"));

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.mode, ControlMode::Pins);
    assert_eq!(config.plugs.pins, vec![4, 5, 18]);
    assert_eq!(config.plugs.base_url_prefix, "http://10.0.0.");
    assert_eq!(config.metrics_addr.as_deref(), Some("127.0.0.1:9108"));

    clear_env();
}

#[test]
fn invalid_config_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_CONFIG", fixture_path("config-invalid.toml"));

    let config = BridgeConfig::load().expect("load config");
    assert!(config.validate().is_err());

    // fixing the timeout still leaves a multiplexed group in pin mode
    env::set_var("PLUGBRIDGE_TIMEOUT_MS", "1000");
    let config = BridgeConfig::load().expect("load config");
    let err = config.validate().expect_err("pins need one plug per group");
    assert!(err.to_string().contains("plugs"));

    clear_env();
}

#[test]
fn plugs_file_replaces_inline_plugs() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("PLUGBRIDGE_PLUGS_FILE", fixture_path("plugs.json"));

    let config = BridgeConfig::load().expect("load config");
    config.validate().expect("validate config");
    assert_eq!(config.plugs.ip_octets, vec![31, 32]);
    assert_eq!(config.plugs.plugs_per_ip, vec![2, 1]);

    clear_env();
}

#[test]
fn env_overrides_file_values() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_CONFIG", fixture_path("config-valid.toml"));
    env::set_var("PLUGBRIDGE_BUS_ADDRESS", "0x35");
    env::set_var("PLUGBRIDGE_PLUG_IPS", "40, 41, 42");
    env::set_var("PLUGBRIDGE_MODE", "bus");

    let config = BridgeConfig::load().expect("load config");
    assert_eq!(config.bus.address, 0x35);
    assert_eq!(config.plugs.ip_octets, vec![40, 41, 42]);
    // three groups against two counts from the file
    assert!(config.validate().is_err());

    clear_env();
}

#[test]
fn unknown_mode_is_a_load_error() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_PLUG_IPS", "10, 11");
    env::set_var("PLUGBRIDGE_PINS", "4, 5");
    env::set_var("PLUGBRIDGE_MODE", "pin");

    let err = BridgeConfig::load().expect_err("typo in mode");
    assert!(err.to_string().contains("PLUGBRIDGE_MODE"));

    env::set_var("PLUGBRIDGE_MODE", " Pins ");
    let config = BridgeConfig::load().expect("load config");
    assert_eq!(config.mode, ControlMode::Pins);
    config.validate().expect("validate config");

    clear_env();
}

#[test]
fn missing_plugs_file_is_a_load_error() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    clear_env();
    env::set_var("PLUGBRIDGE_PLUGS_FILE", fixture_path("does-not-exist.json"));

    assert!(BridgeConfig::load().is_err());

    clear_env();
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
