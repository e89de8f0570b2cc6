use thiserror::Error;
use tracing::info;

use types::{DeviceAddress, PinLevel};

pub const DEFAULT_BASE_URL_PREFIX: &str = "http://192.168.4.";

/// How the bridge is driven: by bus commands from a master, or by GPIO levels.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "lowercase"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    #[default]
    Bus,
    Pins,
}

/// The three parallel lists that describe the plug table, one entry per IP group.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugConfig {
    #[cfg_attr(feature = "config", serde(default, alias = "esp_pin_map"))]
    pub pins: Vec<u32>,
    #[cfg_attr(feature = "config", serde(alias = "plug_ip"))]
    pub ip_octets: Vec<u8>,
    /// Empty means one plug per IP.
    #[cfg_attr(feature = "config", serde(default))]
    pub plugs_per_ip: Vec<u16>,
    #[cfg_attr(feature = "config", serde(default = "default_base_url_prefix"))]
    pub base_url_prefix: String,
}

impl Default for PlugConfig {
    fn default() -> Self {
        Self {
            pins: Vec::new(),
            ip_octets: Vec::new(),
            plugs_per_ip: Vec::new(),
            base_url_prefix: default_base_url_prefix(),
        }
    }
}

fn default_base_url_prefix() -> String {
    DEFAULT_BASE_URL_PREFIX.to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid plug configuration: {0}")]
    ConfigInvalid(String),
    #[error("no plug at address {0}")]
    AddressOutOfRange(DeviceAddress),
}

/// One physical plug reachable at `base_url_prefix + ip_octet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlugEndpoint {
    pub ip_octet: u8,
    pub sub_index: u8,
    /// 1-based Tasmota relay number; only set when the IP hosts several plugs.
    pub relay: Option<u16>,
    pub control_pin: Option<u32>,
    pub last_pin_level: PinLevel,
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    base_url_prefix: String,
    groups: Vec<Vec<PlugEndpoint>>,
}

impl DeviceRegistry {
    pub fn build(config: &PlugConfig, mode: ControlMode) -> Result<Self, RegistryError> {
        if config.ip_octets.is_empty() {
            return Err(RegistryError::ConfigInvalid(
                "at least one plug IP octet is required".to_string(),
            ));
        }

        let group_count = config.ip_octets.len();
        if group_count > 256 {
            return Err(RegistryError::ConfigInvalid(format!(
                "at most 256 plug IPs are addressable, got {group_count}"
            )));
        }
        let counts: Vec<u16> = if config.plugs_per_ip.is_empty() {
            vec![1; group_count]
        } else {
            config.plugs_per_ip.clone()
        };
        if counts.len() != group_count {
            return Err(RegistryError::ConfigInvalid(format!(
                "plugs_per_ip has {} entries but there are {group_count} IP octets",
                counts.len()
            )));
        }
        if let Some(index) = counts.iter().position(|count| *count == 0 || *count > 256) {
            return Err(RegistryError::ConfigInvalid(format!(
                "plugs_per_ip[{index}] must be between 1 and 256"
            )));
        }

        if mode == ControlMode::Pins {
            if config.pins.len() != group_count {
                return Err(RegistryError::ConfigInvalid(format!(
                    "pin mode needs one pin per IP octet ({} pins, {group_count} octets)",
                    config.pins.len()
                )));
            }
            if let Some(index) = counts.iter().position(|count| *count != 1) {
                return Err(RegistryError::ConfigInvalid(format!(
                    "pin mode drives one plug per IP, plugs_per_ip[{index}] is {}",
                    counts[index]
                )));
            }
        }

        let groups = config
            .ip_octets
            .iter()
            .zip(&counts)
            .enumerate()
            .map(|(group, (&ip_octet, &count))| {
                (0..count)
                    .map(|sub| PlugEndpoint {
                        ip_octet,
                        sub_index: sub as u8,
                        relay: (count > 1).then_some(sub + 1),
                        control_pin: match mode {
                            ControlMode::Pins => Some(config.pins[group]),
                            ControlMode::Bus => None,
                        },
                        last_pin_level: PinLevel::Unknown,
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            base_url_prefix: config.base_url_prefix.clone(),
            groups,
        })
    }

    pub fn resolve(&self, address: DeviceAddress) -> Result<&PlugEndpoint, RegistryError> {
        self.groups
            .get(usize::from(address.group))
            .and_then(|group| group.get(usize::from(address.sub)))
            .ok_or(RegistryError::AddressOutOfRange(address))
    }

    pub fn resolve_mut(
        &mut self,
        address: DeviceAddress,
    ) -> Result<&mut PlugEndpoint, RegistryError> {
        self.groups
            .get_mut(usize::from(address.group))
            .and_then(|group| group.get_mut(usize::from(address.sub)))
            .ok_or(RegistryError::AddressOutOfRange(address))
    }

    pub fn ip_address_of(&self, endpoint: &PlugEndpoint) -> String {
        format!("{}{}", self.base_url_prefix, endpoint.ip_octet)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn group_len(&self, group: u8) -> Option<usize> {
        self.groups.get(usize::from(group)).map(Vec::len)
    }

    /// Every address in table order.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(group, plugs)| {
                plugs
                    .iter()
                    .map(move |plug| DeviceAddress::new(group as u8, plug.sub_index))
            })
            .collect()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (DeviceAddress, &PlugEndpoint)> {
        self.groups.iter().enumerate().flat_map(|(group, plugs)| {
            plugs
                .iter()
                .map(move |plug| (DeviceAddress::new(group as u8, plug.sub_index), plug))
        })
    }

    pub fn log_table(&self) {
        for (address, plug) in self.endpoints() {
            info!(
                address = %address,
                url = %self.ip_address_of(plug),
                relay = ?plug.relay,
                pin = ?plug.control_pin,
                "plug configured"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(octets: &[u8], counts: &[u16], pins: &[u32]) -> PlugConfig {
        PlugConfig {
            pins: pins.to_vec(),
            ip_octets: octets.to_vec(),
            plugs_per_ip: counts.to_vec(),
            ..PlugConfig::default()
        }
    }

    #[test]
    fn table_shape_follows_plug_counts() {
        let registry =
            DeviceRegistry::build(&config(&[10, 11], &[1, 3], &[]), ControlMode::Bus).expect("build");
        assert_eq!(registry.group_count(), 2);
        assert_eq!(registry.group_len(0), Some(1));
        assert_eq!(registry.group_len(1), Some(3));
        assert_eq!(registry.addresses().len(), 4);

        let single = registry.resolve(DeviceAddress::new(0, 0)).expect("resolve");
        assert_eq!(single.relay, None);
        let third = registry.resolve(DeviceAddress::new(1, 2)).expect("resolve");
        assert_eq!(third.ip_octet, 11);
        assert_eq!(third.relay, Some(3));
        assert_eq!(third.control_pin, None);
    }

    #[test]
    fn missing_plug_counts_default_to_one() {
        let registry =
            DeviceRegistry::build(&config(&[5, 6, 7], &[], &[]), ControlMode::Bus).expect("build");
        assert_eq!(registry.addresses().len(), 3);
    }

    #[test]
    fn out_of_range_addresses_fail() {
        let registry =
            DeviceRegistry::build(&config(&[10], &[2], &[]), ControlMode::Bus).expect("build");
        assert_eq!(
            registry.resolve(DeviceAddress::new(5, 0)),
            Err(RegistryError::AddressOutOfRange(DeviceAddress::new(5, 0)))
        );
        assert!(registry.resolve(DeviceAddress::new(0, 2)).is_err());
    }

    #[test]
    fn ip_address_is_prefix_plus_octet() {
        let registry =
            DeviceRegistry::build(&config(&[42], &[], &[]), ControlMode::Bus).expect("build");
        let plug = registry.resolve(DeviceAddress::new(0, 0)).expect("resolve");
        assert_eq!(registry.ip_address_of(plug), "http://192.168.4.42");
    }

    #[test]
    fn pin_mode_requires_matching_pins() {
        let err = DeviceRegistry::build(&config(&[10, 11], &[], &[4]), ControlMode::Pins)
            .expect_err("pin count mismatch");
        assert!(matches!(err, RegistryError::ConfigInvalid(_)));

        let err = DeviceRegistry::build(&config(&[10], &[2], &[4]), ControlMode::Pins)
            .expect_err("multiplexed group in pin mode");
        assert!(matches!(err, RegistryError::ConfigInvalid(_)));

        let registry = DeviceRegistry::build(&config(&[10, 11], &[], &[4, 5]), ControlMode::Pins)
            .expect("build");
        let plug = registry.resolve(DeviceAddress::new(1, 0)).expect("resolve");
        assert_eq!(plug.control_pin, Some(5));
        assert_eq!(plug.last_pin_level, PinLevel::Unknown);
    }

    #[test]
    fn inconsistent_lists_are_rejected() {
        assert!(DeviceRegistry::build(&config(&[], &[], &[]), ControlMode::Bus).is_err());
        assert!(DeviceRegistry::build(&config(&[1, 2], &[1], &[]), ControlMode::Bus).is_err());
        assert!(DeviceRegistry::build(&config(&[1], &[0], &[]), ControlMode::Bus).is_err());
        assert!(DeviceRegistry::build(&config(&[1], &[300], &[]), ControlMode::Bus).is_err());
    }

    #[test]
    fn resolve_mut_updates_pin_level() {
        let mut registry =
            DeviceRegistry::build(&config(&[10], &[], &[3]), ControlMode::Pins).expect("build");
        registry
            .resolve_mut(DeviceAddress::new(0, 0))
            .expect("resolve")
            .last_pin_level = PinLevel::High;
        assert_eq!(
            registry.resolve(DeviceAddress::new(0, 0)).expect("resolve").last_pin_level,
            PinLevel::High
        );
    }
}
