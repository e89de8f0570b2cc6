//! Mirrors GPIO levels onto plug relays: a high pin means the plug should be on.
//!
//! Each pass reads every control pin. Only a level that differs from the last
//! one seen triggers HTTP traffic, and a plug is only switched when its live
//! state disagrees with the pin.

pub mod sysfs;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use device_registry::DeviceRegistry;
use plug_client::{PlugError, PlugTarget, PlugTransport};
use types::{DeviceAddress, PinLevel};

pub use sysfs::SysfsPins;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("GPIO {pin} unavailable: {source}")]
    Io {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("GPIO {pin} reported {value:?}")]
    InvalidValue { pin: u32, value: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Pin(#[from] PinError),
    #[error(transparent)]
    Plug(#[from] PlugError),
}

#[async_trait]
pub trait PinReader: Send + Sync {
    async fn read_level(&self, pin: u32) -> Result<PinLevel, PinError>;
}

/// Counts from one pass over the control pins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub checked: usize,
    pub changed: usize,
    pub corrected: usize,
    pub errors: usize,
}

enum PlugSync {
    Unchanged,
    InAgreement(PinLevel),
    Switched(PinLevel),
}

pub struct PinSync<T, P> {
    registry: DeviceRegistry,
    transport: T,
    pins: P,
}

impl<T: PlugTransport, P: PinReader> PinSync<T, P> {
    pub fn new(registry: DeviceRegistry, transport: T, pins: P) -> Self {
        Self {
            registry,
            transport,
            pins,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn sync_once(&mut self) -> SyncReport {
        let mut report = SyncReport::default();

        for address in self.registry.addresses() {
            let Ok(endpoint) = self.registry.resolve(address) else {
                continue;
            };
            let Some(pin) = endpoint.control_pin else {
                continue;
            };
            let cached = endpoint.last_pin_level;
            let target = PlugTarget::of(&self.registry, endpoint);
            report.checked += 1;

            let level = match self.sync_plug(address, pin, cached, &target).await {
                Ok(PlugSync::Unchanged) => continue,
                Ok(PlugSync::InAgreement(level)) => level,
                Ok(PlugSync::Switched(level)) => {
                    report.corrected += 1;
                    metrics::counter!("pin_sync_corrections_total").increment(1);
                    level
                }
                Err(err) => {
                    // cache untouched so the next pass retries
                    warn!(address = %address, pin, error = %err, "pin sync failed");
                    report.errors += 1;
                    metrics::counter!("pin_sync_errors_total").increment(1);
                    continue;
                }
            };

            report.changed += 1;
            if let Ok(endpoint) = self.registry.resolve_mut(address) {
                endpoint.last_pin_level = level;
            }
        }

        report
    }

    async fn sync_plug(
        &self,
        address: DeviceAddress,
        pin: u32,
        cached: PinLevel,
        target: &PlugTarget,
    ) -> Result<PlugSync, SyncError> {
        let level = self.pins.read_level(pin).await?;
        if level == cached {
            return Ok(PlugSync::Unchanged);
        }

        let wanted = level == PinLevel::High;
        let live = self.transport.query_power(target).await?;
        debug!(address = %address, pin, ?level, on = live.is_on(), "pin level changed");
        if live.is_on() == wanted {
            return Ok(PlugSync::InAgreement(level));
        }

        self.transport.set_power(target, wanted).await?;
        info!(address = %address, pin, on = wanted, "plug switched to follow pin");
        Ok(PlugSync::Switched(level))
    }

    /// Runs passes every `interval` until `shutdown` flips to true.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            pins = self.registry.addresses().len(),
            interval_ms = interval.as_millis() as u64,
            "pin sync started"
        );

        loop {
            if *shutdown.borrow() {
                info!("pin sync shutdown requested");
                break;
            }

            let report = self.sync_once().await;
            if report.changed > 0 || report.errors > 0 {
                debug!(
                    changed = report.changed,
                    corrected = report.corrected,
                    errors = report.errors,
                    "pin sync pass"
                );
            }

            tokio::select! {
                _ = sleep(interval) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("pin sync shutdown requested");
                        break;
                    }
                }
            }
        }
    }
}
