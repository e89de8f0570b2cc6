use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{PinError, PinReader};
use types::PinLevel;

pub const DEFAULT_BASE_PATH: &str = "/sys/class/gpio";

/// Legacy `/sys/class/gpio` interface: `gpioN/value` holds `0` or `1`.
#[derive(Debug, Clone)]
pub struct SysfsPins {
    base_path: PathBuf,
}

impl SysfsPins {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn gpio_dir(&self, pin: u32) -> PathBuf {
        self.base_path.join(format!("gpio{pin}"))
    }

    fn value_path(&self, pin: u32) -> PathBuf {
        self.gpio_dir(pin).join("value")
    }

    /// Exports `pin` if needed and sets it as an input.
    pub async fn prepare_input(&self, pin: u32) -> Result<(), PinError> {
        let io = |source| PinError::Io { pin, source };

        if tokio::fs::metadata(self.gpio_dir(pin)).await.is_err() {
            tokio::fs::write(self.base_path.join("export"), pin.to_string())
                .await
                .map_err(io)?;
            // the kernel creates gpioN asynchronously
            tokio::time::sleep(Duration::from_millis(100)).await;
            debug!(pin, "gpio exported");
        }

        tokio::fs::write(self.gpio_dir(pin).join("direction"), "in")
            .await
            .map_err(io)
    }
}

impl Default for SysfsPins {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PATH)
    }
}

#[async_trait]
impl PinReader for SysfsPins {
    async fn read_level(&self, pin: u32) -> Result<PinLevel, PinError> {
        let raw = tokio::fs::read_to_string(self.value_path(pin))
            .await
            .map_err(|source| PinError::Io { pin, source })?;
        match raw.trim() {
            "1" => Ok(PinLevel::High),
            "0" => Ok(PinLevel::Low),
            other => Err(PinError::InvalidValue {
                pin,
                value: other.to_string(),
            }),
        }
    }
}
