//! GPIO output drivers
//!
//! `SysfsGpioDriver` drives pins through the Linux sysfs interface
//! (`{base}/gpio{n}/value`). `MemoryGpioDriver` keeps pin state in memory and
//! records every write, for hosts without GPIO and for tests.

use crate::error::GpioError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_sysfs(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// GPIO driver trait
pub trait GpioDriver: Send + Sync {
    /// Read GPIO value
    fn read(&self, pin: u32) -> Result<bool, GpioError>;

    /// Write GPIO value
    fn write(&self, pin: u32, value: bool) -> Result<(), GpioError>;

    /// Export the pin (if needed) and set its direction
    fn setup(&self, pin: u32, direction: Direction) -> Result<(), GpioError>;

    /// Return the pin to the kernel
    fn release(&self, pin: u32) -> Result<(), GpioError>;

    /// Check if driver is available
    fn is_available(&self) -> bool;
}

/// Sysfs GPIO driver for Linux
#[derive(Debug, Clone)]
pub struct SysfsGpioDriver {
    base_path: PathBuf,
}

impl SysfsGpioDriver {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn pin_path(&self, pin: u32) -> PathBuf {
        self.base_path.join(format!("gpio{}", pin))
    }
}

impl Default for SysfsGpioDriver {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

impl GpioDriver for SysfsGpioDriver {
    fn read(&self, pin: u32) -> Result<bool, GpioError> {
        let path = self.pin_path(pin).join("value");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            debug!("Failed to read GPIO {}: {}", pin, e);
            GpioError::Access {
                pin,
                op: "read",
                reason: e.to_string(),
            }
        })?;
        Ok(content.trim() == "1")
    }

    fn write(&self, pin: u32, value: bool) -> Result<(), GpioError> {
        let path = self.pin_path(pin).join("value");
        let content = if value { "1" } else { "0" };
        std::fs::write(&path, content).map_err(|e| {
            warn!("Failed to write GPIO {}: {}", pin, e);
            GpioError::Access {
                pin,
                op: "write",
                reason: e.to_string(),
            }
        })
    }

    fn setup(&self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        if !self.is_available() {
            return Err(GpioError::Unavailable(format!(
                "{} does not exist",
                self.base_path.display()
            )));
        }

        let gpio_path = self.pin_path(pin);
        if !gpio_path.exists() {
            if let Err(e) = std::fs::write(self.base_path.join("export"), pin.to_string()) {
                // Already exported by someone else
                if !e.to_string().contains("Device or resource busy") {
                    return Err(GpioError::Access {
                        pin,
                        op: "export",
                        reason: e.to_string(),
                    });
                }
            }
        }

        std::fs::write(gpio_path.join("direction"), direction.as_sysfs()).map_err(|e| {
            GpioError::Access {
                pin,
                op: "set direction",
                reason: e.to_string(),
            }
        })
    }

    fn release(&self, pin: u32) -> Result<(), GpioError> {
        if !self.pin_path(pin).exists() {
            return Ok(());
        }
        std::fs::write(self.base_path.join("unexport"), pin.to_string()).map_err(|e| {
            GpioError::Access {
                pin,
                op: "unexport",
                reason: e.to_string(),
            }
        })
    }

    fn is_available(&self) -> bool {
        Path::new(&self.base_path).exists()
    }
}

/// In-memory GPIO driver
///
/// Every write is recorded with its (tokio) timestamp so pulse patterns can
/// be inspected.
#[derive(Debug, Default)]
pub struct MemoryGpioDriver {
    pins: Mutex<HashMap<u32, bool>>,
    writes: Mutex<Vec<(Instant, u32, bool)>>,
}

impl MemoryGpioDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes so far, oldest first
    pub fn writes(&self) -> Vec<(Instant, u32, bool)> {
        self.writes.lock().clone()
    }

    /// Current level of `pin` (low if never written)
    pub fn level(&self, pin: u32) -> bool {
        self.pins.lock().get(&pin).copied().unwrap_or(false)
    }
}

impl GpioDriver for MemoryGpioDriver {
    fn read(&self, pin: u32) -> Result<bool, GpioError> {
        Ok(self.level(pin))
    }

    fn write(&self, pin: u32, value: bool) -> Result<(), GpioError> {
        self.pins.lock().insert(pin, value);
        self.writes.lock().push((Instant::now(), pin, value));
        Ok(())
    }

    fn setup(&self, pin: u32, _direction: Direction) -> Result<(), GpioError> {
        self.pins.lock().entry(pin).or_insert(false);
        Ok(())
    }

    fn release(&self, pin: u32) -> Result<(), GpioError> {
        self.pins.lock().remove(&pin);
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}
