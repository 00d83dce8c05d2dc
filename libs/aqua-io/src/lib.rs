//! AquaWatch hardware I/O
//!
//! - `modem`: AT-command session with a GSM module for sending SMS
//! - `gpio`: digital output drivers (sysfs and in-memory)

pub mod error;
pub mod gpio;
pub mod modem;

pub use error::{GpioError, ModemError};
pub use gpio::{Direction, GpioDriver, MemoryGpioDriver, SysfsGpioDriver};
pub use modem::{AtReply, ModemConfig, ModemStatus, ModemTransport, SmsSender};
