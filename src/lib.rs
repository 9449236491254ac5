//! This crate provides a platform agnostic no_std driver for the AS7331 UVA/UVB/UVC sensor.
//! The driver is compatible with the [`embedded-hal`](https://crates.io/crates/embedded-hal) traits.
//!
//! The datasheet of the sensor can be found [here](https://ams-osram.com/products/sensor-solutions/ambient-light-color-spectral-proximity-sensors/ams-as7331-spectral-uv-sensor).
//!
//! ## Supported features
//! * Continuous, command, sync-start and sync-duration measurement modes
//! * Configurable gain, integration time, conversion clock and output divider
//! * Validated configuration with all invalid fields reported at once
//! * Converting the raw channel counts into irradiance in W/m² and a UV index
//! * Reading the chip temperature
//! * Automatic gain and integration time ranging
//! * Dark offset calibration
//! * A polling lifecycle that is driven by an external scheduler tick
//! * Async (behind the `async` feature)
//!
//! ## Unsupported features
//! * Interrupt (READY pin) functionality
//! * The OPTREG and standby functionality
//!
//! ## Usage
//!
//! ### Creating a driver instance
//!
//! ```rust,ignore
//! use as7331::{AS7331, DeviceConfig, RawOptions, AS7331_ADDR};
//!
//! let config = DeviceConfig::build(&RawOptions::default()).unwrap();
//! let mut sensor = AS7331::new(i2c, AS7331_ADDR, config);
//! sensor.setup(&mut delay).unwrap();
//! ```
//!
//! ### Polling
//!
//! ```rust,ignore
//! use as7331::{Channel, Sink};
//!
//! struct Printer;
//!
//! impl Sink for Printer {
//!     fn publish(&mut self, channel: Channel, value: f32, stale: bool) {
//!         println!("{:?}: {} (stale: {})", channel, value, stale);
//!     }
//! }
//!
//! loop {
//!     // Call this once per scheduler interval, it never blocks longer
//!     // than the configured wait budget
//!     sensor.poll_tick(&mut delay, &mut Printer);
//!     delay.delay_ms(1000u32);
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod conversion;
pub mod driver;
pub mod registers;
pub mod sink;
pub mod switch;

#[cfg(feature = "async")]
pub mod r#async;

pub use config::{
    Calibration, ConfigError, ConfigErrors, ConfigField, ConfigReason, ConversionClock,
    DeviceConfig, MeasurementMode, Profile, RawOptions, UvIndexWeights,
};
pub use conversion::{convert, PhysicalSample, RawSample};
pub use driver::{CalibrationError, DriverState, SetupError, SkipReason, Tick, AS7331};
pub use registers::Registers;
pub use sink::{Channel, Outputs, SaturationWarning, Sink};
pub use switch::{AS7331Switch, SwitchError, SwitchFeature, SwitchTarget};

#[cfg(feature = "async")]
pub use r#async::AS7331Async;

/// Default I2C address of the AS7331 (A1 = A0 = low).
pub const AS7331_ADDR: u8 = 0x74;

/// I2C address of the AS7331 with both address pins strapped high.
pub const AS7331_ADDR_ALT: u8 = 0x77;

/// Shorthand for all bus level functions returning an error in this crate.
pub type Result<T, E = BusError> = core::result::Result<T, E>;

/// Represents an error that happened during a single bus transaction.
#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq)]
pub enum BusError {
    /// An error occurred while reading the given register.
    Read { register: u8 },
    /// An error occurred while writing the given register.
    Write { register: u8 },
}

impl core::fmt::Display for BusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BusError::Read { register } => {
                write!(f, "i2c read of register 0x{:02X} failed", register)
            }
            BusError::Write { register } => {
                write!(f, "i2c write of register 0x{:02X} failed", register)
            }
        }
    }
}

impl core::error::Error for BusError {}
