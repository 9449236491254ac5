//! Blocking polling driver.
//!
//! The driver is a cooperative unit of work: the host calls [`AS7331::setup`]
//! once and [`AS7331::poll_tick`] once per scheduler interval. A tick never
//! waits longer than [`DeviceConfig::wait_budget_ms`] for a conversion; when the
//! conversion is not done yet the next tick picks up where this one stopped.

use core::marker::PhantomData;

use crate::config::{DeviceConfig, MeasurementMode, MAX_GAIN_CODE};
use crate::conversion::{convert, PhysicalSample, RawSample};
use crate::registers::{
    split_agen, Registers, AGEN_DEVID, OSR_DOS_CONFIG, OSR_DOS_MEASUREMENT, OSR_SS, OSR_SW_RES,
    REG_AGEN, REG_BREAK, REG_CREG1, REG_CREG2, REG_CREG3, REG_EDGES, REG_MRES1, REG_MRES2,
    REG_MRES3, REG_OSR, REG_TEMP, STATUS_ADCOF, STATUS_MRESOF, STATUS_NDATA,
};
use crate::sink::{publish_sample, SaturationWarning, Sink};
use crate::switch::{SwitchFeature, SwitchTarget};
use crate::{BusError, Result};

/// Attempts per bus transaction before giving up.
pub(crate) const RETRY_ATTEMPTS: u8 = 3;

/// Backoff before the first retry, doubled for every further retry.
pub(crate) const RETRY_BACKOFF_MS: u32 = 10;

/// Settling time after switching the device operating state.
pub(crate) const STATE_SWITCH_DELAY_MS: u32 = 3;

/// Interval between two STATUS polls while waiting for a conversion.
pub(crate) const READY_POLL_MS: u32 = 5;

/// Added to the nominal conversion time in command mode.
pub(crate) const CONVERSION_MARGIN_MS: u32 = 2;

/// Ticks granted on top of the expected conversion time before a cycle is abandoned.
pub(crate) const AWAIT_TICK_SLACK: u32 = 4;

/// A channel below this share of full scale (in percent) counts as underranged.
pub(crate) const UNDERRANGE_PERCENT: u32 = 10;

/// Fewest good samples a dark offset calibration accepts.
pub(crate) const MIN_DARK_SAMPLES: u8 = 3;

/// Pause between two dark offset samples.
pub(crate) const DARK_SAMPLE_INTERVAL_MS: u32 = 10;

/// OSR value that starts a measurement.
pub(crate) const OSR_START: u8 = OSR_SS | OSR_DOS_MEASUREMENT;

/// Backoff before retry number `attempt + 1`.
pub(crate) fn backoff_ms(attempt: u8) -> u32 {
    RETRY_BACKOFF_MS << attempt
}

/// Lifecycle state of a driver instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// `setup` has not run yet.
    Uninitialized,
    /// Configuration registers are being written.
    Configuring,
    /// Ready to start the next measurement cycle.
    Idle,
    /// A measurement is being started.
    Measuring,
    /// Waiting for the device to finish a conversion.
    AwaitingConversion,
    /// Result registers are being read.
    ReadingOut,
    /// Setup failed, only `reset` leaves this state.
    Error,
}

/// Why a measurement cycle produced no fresh sample.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// A bus transaction kept failing after all retries.
    Bus(BusError),
    /// The conversion did not finish within the allowed number of ticks.
    ConversionTimeout,
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::Bus(error) => write!(f, "{}", error),
            SkipReason::ConversionTimeout => write!(f, "conversion did not finish"),
        }
    }
}

/// Outcome of a single [`AS7331::poll_tick`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Tick {
    /// `setup` has not been called yet, nothing happened.
    NotSetUp,
    /// The driver is in [`DriverState::Error`], nothing happened.
    Faulted,
    /// Measurement is switched off.
    Disabled,
    /// The conversion is still running, the next tick continues waiting.
    Pending,
    /// A fresh sample was converted and published.
    Published(PhysicalSample),
    /// The cycle failed. If a previous sample existed it was republished
    /// flagged as stale.
    Skipped {
        reason: SkipReason,
        stale_published: bool,
    },
}

/// Represents a failure to bring the device into its configured state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetupError {
    /// A bus transaction kept failing after all retries.
    Bus(BusError),
    /// The AGEN register does not identify an AS7331.
    UnexpectedDevice { agen: u8 },
    /// A configuration register did not read back as written.
    VerifyMismatch { register: u8, expected: u8, actual: u8 },
    /// An earlier setup failed; call `reset` first.
    Faulted,
}

impl From<BusError> for SetupError {
    fn from(error: BusError) -> Self {
        SetupError::Bus(error)
    }
}

impl core::fmt::Display for SetupError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SetupError::Bus(error) => write!(f, "{}", error),
            SetupError::UnexpectedDevice { agen } => {
                write!(f, "unexpected device (AGEN=0x{:02X})", agen)
            }
            SetupError::VerifyMismatch {
                register,
                expected,
                actual,
            } => write!(
                f,
                "register 0x{:02X} reads 0x{:02X}, wrote 0x{:02X}",
                register, actual, expected
            ),
            SetupError::Faulted => write!(f, "device is faulted, reset required"),
        }
    }
}

impl core::error::Error for SetupError {}

/// Represents a failed dark offset calibration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CalibrationError {
    /// The driver is not set up or measurement is switched off.
    NotMeasuring,
    /// Fewer good samples than required could be collected.
    InsufficientSamples { collected: u8 },
}

impl core::fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CalibrationError::NotMeasuring => write!(f, "measurement is not running"),
            CalibrationError::InsufficientSamples { collected } => {
                write!(f, "only {} dark samples collected", collected)
            }
        }
    }
}

impl core::error::Error for CalibrationError {}

/// Configuration registers in the order they are written and verified.
pub(crate) fn config_registers(config: &DeviceConfig) -> [(u8, u8); 5] {
    [
        (REG_CREG1, config.creg1()),
        (REG_CREG2, config.creg2()),
        (REG_CREG3, config.creg3()),
        (REG_BREAK, config.break_time),
        (REG_EDGES, config.sync_edges),
    ]
}

/// Bus independent bookkeeping of a driver instance.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) config: DeviceConfig,
    pub(crate) state: DriverState,
    pub(crate) last: Option<PhysicalSample>,
    pub(crate) device_id: Option<(u8, u8)>,
    /// The configuration changed and has to be written before the next cycle.
    pub(crate) reconfigure: bool,
    pub(crate) cycle: u32,
    /// Time already spent waiting for the running conversion.
    pub(crate) waited_ms: u32,
    pub(crate) await_ticks: u32,
}

impl Lifecycle {
    pub(crate) fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            state: DriverState::Uninitialized,
            last: None,
            device_id: None,
            reconfigure: false,
            cycle: 0,
            waited_ms: 0,
            await_ticks: 0,
        }
    }

    /// OSR value written after entering measurement state, if any.
    ///
    /// In command mode every cycle starts its own measurement.
    pub(crate) fn start_osr(&self) -> Option<u8> {
        let free_running = self.config.measurement_mode != MeasurementMode::Command;
        (self.config.measurement_enabled && free_running).then_some(OSR_START)
    }

    pub(crate) fn check_identity(&mut self, agen: u8) -> core::result::Result<(), SetupError> {
        let (device_id, mutation) = split_agen(agen);
        if device_id != AGEN_DEVID {
            return Err(SetupError::UnexpectedDevice { agen });
        }
        self.device_id = Some((device_id, mutation));
        Ok(())
    }

    pub(crate) fn configured(&mut self) {
        let config = &self.config;
        log::info!(
            "AS7331 configured: gain {}x, integration time {} ms, clock {} kHz, mode {:?}, divider {}",
            config.gain(),
            config.integration_time_ms(),
            config.conversion_clock.khz(),
            config.measurement_mode,
            config.divider_factor(),
        );
        if config.dark_offsets != [0; 3] {
            log::info!(
                "Dark offsets: UVA={} UVB={} UVC={} counts",
                config.dark_offsets[0],
                config.dark_offsets[1],
                config.dark_offsets[2]
            );
        }

        self.state = DriverState::Idle;
        self.reconfigure = false;
        self.waited_ms = 0;
        self.await_ticks = 0;
    }

    pub(crate) fn setup_failed(&mut self, error: SetupError) {
        log::error!("AS7331 setup failed: {}", error);
        self.state = DriverState::Error;
    }

    /// Leave `Idle` for a new cycle.
    pub(crate) fn begin_cycle(&mut self) {
        self.cycle = self.cycle.wrapping_add(1);
        self.waited_ms = 0;
        self.await_ticks = 0;
        self.state = DriverState::Measuring;
    }

    /// Time the running conversion still needs before STATUS is worth polling.
    pub(crate) fn remaining_conversion_ms(&self) -> u32 {
        if self.config.measurement_mode != MeasurementMode::Command {
            return 0;
        }
        (self.config.conversion_time_ms() + CONVERSION_MARGIN_MS).saturating_sub(self.waited_ms)
    }

    /// Ticks a cycle may wait for NDATA before it is abandoned.
    ///
    /// Only time spent inside ticks is counted, so the wait budgets of all
    /// granted ticks together always cover the full conversion time.
    pub(crate) fn await_tick_limit(&self) -> u32 {
        let expected_ms = self.config.conversion_time_ms() + CONVERSION_MARGIN_MS;
        expected_ms.div_ceil(self.config.wait_budget_ms.max(1)) + AWAIT_TICK_SLACK
    }

    /// The wait budget of this tick ran out before the conversion finished.
    pub(crate) fn conversion_pending<S: Sink>(&mut self, sink: &mut S) -> Tick {
        self.await_ticks += 1;
        if self.await_ticks >= self.await_tick_limit() {
            return self.skip_cycle(sink, SkipReason::ConversionTimeout);
        }
        log::debug!(
            "Conversion of cycle {} still running ({} ms waited)",
            self.cycle,
            self.waited_ms
        );
        Tick::Pending
    }

    /// Give up on the current cycle, republishing the last good sample as stale.
    pub(crate) fn skip_cycle<S: Sink>(&mut self, sink: &mut S, reason: SkipReason) -> Tick {
        log::warn!("Skipping measurement cycle {}: {}", self.cycle, reason);
        self.state = DriverState::Idle;

        let stale_published = match self.last {
            Some(last) => {
                publish_sample(sink, self.config.outputs, None, &last, true);
                true
            }
            None => false,
        };

        Tick::Skipped {
            reason,
            stale_published,
        }
    }

    pub(crate) fn raw_sample(
        &self,
        status: u8,
        counts: [u16; 3],
        temperature: Option<u16>,
        outconv: Option<u32>,
    ) -> RawSample {
        RawSample {
            uva: counts[0],
            uvb: counts[1],
            uvc: counts[2],
            temperature,
            outconv,
            overflow: status & (STATUS_ADCOF | STATUS_MRESOF) != 0,
            timestamp: self.cycle,
        }
    }

    /// Convert and publish a successfully read sample, then pick the range
    /// for the next cycle.
    pub(crate) fn complete_cycle<S: Sink>(&mut self, raw: RawSample, sink: &mut S) -> Tick {
        let sample = convert(raw, &self.config);

        log::debug!(
            "Counts A:{} B:{} C:{} | W/m² A:{} B:{} C:{} | UVI {}",
            raw.uva,
            raw.uvb,
            raw.uvc,
            sample.uva,
            sample.uvb,
            sample.uvc,
            sample.uv_index
        );

        if sample.saturated {
            let warning = SaturationWarning {
                gain_code: self.config.gain_code,
                integration_time_code: self.config.integration_time_code,
                device_overflow: raw.overflow,
            };
            log::warn!("AS7331 {}", warning);
            sink.saturation(warning);
        }

        publish_sample(sink, self.config.outputs, Some(&raw), &sample, false);
        self.last = Some(sample);

        if self.auto_range(&raw) {
            self.reconfigure = true;
        }

        self.state = DriverState::Idle;
        Tick::Published(sample)
    }

    /// Move gain or integration time one table step towards a usable range.
    ///
    /// Returns true if the configuration changed.
    pub(crate) fn auto_range(&mut self, raw: &RawSample) -> bool {
        let config = &mut self.config;
        if !config.auto_gain && !config.auto_integration_time {
            return false;
        }

        // The integration time of a sync-duration measurement is set by SYN.
        let time_adjustable = config.auto_integration_time
            && config.measurement_mode != MeasurementMode::SyncDuration;
        // The divider scales counts down on chip.
        let undivided_peak = raw.peak() as u32 * config.divider_factor() as u32;
        let underranged =
            undivided_peak * 100 < config.full_scale_counts() as u32 * UNDERRANGE_PERCENT;

        let changed = if raw.is_saturated() {
            if config.auto_gain && config.gain_code < MAX_GAIN_CODE {
                config.gain_code += 1;
                true
            } else if time_adjustable && config.integration_time_code > 0 {
                config.integration_time_code -= 1;
                true
            } else {
                false
            }
        } else if underranged {
            if config.auto_gain && config.gain_code > 0 {
                config.gain_code -= 1;
                true
            } else if time_adjustable
                && config.integration_time_code < config.max_auto_integration_time_code
            {
                config.integration_time_code += 1;
                true
            } else {
                false
            }
        } else {
            false
        };

        if changed {
            log::debug!(
                "Auto-range -> gain={}x time={} ms",
                config.gain(),
                config.integration_time_ms()
            );
        }
        changed
    }

    /// Record that the configuration has to be rewritten before the next cycle.
    fn request_reconfigure(&mut self) {
        self.reconfigure = matches!(
            self.state,
            DriverState::Idle | DriverState::AwaitingConversion
        );
    }

    pub(crate) fn set_measurement_enabled(&mut self, enabled: bool) {
        if self.config.measurement_enabled != enabled {
            log::info!(
                "Measurement {}",
                if enabled { "enabled" } else { "disabled" }
            );
            self.config.measurement_enabled = enabled;
            self.request_reconfigure();
        }
    }

    pub(crate) fn set_divider_enabled(&mut self, enabled: bool) {
        if self.config.divider_enabled != enabled {
            log::info!("Divider {}", if enabled { "enabled" } else { "disabled" });
            self.config.divider_enabled = enabled;
            self.request_reconfigure();
        }
    }

    pub(crate) fn switch_state(&self, feature: SwitchFeature) -> bool {
        match feature {
            SwitchFeature::Measurement => self.config.measurement_enabled,
            SwitchFeature::Divider => self.config.divider_enabled,
        }
    }

    pub(crate) fn apply_switch(&mut self, feature: SwitchFeature, on: bool) {
        match feature {
            SwitchFeature::Measurement => self.set_measurement_enabled(on),
            SwitchFeature::Divider => self.set_divider_enabled(on),
        }
    }

    /// Store averaged dark counts from `collected` samples.
    pub(crate) fn finish_dark_calibration(
        &mut self,
        sums: [u32; 3],
        collected: u8,
    ) -> core::result::Result<[u16; 3], CalibrationError> {
        if collected < MIN_DARK_SAMPLES {
            log::warn!(
                "Dark offset calibration skipped ({} samples collected)",
                collected
            );
            return Err(CalibrationError::InsufficientSamples { collected });
        }

        let offsets = sums.map(|sum| (sum / collected as u32) as u16);
        log::info!(
            "Dark offset calibrated: UVA={} UVB={} UVC={} counts",
            offsets[0],
            offsets[1],
            offsets[2]
        );
        self.config.dark_offsets = offsets;
        Ok(offsets)
    }
}

/// Run `transaction` up to [`RETRY_ATTEMPTS`] times with exponential backoff.
fn with_retry<T, D>(delay: &mut D, mut transaction: impl FnMut() -> Result<T>) -> Result<T>
where
    D: embedded_hal::blocking::delay::DelayMs<u32>,
{
    let mut attempt = 0;
    loop {
        match transaction() {
            Ok(value) => return Ok(value),
            Err(error) if attempt + 1 < RETRY_ATTEMPTS => {
                log::warn!("{}, retrying", error);
                delay.delay_ms(backoff_ms(attempt));
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Represents an I2C-connected AS7331 sensor.
#[derive(Debug)]
pub struct AS7331<I2C, D> {
    /// Marker to satisfy the compiler.
    _delay: PhantomData<D>,

    /// Register access over the owned bus handle.
    registers: Registers<I2C>,

    lifecycle: Lifecycle,
}

impl<I2C, D> AS7331<I2C, D> {
    /// Creates a driver for the AS7331 at `address` without touching the bus.
    pub fn new(i2c: I2C, address: u8, config: DeviceConfig) -> Self {
        Self {
            _delay: PhantomData,
            registers: Registers::new(i2c, address),
            lifecycle: Lifecycle::new(config),
        }
    }

    pub fn state(&self) -> DriverState {
        self.lifecycle.state
    }

    /// The active configuration, including auto-range adjustments.
    pub fn config(&self) -> &DeviceConfig {
        &self.lifecycle.config
    }

    /// The most recent successfully converted sample.
    pub fn last_sample(&self) -> Option<&PhysicalSample> {
        self.lifecycle.last.as_ref()
    }

    /// Device id and mutation number read during setup.
    pub fn device_id(&self) -> Option<(u8, u8)> {
        self.lifecycle.device_id
    }

    /// Start or stop measuring. Applied at the next tick.
    pub fn set_measurement_enabled(&mut self, enabled: bool) {
        self.lifecycle.set_measurement_enabled(enabled);
    }

    /// Enable or disable the output divider. Applied at the next tick.
    pub fn set_divider_enabled(&mut self, enabled: bool) {
        self.lifecycle.set_divider_enabled(enabled);
    }

    /// Give back the bus handle.
    pub fn release(self) -> I2C {
        self.registers.release()
    }
}

impl<I2C, D> AS7331<I2C, D>
where
    D: embedded_hal::blocking::delay::DelayMs<u32>,
    I2C: embedded_hal::blocking::i2c::Write + embedded_hal::blocking::i2c::WriteRead,
{
    /// Applies the configuration and starts measuring.
    ///
    /// After a failure the driver stays in [`DriverState::Error`] and further
    /// calls return [`SetupError::Faulted`] until [`AS7331::reset`] is called.
    pub fn setup(&mut self, delay: &mut D) -> core::result::Result<(), SetupError> {
        match self.lifecycle.state {
            DriverState::Error => return Err(SetupError::Faulted),
            DriverState::Uninitialized => {}
            _ => return Ok(()),
        }

        log::info!("Setting up AS7331 at 0x{:02X}", self.registers.address());
        self.configure(delay, true).map_err(|error| {
            self.lifecycle.setup_failed(error);
            error
        })
    }

    /// Software-resets the device and runs setup again.
    ///
    /// This is the only way out of [`DriverState::Error`].
    pub fn reset(&mut self, delay: &mut D) -> core::result::Result<(), SetupError> {
        log::info!("Resetting AS7331");
        if let Err(error) = self
            .registers
            .write_register(REG_OSR, OSR_SW_RES | OSR_DOS_CONFIG)
        {
            log::warn!("Software reset failed: {}", error);
        }
        delay.delay_ms(STATE_SWITCH_DELAY_MS);

        self.lifecycle.state = DriverState::Uninitialized;
        self.lifecycle.last = None;
        self.setup(delay)
    }

    /// Runs one step of the measurement cycle and publishes the outcome to `sink`.
    pub fn poll_tick<S: Sink>(&mut self, delay: &mut D, sink: &mut S) -> Tick {
        match self.lifecycle.state {
            DriverState::Uninitialized => return Tick::NotSetUp,
            DriverState::Error => return Tick::Faulted,
            _ => {}
        }

        if self.lifecycle.reconfigure {
            if let Err(error) = self.configure(delay, false) {
                self.lifecycle.setup_failed(error);
                return Tick::Faulted;
            }
        }

        if !self.lifecycle.config.measurement_enabled {
            return Tick::Disabled;
        }

        if self.lifecycle.state == DriverState::Idle {
            self.lifecycle.begin_cycle();
            if self.lifecycle.config.measurement_mode == MeasurementMode::Command {
                let registers = &mut self.registers;
                if let Err(error) =
                    with_retry(delay, || registers.write_register(REG_OSR, OSR_START))
                {
                    return self.lifecycle.skip_cycle(sink, SkipReason::Bus(error));
                }
            }
            self.lifecycle.state = DriverState::AwaitingConversion;
        }

        let status = match self.await_conversion(delay) {
            Ok(Some(status)) => status,
            Ok(None) => return self.lifecycle.conversion_pending(sink),
            Err(error) => return self.lifecycle.skip_cycle(sink, SkipReason::Bus(error)),
        };

        self.lifecycle.state = DriverState::ReadingOut;
        match self.read_out(delay, status) {
            Ok(raw) => self.lifecycle.complete_cycle(raw, sink),
            Err(error) => self.lifecycle.skip_cycle(sink, SkipReason::Bus(error)),
        }
    }

    /// Averages `samples` dark measurements into per-channel offsets.
    ///
    /// The sensor must be covered. Blocks for the whole calibration.
    pub fn calibrate_dark_offset(
        &mut self,
        delay: &mut D,
        samples: u8,
    ) -> core::result::Result<[u16; 3], CalibrationError> {
        if self.lifecycle.state != DriverState::Idle || !self.lifecycle.config.measurement_enabled
        {
            return Err(CalibrationError::NotMeasuring);
        }

        let mut sums = [0u32; 3];
        let mut collected = 0u8;

        for _ in 0..samples {
            match self.dark_sample(delay) {
                Ok(Some(counts)) => {
                    for (sum, count) in sums.iter_mut().zip(counts) {
                        *sum += count as u32;
                    }
                    collected += 1;
                }
                Ok(None) => {}
                Err(error) => log::warn!("Dark sample failed: {}", error),
            }
            delay.delay_ms(DARK_SAMPLE_INTERVAL_MS);
        }

        self.lifecycle.finish_dark_calibration(sums, collected)
    }

    fn dark_sample(&mut self, delay: &mut D) -> Result<Option<[u16; 3]>> {
        let registers = &mut self.registers;
        if self.lifecycle.config.measurement_mode == MeasurementMode::Command {
            with_retry(delay, || registers.write_register(REG_OSR, OSR_START))?;
            self.lifecycle.waited_ms = 0;
            delay.delay_ms(self.lifecycle.remaining_conversion_ms());
        }

        let status = with_retry(delay, || registers.read_status())?;
        if status & STATUS_NDATA == 0 {
            return Ok(None);
        }
        self.read_counts(delay).map(Some)
    }

    /// Writes the whole configuration, verifying every register, and
    /// returns to measurement state.
    fn configure(
        &mut self,
        delay: &mut D,
        identify: bool,
    ) -> core::result::Result<(), SetupError> {
        self.lifecycle.state = DriverState::Configuring;

        let registers = &mut self.registers;
        with_retry(delay, || registers.write_register(REG_OSR, OSR_DOS_CONFIG))?;
        delay.delay_ms(STATE_SWITCH_DELAY_MS);

        if identify {
            let agen = with_retry(delay, || registers.read_config_register(REG_AGEN))?;
            self.lifecycle.check_identity(agen)?;
        }

        for (register, value) in config_registers(&self.lifecycle.config) {
            self.write_verified(delay, register, value)?;
        }

        let registers = &mut self.registers;
        with_retry(delay, || {
            registers.write_register(REG_OSR, OSR_DOS_MEASUREMENT)
        })?;
        delay.delay_ms(STATE_SWITCH_DELAY_MS);

        if let Some(osr) = self.lifecycle.start_osr() {
            with_retry(delay, || registers.write_register(REG_OSR, osr))?;
            log::info!("Measurement running");
        }

        self.lifecycle.configured();
        Ok(())
    }

    /// Writes a configuration register and reads it back, retrying the pair.
    fn write_verified(
        &mut self,
        delay: &mut D,
        register: u8,
        value: u8,
    ) -> core::result::Result<(), SetupError> {
        let mut attempt = 0;
        loop {
            let error = match self
                .registers
                .write_register(register, value)
                .and_then(|_| self.registers.read_config_register(register))
            {
                Ok(actual) if actual == value => return Ok(()),
                Ok(actual) => SetupError::VerifyMismatch {
                    register,
                    expected: value,
                    actual,
                },
                Err(error) => SetupError::Bus(error),
            };

            if attempt + 1 >= RETRY_ATTEMPTS {
                return Err(error);
            }
            log::warn!("{}, retrying", error);
            delay.delay_ms(backoff_ms(attempt));
            attempt += 1;
        }
    }

    /// Waits for NDATA within the wait budget.
    ///
    /// Returns the STATUS byte once new data is available, `None` if the
    /// budget ran out first.
    fn await_conversion(&mut self, delay: &mut D) -> Result<Option<u8>> {
        let budget = self.lifecycle.config.wait_budget_ms;

        let mut spent = self.lifecycle.remaining_conversion_ms().min(budget);
        if spent > 0 {
            delay.delay_ms(spent);
            self.lifecycle.waited_ms += spent;
        }

        loop {
            let registers = &mut self.registers;
            let status = with_retry(delay, || registers.read_status())?;
            if status & STATUS_NDATA != 0 {
                return Ok(Some(status));
            }
            if spent + READY_POLL_MS > budget {
                return Ok(None);
            }
            delay.delay_ms(READY_POLL_MS);
            spent += READY_POLL_MS;
            self.lifecycle.waited_ms += READY_POLL_MS;
        }
    }

    fn read_counts(&mut self, delay: &mut D) -> Result<[u16; 3]> {
        let registers = &mut self.registers;
        let uva = with_retry(delay, || registers.read_register(REG_MRES1))?;
        let uvb = with_retry(delay, || registers.read_register(REG_MRES2))?;
        let uvc = with_retry(delay, || registers.read_register(REG_MRES3))?;
        Ok([uva, uvb, uvc])
    }

    fn read_out(&mut self, delay: &mut D, status: u8) -> Result<RawSample> {
        let counts = self.read_counts(delay)?;

        let registers = &mut self.registers;
        let temperature = if self.lifecycle.config.temperature_enabled() {
            Some(with_retry(delay, || registers.read_register(REG_TEMP))?)
        } else {
            None
        };

        let outconv = if self.lifecycle.config.outconv_needed() {
            Some(with_retry(delay, || registers.read_outconv())?)
        } else {
            None
        };

        Ok(self
            .lifecycle
            .raw_sample(status, counts, temperature, outconv))
    }
}

impl<I2C, D> SwitchTarget for AS7331<I2C, D> {
    fn switch_state(&self, feature: SwitchFeature) -> bool {
        self.lifecycle.switch_state(feature)
    }

    fn apply_switch(&mut self, feature: SwitchFeature, on: bool) {
        self.lifecycle.apply_switch(feature, on);
    }
}
