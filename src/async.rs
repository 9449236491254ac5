//! Async API
//!
//! This module contains the async variant of the polling driver. It shares
//! the lifecycle, auto-ranging and publication logic with [`crate::AS7331`]
//! and only differs in how bus transactions and delays are awaited.

use core::marker::PhantomData;

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::config::{DeviceConfig, MeasurementMode};
use crate::conversion::{PhysicalSample, RawSample};
use crate::driver::{
    backoff_ms, config_registers, DriverState, Lifecycle, SetupError, SkipReason, Tick, OSR_START,
    RETRY_ATTEMPTS, READY_POLL_MS, STATE_SWITCH_DELAY_MS,
};
use crate::registers::{
    outconv_from_parts, OSR_DOS_CONFIG, OSR_DOS_MEASUREMENT, OSR_SW_RES, REG_AGEN, REG_MRES1,
    REG_MRES2, REG_MRES3, REG_OSR, REG_OUTCONV_H, REG_OUTCONV_L, REG_TEMP, STATUS_NDATA,
};
use crate::sink::Sink;
use crate::switch::{SwitchFeature, SwitchTarget};
use crate::{BusError, Result};

/// A single register transfer.
#[derive(Copy, Clone, Debug)]
enum Access {
    /// Write an 8 bit register.
    Write { register: u8, data: u8 },
    /// Read a 16 bit register (measurement state).
    Read { register: u8 },
    /// Read an 8 bit register (configuration state).
    ReadConfig { register: u8 },
}

/// Represents an I2C-connected AS7331 sensor driven by an async executor.
#[derive(Debug)]
pub struct AS7331Async<I2C, D> {
    /// Marker to satisfy the compiler.
    _delay: PhantomData<D>,
    i2c: I2C,
    address: u8,
    lifecycle: Lifecycle,
}

impl<I2C, D> AS7331Async<I2C, D> {
    /// Creates a driver for the AS7331 at `address` without touching the bus.
    pub fn new(i2c: I2C, address: u8, config: DeviceConfig) -> Self {
        Self {
            _delay: PhantomData,
            i2c,
            address,
            lifecycle: Lifecycle::new(config),
        }
    }

    pub fn state(&self) -> DriverState {
        self.lifecycle.state
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.lifecycle.config
    }

    pub fn last_sample(&self) -> Option<&PhysicalSample> {
        self.lifecycle.last.as_ref()
    }

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

    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C, D> AS7331Async<I2C, D>
where
    D: DelayNs,
    I2C: I2c<SevenBitAddress>,
{
    /// Applies the configuration and starts measuring.
    ///
    /// See [`crate::AS7331::setup`].
    pub async fn setup(&mut self, delay: &mut D) -> core::result::Result<(), SetupError> {
        match self.lifecycle.state {
            DriverState::Error => return Err(SetupError::Faulted),
            DriverState::Uninitialized => {}
            _ => return Ok(()),
        }

        log::info!("Setting up AS7331 at 0x{:02X}", self.address);
        let result = self.configure(delay, true).await;
        if let Err(error) = result {
            self.lifecycle.setup_failed(error);
        }
        result
    }

    /// Software-resets the device and runs setup again.
    pub async fn reset(&mut self, delay: &mut D) -> core::result::Result<(), SetupError> {
        log::info!("Resetting AS7331");
        let reset = Access::Write {
            register: REG_OSR,
            data: OSR_SW_RES | OSR_DOS_CONFIG,
        };
        if let Err(error) = self.transfer(reset).await {
            log::warn!("Software reset failed: {}", error);
        }
        delay.delay_ms(STATE_SWITCH_DELAY_MS).await;

        self.lifecycle.state = DriverState::Uninitialized;
        self.lifecycle.last = None;
        self.setup(delay).await
    }

    /// Runs one step of the measurement cycle and publishes the outcome to `sink`.
    ///
    /// See [`crate::AS7331::poll_tick`].
    pub async fn poll_tick<S: Sink>(&mut self, delay: &mut D, sink: &mut S) -> Tick {
        match self.lifecycle.state {
            DriverState::Uninitialized => return Tick::NotSetUp,
            DriverState::Error => return Tick::Faulted,
            _ => {}
        }

        if self.lifecycle.reconfigure {
            if let Err(error) = self.configure(delay, false).await {
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
                if let Err(error) = self.write_register(delay, REG_OSR, OSR_START).await {
                    return self.lifecycle.skip_cycle(sink, SkipReason::Bus(error));
                }
            }
            self.lifecycle.state = DriverState::AwaitingConversion;
        }

        let status = match self.await_conversion(delay).await {
            Ok(Some(status)) => status,
            Ok(None) => return self.lifecycle.conversion_pending(sink),
            Err(error) => return self.lifecycle.skip_cycle(sink, SkipReason::Bus(error)),
        };

        self.lifecycle.state = DriverState::ReadingOut;
        match self.read_out(delay, status).await {
            Ok(raw) => self.lifecycle.complete_cycle(raw, sink),
            Err(error) => self.lifecycle.skip_cycle(sink, SkipReason::Bus(error)),
        }
    }

    async fn configure(
        &mut self,
        delay: &mut D,
        identify: bool,
    ) -> core::result::Result<(), SetupError> {
        self.lifecycle.state = DriverState::Configuring;

        self.write_register(delay, REG_OSR, OSR_DOS_CONFIG).await?;
        delay.delay_ms(STATE_SWITCH_DELAY_MS).await;

        if identify {
            let agen = self.retry(delay, Access::ReadConfig { register: REG_AGEN }).await? as u8;
            self.lifecycle.check_identity(agen)?;
        }

        for (register, value) in config_registers(&self.lifecycle.config) {
            self.write_verified(delay, register, value).await?;
        }

        self.write_register(delay, REG_OSR, OSR_DOS_MEASUREMENT)
            .await?;
        delay.delay_ms(STATE_SWITCH_DELAY_MS).await;

        if let Some(osr) = self.lifecycle.start_osr() {
            self.write_register(delay, REG_OSR, osr).await?;
            log::info!("Measurement running");
        }

        self.lifecycle.configured();
        Ok(())
    }

    async fn write_verified(
        &mut self,
        delay: &mut D,
        register: u8,
        value: u8,
    ) -> core::result::Result<(), SetupError> {
        let mut attempt = 0;
        loop {
            let written = self.transfer(Access::Write { register, data: value }).await;
            let error = match written {
                Ok(_) => match self.transfer(Access::ReadConfig { register }).await {
                    Ok(actual) if actual as u8 == value => return Ok(()),
                    Ok(actual) => SetupError::VerifyMismatch {
                        register,
                        expected: value,
                        actual: actual as u8,
                    },
                    Err(error) => SetupError::Bus(error),
                },
                Err(error) => SetupError::Bus(error),
            };

            if attempt + 1 >= RETRY_ATTEMPTS {
                return Err(error);
            }
            log::warn!("{}, retrying", error);
            delay.delay_ms(backoff_ms(attempt)).await;
            attempt += 1;
        }
    }

    async fn await_conversion(&mut self, delay: &mut D) -> Result<Option<u8>> {
        let budget = self.lifecycle.config.wait_budget_ms;

        let mut spent = self.lifecycle.remaining_conversion_ms().min(budget);
        if spent > 0 {
            delay.delay_ms(spent).await;
            self.lifecycle.waited_ms += spent;
        }

        loop {
            let status = (self.read_register(delay, REG_OSR).await? >> 8) as u8;
            if status & STATUS_NDATA != 0 {
                return Ok(Some(status));
            }
            if spent + READY_POLL_MS > budget {
                return Ok(None);
            }
            delay.delay_ms(READY_POLL_MS).await;
            spent += READY_POLL_MS;
            self.lifecycle.waited_ms += READY_POLL_MS;
        }
    }

    async fn read_out(&mut self, delay: &mut D, status: u8) -> Result<RawSample> {
        let counts = [
            self.read_register(delay, REG_MRES1).await?,
            self.read_register(delay, REG_MRES2).await?,
            self.read_register(delay, REG_MRES3).await?,
        ];

        let temperature = if self.lifecycle.config.temperature_enabled() {
            Some(self.read_register(delay, REG_TEMP).await?)
        } else {
            None
        };

        let outconv = if self.lifecycle.config.outconv_needed() {
            let low = self.read_register(delay, REG_OUTCONV_L).await?;
            let high = self.read_register(delay, REG_OUTCONV_H).await?;
            Some(outconv_from_parts(low, high))
        } else {
            None
        };

        Ok(self
            .lifecycle
            .raw_sample(status, counts, temperature, outconv))
    }

    async fn write_register(&mut self, delay: &mut D, register: u8, data: u8) -> Result<()> {
        self.retry(delay, Access::Write { register, data })
            .await
            .map(|_| ())
    }

    async fn read_register(&mut self, delay: &mut D, register: u8) -> Result<u16> {
        self.retry(delay, Access::Read { register }).await
    }

    /// Run `access` up to three times with exponential backoff.
    async fn retry(&mut self, delay: &mut D, access: Access) -> Result<u16> {
        let mut attempt = 0;
        loop {
            match self.transfer(access).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < RETRY_ATTEMPTS => {
                    log::warn!("{}, retrying", error);
                    delay.delay_ms(backoff_ms(attempt)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One bus transaction. 8 bit reads are widened to `u16`.
    async fn transfer(&mut self, access: Access) -> Result<u16> {
        match access {
            Access::Write { register, data } => {
                self.i2c
                    .write(self.address, &[register, data])
                    .await
                    .map_err(|_| BusError::Write { register })?;
                Ok(0)
            }
            Access::Read { register } => {
                let mut read_data = [0; 2];
                self.i2c
                    .write_read(self.address, &[register], &mut read_data)
                    .await
                    .map_err(|_| BusError::Read { register })?;
                Ok(u16::from_le_bytes(read_data))
            }
            Access::ReadConfig { register } => {
                let mut read_data = [0; 1];
                self.i2c
                    .write_read(self.address, &[register], &mut read_data)
                    .await
                    .map_err(|_| BusError::Read { register })?;
                Ok(read_data[0] as u16)
            }
        }
    }
}

impl<I2C, D> SwitchTarget for AS7331Async<I2C, D> {
    fn switch_state(&self, feature: SwitchFeature) -> bool {
        self.lifecycle.switch_state(feature)
    }

    fn apply_switch(&mut self, feature: SwitchFeature, on: bool) {
        self.lifecycle.apply_switch(feature, on);
    }
}
