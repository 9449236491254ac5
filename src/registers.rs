//! Register level access to the AS7331.
//!
//! The AS7331 has two register banks selected by the DOS field of the OSR
//! register. In configuration state all registers are 8 bit wide, in
//! measurement state the output registers are 16 bit wide and are
//! transferred LSB first.

use crate::{BusError, Result};

/// Operational state register, shared by both states.
pub const REG_OSR: u8 = 0x00;

/// Temperature result (measurement state, 12 bit).
pub const REG_TEMP: u8 = 0x01;

/// UVA result (measurement state).
pub const REG_MRES1: u8 = 0x02;

/// UVB result (measurement state).
pub const REG_MRES2: u8 = 0x03;

/// UVC result (measurement state).
pub const REG_MRES3: u8 = 0x04;

/// Conversion time ticks, bits 15:0 (measurement state).
pub const REG_OUTCONV_L: u8 = 0x05;

/// Conversion time ticks, bits 23:16 (measurement state).
pub const REG_OUTCONV_H: u8 = 0x06;

/// Device id and mutation number (configuration state).
pub const REG_AGEN: u8 = 0x02;

/// Gain and integration time (configuration state).
pub const REG_CREG1: u8 = 0x06;

/// Temperature enable and output divider (configuration state).
pub const REG_CREG2: u8 = 0x07;

/// Measurement mode, standby, READY pin and clock (configuration state).
pub const REG_CREG3: u8 = 0x08;

/// Pause between two measurements in continuous mode, 8 us steps (configuration state).
pub const REG_BREAK: u8 = 0x09;

/// Number of SYN falling edges ending a measurement in sync-duration mode (configuration state).
pub const REG_EDGES: u8 = 0x0A;

/// OSR: start measurement.
pub const OSR_SS: u8 = 0x80;
/// OSR: power down.
pub const OSR_PD: u8 = 0x40;
/// OSR: software reset.
pub const OSR_SW_RES: u8 = 0x08;
/// OSR: device operating state "configuration".
pub const OSR_DOS_CONFIG: u8 = 0x02;
/// OSR: device operating state "measurement".
pub const OSR_DOS_MEASUREMENT: u8 = 0x03;

/// STATUS: conversion time counter overflowed.
pub const STATUS_OUTCONVOF: u8 = 0x80;
/// STATUS: a result register overflowed.
pub const STATUS_MRESOF: u8 = 0x40;
/// STATUS: an ADC was overdriven.
pub const STATUS_ADCOF: u8 = 0x20;
/// STATUS: results were overwritten before being read.
pub const STATUS_LDATA: u8 = 0x10;
/// STATUS: new results are available.
pub const STATUS_NDATA: u8 = 0x08;
/// STATUS: a measurement is in progress.
pub const STATUS_NOTREADY: u8 = 0x04;

/// CREG2: enable the temperature measurement.
pub const CREG2_EN_TM: u8 = 0x40;
/// CREG2: enable the output divider.
pub const CREG2_EN_DIV: u8 = 0x08;

/// Expected value of the DEVID nibble in the AGEN register.
pub const AGEN_DEVID: u8 = 0x2;

/// Transactional access to the registers of one AS7331 on an I2C bus.
///
/// Every call is exactly one bus transaction and blocks until the bus
/// implementation returns. Failed transactions are reported, never retried.
#[derive(Debug)]
pub struct Registers<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C> Registers<I2C> {
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Give back the bus handle.
    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C> Registers<I2C>
where
    I2C: embedded_hal::blocking::i2c::Write + embedded_hal::blocking::i2c::WriteRead,
{
    /// Writes a new value to an 8 bit register.
    pub fn write_register(&mut self, register: u8, data: u8) -> Result<()> {
        self.i2c
            .write(self.address, &[register, data])
            .map_err(|_| BusError::Write { register })
    }

    /// Reads a 16 bit register (measurement state).
    pub fn read_register(&mut self, register: u8) -> Result<u16> {
        let mut read_data = [0; 2];

        self.i2c
            .write_read(self.address, &[register], &mut read_data)
            .map_err(|_| BusError::Read { register })?;

        Ok(u16::from_le_bytes(read_data))
    }

    /// Reads an 8 bit register (configuration state).
    pub fn read_config_register(&mut self, register: u8) -> Result<u8> {
        let mut read_data = [0; 1];

        self.i2c
            .write_read(self.address, &[register], &mut read_data)
            .map_err(|_| BusError::Read { register })?;

        Ok(read_data[0])
    }

    /// Reads the STATUS byte, which the device returns as the upper half of OSR
    /// while in measurement state.
    pub fn read_status(&mut self) -> Result<u8> {
        let osr_status = self.read_register(REG_OSR)?;
        Ok((osr_status >> 8) as u8)
    }

    /// Reads the 24 bit OUTCONV tick counter.
    pub fn read_outconv(&mut self) -> Result<u32> {
        let low = self.read_register(REG_OUTCONV_L)?;
        let high = self.read_register(REG_OUTCONV_H)?;
        Ok(outconv_from_parts(low, high))
    }
}

/// Assemble the OUTCONV tick counter from its two result registers.
pub(crate) fn outconv_from_parts(low: u16, high: u16) -> u32 {
    ((high as u32 & 0xFF) << 16) | low as u32
}

/// Split the AGEN register into device id and mutation number.
pub(crate) fn split_agen(agen: u8) -> (u8, u8) {
    (agen >> 4, agen & 0x0F)
}
