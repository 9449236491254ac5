//! Device configuration model.
//!
//! [`RawOptions`] carries the operating parameters in human units (gain
//! multiplier, milliseconds, kHz, divider factor) as a host hands them over.
//! [`DeviceConfig::build`] validates all of them at once and encodes them
//! into the register codes the driver writes.
//!
//! The tables below describe the `AS7331` silicon revision: a 12 entry gain
//! table (code 0 = 2048x ... code 11 = 1x) and a 15 entry integration time
//! table (code 0 = 1 ms ... code 14 = 16384 ms at 1.024 MHz). TIME code 15
//! aliases 1 ms on silicon and is never produced.

use crate::registers::{CREG2_EN_DIV, CREG2_EN_TM};
use crate::sink::{Channel, Outputs};

/// Gain multipliers indexed by gain code.
pub const GAIN_TABLE: [u16; 12] = [2048, 1024, 512, 256, 128, 64, 32, 16, 8, 4, 2, 1];

/// Nominal integration time in ms at 1.024 MHz, indexed by time code.
pub const TIME_TABLE_MS: [u16; 15] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Largest valid gain code.
pub const MAX_GAIN_CODE: u8 = GAIN_TABLE.len() as u8 - 1;

/// Largest valid integration time code.
pub const MAX_TIME_CODE: u8 = TIME_TABLE_MS.len() as u8 - 1;

/// Largest valid divider code (factor 256).
pub const MAX_DIVIDER_CODE: u8 = 7;

/// Encode a gain multiplier into its register code, `code = log2(2048 / gain)`.
///
/// Returns `None` unless `gain` is a power of two between 1 and 2048.
pub fn gain_code_from_multiplier(gain: u16) -> Option<u8> {
    if gain == 0 || !gain.is_power_of_two() || gain > GAIN_TABLE[0] {
        return None;
    }
    Some((GAIN_TABLE[0] / gain).trailing_zeros() as u8)
}

/// Decode a gain register code into its multiplier.
pub fn gain_multiplier(code: u8) -> Option<u16> {
    GAIN_TABLE.get(code as usize).copied()
}

/// Encode a nominal integration time into its register code, `code = log2(ms)`.
pub fn time_code_from_ms(time_ms: u16) -> Option<u8> {
    if time_ms == 0 || !time_ms.is_power_of_two() {
        return None;
    }
    let code = time_ms.trailing_zeros() as u8;
    (code <= MAX_TIME_CODE).then_some(code)
}

/// Encode a divider factor (2..=256) into its register code, `code = log2(factor) - 1`.
pub fn divider_code_from_factor(factor: u16) -> Option<u8> {
    if factor < 2 || !factor.is_power_of_two() {
        return None;
    }
    let code = factor.trailing_zeros() as u8 - 1;
    (code <= MAX_DIVIDER_CODE).then_some(code)
}

/// Conversion clock frequency (CREG3.CCLK).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConversionClock {
    Mhz1_024 = 0x0,
    Mhz2_048 = 0x1,
    Mhz4_096 = 0x2,
    Mhz8_192 = 0x3,
}

impl ConversionClock {
    /// Map a frequency in kHz onto one of the four supported clocks.
    pub fn from_khz(khz: u32) -> Option<Self> {
        match khz {
            1024 => Some(Self::Mhz1_024),
            2048 => Some(Self::Mhz2_048),
            4096 => Some(Self::Mhz4_096),
            8192 => Some(Self::Mhz8_192),
            _ => None,
        }
    }

    pub fn khz(self) -> u32 {
        1024 << self as u32
    }

    pub fn into_reg_value(self) -> u8 {
        self as u8
    }
}

/// Measurement mode (CREG3.MMODE).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MeasurementMode {
    /// The device measures back to back, separated by BREAK.
    Continuous = 0x0,
    /// Every measurement is started by a write of OSR.SS.
    Command = 0x1,
    /// A measurement is started by a falling edge on SYN.
    SyncStart = 0x2,
    /// A measurement is started and ended by falling edges on SYN.
    SyncDuration = 0x3,
}

impl MeasurementMode {
    pub fn into_reg_value(self) -> u8 {
        self as u8
    }
}

/// Named starting points for gain and integration time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    /// Use the gain and integration time given in [`RawOptions`].
    Custom,
    /// Very sensitive: 2048x, 128 ms.
    Indoor,
    /// Direct sunlight: 32x, 16 ms.
    Outdoor,
    /// Close to a UV lamp: 256x, 4 ms.
    UvLamp,
}

impl Profile {
    /// Gain multiplier and integration time in ms for this profile.
    fn gain_and_time(self) -> Option<(u16, u16)> {
        match self {
            Profile::Custom => None,
            Profile::Indoor => Some((2048, 128)),
            Profile::Outdoor => Some((32, 16)),
            Profile::UvLamp => Some((256, 4)),
        }
    }
}

/// Per-channel multipliers applied on top of the datasheet responsivity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub uva: f32,
    pub uvb: f32,
    pub uvc: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            uva: 1.0,
            uvb: 1.0,
            uvc: 1.0,
        }
    }
}

/// Erythemal weights of UVA and UVB irradiance used for the UV index.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UvIndexWeights {
    pub uva: f32,
    pub uvb: f32,
}

impl Default for UvIndexWeights {
    fn default() -> Self {
        Self {
            uva: 0.0025,
            uvb: 0.0100,
        }
    }
}

/// Unvalidated operating parameters in human units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RawOptions {
    pub profile: Profile,
    /// Gain multiplier, power of two between 1 and 2048.
    pub gain: u16,
    /// Integration time in ms at 1.024 MHz, power of two between 1 and 16384.
    /// The real duration scales down with a faster conversion clock.
    pub integration_time_ms: u16,
    /// Conversion clock in kHz: 1024, 2048, 4096 or 8192.
    pub conversion_clock_khz: u32,
    pub measurement_mode: MeasurementMode,
    /// Output divider factor (2..=256), `None` keeps the divider disabled.
    pub divider: Option<u16>,
    pub auto_gain: bool,
    pub auto_integration_time: bool,
    /// Longest integration time auto ranging may select, in ms at 1.024 MHz.
    pub max_auto_integration_time_ms: u16,
    pub calibration: Calibration,
    pub uv_index_weights: UvIndexWeights,
    /// Pause between continuous measurements in 8 us steps.
    pub break_time: u8,
    /// SYN falling edges per measurement in sync-duration mode.
    pub sync_edges: u8,
    /// Start measuring right after setup.
    pub measurement_enabled: bool,
    /// Longest time a single poll tick may wait for a conversion, in ms.
    pub wait_budget_ms: u32,
    pub outputs: Outputs,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            profile: Profile::Custom,
            gain: 16,
            integration_time_ms: 64,
            conversion_clock_khz: 1024,
            measurement_mode: MeasurementMode::Continuous,
            divider: None,
            auto_gain: false,
            auto_integration_time: false,
            max_auto_integration_time_ms: 256,
            calibration: Calibration::default(),
            uv_index_weights: UvIndexWeights::default(),
            break_time: 0x19,
            sync_edges: 1,
            measurement_enabled: true,
            wait_budget_ms: 100,
            outputs: Outputs::DEFAULT,
        }
    }
}

/// A field of [`RawOptions`] that failed validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigField {
    Gain,
    IntegrationTime,
    ConversionClock,
    Divider,
    MaxAutoIntegrationTime,
    CalibrationUva,
    CalibrationUvb,
    CalibrationUvc,
    UvIndexWeightUva,
    UvIndexWeightUvb,
    SyncEdges,
}

/// Why a field failed validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigReason {
    /// The value must be a power of two.
    NotPowerOfTwo,
    /// The value is outside of the supported table.
    OutOfRange,
    /// The value is NaN or infinite.
    NotFinite,
    /// The value is below zero.
    Negative,
}

/// One invalid configuration field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub field: ConfigField,
    pub reason: ConfigReason,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {:?}", self.field, self.reason)
    }
}

impl core::error::Error for ConfigError {}

const MAX_CONFIG_ERRORS: usize = 11;

/// Every invalid field found while building a [`DeviceConfig`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigErrors {
    errors: [Option<ConfigError>; MAX_CONFIG_ERRORS],
    len: usize,
}

impl ConfigErrors {
    fn new() -> Self {
        Self {
            errors: [None; MAX_CONFIG_ERRORS],
            len: 0,
        }
    }

    // Each field is checked at most once, so this never runs out of room.
    fn push(&mut self, field: ConfigField, reason: ConfigReason) {
        if let Some(slot) = self.errors.get_mut(self.len) {
            *slot = Some(ConfigError { field, reason });
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.errors[..self.len].iter().flatten()
    }

    /// The error reported for `field`, if any.
    pub fn get(&self, field: ConfigField) -> Option<&ConfigError> {
        self.iter().find(|e| e.field == field)
    }
}

impl core::fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid configuration:")?;
        for error in self.iter() {
            write!(f, " {};", error)?;
        }
        Ok(())
    }
}

impl core::error::Error for ConfigErrors {}

/// Validated operating parameters, encoded as register codes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    /// Index into [`GAIN_TABLE`].
    pub gain_code: u8,
    /// Index into [`TIME_TABLE_MS`].
    pub integration_time_code: u8,
    pub conversion_clock: ConversionClock,
    pub measurement_mode: MeasurementMode,
    pub divider_enabled: bool,
    pub divider_code: u8,
    pub auto_gain: bool,
    pub auto_integration_time: bool,
    pub max_auto_integration_time_code: u8,
    pub calibration: Calibration,
    pub uv_index_weights: UvIndexWeights,
    /// Per-channel dark counts subtracted before conversion (UVA, UVB, UVC).
    pub dark_offsets: [u16; 3],
    pub break_time: u8,
    pub sync_edges: u8,
    pub measurement_enabled: bool,
    pub wait_budget_ms: u32,
    pub outputs: Outputs,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gain_code: 7,
            integration_time_code: 6,
            conversion_clock: ConversionClock::Mhz1_024,
            measurement_mode: MeasurementMode::Continuous,
            divider_enabled: false,
            divider_code: 0,
            auto_gain: false,
            auto_integration_time: false,
            max_auto_integration_time_code: 8,
            calibration: Calibration::default(),
            uv_index_weights: UvIndexWeights::default(),
            dark_offsets: [0; 3],
            break_time: 0x19,
            sync_edges: 1,
            measurement_enabled: true,
            wait_budget_ms: 100,
            outputs: Outputs::DEFAULT,
        }
    }
}

fn check_factor(errors: &mut ConfigErrors, field: ConfigField, value: f32) {
    if !value.is_finite() {
        errors.push(field, ConfigReason::NotFinite);
    } else if value < 0.0 {
        errors.push(field, ConfigReason::Negative);
    }
}

fn power_of_two_reason(value: u16) -> ConfigReason {
    if value != 0 && !value.is_power_of_two() {
        ConfigReason::NotPowerOfTwo
    } else {
        ConfigReason::OutOfRange
    }
}

impl DeviceConfig {
    /// Validate `options` and encode them, reporting every invalid field.
    pub fn build(options: &RawOptions) -> Result<Self, ConfigErrors> {
        let mut errors = ConfigErrors::new();

        let (gain, integration_time_ms) = options
            .profile
            .gain_and_time()
            .unwrap_or((options.gain, options.integration_time_ms));

        let gain_code = gain_code_from_multiplier(gain);
        if gain_code.is_none() {
            errors.push(ConfigField::Gain, power_of_two_reason(gain));
        }

        let integration_time_code = time_code_from_ms(integration_time_ms);
        if integration_time_code.is_none() {
            errors.push(
                ConfigField::IntegrationTime,
                power_of_two_reason(integration_time_ms),
            );
        }

        let conversion_clock = ConversionClock::from_khz(options.conversion_clock_khz);
        if conversion_clock.is_none() {
            errors.push(ConfigField::ConversionClock, ConfigReason::OutOfRange);
        }

        let divider_code = match options.divider {
            None => Some(0),
            Some(factor) => divider_code_from_factor(factor),
        };
        if let (None, Some(factor)) = (divider_code, options.divider) {
            errors.push(ConfigField::Divider, power_of_two_reason(factor));
        }

        let max_auto_integration_time_code =
            time_code_from_ms(options.max_auto_integration_time_ms);
        if max_auto_integration_time_code.is_none() {
            errors.push(
                ConfigField::MaxAutoIntegrationTime,
                power_of_two_reason(options.max_auto_integration_time_ms),
            );
        }

        check_factor(&mut errors, ConfigField::CalibrationUva, options.calibration.uva);
        check_factor(&mut errors, ConfigField::CalibrationUvb, options.calibration.uvb);
        check_factor(&mut errors, ConfigField::CalibrationUvc, options.calibration.uvc);
        check_factor(
            &mut errors,
            ConfigField::UvIndexWeightUva,
            options.uv_index_weights.uva,
        );
        check_factor(
            &mut errors,
            ConfigField::UvIndexWeightUvb,
            options.uv_index_weights.uvb,
        );

        if options.sync_edges == 0 {
            errors.push(ConfigField::SyncEdges, ConfigReason::OutOfRange);
        }

        match (
            gain_code,
            integration_time_code,
            conversion_clock,
            divider_code,
            max_auto_integration_time_code,
        ) {
            (
                Some(gain_code),
                Some(integration_time_code),
                Some(conversion_clock),
                Some(divider_code),
                Some(max_auto_integration_time_code),
            ) if errors.is_empty() => Ok(Self {
                gain_code,
                integration_time_code,
                conversion_clock,
                measurement_mode: options.measurement_mode,
                divider_enabled: options.divider.is_some(),
                divider_code,
                auto_gain: options.auto_gain,
                auto_integration_time: options.auto_integration_time,
                max_auto_integration_time_code,
                calibration: options.calibration,
                uv_index_weights: options.uv_index_weights,
                dark_offsets: [0; 3],
                break_time: options.break_time,
                sync_edges: options.sync_edges,
                measurement_enabled: options.measurement_enabled,
                wait_budget_ms: options.wait_budget_ms,
                outputs: options.outputs,
            }),
            _ => Err(errors),
        }
    }

    /// Gain code clamped into [`GAIN_TABLE`].
    fn gain_index(&self) -> u8 {
        self.gain_code.min(MAX_GAIN_CODE)
    }

    /// Integration time code clamped into [`TIME_TABLE_MS`].
    fn time_index(&self) -> u8 {
        self.integration_time_code.min(MAX_TIME_CODE)
    }

    /// Gain multiplier of the active gain code.
    pub fn gain(&self) -> u16 {
        GAIN_TABLE[self.gain_index() as usize]
    }

    /// Integration time in ms at the active conversion clock.
    pub fn integration_time_ms(&self) -> f32 {
        TIME_TABLE_MS[self.time_index() as usize] as f32 * 1024.0
            / self.conversion_clock.khz() as f32
    }

    /// Integration time rounded up to whole milliseconds.
    pub fn conversion_time_ms(&self) -> u32 {
        let nominal = self.integration_time_ms();
        let whole = nominal as u32;
        if (whole as f32) < nominal {
            whole + 1
        } else {
            whole
        }
    }

    /// Largest count a channel can reach with the active integration time.
    pub fn full_scale_counts(&self) -> u16 {
        let clocks = 1024u32 << self.time_index();
        clocks.min(u16::MAX as u32) as u16
    }

    /// Output divider factor, 1 while the divider is disabled.
    pub fn divider_factor(&self) -> u16 {
        if self.divider_enabled {
            2 << self.divider_code.min(MAX_DIVIDER_CODE)
        } else {
            1
        }
    }

    /// The temperature result is read and published.
    pub fn temperature_enabled(&self) -> bool {
        self.outputs.contains(Channel::Temperature)
    }

    /// The OUTCONV tick counter is needed, either for publication or for
    /// normalising sync-duration measurements.
    pub fn outconv_needed(&self) -> bool {
        self.outputs.contains(Channel::OutConv)
            || self.measurement_mode == MeasurementMode::SyncDuration
    }

    /// CREG1: GAIN(7:4) | TIME(3:0).
    pub fn creg1(&self) -> u8 {
        (self.gain_index() << 4) | self.time_index()
    }

    /// CREG2: EN_TM(6) | EN_DIV(3) | DIV(2:0).
    pub fn creg2(&self) -> u8 {
        let mut creg2 = self.divider_code.min(MAX_DIVIDER_CODE);
        if self.divider_enabled {
            creg2 |= CREG2_EN_DIV;
        }
        if self.temperature_enabled() {
            creg2 |= CREG2_EN_TM;
        }
        creg2
    }

    /// CREG3: MMODE(7:6) | SB(4) = 0 | RDYOD(3) = 0 | CCLK(1:0).
    pub fn creg3(&self) -> u8 {
        (self.measurement_mode.into_reg_value() << 6) | self.conversion_clock.into_reg_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_round_trip() {
        for (code, gain) in GAIN_TABLE.iter().enumerate() {
            let encoded = gain_code_from_multiplier(*gain).unwrap();
            assert_eq!(encoded, code as u8);
            assert_eq!(gain_multiplier(encoded), Some(*gain));
        }

        assert_eq!(gain_code_from_multiplier(128), Some(4));
        assert_eq!(gain_multiplier(4), Some(128));
    }

    #[test]
    fn test_invalid_gain_multipliers() {
        assert_eq!(gain_code_from_multiplier(0), None);
        assert_eq!(gain_code_from_multiplier(3), None);
        assert_eq!(gain_code_from_multiplier(4096), None);
        assert_eq!(gain_multiplier(12), None);
    }

    #[test]
    fn test_time_and_divider_codes() {
        assert_eq!(time_code_from_ms(1), Some(0));
        assert_eq!(time_code_from_ms(64), Some(6));
        assert_eq!(time_code_from_ms(16384), Some(14));
        assert_eq!(time_code_from_ms(32768), None);
        assert_eq!(time_code_from_ms(100), None);

        assert_eq!(divider_code_from_factor(2), Some(0));
        assert_eq!(divider_code_from_factor(256), Some(7));
        assert_eq!(divider_code_from_factor(1), None);
        assert_eq!(divider_code_from_factor(512), None);
    }

    #[test]
    fn test_build_defaults() {
        let config = DeviceConfig::build(&RawOptions::default()).unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.gain(), 16);
        assert_eq!(config.integration_time_ms(), 64.0);
        assert_eq!(config.creg1(), 0x76);
        assert_eq!(config.creg2(), 0x40);
        assert_eq!(config.creg3(), 0x00);
    }

    #[test]
    fn test_build_encodes_registers() {
        let options = RawOptions {
            gain: 128,
            integration_time_ms: 256,
            conversion_clock_khz: 4096,
            measurement_mode: MeasurementMode::Command,
            divider: Some(16),
            outputs: Outputs::NONE,
            ..RawOptions::default()
        };

        let config = DeviceConfig::build(&options).unwrap();
        assert_eq!(config.creg1(), 0x48);
        assert_eq!(config.creg2(), 0x0B);
        assert_eq!(config.creg3(), 0x42);
        assert_eq!(config.divider_factor(), 16);
        assert_eq!(config.integration_time_ms(), 64.0);
    }

    #[test]
    fn test_build_reports_every_invalid_field() {
        let options = RawOptions {
            gain: 3,
            integration_time_ms: 0,
            conversion_clock_khz: 1000,
            divider: Some(1),
            calibration: Calibration {
                uva: f32::NAN,
                uvb: -1.0,
                uvc: 1.0,
            },
            sync_edges: 0,
            ..RawOptions::default()
        };

        let errors = DeviceConfig::build(&options).unwrap_err();
        assert_eq!(errors.len(), 7);
        assert_eq!(
            errors.get(ConfigField::Gain).unwrap().reason,
            ConfigReason::NotPowerOfTwo
        );
        assert_eq!(
            errors.get(ConfigField::IntegrationTime).unwrap().reason,
            ConfigReason::OutOfRange
        );
        assert!(errors.get(ConfigField::ConversionClock).is_some());
        assert!(errors.get(ConfigField::Divider).is_some());
        assert_eq!(
            errors.get(ConfigField::CalibrationUva).unwrap().reason,
            ConfigReason::NotFinite
        );
        assert_eq!(
            errors.get(ConfigField::CalibrationUvb).unwrap().reason,
            ConfigReason::Negative
        );
        assert!(errors.get(ConfigField::SyncEdges).is_some());
        assert!(errors.get(ConfigField::CalibrationUvc).is_none());
    }

    #[test]
    fn test_profile_overrides_gain_and_time() {
        let options = RawOptions {
            profile: Profile::Outdoor,
            gain: 3,
            ..RawOptions::default()
        };

        let config = DeviceConfig::build(&options).unwrap();
        assert_eq!(config.gain_code, 6);
        assert_eq!(config.integration_time_code, 4);
    }

    #[test]
    fn test_full_scale_counts() {
        let mut config = DeviceConfig::default();
        config.integration_time_code = 0;
        assert_eq!(config.full_scale_counts(), 1024);
        config.integration_time_code = 6;
        assert_eq!(config.full_scale_counts(), 65535);
    }

    #[test]
    fn test_out_of_table_codes_saturate() {
        let config = DeviceConfig {
            gain_code: 12,
            integration_time_code: 15,
            divider_enabled: true,
            divider_code: 9,
            ..DeviceConfig::default()
        };

        assert_eq!(config.gain(), 1);
        assert_eq!(config.integration_time_ms(), 16384.0);
        assert_eq!(config.full_scale_counts(), 65535);
        assert_eq!(config.divider_factor(), 256);
        assert_eq!(config.creg1(), 0xBE);
        assert_eq!(config.creg2(), 0x4F);
    }

    #[test]
    fn test_conversion_time_rounds_up() {
        let fast = DeviceConfig {
            integration_time_code: 0,
            conversion_clock: ConversionClock::Mhz8_192,
            ..DeviceConfig::default()
        };
        assert_eq!(fast.conversion_time_ms(), 1);

        let half = DeviceConfig {
            conversion_clock: ConversionClock::Mhz2_048,
            ..DeviceConfig::default()
        };
        assert_eq!(half.conversion_time_ms(), 32);
    }

    #[test]
    fn test_zero_outputs_is_valid() {
        let options = RawOptions {
            outputs: Outputs::NONE,
            ..RawOptions::default()
        };

        let config = DeviceConfig::build(&options).unwrap();
        assert!(!config.temperature_enabled());
        assert_eq!(config.creg2(), 0x00);
    }
}
