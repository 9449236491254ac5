//! Conversion of raw channel counts into physical values.

use crate::config::{DeviceConfig, MeasurementMode};

/// LSB of each channel in nW/cm² per count, at 2048x gain, TIME code 10
/// (1024 ms) and 1.024 MHz. Order: UVA, UVB, UVC.
const LSB_REFERENCE_NW_CM2: [f32; 3] = [0.16213, 0.18001, 0.03849];

const REFERENCE_GAIN: f32 = 2048.0;
const REFERENCE_TIME_MS: f32 = 1024.0;

/// 1 nW/cm² = 1e-5 W/m².
const NW_CM2_TO_W_M2: f32 = 1.0e-5;

/// Responsivity of each channel in W/m² * ms per count at unity gain, so that
/// `irradiance = counts / (gain * time_ms) * RESPONSIVITY`.
const RESPONSIVITY: [f32; 3] = [
    LSB_REFERENCE_NW_CM2[0] * REFERENCE_GAIN * REFERENCE_TIME_MS * NW_CM2_TO_W_M2,
    LSB_REFERENCE_NW_CM2[1] * REFERENCE_GAIN * REFERENCE_TIME_MS * NW_CM2_TO_W_M2,
    LSB_REFERENCE_NW_CM2[2] * REFERENCE_GAIN * REFERENCE_TIME_MS * NW_CM2_TO_W_M2,
];

/// Erythemally weighted irradiance equivalent to one UV index step, W/m².
const UV_INDEX_UNIT_W_M2: f32 = 0.025;

/// Temperature sensor slope in °C per LSB.
const TEMPERATURE_SLOPE: f32 = 0.05;

/// Temperature at a raw reading of zero, in °C.
const TEMPERATURE_OFFSET: f32 = -66.9;

/// Counts read in one measurement cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawSample {
    pub uva: u16,
    pub uvb: u16,
    pub uvc: u16,
    /// Content of the TEMP register, if the temperature measurement is enabled.
    pub temperature: Option<u16>,
    /// Conversion time in clock ticks as counted by the device.
    pub outconv: Option<u32>,
    /// STATUS reported an ADC or result register overflow.
    pub overflow: bool,
    /// Poll cycle in which the sample was captured.
    pub timestamp: u32,
}

/// Calibrated values derived from a [`RawSample`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalSample {
    /// UVA irradiance in W/m².
    pub uva: f32,
    /// UVB irradiance in W/m².
    pub uvb: f32,
    /// UVC irradiance in W/m².
    pub uvc: f32,
    pub uv_index: f32,
    pub temperature_celsius: Option<f32>,
    /// At least one channel hit the top of its range, the values are a lower bound.
    pub saturated: bool,
    pub timestamp: u32,
}

impl RawSample {
    /// Any channel at the 16 bit ceiling, or the device reported an overflow.
    pub fn is_saturated(&self) -> bool {
        self.overflow || [self.uva, self.uvb, self.uvc].contains(&u16::MAX)
    }

    /// Largest of the three channel counts.
    pub fn peak(&self) -> u16 {
        self.uva.max(self.uvb).max(self.uvc)
    }
}

/// Integration time the counts of `raw` were accumulated over, in ms.
fn effective_time_ms(raw: &RawSample, config: &DeviceConfig) -> f32 {
    match (config.measurement_mode, raw.outconv) {
        (MeasurementMode::SyncDuration, Some(ticks)) if ticks > 0 => {
            ticks as f32 / config.conversion_clock.khz() as f32
        }
        _ => config.integration_time_ms(),
    }
}

/// Convert a TEMP register value into °C.
pub fn temperature_celsius(raw: u16) -> f32 {
    (raw & 0x0FFF) as f32 * TEMPERATURE_SLOPE + TEMPERATURE_OFFSET
}

/// Convert a raw sample into calibrated irradiance, UV index and temperature.
///
/// This never fails: a channel at its ceiling is still converted and the
/// result is flagged as saturated.
///
/// The device divides its output by [`DeviceConfig::divider_factor`] when the
/// divider is enabled, so the counts are multiplied back by that factor here.
pub fn convert(raw: RawSample, config: &DeviceConfig) -> PhysicalSample {
    let sensitivity = config.gain() as f32 * effective_time_ms(&raw, config);
    let divider = config.divider_factor() as f32;

    let irradiance = |counts: u16, channel: usize, calibration: f32| -> f32 {
        let counts = counts.saturating_sub(config.dark_offsets[channel]);
        if counts == 0 {
            return 0.0;
        }
        counts as f32 / sensitivity * RESPONSIVITY[channel] * calibration * divider
    };

    let uva = irradiance(raw.uva, 0, config.calibration.uva);
    let uvb = irradiance(raw.uvb, 1, config.calibration.uvb);
    let uvc = irradiance(raw.uvc, 2, config.calibration.uvc);

    let erythemal = config.uv_index_weights.uva * uva + config.uv_index_weights.uvb * uvb;
    let uv_index = if erythemal > 0.0 {
        erythemal / UV_INDEX_UNIT_W_M2
    } else {
        0.0
    };

    PhysicalSample {
        uva,
        uvb,
        uvc,
        uv_index,
        temperature_celsius: raw.temperature.map(temperature_celsius),
        saturated: raw.is_saturated(),
        timestamp: raw.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;

    fn raw(uva: u16, uvb: u16, uvc: u16) -> RawSample {
        RawSample {
            uva,
            uvb,
            uvc,
            temperature: None,
            outconv: None,
            overflow: false,
            timestamp: 7,
        }
    }

    fn assert_close(actual: f32, expected: f32) {
        let tolerance = expected.abs() * 1e-4 + 1e-9;
        assert!(
            (actual - expected).abs() <= tolerance,
            "{} is not close to {}",
            actual,
            expected
        );
    }

    #[test]
    fn test_zero_counts() {
        let sample = convert(raw(0, 0, 0), &DeviceConfig::default());
        assert_eq!(sample.uva, 0.0);
        assert_eq!(sample.uvb, 0.0);
        assert_eq!(sample.uvc, 0.0);
        assert_eq!(sample.uv_index, 0.0);
        assert!(!sample.saturated);
        assert_eq!(sample.temperature_celsius, None);
    }

    #[test]
    fn test_reference_point_matches_datasheet_lsb() {
        let config = DeviceConfig {
            gain_code: 0,
            integration_time_code: 10,
            ..DeviceConfig::default()
        };

        let sample = convert(raw(1000, 1000, 1000), &config);
        // 1000 counts * LSB nW/cm² -> W/m²
        assert_close(sample.uva, 1000.0 * 0.16213 * 1e-5);
        assert_close(sample.uvb, 1000.0 * 0.18001 * 1e-5);
        assert_close(sample.uvc, 1000.0 * 0.03849 * 1e-5);
    }

    #[test]
    fn test_channels_use_distinct_responsivity() {
        let sample = convert(raw(500, 500, 500), &DeviceConfig::default());
        assert!(sample.uva != sample.uvb);
        assert!(sample.uvb != sample.uvc);
        assert!(sample.uva != sample.uvc);
    }

    #[test]
    fn test_gain_and_time_normalisation() {
        let base = DeviceConfig::default();
        let double_gain = DeviceConfig {
            gain_code: base.gain_code - 1,
            ..base
        };
        let double_time = DeviceConfig {
            integration_time_code: base.integration_time_code + 1,
            ..base
        };

        let reference = convert(raw(2000, 2000, 2000), &base);
        assert_close(convert(raw(4000, 4000, 4000), &double_gain).uva, reference.uva);
        assert_close(convert(raw(4000, 4000, 4000), &double_time).uvb, reference.uvb);
    }

    #[test]
    fn test_faster_clock_shortens_integration() {
        let base = DeviceConfig::default();
        let fast = DeviceConfig {
            conversion_clock: crate::config::ConversionClock::Mhz2_048,
            ..base
        };

        let slow_sample = convert(raw(1000, 0, 0), &base);
        let fast_sample = convert(raw(500, 0, 0), &fast);
        assert_close(fast_sample.uva, slow_sample.uva);
    }

    #[test]
    fn test_divider_compensation() {
        let base = DeviceConfig::default();
        let divided = DeviceConfig {
            divider_enabled: true,
            divider_code: 2,
            ..base
        };

        let plain = convert(raw(800, 800, 800), &base);
        let compensated = convert(raw(100, 100, 100), &divided);
        assert_close(compensated.uvc, plain.uvc);
    }

    #[test]
    fn test_calibration_multipliers() {
        let config = DeviceConfig {
            calibration: Calibration {
                uva: 2.0,
                uvb: 1.0,
                uvc: 0.0,
            },
            ..DeviceConfig::default()
        };

        let plain = convert(raw(1000, 1000, 1000), &DeviceConfig::default());
        let calibrated = convert(raw(1000, 1000, 1000), &config);
        assert_close(calibrated.uva, plain.uva * 2.0);
        assert_eq!(calibrated.uvb, plain.uvb);
        assert_eq!(calibrated.uvc, 0.0);
    }

    #[test]
    fn test_uv_index() {
        let config = DeviceConfig::default();
        let sample = convert(raw(30000, 20000, 0), &config);
        let expected = (0.0025 * sample.uva + 0.0100 * sample.uvb) / 0.025;
        assert_close(sample.uv_index, expected);
        assert!(sample.uv_index > 0.0);
    }

    #[test]
    fn test_saturation_is_flagged_and_converted() {
        let config = DeviceConfig::default();
        let sample = convert(raw(65535, 10, 10), &config);
        assert!(sample.saturated);
        assert!(sample.uva.is_finite());
        assert!(sample.uva > 0.0);

        let overflowed = convert(
            RawSample {
                overflow: true,
                ..raw(10, 10, 10)
            },
            &config,
        );
        assert!(overflowed.saturated);
    }

    #[test]
    fn test_dark_offsets_are_subtracted() {
        let config = DeviceConfig {
            dark_offsets: [100, 200, 300],
            ..DeviceConfig::default()
        };
        let plain = convert(raw(100, 200, 300), &DeviceConfig::default());
        let sample = convert(raw(200, 200, 50), &config);
        assert_close(sample.uva, plain.uva);
        assert_eq!(sample.uvb, 0.0);
        assert_eq!(sample.uvc, 0.0);
    }

    #[test]
    fn test_sync_duration_uses_outconv() {
        let config = DeviceConfig {
            measurement_mode: MeasurementMode::SyncDuration,
            ..DeviceConfig::default()
        };
        // 131072 ticks at 1.024 MHz = 128 ms, twice the configured 64 ms
        let long = RawSample {
            outconv: Some(131072),
            ..raw(2000, 2000, 2000)
        };

        let nominal = convert(raw(1000, 1000, 1000), &DeviceConfig::default());
        assert_close(convert(long, &config).uva, nominal.uva);
    }

    #[test]
    fn test_temperature() {
        assert_close(temperature_celsius(1838), 25.0);
        assert_close(temperature_celsius(0xF000 | 1838), 25.0);

        let sample = convert(
            RawSample {
                temperature: Some(1838),
                ..raw(0, 0, 0)
            },
            &DeviceConfig::default(),
        );
        assert_close(sample.temperature_celsius.unwrap(), 25.0);
    }

    #[test]
    fn test_convert_is_deterministic() {
        let config = DeviceConfig::default();
        let sample = raw(1234, 5678, 910);
        for gain_code in 0..=crate::config::MAX_GAIN_CODE {
            for integration_time_code in 0..=crate::config::MAX_TIME_CODE {
                let config = DeviceConfig {
                    gain_code,
                    integration_time_code,
                    ..config
                };
                assert_eq!(convert(sample, &config), convert(sample, &config));
            }
        }
    }
}
