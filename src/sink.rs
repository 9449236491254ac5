//! Publication of computed values to the host.

use crate::conversion::{PhysicalSample, RawSample};

/// An output the driver can publish.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Raw UVA counts.
    RawUva = 0,
    /// Raw UVB counts.
    RawUvb = 1,
    /// Raw UVC counts.
    RawUvc = 2,
    /// UVA irradiance in W/m².
    Uva = 3,
    /// UVB irradiance in W/m².
    Uvb = 4,
    /// UVC irradiance in W/m².
    Uvc = 5,
    UvIndex = 6,
    /// Chip temperature in °C.
    Temperature = 7,
    /// Conversion time in clock ticks, as counted by the device.
    OutConv = 8,
}

impl Channel {
    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// The set of enabled output channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Outputs(u16);

impl Outputs {
    pub const NONE: Self = Self(0);

    /// Every channel, including the OUTCONV diagnostic.
    pub const ALL: Self = Self(0x01FF);

    /// Every channel except the OUTCONV diagnostic.
    pub const DEFAULT: Self = Self::ALL.without(Channel::OutConv);

    pub const fn with(self, channel: Channel) -> Self {
        Self(self.0 | channel.bit())
    }

    pub const fn without(self, channel: Channel) -> Self {
        Self(self.0 & !channel.bit())
    }

    pub const fn contains(self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A sample was published although the signal exceeded the current range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SaturationWarning {
    pub gain_code: u8,
    pub integration_time_code: u8,
    /// The device flagged an ADC or result register overflow.
    pub device_overflow: bool,
}

impl core::fmt::Display for SaturationWarning {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "saturated at gain code {} / time code {}",
            self.gain_code, self.integration_time_code
        )
    }
}

/// Receiver for everything the driver measures.
///
/// Implemented by the host, one call per enabled channel and cycle.
pub trait Sink {
    /// Publish one value. `stale` is set when the value is a repeat of the
    /// last good sample because the current cycle failed.
    fn publish(&mut self, channel: Channel, value: f32, stale: bool);

    /// Called once per saturated sample, before its values are published.
    fn saturation(&mut self, _warning: SaturationWarning) {}
}

/// Publish a freshly converted sample on every enabled channel.
pub(crate) fn publish_sample<S: Sink>(
    sink: &mut S,
    outputs: Outputs,
    raw: Option<&RawSample>,
    sample: &PhysicalSample,
    stale: bool,
) {
    let mut emit = |channel: Channel, value: f32| {
        if outputs.contains(channel) {
            sink.publish(channel, value, stale);
        }
    };

    if let Some(raw) = raw {
        emit(Channel::RawUva, raw.uva as f32);
        emit(Channel::RawUvb, raw.uvb as f32);
        emit(Channel::RawUvc, raw.uvc as f32);
    }

    emit(Channel::Uva, sample.uva);
    emit(Channel::Uvb, sample.uvb);
    emit(Channel::Uvc, sample.uvc);
    emit(Channel::UvIndex, sample.uv_index);

    if let Some(temperature) = sample.temperature_celsius {
        emit(Channel::Temperature, temperature);
    }

    if let Some(outconv) = raw.and_then(|raw| raw.outconv) {
        emit(Channel::OutConv, outconv as f32);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every publication.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub published: Vec<(Channel, f32, bool)>,
        pub warnings: Vec<SaturationWarning>,
    }

    impl RecordingSink {
        pub fn value(&self, channel: Channel) -> Option<(f32, bool)> {
            self.published
                .iter()
                .rev()
                .find(|(c, _, _)| *c == channel)
                .map(|(_, v, s)| (*v, *s))
        }
    }

    impl Sink for RecordingSink {
        fn publish(&mut self, channel: Channel, value: f32, stale: bool) {
            self.published.push((channel, value, stale));
        }

        fn saturation(&mut self, warning: SaturationWarning) {
            self.warnings.push(warning);
        }
    }

    fn sample() -> (RawSample, PhysicalSample) {
        let raw = RawSample {
            uva: 10,
            uvb: 20,
            uvc: 30,
            temperature: Some(1500),
            outconv: Some(65536),
            overflow: false,
            timestamp: 1,
        };
        let physical = PhysicalSample {
            uva: 1.0,
            uvb: 2.0,
            uvc: 3.0,
            uv_index: 4.0,
            temperature_celsius: Some(8.1),
            saturated: false,
            timestamp: 1,
        };
        (raw, physical)
    }

    #[test]
    fn test_outputs() {
        let outputs = Outputs::NONE.with(Channel::Uva).with(Channel::UvIndex);
        assert!(outputs.contains(Channel::Uva));
        assert!(outputs.contains(Channel::UvIndex));
        assert!(!outputs.contains(Channel::Uvb));
        assert!(!outputs.without(Channel::Uva).contains(Channel::Uva));
        assert!(Outputs::ALL.contains(Channel::Temperature));
        assert!(Outputs::ALL.contains(Channel::OutConv));
        assert!(Outputs::DEFAULT.contains(Channel::Temperature));
        assert!(!Outputs::DEFAULT.contains(Channel::OutConv));
        assert_eq!(Outputs::default(), Outputs::DEFAULT);
    }

    #[test]
    fn test_publish_only_enabled_channels() {
        let (raw, physical) = sample();
        let mut sink = RecordingSink::default();
        let outputs = Outputs::NONE.with(Channel::RawUvb).with(Channel::UvIndex);

        publish_sample(&mut sink, outputs, Some(&raw), &physical, false);

        assert_eq!(
            sink.published,
            vec![(Channel::RawUvb, 20.0, false), (Channel::UvIndex, 4.0, false)]
        );
    }

    #[test]
    fn test_publish_every_channel() {
        let (raw, physical) = sample();
        let mut sink = RecordingSink::default();

        publish_sample(&mut sink, Outputs::ALL, Some(&raw), &physical, false);

        assert_eq!(sink.published.len(), 9);
        assert_eq!(sink.value(Channel::OutConv), Some((65536.0, false)));
    }

    #[test]
    fn test_publish_nothing_without_outputs() {
        let (raw, physical) = sample();
        let mut sink = RecordingSink::default();

        publish_sample(&mut sink, Outputs::NONE, Some(&raw), &physical, false);

        assert!(sink.published.is_empty());
    }

    #[test]
    fn test_publish_stale_repeat() {
        let (_, physical) = sample();
        let mut sink = RecordingSink::default();

        publish_sample(&mut sink, Outputs::ALL, None, &physical, true);

        assert_eq!(sink.published.len(), 5);
        assert!(sink.published.iter().all(|(_, _, stale)| *stale));
        assert_eq!(sink.value(Channel::RawUva), None);
    }
}
