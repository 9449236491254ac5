// This example demonstrates how to use the AS7331 sensor with a Raspberry Pi.
// It polls the sensor once per second and logs every published value.

#[cfg(target_arch = "arm")]
use as7331::{Channel, DeviceConfig, Profile, RawOptions, SaturationWarning, Sink, Tick, AS7331};
#[cfg(target_arch = "arm")]
use embedded_hal::blocking::delay::DelayMs;
#[cfg(target_arch = "arm")]
use linux_embedded_hal as hal;

#[cfg(target_arch = "arm")]
struct LogSink;

#[cfg(target_arch = "arm")]
impl Sink for LogSink {
    fn publish(&mut self, channel: Channel, value: f32, stale: bool) {
        if stale {
            log::warn!("{:?}: {} (stale)", channel, value);
        } else {
            log::info!("{:?}: {}", channel, value);
        }
    }

    fn saturation(&mut self, warning: SaturationWarning) {
        log::warn!("Sensor {}", warning);
    }
}

#[cfg(target_arch = "arm")]
fn main() {
    let i2c = hal::I2cdev::new("/dev/i2c-1").unwrap();
    let mut delay = hal::Delay;

    let options = RawOptions {
        profile: Profile::Outdoor,
        auto_gain: true,
        ..RawOptions::default()
    };
    let config = match DeviceConfig::build(&options) {
        Ok(config) => config,
        Err(errors) => {
            log::error!("{}", errors);
            return;
        }
    };

    let mut as7331 = AS7331::new(i2c, as7331::AS7331_ADDR, config);
    if let Err(e) = as7331.setup(&mut delay) {
        log::error!("Error setting up sensor: {}", e);
        return;
    }

    if let Some((device_id, mutation)) = as7331.device_id() {
        log::info!(
            "Device ID: 0x{:X}, Mutation: 0x{:X}",
            device_id,
            mutation
        );
    }

    // Poll for 5 minutes
    for _ in 0..300 {
        match as7331.poll_tick(&mut delay, &mut LogSink) {
            Tick::Faulted => {
                log::error!("Sensor faulted, resetting");
                if let Err(e) = as7331.reset(&mut delay) {
                    log::error!("Reset failed: {}", e);
                }
            }
            Tick::Published(sample) => log::info!("UV index: {}", sample.uv_index),
            _ => {}
        }
        delay.delay_ms(1000u32);
    }

    // Stop measuring (sensor stays configured)
    as7331.set_measurement_enabled(false);
    as7331.poll_tick(&mut delay, &mut LogSink);

    // Just some loop so we never return
    loop {
        delay.delay_ms(1000u32);
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
