//! Sensor drivers behind one closed dispatch surface.
//!
//! Drivers own their register and mask state but never the bus; every
//! hardware-touching call borrows the bus for its duration. Failure is a
//! `DriverError` or, for `sample`, the zero-timestamp sentinel the
//! aggregation layer skips.

pub mod ad7147;
pub mod gtx312l;
pub mod psoc;

use heapless::String;

use crate::{
    config::BLOB_MAX,
    platform::{DelayOps, I2cOps},
    touch::stabilizer::ChannelLevels,
};

pub use ad7147::Ad7147;
pub use gtx312l::Gtx312l;
pub use psoc::Psoc;

pub const SENSITIVITY_MAX: u8 = 99;

/// One tagged sample. Low 24 bits of `packed()` carry the channel
/// bitmap, the high 8 the module mask; `timestamp_us == 0` marks a
/// failed read.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TouchSample {
    pub channel_mask: u32,
    pub module_mask: u8,
    pub timestamp_us: u32,
}

impl TouchSample {
    pub fn new(module_mask: u8, channel_mask: u32, timestamp_us: u32) -> Self {
        Self {
            channel_mask: channel_mask & 0x00FF_FFFF,
            module_mask,
            timestamp_us,
        }
    }

    pub fn failure(module_mask: u8) -> Self {
        Self {
            channel_mask: 0,
            module_mask,
            timestamp_us: 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.timestamp_us == 0
    }

    pub fn packed(&self) -> u32 {
        ((self.module_mask as u32) << 24) | (self.channel_mask & 0x00FF_FFFF)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SensorKind {
    Psoc,
    Gtx312l,
    Ad7147,
    Unknown,
}

impl SensorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Psoc => "psoc",
            Self::Gtx312l => "gtx312l",
            Self::Ad7147 => "ad7147",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverError {
    /// NACK or timeout on the wire, after the local retry.
    Bus,
    /// Chip absent or failed its init validation.
    NotPresent,
    NotInitialized,
    InvalidArgument,
    Unsupported,
    /// Config blob failed the token-count or range checks.
    ConfigRejected,
}

/// Module mask: bit 7 = bus index, bits 6..0 = device address.
pub fn module_mask(bus_index: u8, addr: u8) -> u8 {
    ((bus_index & 0x01) << 7) | (addr & 0x7F)
}

// Bus helpers shared by the drivers: one transparent retry, then the
// error surfaces as DriverError::Bus.

pub(crate) fn bus_write<B: I2cOps>(bus: &mut B, addr: u8, bytes: &[u8]) -> Result<(), DriverError> {
    if bus.write(addr, bytes).is_ok() {
        return Ok(());
    }
    bus.write(addr, bytes).map_err(|_| DriverError::Bus)
}

pub(crate) fn bus_write_read<B: I2cOps>(
    bus: &mut B,
    addr: u8,
    bytes: &[u8],
    buffer: &mut [u8],
) -> Result<(), DriverError> {
    if bus.write_read(addr, bytes, buffer).is_ok() {
        return Ok(());
    }
    bus.write_read(addr, bytes, buffer)
        .map_err(|_| DriverError::Bus)
}

/// The driver fleet is a closed set; dispatch stays monomorphic per call
/// site instead of going through a vtable.
pub enum SensorDriver {
    Psoc(Psoc),
    Gtx312l(Gtx312l),
    Ad7147(Ad7147),
}

impl SensorDriver {
    pub fn kind(&self) -> SensorKind {
        match self {
            Self::Psoc(_) => SensorKind::Psoc,
            Self::Gtx312l(_) => SensorKind::Gtx312l,
            Self::Ad7147(_) => SensorKind::Ad7147,
        }
    }

    pub fn module_mask(&self) -> u8 {
        match self {
            Self::Psoc(dev) => dev.module_mask(),
            Self::Gtx312l(dev) => dev.module_mask(),
            Self::Ad7147(dev) => dev.module_mask(),
        }
    }

    pub fn supported_channels(&self) -> u8 {
        match self {
            Self::Psoc(dev) => dev.supported_channels(),
            Self::Gtx312l(dev) => dev.supported_channels(),
            Self::Ad7147(dev) => dev.supported_channels(),
        }
    }

    pub fn enabled_channel_mask(&self) -> u32 {
        match self {
            Self::Psoc(dev) => dev.enabled_channel_mask(),
            Self::Gtx312l(dev) => dev.enabled_channel_mask(),
            Self::Ad7147(dev) => dev.enabled_channel_mask(),
        }
    }

    pub fn init<B: I2cOps>(
        &mut self,
        bus: &mut B,
        delay: &impl DelayOps,
    ) -> Result<(), DriverError> {
        match self {
            Self::Psoc(dev) => dev.init(bus, delay),
            Self::Gtx312l(dev) => dev.init(bus),
            Self::Ad7147(dev) => dev.init(bus),
        }
    }

    pub fn sample<B: I2cOps>(&mut self, bus: &mut B, now_us: u32) -> TouchSample {
        match self {
            Self::Psoc(dev) => dev.sample(bus, now_us),
            Self::Gtx312l(dev) => dev.sample(bus, now_us),
            Self::Ad7147(dev) => dev.sample(bus, now_us),
        }
    }

    pub fn set_channel_enabled<B: I2cOps>(
        &mut self,
        bus: &mut B,
        channel: u8,
        enabled: bool,
    ) -> Result<(), DriverError> {
        match self {
            Self::Psoc(dev) => dev.set_channel_enabled(channel, enabled),
            Self::Gtx312l(dev) => dev.set_channel_enabled(bus, channel, enabled),
            Self::Ad7147(dev) => dev.set_channel_enabled(bus, channel, enabled),
        }
    }

    pub fn set_channel_sensitivity<B: I2cOps>(
        &mut self,
        bus: &mut B,
        channel: u8,
        sensitivity: u8,
    ) -> Result<(), DriverError> {
        match self {
            Self::Psoc(dev) => dev.set_channel_sensitivity(bus, channel, sensitivity),
            Self::Gtx312l(dev) => dev.set_channel_sensitivity(bus, channel, sensitivity),
            Self::Ad7147(dev) => dev.set_channel_sensitivity(bus, channel, sensitivity),
        }
    }

    pub fn set_led_enabled<B: I2cOps>(
        &mut self,
        bus: &mut B,
        enabled: bool,
    ) -> Result<(), DriverError> {
        match self {
            Self::Psoc(dev) => dev.set_led_enabled(bus, enabled),
            Self::Gtx312l(_) | Self::Ad7147(_) => Err(DriverError::Unsupported),
        }
    }

    pub fn load_config<B: I2cOps>(&mut self, bus: &mut B, blob: &str) -> Result<(), DriverError> {
        match self {
            Self::Psoc(dev) => dev.load_config(bus, blob),
            Self::Gtx312l(dev) => dev.load_config(bus, blob),
            Self::Ad7147(dev) => dev.load_config(bus, blob),
        }
    }

    pub fn save_config(&self) -> Option<String<BLOB_MAX>> {
        match self {
            Self::Psoc(dev) => dev.save_config(),
            Self::Gtx312l(dev) => dev.save_config(),
            Self::Ad7147(dev) => dev.save_config(),
        }
    }

    pub fn calibrate_sensor<B: I2cOps>(&mut self, bus: &mut B) -> Result<(), DriverError> {
        match self {
            Self::Ad7147(dev) => dev.calibrate_sensor(bus),
            Self::Psoc(_) | Self::Gtx312l(_) => Err(DriverError::Unsupported),
        }
    }

    pub fn abort_calibration<B: I2cOps>(&mut self, bus: &mut B) -> Result<(), DriverError> {
        match self {
            Self::Ad7147(dev) => dev.abort_calibration(bus),
            Self::Psoc(_) | Self::Gtx312l(_) => Err(DriverError::Unsupported),
        }
    }

    /// 0..=255; devices without a calibration engine always report done.
    pub fn calibration_progress(&self) -> u8 {
        match self {
            Self::Ad7147(dev) => dev.calibration_progress(),
            Self::Psoc(_) | Self::Gtx312l(_) => 255,
        }
    }

    pub fn calibration_active(&self) -> bool {
        match self {
            Self::Ad7147(dev) => dev.calibration_active(),
            Self::Psoc(_) | Self::Gtx312l(_) => false,
        }
    }

    pub fn abnormal_channel_mask(&self) -> u32 {
        match self {
            Self::Ad7147(dev) => dev.abnormal_channel_mask(),
            Self::Psoc(_) | Self::Gtx312l(_) => 0,
        }
    }

    /// Level accessors for the stabilizer; only the AD7147 path exposes
    /// per-channel CDC readings.
    pub fn channel_levels(&self) -> Option<&dyn ChannelLevels> {
        match self {
            Self::Ad7147(dev) => Some(dev),
            Self::Psoc(_) | Self::Gtx312l(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_keeps_module_in_high_byte() {
        let sample = TouchSample::new(0x8A, 0x0000_0109, 42);
        assert_eq!(sample.packed(), 0x8A00_0109);
        assert!(!sample.is_failure());
    }

    #[test]
    fn channel_bits_above_24_are_dropped() {
        let sample = TouchSample::new(0x01, 0xFF00_0001, 42);
        assert_eq!(sample.channel_mask, 0x0000_0001);
    }

    #[test]
    fn failure_sample_has_zero_timestamp() {
        let sample = TouchSample::failure(0x2C);
        assert!(sample.is_failure());
        assert_eq!(sample.packed(), 0x2C00_0000);
    }

    #[test]
    fn module_mask_packs_bus_and_address() {
        assert_eq!(module_mask(0, 0x2C), 0x2C);
        assert_eq!(module_mask(1, 0x2C), 0xAC);
        assert_eq!(module_mask(1, 0xB2), 0xB2);
    }
}
