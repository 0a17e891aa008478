//! GTX312L 12-channel touch switch bank. 1-byte registers, no
//! coordinate output; the chip runs its own threshold logic and we read
//! the status bitmap.

use heapless::String;

use super::{bus_write, bus_write_read, DriverError, TouchSample, SENSITIVITY_MAX};
use crate::{
    config::{token_count, ValueReader, ValueWriter, BLOB_MAX},
    platform::I2cOps,
};

pub const MAX_CHANNELS: u8 = 12;
const CHANNEL_MASK_ALL: u32 = 0x0FFF;

const REG_CHIP_VERSION: u8 = 0x01;
const REG_TOUCH_STATUS_L: u8 = 0x02;
const REG_TOUCH_STATUS_H: u8 = 0x03;
const REG_CH_ENABLE_L: u8 = 0x04;
const REG_CH_ENABLE_H: u8 = 0x05;
const REG_MON_RST: u8 = 0x0A;
const REG_SLEEP: u8 = 0x0B;
const REG_I2C_PU_DIS: u8 = 0x0C;
const REG_WRITE_LOCK: u8 = 0x0F;
const REG_INT_TOUCH_MODE: u8 = 0x10;
const REG_EXP_CONFIG: u8 = 0x11;
const REG_CAL_TIME: u8 = 0x13;
const REG_SEN_IDLE_TIME: u8 = 0x14;
const REG_SEN_IDLE_SUFFIX: u8 = 0x15;
const REG_BUSY_TO_IDLE: u8 = 0x17;
const REG_I2B_MODE: u8 = 0x18;
const REG_SLIDE_MODE: u8 = 0x19;
const REG_SENSITIVITY_BASE: u8 = 0x20;

const WRITE_LOCK_VALUE: u8 = 0x5A;
const SENSITIVITY_REG_MAX: u8 = 0x3F;

/// Multi-touch on, interrupts ignored, timeouts and idle modes off: the
/// frame task polls, so the chip must never go quiet on its own.
const INIT_TEMPLATE: [(u8, u8); 12] = [
    (REG_MON_RST, 0x01),
    (REG_SLEEP, 0x00),
    (REG_I2C_PU_DIS, 0x01),
    (REG_WRITE_LOCK, WRITE_LOCK_VALUE),
    (REG_INT_TOUCH_MODE, 0x01),
    (REG_EXP_CONFIG, 0x00),
    (REG_CAL_TIME, 0x00),
    (REG_SEN_IDLE_TIME, 0x00),
    (REG_SEN_IDLE_SUFFIX, 0x00),
    (REG_BUSY_TO_IDLE, 0x00),
    (REG_I2B_MODE, 0x00),
    (REG_SLIDE_MODE, 0x00),
];

pub struct Gtx312l {
    addr: u8,
    module_mask: u8,
    enabled_mask: u32,
    sensitivity: [u8; MAX_CHANNELS as usize],
    initialized: bool,
}

impl Gtx312l {
    pub fn new(addr: u8, module_mask: u8) -> Self {
        Self {
            addr,
            module_mask,
            enabled_mask: CHANNEL_MASK_ALL,
            sensitivity: [49; MAX_CHANNELS as usize],
            initialized: false,
        }
    }

    pub fn module_mask(&self) -> u8 {
        self.module_mask
    }

    pub fn supported_channels(&self) -> u8 {
        MAX_CHANNELS
    }

    pub fn enabled_channel_mask(&self) -> u32 {
        self.enabled_mask
    }

    pub fn init<B: I2cOps>(&mut self, bus: &mut B) -> Result<(), DriverError> {
        if self.initialized {
            return Err(DriverError::InvalidArgument);
        }
        // Presence check: the chip-version register must answer.
        self.read_register(bus, REG_CHIP_VERSION)
            .map_err(|_| DriverError::NotPresent)?;

        for (reg, value) in INIT_TEMPLATE {
            self.write_register(bus, reg, value)?;
        }

        // Seed the enabled mask from the chip; it keeps its own default
        // when the readback fails.
        self.enabled_mask = match self.read_enable_mask(bus) {
            Ok(mask) => mask,
            Err(_) => CHANNEL_MASK_ALL,
        };
        self.initialized = true;
        Ok(())
    }

    pub fn sample<B: I2cOps>(&mut self, bus: &mut B, now_us: u32) -> TouchSample {
        if !self.initialized {
            return TouchSample::failure(self.module_mask);
        }
        let low = match self.read_register(bus, REG_TOUCH_STATUS_L) {
            Ok(value) => value,
            Err(_) => return TouchSample::failure(self.module_mask),
        };
        let high = match self.read_register(bus, REG_TOUCH_STATUS_H) {
            Ok(value) => value,
            Err(_) => return TouchSample::failure(self.module_mask),
        };
        let status = ((high as u32 & 0x0F) << 8) | low as u32;
        TouchSample::new(self.module_mask, status & self.enabled_mask, now_us)
    }

    pub fn set_channel_enabled<B: I2cOps>(
        &mut self,
        bus: &mut B,
        channel: u8,
        enabled: bool,
    ) -> Result<(), DriverError> {
        if channel >= MAX_CHANNELS {
            return Err(DriverError::InvalidArgument);
        }
        let mut mask = self.read_enable_mask(bus)?;
        if enabled {
            mask |= 1 << channel;
        } else {
            mask &= !(1 << channel);
        }
        self.write_register(bus, REG_CH_ENABLE_L, (mask & 0xFF) as u8)?;
        self.write_register(bus, REG_CH_ENABLE_H, ((mask >> 8) & 0x0F) as u8)?;
        self.enabled_mask = mask & CHANNEL_MASK_ALL;
        Ok(())
    }

    pub fn set_channel_sensitivity<B: I2cOps>(
        &mut self,
        bus: &mut B,
        channel: u8,
        sensitivity: u8,
    ) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if channel >= MAX_CHANNELS || sensitivity > SENSITIVITY_MAX {
            return Err(DriverError::InvalidArgument);
        }
        let reg_value = (sensitivity as u16 * SENSITIVITY_REG_MAX as u16 / SENSITIVITY_MAX as u16) as u8;
        self.write_register(bus, REG_SENSITIVITY_BASE + channel, reg_value)?;
        self.sensitivity[channel as usize] = sensitivity;
        Ok(())
    }

    /// Blob: 12 sensitivity values in channel order.
    pub fn load_config<B: I2cOps>(&mut self, bus: &mut B, blob: &str) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if token_count(blob) != MAX_CHANNELS as usize {
            return Err(DriverError::ConfigRejected);
        }
        let mut values = [0u8; MAX_CHANNELS as usize];
        let mut reader = ValueReader::new(blob);
        for value in values.iter_mut() {
            let parsed = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
            if parsed > SENSITIVITY_MAX as u32 {
                return Err(DriverError::ConfigRejected);
            }
            *value = parsed as u8;
        }
        for (channel, &value) in values.iter().enumerate() {
            self.set_channel_sensitivity(bus, channel as u8, value)?;
        }
        Ok(())
    }

    pub fn save_config(&self) -> Option<String<BLOB_MAX>> {
        let mut writer = ValueWriter::<BLOB_MAX>::new();
        for &value in &self.sensitivity {
            if !writer.push(value as u32) {
                return None;
            }
        }
        Some(writer.finish())
    }

    fn read_enable_mask<B: I2cOps>(&mut self, bus: &mut B) -> Result<u32, DriverError> {
        let low = self.read_register(bus, REG_CH_ENABLE_L)?;
        let high = self.read_register(bus, REG_CH_ENABLE_H)?;
        Ok(((high as u32 & 0x0F) << 8) | low as u32)
    }

    fn write_register<B: I2cOps>(
        &mut self,
        bus: &mut B,
        reg: u8,
        value: u8,
    ) -> Result<(), DriverError> {
        bus_write(bus, self.addr, &[reg, value])
    }

    fn read_register<B: I2cOps>(&mut self, bus: &mut B, reg: u8) -> Result<u8, DriverError> {
        let mut buffer = [0u8; 1];
        bus_write_read(bus, self.addr, &[reg], &mut buffer)?;
        Ok(buffer[0])
    }
}
