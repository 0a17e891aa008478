//! PSoC CapSense slave. 1-byte register addresses, 16-bit big-endian
//! values. Thresholds run in two modes: relative (UI sensitivity mapped
//! onto a raw threshold) and absolute (stored total-capacitance steps
//! written back verbatim on config load).

use heapless::String;

use super::{bus_write, bus_write_read, DriverError, TouchSample, SENSITIVITY_MAX};
use crate::{
    config::{token_count, ValueReader, ValueWriter, BLOB_MAX},
    platform::{DelayOps, I2cOps},
};

pub const MAX_CHANNELS: u8 = 12;
const CHANNEL_MASK_ALL: u32 = 0x0FFF;

const REG_SCAN_RATE: u8 = 0x00;
const REG_TOUCH_STATUS: u8 = 0x01;
const REG_CONTROL: u8 = 0x02;
const REG_THRESHOLD_BASE: u8 = 0x03;
const REG_TOTAL_CAP_BASE: u8 = 0x0F;

const CONTROL_RESET: u16 = 0x0001;
const CONTROL_LED: u16 = 0x0002;
const CONTROL_RUN: u16 = 0x0004;
const CONTROL_ABSOLUTE: u16 = 0x0010;

const RESET_GRACE_MS: u32 = 500;
const SCAN_RATE_POLLS: u32 = 10;
const SCAN_RATE_POLL_MS: u32 = 20;

const THRESHOLD_BASELINE: i32 = 4095;
const THRESHOLD_RAW_MAX: i32 = 8191;
const SENSITIVITY_MIDPOINT: i32 = 49;
const RAW_PER_SENSITIVITY_STEP: i32 = 10;
/// Upper bound for absolute-mode writes, in 0.01 pF steps.
const TOTAL_CAP_STEPS_MAX: u16 = 2200;

const CONFIG_FIELDS_NEW: usize = 3 * MAX_CHANNELS as usize;
const CONFIG_FIELDS_LEGACY: usize = MAX_CHANNELS as usize;

pub struct Psoc {
    addr: u8,
    module_mask: u8,
    enabled_mask: u32,
    control: u16,
    ui_sensitivity: [u8; MAX_CHANNELS as usize],
    raw_threshold: [u16; MAX_CHANNELS as usize],
    total_cap_steps: [u16; MAX_CHANNELS as usize],
    initialized: bool,
}

fn sensitivity_to_raw(sensitivity: u8) -> u16 {
    let raw = THRESHOLD_BASELINE
        - (sensitivity as i32 - SENSITIVITY_MIDPOINT) * RAW_PER_SENSITIVITY_STEP;
    raw.clamp(0, THRESHOLD_RAW_MAX) as u16
}

fn raw_to_sensitivity(raw: u16) -> u8 {
    let sensitivity =
        SENSITIVITY_MIDPOINT - (raw as i32 - THRESHOLD_BASELINE) / RAW_PER_SENSITIVITY_STEP;
    sensitivity.clamp(0, SENSITIVITY_MAX as i32) as u8
}

impl Psoc {
    pub fn new(addr: u8, module_mask: u8) -> Self {
        Self {
            addr,
            module_mask,
            enabled_mask: CHANNEL_MASK_ALL,
            control: 0,
            ui_sensitivity: [SENSITIVITY_MIDPOINT as u8; MAX_CHANNELS as usize],
            raw_threshold: [THRESHOLD_BASELINE as u16; MAX_CHANNELS as usize],
            total_cap_steps: [0; MAX_CHANNELS as usize],
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

    /// Soft reset, then the scan-rate register must come up non-zero
    /// within the grace period before the run bit is set.
    pub fn init<B: I2cOps>(
        &mut self,
        bus: &mut B,
        delay: &impl DelayOps,
    ) -> Result<(), DriverError> {
        if self.initialized {
            return Err(DriverError::InvalidArgument);
        }
        self.write_control(bus, CONTROL_RESET)
            .map_err(|_| DriverError::NotPresent)?;
        delay.delay_ms(RESET_GRACE_MS);

        let mut scan_rate = 0u16;
        for poll in 0..SCAN_RATE_POLLS {
            if let Ok(rate) = self.read_reg16(bus, REG_SCAN_RATE) {
                scan_rate = rate;
                if scan_rate != 0 {
                    break;
                }
            }
            if poll + 1 < SCAN_RATE_POLLS {
                delay.delay_ms(SCAN_RATE_POLL_MS);
            }
        }
        if scan_rate == 0 {
            return Err(DriverError::NotPresent);
        }

        self.write_control(bus, CONTROL_RUN)?;
        self.enabled_mask = CHANNEL_MASK_ALL;
        self.initialized = true;
        Ok(())
    }

    pub fn sample<B: I2cOps>(&mut self, bus: &mut B, now_us: u32) -> TouchSample {
        if !self.initialized {
            return TouchSample::failure(self.module_mask);
        }
        match self.read_reg16(bus, REG_TOUCH_STATUS) {
            Ok(status) => TouchSample::new(
                self.module_mask,
                (status as u32 & CHANNEL_MASK_ALL) & self.enabled_mask,
                now_us,
            ),
            Err(_) => TouchSample::failure(self.module_mask),
        }
    }

    /// The chip scans all pads regardless; the mask only filters what we
    /// publish.
    pub fn set_channel_enabled(&mut self, channel: u8, enabled: bool) -> Result<(), DriverError> {
        if channel >= MAX_CHANNELS {
            return Err(DriverError::InvalidArgument);
        }
        if enabled {
            self.enabled_mask |= 1 << channel;
        } else {
            self.enabled_mask &= !(1 << channel);
        }
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
        self.set_absolute_mode(bus, false)?;
        let raw = sensitivity_to_raw(sensitivity);
        self.write_reg16(bus, REG_THRESHOLD_BASE + channel, raw)?;
        self.ui_sensitivity[channel as usize] = sensitivity;
        self.raw_threshold[channel as usize] = raw;
        // Capture the resulting pad capacitance for absolute-mode saves;
        // a failed readback keeps the previous value.
        if let Ok(steps) = self.read_reg16(bus, REG_TOTAL_CAP_BASE + channel) {
            self.total_cap_steps[channel as usize] = steps;
        }
        Ok(())
    }

    pub fn set_led_enabled<B: I2cOps>(
        &mut self,
        bus: &mut B,
        enabled: bool,
    ) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        let mut control = self.control;
        if enabled {
            control |= CONTROL_LED;
        } else {
            control &= !CONTROL_LED;
        }
        self.write_control(bus, control)
    }

    /// Blob: `(ui_sens, raw_threshold, total_cap_steps)` per channel, 36
    /// fields. The legacy 12-field threshold-only form is still accepted;
    /// its UI sensitivity is derived from the raw threshold.
    pub fn load_config<B: I2cOps>(&mut self, bus: &mut B, blob: &str) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        match token_count(blob) {
            CONFIG_FIELDS_NEW => self.load_config_new(bus, blob),
            CONFIG_FIELDS_LEGACY => self.load_config_legacy(bus, blob),
            _ => Err(DriverError::ConfigRejected),
        }
    }

    fn load_config_new<B: I2cOps>(&mut self, bus: &mut B, blob: &str) -> Result<(), DriverError> {
        let mut ui = [0u8; MAX_CHANNELS as usize];
        let mut raw = [0u16; MAX_CHANNELS as usize];
        let mut steps = [0u16; MAX_CHANNELS as usize];
        let mut reader = ValueReader::new(blob);
        for channel in 0..MAX_CHANNELS as usize {
            let ui_value = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
            let raw_value = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
            let steps_value = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
            if ui_value > SENSITIVITY_MAX as u32
                || raw_value > THRESHOLD_RAW_MAX as u32
                || steps_value > u16::MAX as u32
            {
                return Err(DriverError::ConfigRejected);
            }
            ui[channel] = ui_value as u8;
            raw[channel] = raw_value as u16;
            steps[channel] = steps_value as u16;
        }

        self.set_absolute_mode(bus, true)?;
        for channel in 0..MAX_CHANNELS {
            let value = steps[channel as usize];
            if value > 0 {
                self.write_reg16(
                    bus,
                    REG_THRESHOLD_BASE + channel,
                    value.min(TOTAL_CAP_STEPS_MAX),
                )?;
            }
        }
        self.ui_sensitivity = ui;
        self.raw_threshold = raw;
        self.total_cap_steps = steps;
        Ok(())
    }

    fn load_config_legacy<B: I2cOps>(
        &mut self,
        bus: &mut B,
        blob: &str,
    ) -> Result<(), DriverError> {
        let mut raw = [0u16; MAX_CHANNELS as usize];
        let mut reader = ValueReader::new(blob);
        for value in raw.iter_mut() {
            let parsed = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
            if parsed > THRESHOLD_RAW_MAX as u32 {
                return Err(DriverError::ConfigRejected);
            }
            *value = parsed as u16;
        }

        self.set_absolute_mode(bus, false)?;
        for channel in 0..MAX_CHANNELS {
            self.write_reg16(bus, REG_THRESHOLD_BASE + channel, raw[channel as usize])?;
        }
        for channel in 0..MAX_CHANNELS as usize {
            self.ui_sensitivity[channel] = raw_to_sensitivity(raw[channel]);
            self.raw_threshold[channel] = raw[channel];
            self.total_cap_steps[channel] = 0;
        }
        Ok(())
    }

    pub fn save_config(&self) -> Option<String<BLOB_MAX>> {
        let mut writer = ValueWriter::<BLOB_MAX>::new();
        for channel in 0..MAX_CHANNELS as usize {
            let ok = writer.push(self.ui_sensitivity[channel] as u32)
                && writer.push(self.raw_threshold[channel] as u32)
                && writer.push(self.total_cap_steps[channel] as u32);
            if !ok {
                return None;
            }
        }
        Some(writer.finish())
    }

    fn set_absolute_mode<B: I2cOps>(
        &mut self,
        bus: &mut B,
        absolute: bool,
    ) -> Result<(), DriverError> {
        let mut control = self.control;
        if absolute {
            control |= CONTROL_ABSOLUTE;
        } else {
            control &= !CONTROL_ABSOLUTE;
        }
        if control == self.control {
            return Ok(());
        }
        self.write_control(bus, control)
    }

    fn write_control<B: I2cOps>(&mut self, bus: &mut B, value: u16) -> Result<(), DriverError> {
        self.write_reg16(bus, REG_CONTROL, value)?;
        self.control = value;
        Ok(())
    }

    fn read_reg16<B: I2cOps>(&mut self, bus: &mut B, reg: u8) -> Result<u16, DriverError> {
        let mut buffer = [0u8; 2];
        bus_write_read(bus, self.addr, &[reg], &mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }

    fn write_reg16<B: I2cOps>(&mut self, bus: &mut B, reg: u8, value: u16) -> Result<(), DriverError> {
        let bytes = value.to_be_bytes();
        bus_write(bus, self.addr, &[reg, bytes[0], bytes[1]])
    }
}
