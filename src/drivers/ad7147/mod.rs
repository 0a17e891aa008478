//! AD7147 CapTouch controller. 16-bit register space, big-endian words;
//! single-register access sets the address MSB, block access leaves it
//! clear. Thirteen inputs share twelve conversion stages: enabled
//! channels occupy consecutive stages and fired stage bits are remapped
//! back to their channel positions, so disabling one channel never
//! renumbers the rest.

mod calib;

use heapless::String;

use calib::{AfeEngine, SearchContext};

use super::{bus_write, bus_write_read, DriverError, TouchSample, SENSITIVITY_MAX};
use crate::{
    config::{token_count, ValueReader, ValueWriter, BLOB_MAX},
    platform::I2cOps,
    touch::stabilizer::ChannelLevels,
};

pub const MAX_CHANNELS: u8 = 13;
pub(crate) const STAGE_SLOTS: usize = 12;
const CHANNEL_MASK_ALL: u32 = 0x1FFF;

const REG_PWR_CONTROL: u16 = 0x000;
const REG_STAGE_CAL_EN: u16 = 0x001;
const REG_AMB_COMP_CTRL0: u16 = 0x002;
const REG_AMB_COMP_CTRL1: u16 = 0x003;
const REG_AMB_COMP_CTRL2: u16 = 0x004;
const REG_STAGE_LOW_INT_EN: u16 = 0x005;
const REG_STAGE_HIGH_INT_EN: u16 = 0x006;
const REG_STAGE_COMPLETE_INT_EN: u16 = 0x007;
const REG_STAGE_HIGH_INT_STATUS: u16 = 0x009;
const REG_CDC_DATA: u16 = 0x00B;
const REG_DEVICE_ID: u16 = 0x017;
const REG_STAGE_CONFIG_BASE: u16 = 0x080;
const STAGE_CONFIG_WORDS: u16 = 8;

const SINGLE_ACCESS_FLAG: u16 = 0x8000;

const PWR_CONTROL_BASE: u16 = 0x12F0;
const PWR_SEQUENCE_MASK: u16 = 0x00F0;
const AMB_COMP_CTRL0_INIT: u16 = 0xC0FF;
const AMB_COMP_CTRL1_INIT: u16 = 0x0040;
const AMB_COMP_CTRL2_INIT: u16 = 0xFFFF;

const SENSITIVITY_WORD_DEFAULT: u16 = 0x2929;
const OFFSET_HIGH_DEFAULT: u16 = 0x1000;
/// UI value whose register image equals the chip default word.
const SENSITIVITY_UI_DEFAULT: u8 = 61;

/// Slow drift tracking: one sixteenth of the error per untouched frame.
const BASELINE_SHIFT: u32 = 4;

const CONFIG_FIELDS: usize = STAGE_SLOTS * 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AfeSide {
    Positive,
    Negative,
}

/// Magnitudes above 63 spill into the opposite field with its swap bit
/// set, extending the reach to 127.
pub(crate) fn afe_offset_word(side: AfeSide, magnitude: u8) -> u16 {
    let magnitude = magnitude.min(127);
    let primary = u16::from(magnitude & 0x3F);
    let spill = if magnitude > 63 {
        u16::from((magnitude - 64) & 0x3F)
    } else {
        0
    };
    match side {
        AfeSide::Positive => {
            let mut word = primary << 8;
            if magnitude > 63 {
                word |= 0x0080 | spill;
            }
            word
        }
        AfeSide::Negative => {
            let mut word = primary;
            if magnitude > 63 {
                word |= 0x8000 | (spill << 8);
            }
            word
        }
    }
}

/// Both threshold nibbles move together; the peak-detect fields keep the
/// chip default.
fn sensitivity_word(sensitivity: u8) -> u16 {
    let nibble = u16::from(sensitivity) * 15 / 99;
    0x2020 | (nibble << 8) | nibble
}

/// Single-ended routing: one CIN per stage, everything else high
/// impedance.
fn connection_words(channel: u8) -> (u16, u16) {
    if channel <= 6 {
        (2u16 << (2 * channel), 0x1000)
    } else {
        (0, 0x1000 | (2u16 << (2 * (channel - 7))))
    }
}

fn stage_mask(count: u8) -> u16 {
    (1u16 << count) - 1
}

/// Fired stage bits walk the enabled mask to land back on their original
/// channels.
fn remap_stage_bits(mut stage_bits: u16, enabled_mask: u32) -> u32 {
    let mut channels = 0u32;
    let mut remaining = enabled_mask;
    while stage_bits != 0 && remaining != 0 {
        let channel = remaining.trailing_zeros();
        if stage_bits & 1 != 0 {
            channels |= 1 << channel;
        }
        stage_bits >>= 1;
        remaining &= remaining - 1;
    }
    channels
}

/// One conversion stage: routing pair, AFE offset word, threshold
/// sensitivity and the four offset/clamp words, in register order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StageConfig {
    pub connection_low: u16,
    pub connection_high: u16,
    pub afe_offset: u16,
    pub sensitivity: u16,
    pub offset_low: u16,
    pub offset_high: u16,
    pub offset_high_clamp: u16,
    pub offset_low_clamp: u16,
}

impl StageConfig {
    fn for_channel(channel: u8) -> Self {
        let (connection_low, connection_high) = connection_words(channel);
        Self {
            connection_low,
            connection_high,
            afe_offset: 0,
            sensitivity: SENSITIVITY_WORD_DEFAULT,
            offset_low: 0,
            offset_high: OFFSET_HIGH_DEFAULT,
            offset_high_clamp: 0,
            offset_low_clamp: 0,
        }
    }

    fn words(&self) -> [u16; 8] {
        [
            self.connection_low,
            self.connection_high,
            self.afe_offset,
            self.sensitivity,
            self.offset_low,
            self.offset_high,
            self.offset_high_clamp,
            self.offset_low_clamp,
        ]
    }

    fn from_words(words: [u16; 8]) -> Self {
        Self {
            connection_low: words[0],
            connection_high: words[1],
            afe_offset: words[2],
            sensitivity: words[3],
            offset_low: words[4],
            offset_high: words[5],
            offset_high_clamp: words[6],
            offset_low_clamp: words[7],
        }
    }
}

pub struct Ad7147 {
    addr: u8,
    module_mask: u8,
    user_mask: u32,
    enabled_mask: u32,
    stage_count: u8,
    staged_channels: [u8; STAGE_SLOTS],
    stages: [StageConfig; STAGE_SLOTS],
    ui_sensitivity: [u8; MAX_CHANNELS as usize],
    cdc: [u16; STAGE_SLOTS],
    baseline: [i32; STAGE_SLOTS],
    baseline_seeded: u16,
    abnormal_mask: u32,
    search: AfeEngine,
    initialized: bool,
}

impl Ad7147 {
    pub fn new(addr: u8, module_mask: u8) -> Self {
        Self {
            addr,
            module_mask,
            user_mask: CHANNEL_MASK_ALL,
            enabled_mask: CHANNEL_MASK_ALL,
            stage_count: 0,
            staged_channels: [0; STAGE_SLOTS],
            stages: core::array::from_fn(|slot| StageConfig::for_channel(slot as u8)),
            ui_sensitivity: [SENSITIVITY_UI_DEFAULT; MAX_CHANNELS as usize],
            cdc: [0; STAGE_SLOTS],
            baseline: [0; STAGE_SLOTS],
            baseline_seeded: 0,
            abnormal_mask: 0,
            search: AfeEngine::new(),
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
        let device_id = self
            .read_reg(bus, REG_DEVICE_ID)
            .map_err(|_| DriverError::NotPresent)?;
        if device_id == 0 {
            return Err(DriverError::NotPresent);
        }
        self.user_mask = CHANNEL_MASK_ALL;
        self.enabled_mask = CHANNEL_MASK_ALL;
        self.rebind_stages();
        self.program_sequencer(bus, false)?;
        self.initialized = true;
        Ok(())
    }

    /// One frame: status word, CDC refresh, baseline drift, one offset
    /// search step when a search is running.
    pub fn sample<B: I2cOps>(&mut self, bus: &mut B, now_us: u32) -> TouchSample {
        if !self.initialized {
            return TouchSample::failure(self.module_mask);
        }
        let status = match self.read_reg(bus, REG_STAGE_HIGH_INT_STATUS) {
            Ok(word) => word,
            Err(_) => return TouchSample::failure(self.module_mask),
        };
        // The chip reports "above threshold" as a cleared bit.
        let fired = !status & stage_mask(self.stage_count);
        if let Ok(words) = self.read_cdc_block(bus) {
            self.cdc = words;
        }
        self.track_baselines(fired);
        if self.search.active() {
            let outcome = self.search.step(fired, self.cdc);
            let _ = self.apply_search_outcome(bus, outcome);
        }
        let channels = remap_stage_bits(fired, self.enabled_mask);
        TouchSample::new(self.module_mask, channels, now_us)
    }

    pub fn set_channel_enabled<B: I2cOps>(
        &mut self,
        bus: &mut B,
        channel: u8,
        enabled: bool,
    ) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if channel >= MAX_CHANNELS {
            return Err(DriverError::InvalidArgument);
        }
        if enabled {
            self.user_mask |= 1 << channel;
        } else {
            self.user_mask &= !(1 << channel);
        }
        if self.search.active() {
            // Takes effect when the search restores the user mask.
            return Ok(());
        }
        self.enabled_mask = self.user_mask;
        self.rebind_stages();
        self.baseline_seeded = 0;
        self.program_sequencer(bus, false)
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
        self.ui_sensitivity[channel as usize] = sensitivity;
        if let Some(slot) = self.slot_of(channel) {
            self.stages[slot].sensitivity = sensitivity_word(sensitivity);
            if !self.search.active() {
                let config = self.stages[slot];
                self.write_stage(bus, slot as u8, config)?;
            }
        }
        Ok(())
    }

    /// Blob: the eight stage words of every slot, in register order.
    pub fn load_config<B: I2cOps>(&mut self, bus: &mut B, blob: &str) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if self.search.active() {
            return Err(DriverError::InvalidArgument);
        }
        if token_count(blob) != CONFIG_FIELDS {
            return Err(DriverError::ConfigRejected);
        }
        let mut staged = [[0u16; 8]; STAGE_SLOTS];
        let mut reader = ValueReader::new(blob);
        for words in staged.iter_mut() {
            for word in words.iter_mut() {
                let value = reader.next_u32().ok_or(DriverError::ConfigRejected)?;
                if value > u32::from(u16::MAX) {
                    return Err(DriverError::ConfigRejected);
                }
                *word = value as u16;
            }
        }
        for (slot, words) in staged.iter().enumerate() {
            self.stages[slot] = StageConfig::from_words(*words);
        }
        self.program_sequencer(bus, false)
    }

    pub fn save_config(&self) -> Option<String<BLOB_MAX>> {
        let mut writer = ValueWriter::<BLOB_MAX>::new();
        for stage in &self.stages {
            for word in stage.words() {
                if !writer.push(u32::from(word)) {
                    return None;
                }
            }
        }
        Some(writer.finish())
    }

    /// Widens the enabled mask to every input, reprograms the stages
    /// with cleared offsets and wide clamps, then lets the offset search
    /// run one step per sample until every stage settles or fails.
    pub fn calibrate_sensor<B: I2cOps>(&mut self, bus: &mut B) -> Result<(), DriverError> {
        if !self.initialized {
            return Err(DriverError::NotInitialized);
        }
        if self.search.active() {
            return Err(DriverError::InvalidArgument);
        }
        self.user_mask = self.enabled_mask;
        self.enabled_mask = CHANNEL_MASK_ALL;
        self.abnormal_mask = 0;
        self.rebind_stages();
        self.program_sequencer(bus, true)?;
        let mut targets = [SENSITIVITY_UI_DEFAULT; STAGE_SLOTS];
        for slot in 0..self.stage_count as usize {
            targets[slot] = self.ui_sensitivity[self.staged_channels[slot] as usize];
        }
        self.search.start(self.stage_count, targets);
        self.baseline_seeded = 0;
        Ok(())
    }

    pub fn abort_calibration<B: I2cOps>(&mut self, bus: &mut B) -> Result<(), DriverError> {
        if !self.search.active() {
            return Err(DriverError::InvalidArgument);
        }
        let outcome = self.search.abort();
        self.apply_search_outcome(bus, outcome)
    }

    pub fn calibration_progress(&self) -> u8 {
        self.search.progress()
    }

    pub fn calibration_active(&self) -> bool {
        self.search.active()
    }

    pub fn abnormal_channel_mask(&self) -> u32 {
        self.abnormal_mask
    }

    fn slot_of(&self, channel: u8) -> Option<usize> {
        self.staged_channels[..self.stage_count as usize]
            .iter()
            .position(|&staged| staged == channel)
    }

    fn rebind_stages(&mut self) {
        let mut mask = self.enabled_mask & CHANNEL_MASK_ALL;
        let mut count = 0;
        while mask != 0 && count < STAGE_SLOTS {
            let channel = mask.trailing_zeros() as u8;
            self.staged_channels[count] = channel;
            let (low, high) = connection_words(channel);
            self.stages[count].connection_low = low;
            self.stages[count].connection_high = high;
            count += 1;
            mask &= mask - 1;
        }
        self.stage_count = count as u8;
    }

    /// Search trials replace the tuning words but keep the routing; the
    /// stored stage configs stay untouched for the restore.
    fn prepared_stage(&self, slot: usize, afe_word: u16) -> StageConfig {
        let mut config = self.stages[slot];
        config.afe_offset = afe_word;
        config.sensitivity = SENSITIVITY_WORD_DEFAULT;
        config.offset_low = 0;
        config.offset_high = 0;
        config.offset_high_clamp = 0xFFFF;
        config.offset_low_clamp = 0;
        config
    }

    fn program_sequencer<B: I2cOps>(
        &mut self,
        bus: &mut B,
        prepared: bool,
    ) -> Result<(), DriverError> {
        let count = u16::from(self.stage_count.max(1));
        let power = (PWR_CONTROL_BASE & !PWR_SEQUENCE_MASK) | ((count - 1) << 4);
        self.write_reg(bus, REG_PWR_CONTROL, power)?;
        for slot in 0..self.stage_count {
            let config = if prepared {
                self.prepared_stage(slot as usize, 0)
            } else {
                self.stages[slot as usize]
            };
            self.write_stage(bus, slot, config)?;
        }
        let stage_bits = stage_mask(self.stage_count);
        self.write_reg(bus, REG_STAGE_CAL_EN, stage_bits)?;
        self.write_reg(bus, REG_STAGE_LOW_INT_EN, 0)?;
        self.write_reg(bus, REG_STAGE_HIGH_INT_EN, stage_bits)?;
        self.write_reg(bus, REG_STAGE_COMPLETE_INT_EN, 0)?;
        self.write_reg(bus, REG_AMB_COMP_CTRL0, AMB_COMP_CTRL0_INIT)?;
        self.write_reg(bus, REG_AMB_COMP_CTRL1, AMB_COMP_CTRL1_INIT)?;
        self.write_reg(bus, REG_AMB_COMP_CTRL2, AMB_COMP_CTRL2_INIT)?;
        Ok(())
    }

    fn apply_search_outcome<B: I2cOps>(
        &mut self,
        bus: &mut B,
        outcome: SearchContext,
    ) -> Result<(), DriverError> {
        for &(slot, word) in &outcome.writes {
            let config = self.prepared_stage(slot as usize, word);
            let _ = self.write_stage(bus, slot, config);
        }
        for &(slot, word) in &outcome.locks {
            self.stages[slot as usize].afe_offset = word;
            let config = self.prepared_stage(slot as usize, word);
            let _ = self.write_stage(bus, slot, config);
        }
        let mut failed = outcome.failed_stages;
        while failed != 0 {
            let slot = failed.trailing_zeros() as usize;
            if slot < self.stage_count as usize {
                self.abnormal_mask |= 1 << self.staged_channels[slot];
            }
            failed &= failed - 1;
        }
        if outcome.finished {
            self.enabled_mask = self.user_mask;
            self.rebind_stages();
            self.baseline_seeded = 0;
            self.program_sequencer(bus, false)?;
        }
        Ok(())
    }

    fn track_baselines(&mut self, fired: u16) {
        for slot in 0..self.stage_count as usize {
            let level = i32::from(self.cdc[slot]);
            if self.baseline_seeded & (1 << slot) == 0 {
                self.baseline[slot] = level;
                self.baseline_seeded |= 1 << slot;
                continue;
            }
            if fired & (1 << slot) == 0 {
                self.baseline[slot] += (level - self.baseline[slot]) >> BASELINE_SHIFT;
            }
        }
    }

    fn read_reg<B: I2cOps>(&mut self, bus: &mut B, reg: u16) -> Result<u16, DriverError> {
        let reg = (SINGLE_ACCESS_FLAG | reg).to_be_bytes();
        let mut buffer = [0u8; 2];
        bus_write_read(bus, self.addr, &reg, &mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }

    fn write_reg<B: I2cOps>(&mut self, bus: &mut B, reg: u16, value: u16) -> Result<(), DriverError> {
        let reg = (SINGLE_ACCESS_FLAG | reg).to_be_bytes();
        let value = value.to_be_bytes();
        bus_write(bus, self.addr, &[reg[0], reg[1], value[0], value[1]])
    }

    fn write_stage<B: I2cOps>(
        &mut self,
        bus: &mut B,
        slot: u8,
        config: StageConfig,
    ) -> Result<(), DriverError> {
        let base = REG_STAGE_CONFIG_BASE + u16::from(slot) * STAGE_CONFIG_WORDS;
        let mut frame = [0u8; 18];
        frame[..2].copy_from_slice(&base.to_be_bytes());
        for (index, word) in config.words().iter().enumerate() {
            frame[2 + index * 2..4 + index * 2].copy_from_slice(&word.to_be_bytes());
        }
        bus_write(bus, self.addr, &frame)
    }

    fn read_cdc_block<B: I2cOps>(&mut self, bus: &mut B) -> Result<[u16; STAGE_SLOTS], DriverError> {
        let reg = REG_CDC_DATA.to_be_bytes();
        let mut buffer = [0u8; STAGE_SLOTS * 2];
        bus_write_read(bus, self.addr, &reg, &mut buffer)?;
        let mut words = [0u16; STAGE_SLOTS];
        for (index, word) in words.iter_mut().enumerate() {
            *word = u16::from_be_bytes([buffer[index * 2], buffer[index * 2 + 1]]);
        }
        Ok(words)
    }
}

impl ChannelLevels for Ad7147 {
    fn baseline(&self, channel: usize) -> i32 {
        self.slot_of(channel as u8)
            .map_or(0, |slot| self.baseline[slot])
    }

    fn raw_filtered(&self, channel: usize) -> i32 {
        self.slot_of(channel as u8)
            .map_or(0, |slot| i32::from(self.cdc[slot]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::I2cOps;

    fn afe_magnitude(word: u16) -> u8 {
        let primary = ((word >> 8) & 0x3F) as u8;
        if word & 0x0080 != 0 {
            primary + 64
        } else {
            primary
        }
    }

    /// Models a board where CDC rises linearly with the positive AFE
    /// offset and pads keep firing until the offset reaches `fire_below`.
    struct BenchChip {
        stage_words: [[u16; 8]; STAGE_SLOTS],
        pwr_control: u16,
        cal_en: u16,
        high_int_en: u16,
        cdc_base: u32,
        cdc_gain: u32,
        cdc_jitter: u32,
        fire_below: u8,
        force_fired: Option<u16>,
        tick: u32,
    }

    impl BenchChip {
        fn new() -> Self {
            Self {
                stage_words: [[0; 8]; STAGE_SLOTS],
                pwr_control: 0,
                cal_en: 0,
                high_int_en: 0,
                cdc_base: 600,
                cdc_gain: 1200,
                cdc_jitter: 15,
                fire_below: 0,
                force_fired: None,
                tick: 0,
            }
        }

        fn fired_mask(&self) -> u16 {
            if let Some(forced) = self.force_fired {
                return forced;
            }
            let mut fired = 0;
            for (slot, words) in self.stage_words.iter().enumerate() {
                if afe_magnitude(words[2]) < self.fire_below {
                    fired |= 1 << slot;
                }
            }
            fired
        }

        fn cdc_value(&self, slot: usize) -> u16 {
            let magnitude = u32::from(afe_magnitude(self.stage_words[slot][2]));
            let center = (self.cdc_base + magnitude * self.cdc_gain).min(60_000);
            let value = if self.tick % 2 == 0 {
                center + self.cdc_jitter
            } else {
                center - self.cdc_jitter
            };
            value as u16
        }
    }

    impl I2cOps for BenchChip {
        type Error = ();

        fn read(&mut self, _addr: u8, _buffer: &mut [u8]) -> Result<(), ()> {
            Err(())
        }

        fn write(&mut self, _addr: u8, bytes: &[u8]) -> Result<(), ()> {
            match bytes.len() {
                4 => {
                    let reg = u16::from_be_bytes([bytes[0], bytes[1]]) & !SINGLE_ACCESS_FLAG;
                    let value = u16::from_be_bytes([bytes[2], bytes[3]]);
                    match reg {
                        REG_PWR_CONTROL => self.pwr_control = value,
                        REG_STAGE_CAL_EN => self.cal_en = value,
                        REG_STAGE_HIGH_INT_EN => self.high_int_en = value,
                        _ => {}
                    }
                    Ok(())
                }
                18 => {
                    let base = u16::from_be_bytes([bytes[0], bytes[1]]);
                    let slot = ((base - REG_STAGE_CONFIG_BASE) / STAGE_CONFIG_WORDS) as usize;
                    for index in 0..8 {
                        self.stage_words[slot][index] =
                            u16::from_be_bytes([bytes[2 + index * 2], bytes[3 + index * 2]]);
                    }
                    Ok(())
                }
                _ => Err(()),
            }
        }

        fn write_read(&mut self, _addr: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), ()> {
            let reg = u16::from_be_bytes([bytes[0], bytes[1]]);
            if reg == (SINGLE_ACCESS_FLAG | REG_DEVICE_ID) {
                buffer.copy_from_slice(&0x1471u16.to_be_bytes());
                return Ok(());
            }
            if reg == (SINGLE_ACCESS_FLAG | REG_STAGE_HIGH_INT_STATUS) {
                let status = !self.fired_mask();
                buffer.copy_from_slice(&status.to_be_bytes());
                return Ok(());
            }
            if reg == REG_CDC_DATA && buffer.len() == STAGE_SLOTS * 2 {
                self.tick += 1;
                for slot in 0..STAGE_SLOTS {
                    let value = self.cdc_value(slot).to_be_bytes();
                    buffer[slot * 2..slot * 2 + 2].copy_from_slice(&value);
                }
                return Ok(());
            }
            Err(())
        }

        fn probe(&mut self, _addr: u8) -> Result<bool, ()> {
            Ok(true)
        }
    }

    fn init_driver(chip: &mut BenchChip) -> Ad7147 {
        let mut driver = Ad7147::new(0x2C, 0x2C);
        driver.init(chip).unwrap();
        driver
    }

    #[test]
    fn remap_keeps_original_channel_positions() {
        assert_eq!(remap_stage_bits(0b1_0011, 0b1_0110_1001), 0x109);
        assert_eq!(remap_stage_bits(0, 0x1FFF), 0);
        assert_eq!(remap_stage_bits(0b1, 0b1000), 0b1000);
    }

    #[test]
    fn afe_word_spills_into_the_swapped_side() {
        assert_eq!(afe_offset_word(AfeSide::Positive, 20), 0x1400);
        assert_eq!(afe_offset_word(AfeSide::Positive, 70), 0x0686);
        assert_eq!(afe_offset_word(AfeSide::Negative, 20), 0x0014);
        assert_eq!(afe_offset_word(AfeSide::Negative, 70), 0x8606);
        assert_eq!(afe_offset_word(AfeSide::Positive, 0), 0x0000);
    }

    #[test]
    fn sensitivity_word_tracks_both_nibbles() {
        assert_eq!(sensitivity_word(0), 0x2020);
        assert_eq!(sensitivity_word(61), SENSITIVITY_WORD_DEFAULT);
        assert_eq!(sensitivity_word(99), 0x2F2F);
    }

    #[test]
    fn init_programs_sequencer_for_all_stages() {
        let mut chip = BenchChip::new();
        let driver = init_driver(&mut chip);
        assert_eq!(driver.enabled_channel_mask(), CHANNEL_MASK_ALL);
        // Twelve stages: sequence field holds eleven.
        assert_eq!(chip.pwr_control, 0x12B0);
        assert_eq!(chip.cal_en, 0x0FFF);
        assert_eq!(chip.high_int_en, 0x0FFF);
        assert_eq!(chip.stage_words[0][0], 0x0002);
        assert_eq!(chip.stage_words[0][1], 0x1000);
        assert_eq!(chip.stage_words[11][0], 0x0000);
        assert_eq!(chip.stage_words[11][1], 0x1200);
        assert_eq!(chip.stage_words[3][3], SENSITIVITY_WORD_DEFAULT);
        assert_eq!(chip.stage_words[3][5], OFFSET_HIGH_DEFAULT);
    }

    #[test]
    fn sample_inverts_status_and_remaps_around_disabled_channels() {
        let mut chip = BenchChip::new();
        let mut driver = init_driver(&mut chip);
        driver.set_channel_enabled(&mut chip, 1, false).unwrap();
        driver.set_channel_enabled(&mut chip, 2, false).unwrap();
        // Stages now carry channels 0, 3, 4, ...; stage 1 maps to
        // channel 3.
        chip.force_fired = Some(0b0000_0010);
        let sample = driver.sample(&mut chip, 1_000);
        assert_eq!(sample.channel_mask, 1 << 3);
        assert_eq!(sample.timestamp_us, 1_000);
    }

    #[test]
    fn sample_failure_keeps_zero_timestamp() {
        let mut driver = Ad7147::new(0x2C, 0x2C);
        let mut chip = BenchChip::new();
        let sample = driver.sample(&mut chip, 55);
        assert!(sample.is_failure());
        driver.init(&mut chip).unwrap();
    }

    #[test]
    fn offset_search_converges_and_locks_with_margin() {
        let mut chip = BenchChip::new();
        chip.fire_below = 12;
        let mut driver = init_driver(&mut chip);
        for channel in 0..MAX_CHANNELS {
            driver.set_channel_sensitivity(&mut chip, channel, 49).unwrap();
        }
        driver.calibrate_sensor(&mut chip).unwrap();
        assert!(driver.calibration_active());

        let mut now = 1u32;
        while driver.calibration_active() {
            driver.sample(&mut chip, now);
            now += 1;
            assert!(now < 30_000, "search never settled");
        }

        assert_eq!(driver.abnormal_channel_mask(), 0);
        assert_eq!(driver.calibration_progress(), 255);
        for slot in 0..STAGE_SLOTS {
            assert_eq!(afe_magnitude(chip.stage_words[slot][2]), 14);
        }
        // The stored tuples carry the locked offsets for save_config.
        assert_eq!(driver.stages[0].afe_offset, afe_offset_word(AfeSide::Positive, 14));
        // Restore brought back the user tuning words.
        assert_eq!(chip.stage_words[0][3], sensitivity_word(49));
    }

    #[test]
    fn failed_search_reports_abnormal_channels() {
        let mut chip = BenchChip::new();
        // CDC never reaches the target window.
        chip.cdc_gain = 0;
        chip.cdc_base = 1000;
        let mut driver = init_driver(&mut chip);
        driver.calibrate_sensor(&mut chip).unwrap();
        let mut now = 1u32;
        while driver.calibration_active() {
            driver.sample(&mut chip, now);
            now += 1;
            assert!(now < 30_000, "search never gave up");
        }
        assert_eq!(driver.abnormal_channel_mask(), 0x0FFF);
        assert_eq!(driver.calibration_progress(), 255);
    }

    #[test]
    fn abort_restores_user_configuration() {
        let mut chip = BenchChip::new();
        chip.fire_below = 12;
        let mut driver = init_driver(&mut chip);
        driver.calibrate_sensor(&mut chip).unwrap();
        driver.sample(&mut chip, 1);
        driver.abort_calibration(&mut chip).unwrap();
        assert!(!driver.calibration_active());
        // Stage words are back to the stored tuples.
        assert_eq!(chip.stage_words[0][3], SENSITIVITY_WORD_DEFAULT);
        assert_eq!(chip.stage_words[0][5], OFFSET_HIGH_DEFAULT);
    }

    #[test]
    fn config_blob_round_trips_stage_words() {
        let mut chip = BenchChip::new();
        let mut driver = init_driver(&mut chip);
        let blob = driver.save_config().unwrap();
        assert_eq!(token_count(&blob), CONFIG_FIELDS);

        let mut other_chip = BenchChip::new();
        let mut other = init_driver(&mut other_chip);
        other.load_config(&mut other_chip, &blob).unwrap();
        assert_eq!(other.stages, driver.stages);
        assert_eq!(other_chip.stage_words[5][3], SENSITIVITY_WORD_DEFAULT);
    }

    #[test]
    fn cdc_levels_feed_the_level_accessors() {
        let mut chip = BenchChip::new();
        chip.force_fired = Some(0);
        let mut driver = init_driver(&mut chip);
        driver.sample(&mut chip, 1);
        let first = driver.raw_filtered(0);
        driver.sample(&mut chip, 2);
        let second = driver.raw_filtered(0);
        assert_ne!(first, second);
        let baseline = driver.baseline(0);
        assert!(baseline >= second.min(first) && baseline <= second.max(first));
        // Channels without a stage read as flat.
        assert_eq!(driver.raw_filtered(12), 0);
    }
}
