//! Fleet manager: address-rule discovery, per-frame sampling across both
//! buses, stabilization and aggregation into the published state.
//!
//! Drivers are owned here and borrow a bus only for the duration of one
//! call. Configuration writes arriving from the serial layer are queued
//! and drained one per frame so they never crowd out the sample path.

use heapless::{Deque, String, Vec};

use crate::{
    config::{GlobalConfig, BLOB_MAX},
    drivers::{
        module_mask, Ad7147, DriverError, Gtx312l, Psoc, SensorDriver, SensorKind, TouchSample,
    },
    platform::{DelayOps, I2cOps},
    touch::{
        aggregate::{Aggregator, FrameDiff},
        stabilizer::{FastTrigger, X_PERMILLE_DEFAULT},
    },
};

pub const MODULE_SLOTS: usize = 8;
pub const PENDING_SLOTS: usize = 8;
const RULE_SLOTS: usize = 8;
const CANDIDATE_SLOTS: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddressMatch {
    /// `a..=b` inclusive.
    Range,
    /// Exactly `a`; `b` is ignored.
    Exact,
    /// `addr & b == a`.
    Mask,
}

#[derive(Clone, Copy, Debug)]
pub struct AddressRule {
    pub kind: SensorKind,
    pub matcher: AddressMatch,
    pub a: u8,
    pub b: u8,
}

impl AddressRule {
    fn matches(&self, addr: u8) -> bool {
        match self.matcher {
            AddressMatch::Range => (self.a..=self.b).contains(&addr),
            AddressMatch::Exact => addr == self.a,
            AddressMatch::Mask => addr & self.b == self.a,
        }
    }
}

/// First matching rule decides; no match is `Unknown`.
pub fn identify_ic_type(rules: &[AddressRule], addr: u8) -> SensorKind {
    rules
        .iter()
        .find(|rule| rule.matches(addr))
        .map_or(SensorKind::Unknown, |rule| rule.kind)
}

pub fn default_rules() -> Vec<AddressRule, RULE_SLOTS> {
    let mut rules = Vec::new();
    let _ = rules.push(AddressRule {
        kind: SensorKind::Psoc,
        matcher: AddressMatch::Range,
        a: 0x08,
        b: 0x0E,
    });
    let _ = rules.push(AddressRule {
        kind: SensorKind::Gtx312l,
        matcher: AddressMatch::Range,
        a: 0xB0,
        b: 0xB6,
    });
    let _ = rules.push(AddressRule {
        kind: SensorKind::Ad7147,
        matcher: AddressMatch::Range,
        a: 0x2C,
        b: 0x2F,
    });
    rules
}

fn build_driver(kind: SensorKind, addr: u8, mask: u8) -> Option<SensorDriver> {
    match kind {
        SensorKind::Psoc => Some(SensorDriver::Psoc(Psoc::new(addr, mask))),
        SensorKind::Gtx312l => Some(SensorDriver::Gtx312l(Gtx312l::new(addr, mask))),
        SensorKind::Ad7147 => Some(SensorDriver::Ad7147(Ad7147::new(addr, mask))),
        SensorKind::Unknown => None,
    }
}

/// Deferred write from the serial layer; a free queue slot accepts it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PendingConfig {
    PointSensitivity { point: u8, value: u8 },
    AllSensitivity { value: u8 },
}

struct ModuleEntry {
    driver: SensorDriver,
    stabilizer: FastTrigger,
    last_state: u32,
    last_update_us: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ModuleInfo {
    pub module_mask: u8,
    pub kind: SensorKind,
    pub supported_channels: u8,
    pub enabled_mask: u32,
    pub last_state: u32,
    pub last_update_us: u32,
    pub calibration_active: bool,
    pub calibration_progress: u8,
    pub abnormal_mask: u32,
}

/// One pipeline pass over the fleet.
pub struct FrameReport {
    pub touch: FrameDiff,
    pub sampled: u8,
    pub failures: u8,
    pub pending_applied: bool,
}

pub struct TouchManager {
    rules: Vec<AddressRule, RULE_SLOTS>,
    entries: Vec<ModuleEntry, MODULE_SLOTS>,
    aggregator: Aggregator,
    pending: Deque<PendingConfig, PENDING_SLOTS>,
    x_permille: u16,
}

impl TouchManager {
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
            entries: Vec::new(),
            aggregator: Aggregator::new(),
            pending: Deque::new(),
            x_permille: X_PERMILLE_DEFAULT,
        }
    }

    /// Replaces the rule table; entries beyond the table capacity are
    /// dropped.
    pub fn set_rules(&mut self, rules: &[AddressRule]) {
        self.rules.clear();
        for &rule in rules.iter().take(RULE_SLOTS) {
            let _ = self.rules.push(rule);
        }
    }

    pub fn apply_global(&mut self, config: &GlobalConfig) {
        self.x_permille = config.x_permille;
        for entry in &mut self.entries {
            entry.stabilizer.set_x_permille(config.x_permille);
        }
        self.aggregator.set_delay_frames(config.delay_frames);
    }

    /// Scans one bus for rule-covered addresses and registers every
    /// responder whose driver initializes. Two aliases of one wire
    /// address collapse onto the same module mask; the first wins.
    pub fn discover<B: I2cOps, D: DelayOps>(
        &mut self,
        bus_index: u8,
        bus: &mut B,
        delay: &D,
    ) -> usize {
        let candidates = candidate_addresses(&self.rules);
        let mut found: Vec<u8, CANDIDATE_SLOTS> = Vec::new();
        bus.scan(&candidates, &mut found);

        let mut registered = 0;
        for &addr in &found {
            let kind = identify_ic_type(&self.rules, addr);
            let mask = module_mask(bus_index, addr);
            if self.entry_index(mask).is_some() {
                continue;
            }
            let Some(mut driver) = build_driver(kind, addr, mask) else {
                continue;
            };
            if driver.init(bus, delay).is_err() {
                continue;
            }
            let channels = driver.supported_channels();
            let mut stabilizer = FastTrigger::new(channels as usize);
            stabilizer.set_x_permille(self.x_permille);
            if self
                .entries
                .push(ModuleEntry {
                    driver,
                    stabilizer,
                    last_state: 0,
                    last_update_us: 0,
                })
                .is_err()
            {
                break;
            }
            registered += 1;
        }
        registered
    }

    /// Binds every enabled channel to the next free logical point, in
    /// registration order, until the 34 points run out.
    pub fn assign_default_points(&mut self) {
        let Self {
            entries,
            aggregator,
            ..
        } = self;
        let mut next_point = 1u8;
        for entry in entries.iter() {
            let enabled = entry.driver.enabled_channel_mask();
            let module = entry.driver.module_mask();
            for channel in 0..entry.driver.supported_channels() {
                if enabled & (1 << channel) == 0 {
                    continue;
                }
                if next_point > crate::touch::aggregate::POINT_COUNT {
                    return;
                }
                aggregator.map_point(module, channel, next_point);
                next_point += 1;
            }
        }
    }

    /// One frame: sample every module, drain at most one pending config
    /// entry, stabilize the fresh samples, merge and publish.
    pub fn frame<B: I2cOps>(&mut self, bus0: &mut B, bus1: &mut B, now_us: u32) -> FrameReport {
        let Self {
            entries,
            aggregator,
            pending,
            ..
        } = self;
        aggregator.begin_frame();

        let mut raws: Vec<TouchSample, MODULE_SLOTS> = Vec::new();
        let mut failures = 0u8;
        for entry in entries.iter_mut() {
            let bus = if entry.driver.module_mask() & 0x80 == 0 {
                &mut *bus0
            } else {
                &mut *bus1
            };
            let sample = entry.driver.sample(bus, now_us);
            if sample.is_failure() {
                failures += 1;
            }
            let _ = raws.push(sample);
        }

        let mut pending_applied = false;
        if let Some(item) = pending.pop_front() {
            pending_applied = true;
            match item {
                PendingConfig::PointSensitivity { point, value } => {
                    for (module, channel) in aggregator.sources_of(point) {
                        let Some(entry) = entries
                            .iter_mut()
                            .find(|entry| entry.driver.module_mask() == module)
                        else {
                            continue;
                        };
                        let bus = if module & 0x80 == 0 {
                            &mut *bus0
                        } else {
                            &mut *bus1
                        };
                        let _ = entry.driver.set_channel_sensitivity(bus, channel, value);
                    }
                }
                PendingConfig::AllSensitivity { value } => {
                    for entry in entries.iter_mut() {
                        let enabled = entry.driver.enabled_channel_mask();
                        let bus = if entry.driver.module_mask() & 0x80 == 0 {
                            &mut *bus0
                        } else {
                            &mut *bus1
                        };
                        for channel in 0..entry.driver.supported_channels() {
                            if enabled & (1 << channel) == 0 {
                                continue;
                            }
                            let _ = entry.driver.set_channel_sensitivity(bus, channel, value);
                        }
                    }
                }
            }
        }

        for (entry, raw) in entries.iter_mut().zip(&raws) {
            if raw.is_failure() {
                // The previous contribution stands for this frame.
                continue;
            }
            let stabilized = match entry.driver.channel_levels() {
                Some(levels) => entry
                    .stabilizer
                    .process(now_us / 1000, raw.channel_mask, levels),
                None => raw.channel_mask,
            };
            entry.last_state = stabilized;
            entry.last_update_us = raw.timestamp_us;
        }

        for entry in entries.iter() {
            aggregator.merge(entry.driver.module_mask(), entry.last_state);
        }
        let touch = aggregator.finish_frame(now_us);

        FrameReport {
            touch,
            sampled: entries.len() as u8 - failures,
            failures,
            pending_applied,
        }
    }

    pub fn queue_config(&mut self, item: PendingConfig) -> bool {
        self.pending.push_back(item).is_ok()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn module_count(&self) -> usize {
        self.entries.len()
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleInfo> + '_ {
        self.entries.iter().map(|entry| ModuleInfo {
            module_mask: entry.driver.module_mask(),
            kind: entry.driver.kind(),
            supported_channels: entry.driver.supported_channels(),
            enabled_mask: entry.driver.enabled_channel_mask(),
            last_state: entry.last_state,
            last_update_us: entry.last_update_us,
            calibration_active: entry.driver.calibration_active(),
            calibration_progress: entry.driver.calibration_progress(),
            abnormal_mask: entry.driver.abnormal_channel_mask(),
        })
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.aggregator
    }

    pub fn set_leds<B: I2cOps>(&mut self, bus0: &mut B, bus1: &mut B, on: bool) {
        for entry in &mut self.entries {
            let bus = if entry.driver.module_mask() & 0x80 == 0 {
                &mut *bus0
            } else {
                &mut *bus1
            };
            // Most of the fleet has no LED; that is not a failure.
            let _ = entry.driver.set_led_enabled(bus, on);
        }
    }

    /// Starts the offset search on every module that has one.
    pub fn calibrate_all<B: I2cOps>(&mut self, bus0: &mut B, bus1: &mut B) -> usize {
        let mut started = 0;
        for entry in &mut self.entries {
            let bus = if entry.driver.module_mask() & 0x80 == 0 {
                &mut *bus0
            } else {
                &mut *bus1
            };
            if entry.driver.calibrate_sensor(bus).is_ok() {
                started += 1;
            }
        }
        started
    }

    pub fn abort_calibrations<B: I2cOps>(&mut self, bus0: &mut B, bus1: &mut B) {
        for entry in &mut self.entries {
            let bus = if entry.driver.module_mask() & 0x80 == 0 {
                &mut *bus0
            } else {
                &mut *bus1
            };
            let _ = entry.driver.abort_calibration(bus);
        }
    }

    pub fn calibration_active(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.driver.calibration_active())
    }

    pub fn save_module_config(&self, module_mask: u8) -> Option<String<BLOB_MAX>> {
        self.entries
            .iter()
            .find(|entry| entry.driver.module_mask() == module_mask)
            .and_then(|entry| entry.driver.save_config())
    }

    pub fn load_module_config<B: I2cOps>(
        &mut self,
        bus0: &mut B,
        bus1: &mut B,
        module_mask: u8,
        blob: &str,
    ) -> Result<(), DriverError> {
        let Some(index) = self.entry_index(module_mask) else {
            return Err(DriverError::NotPresent);
        };
        let entry = &mut self.entries[index];
        let bus = if module_mask & 0x80 == 0 { bus0 } else { bus1 };
        entry.driver.load_config(bus, blob)
    }

    fn entry_index(&self, module_mask: u8) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.driver.module_mask() == module_mask)
    }
}

impl Default for TouchManager {
    fn default() -> Self {
        Self::new()
    }
}

fn candidate_addresses(rules: &[AddressRule]) -> Vec<u8, CANDIDATE_SLOTS> {
    let mut out = Vec::new();
    for rule in rules {
        match rule.matcher {
            AddressMatch::Exact => push_candidate(&mut out, rule.a),
            AddressMatch::Range => {
                for addr in rule.a..=rule.b {
                    push_candidate(&mut out, addr);
                }
            }
            AddressMatch::Mask => {
                for addr in u8::MIN..=u8::MAX {
                    if addr & rule.b == rule.a {
                        push_candidate(&mut out, addr);
                    }
                }
            }
        }
    }
    out
}

fn push_candidate(out: &mut Vec<u8, CANDIDATE_SLOTS>, addr: u8) {
    if !out.contains(&addr) {
        let _ = out.push(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::touch::aggregate::Edge;

    struct NoDelay;

    impl DelayOps for NoDelay {
        fn delay_us(&self, _micros: u32) {}
        fn delay_ms(&self, _millis: u32) {}
    }

    /// Models one GTX312L-style switch bank answering on every address
    /// in `present`.
    struct BenchBus {
        present: Vec<u8, 4>,
        regs: [u8; 0x40],
        status: u16,
        fail_presence: bool,
        fail_status: bool,
        sensitivity_writes: Vec<(u8, u8), 16>,
    }

    impl BenchBus {
        fn with_device(addr: u8) -> Self {
            let mut bus = Self::empty();
            let _ = bus.present.push(addr);
            bus
        }

        fn empty() -> Self {
            let mut regs = [0u8; 0x40];
            regs[0x01] = 0x12;
            regs[0x04] = 0xFF;
            regs[0x05] = 0x0F;
            Self {
                present: Vec::new(),
                regs,
                status: 0,
                fail_presence: false,
                fail_status: false,
                sensitivity_writes: Vec::new(),
            }
        }
    }

    impl I2cOps for BenchBus {
        type Error = ();

        fn read(&mut self, _addr: u8, _buffer: &mut [u8]) -> Result<(), ()> {
            Err(())
        }

        fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), ()> {
            if !self.present.contains(&addr) {
                return Err(());
            }
            let [reg, value] = bytes else { return Err(()) };
            if (0x20..0x2C).contains(reg) {
                let _ = self.sensitivity_writes.push((*reg, *value));
            }
            self.regs[*reg as usize] = *value;
            Ok(())
        }

        fn write_read(&mut self, addr: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<(), ()> {
            if !self.present.contains(&addr) {
                return Err(());
            }
            let [reg] = bytes else { return Err(()) };
            match *reg {
                0x01 if self.fail_presence => Err(()),
                0x02 if self.fail_status => Err(()),
                0x03 if self.fail_status => Err(()),
                0x02 => {
                    buffer[0] = (self.status & 0xFF) as u8;
                    Ok(())
                }
                0x03 => {
                    buffer[0] = ((self.status >> 8) & 0x0F) as u8;
                    Ok(())
                }
                _ => {
                    buffer[0] = self.regs[*reg as usize];
                    Ok(())
                }
            }
        }

        fn probe(&mut self, addr: u8) -> Result<bool, ()> {
            Ok(self.present.contains(&addr))
        }
    }

    fn discovered_manager(bus0: &mut BenchBus, bus1: &mut BenchBus) -> TouchManager {
        let mut manager = TouchManager::new();
        manager.discover(0, bus0, &NoDelay);
        manager.discover(1, bus1, &NoDelay);
        manager.assign_default_points();
        manager
    }

    #[test]
    fn default_rules_identify_known_ranges() {
        let rules = default_rules();
        assert_eq!(identify_ic_type(&rules, 0x2D), SensorKind::Ad7147);
        assert_eq!(identify_ic_type(&rules, 0x0B), SensorKind::Psoc);
        assert_eq!(identify_ic_type(&rules, 0xB3), SensorKind::Gtx312l);
        assert_eq!(identify_ic_type(&rules, 0x50), SensorKind::Unknown);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = [
            AddressRule {
                kind: SensorKind::Psoc,
                matcher: AddressMatch::Exact,
                a: 0x2D,
                b: 0,
            },
            AddressRule {
                kind: SensorKind::Ad7147,
                matcher: AddressMatch::Range,
                a: 0x2C,
                b: 0x2F,
            },
        ];
        assert_eq!(identify_ic_type(&rules, 0x2D), SensorKind::Psoc);
        assert_eq!(identify_ic_type(&rules, 0x2C), SensorKind::Ad7147);
    }

    #[test]
    fn mask_rule_matches_an_address_family() {
        let rules = [AddressRule {
            kind: SensorKind::Gtx312l,
            matcher: AddressMatch::Mask,
            a: 0x40,
            b: 0xF0,
        }];
        assert_eq!(identify_ic_type(&rules, 0x4C), SensorKind::Gtx312l);
        assert_eq!(identify_ic_type(&rules, 0x5C), SensorKind::Unknown);
    }

    #[test]
    fn discovery_registers_only_known_responders() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let mut bus1 = BenchBus::empty();
        let manager = discovered_manager(&mut bus0, &mut bus1);

        assert_eq!(manager.module_count(), 1);
        let info = manager.modules().next().unwrap();
        assert_eq!(info.kind, SensorKind::Gtx312l);
        // Styled 0xB0 lands on wire address 0x30 on bus 0.
        assert_eq!(info.module_mask, 0x30);
        assert_eq!(info.supported_channels, 12);
        assert_eq!(info.enabled_mask, 0x0FFF);
        assert!(!info.calibration_active);
        assert_eq!(info.calibration_progress, 255);
    }

    #[test]
    fn init_failure_discards_the_module() {
        let mut bus0 = BenchBus::with_device(0xB0);
        bus0.fail_presence = true;
        let mut bus1 = BenchBus::empty();
        let manager = discovered_manager(&mut bus0, &mut bus1);
        assert_eq!(manager.module_count(), 0);
    }

    #[test]
    fn aliased_wire_addresses_register_once() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let _ = bus0.present.push(0x30);
        let mut bus1 = BenchBus::empty();

        let mut manager = TouchManager::new();
        manager.set_rules(&[
            AddressRule {
                kind: SensorKind::Gtx312l,
                matcher: AddressMatch::Exact,
                a: 0xB0,
                b: 0,
            },
            AddressRule {
                kind: SensorKind::Gtx312l,
                matcher: AddressMatch::Exact,
                a: 0x30,
                b: 0,
            },
        ]);
        manager.discover(0, &mut bus0, &NoDelay);
        manager.discover(1, &mut bus1, &NoDelay);
        assert_eq!(manager.module_count(), 1);
    }

    #[test]
    fn frame_pipeline_merges_and_diffs() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let mut bus1 = BenchBus::empty();
        let mut manager = discovered_manager(&mut bus0, &mut bus1);

        bus0.status = 0b1;
        let press = manager.frame(&mut bus0, &mut bus1, 1_000);
        assert_eq!(press.touch.state, 1);
        assert_eq!(press.touch.events.len(), 1);
        assert_eq!(press.touch.events[0].point, 1);
        assert_eq!(press.touch.events[0].edge, Edge::Press);
        assert_eq!(press.sampled, 1);
        assert_eq!(press.failures, 0);

        let hold = manager.frame(&mut bus0, &mut bus1, 2_000);
        assert!(hold.touch.events.is_empty());

        bus0.status = 0;
        let release = manager.frame(&mut bus0, &mut bus1, 3_000);
        assert_eq!(release.touch.state, 0);
        assert_eq!(release.touch.events[0].edge, Edge::Release);
    }

    #[test]
    fn failed_sample_keeps_the_previous_contribution() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let mut bus1 = BenchBus::empty();
        let mut manager = discovered_manager(&mut bus0, &mut bus1);

        bus0.status = 0b1;
        manager.frame(&mut bus0, &mut bus1, 1_000);

        bus0.fail_status = true;
        let report = manager.frame(&mut bus0, &mut bus1, 2_000);
        assert_eq!(report.failures, 1);
        assert_eq!(report.sampled, 0);
        // The held point does not flicker off on a bus hiccup.
        assert_eq!(report.touch.state, 1);
        assert!(report.touch.events.is_empty());

        bus0.fail_status = false;
        bus0.status = 0;
        let release = manager.frame(&mut bus0, &mut bus1, 3_000);
        assert_eq!(release.touch.state, 0);
    }

    #[test]
    fn pending_sensitivity_drains_one_per_frame() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let mut bus1 = BenchBus::empty();
        let mut manager = discovered_manager(&mut bus0, &mut bus1);

        assert!(manager.queue_config(PendingConfig::PointSensitivity { point: 1, value: 80 }));
        assert!(manager.queue_config(PendingConfig::PointSensitivity { point: 2, value: 70 }));

        let first = manager.frame(&mut bus0, &mut bus1, 1_000);
        assert!(first.pending_applied);
        assert_eq!(manager.pending_len(), 1);
        assert_eq!(bus0.sensitivity_writes.len(), 1);
        assert_eq!(bus0.sensitivity_writes[0], (0x20, (80u32 * 63 / 99) as u8));

        let second = manager.frame(&mut bus0, &mut bus1, 2_000);
        assert!(second.pending_applied);
        assert_eq!(manager.pending_len(), 0);
        assert_eq!(bus0.sensitivity_writes[1], (0x21, (70u32 * 63 / 99) as u8));

        let third = manager.frame(&mut bus0, &mut bus1, 3_000);
        assert!(!third.pending_applied);
    }

    #[test]
    fn broadcast_sensitivity_reaches_every_channel() {
        let mut bus0 = BenchBus::with_device(0xB0);
        let mut bus1 = BenchBus::empty();
        let mut manager = discovered_manager(&mut bus0, &mut bus1);

        assert!(manager.queue_config(PendingConfig::AllSensitivity { value: 60 }));
        manager.frame(&mut bus0, &mut bus1, 1_000);
        assert_eq!(bus0.sensitivity_writes.len(), 12);
        assert!(bus0
            .sensitivity_writes
            .iter()
            .all(|&(_, value)| value == (60u32 * 63 / 99) as u8));
    }

    #[test]
    fn queue_accepts_entries_while_slots_are_free() {
        let mut manager = TouchManager::new();
        for point in 0..PENDING_SLOTS as u8 {
            assert!(manager.queue_config(PendingConfig::PointSensitivity {
                point: point + 1,
                value: 50
            }));
        }
        assert!(!manager.queue_config(PendingConfig::AllSensitivity { value: 50 }));
    }
}
