//! Logical-point aggregation. Physical `(module, channel)` pairs map
//! onto the 34 maimai areas (A1..A8, B1..B8, C1, C2, D1..D8, E1..E8;
//! point *p* occupies state bit *p − 1*). Per frame the mapped driver
//! states merge into one 34-bit bitmap, an optional queue delays the
//! publish by a fixed frame count, and the diff against the previous
//! publish becomes press/release events.

use heapless::{Deque, Vec};

use crate::config::DELAY_FRAMES_MAX;

pub const POINT_COUNT: u8 = 34;
pub const STATE_MASK: u64 = (1u64 << POINT_COUNT) - 1;
/// Channel bits beyond the sample payload can never map anywhere.
const CHANNEL_LIMIT: u8 = 24;

const MAPPING_SLOTS: usize = 64;
const EVENTS_MAX: usize = POINT_COUNT as usize;
// Holds delay_frames pending states plus the one being pushed.
const DELAY_QUEUE_LEN: usize = DELAY_FRAMES_MAX as usize + 1;

const AREA_NAMES: [&str; 35] = [
    "--", "A1", "A2", "A3", "A4", "A5", "A6", "A7", "A8", "B1", "B2", "B3", "B4", "B5", "B6",
    "B7", "B8", "C1", "C2", "D1", "D2", "D3", "D4", "D5", "D6", "D7", "D8", "E1", "E2", "E3",
    "E4", "E5", "E6", "E7", "E8",
];

pub fn area_name(point: u8) -> &'static str {
    AREA_NAMES.get(point as usize).copied().unwrap_or("--")
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Edge {
    Press,
    Release,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TouchEvent {
    pub point: u8,
    pub edge: Edge,
    pub timestamp_us: u32,
}

/// One published frame: the post-delay state and its diff.
pub struct FrameDiff {
    pub state: u64,
    pub events: Vec<TouchEvent, EVENTS_MAX>,
}

#[derive(Clone, Copy)]
struct Mapping {
    module_mask: u8,
    channel: u8,
    point: u8,
}

pub struct Aggregator {
    mappings: Vec<Mapping, MAPPING_SLOTS>,
    merged: u64,
    published: u64,
    previous: u64,
    pending: Deque<u64, DELAY_QUEUE_LEN>,
    delay_frames: u8,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            merged: 0,
            published: 0,
            previous: 0,
            pending: Deque::new(),
            delay_frames: 0,
        }
    }

    pub fn set_delay_frames(&mut self, frames: u8) {
        self.delay_frames = frames.min(DELAY_FRAMES_MAX);
    }

    pub fn delay_frames(&self) -> u8 {
        self.delay_frames
    }

    /// Binds a physical channel to a logical point; an existing binding
    /// for the pair is replaced. Several channels may share one point.
    pub fn map_point(&mut self, module_mask: u8, channel: u8, point: u8) -> bool {
        if point == 0 || point > POINT_COUNT || channel >= CHANNEL_LIMIT {
            return false;
        }
        if let Some(existing) = self
            .mappings
            .iter_mut()
            .find(|m| m.module_mask == module_mask && m.channel == channel)
        {
            existing.point = point;
            return true;
        }
        self.mappings
            .push(Mapping {
                module_mask,
                channel,
                point,
            })
            .is_ok()
    }

    pub fn unmap_point(&mut self, module_mask: u8, channel: u8) -> bool {
        let Some(index) = self
            .mappings
            .iter()
            .position(|m| m.module_mask == module_mask && m.channel == channel)
        else {
            return false;
        };
        self.mappings.swap_remove(index);
        true
    }

    pub fn clear_module(&mut self, module_mask: u8) {
        let mut index = 0;
        while index < self.mappings.len() {
            if self.mappings[index].module_mask == module_mask {
                self.mappings.swap_remove(index);
            } else {
                index += 1;
            }
        }
    }

    pub fn point_of(&self, module_mask: u8, channel: u8) -> Option<u8> {
        self.mappings
            .iter()
            .find(|m| m.module_mask == module_mask && m.channel == channel)
            .map(|m| m.point)
    }

    /// Physical sources feeding one logical point, for reverse routing
    /// of per-point commands.
    pub fn sources_of(&self, point: u8) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.mappings
            .iter()
            .filter(move |m| m.point == point)
            .map(|m| (m.module_mask, m.channel))
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn begin_frame(&mut self) {
        self.merged = 0;
    }

    pub fn merge(&mut self, module_mask: u8, channel_mask: u32) {
        if channel_mask == 0 {
            return;
        }
        for mapping in &self.mappings {
            if mapping.module_mask == module_mask && channel_mask & (1 << mapping.channel) != 0 {
                self.merged |= 1u64 << (mapping.point - 1);
            }
        }
    }

    /// Pushes the merged state through the delay queue, publishes the
    /// state that left it, and diffs against the previous publish.
    pub fn finish_frame(&mut self, now_us: u32) -> FrameDiff {
        let _ = self.pending.push_back(self.merged & STATE_MASK);
        while self.pending.len() > usize::from(self.delay_frames) {
            if let Some(state) = self.pending.pop_front() {
                self.published = state;
            }
        }

        let mut events = Vec::new();
        let mut changed = self.published ^ self.previous;
        while changed != 0 {
            let bit = changed.trailing_zeros() as u8;
            let edge = if self.published & (1u64 << bit) != 0 {
                Edge::Press
            } else {
                Edge::Release
            };
            let _ = events.push(TouchEvent {
                point: bit + 1,
                edge,
                timestamp_us: now_us,
            });
            changed &= changed - 1;
        }
        self.previous = self.published;

        FrameDiff {
            state: self.published,
            events,
        }
    }

    pub fn current_state(&self) -> u64 {
        self.published
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_frame(agg: &mut Aggregator, merges: &[(u8, u32)], now_us: u32) -> FrameDiff {
        agg.begin_frame();
        for &(module, mask) in merges {
            agg.merge(module, mask);
        }
        agg.finish_frame(now_us)
    }

    #[test]
    fn mapping_replaces_existing_pairs() {
        let mut agg = Aggregator::new();
        assert!(agg.map_point(0x2C, 0, 1));
        assert!(agg.map_point(0x2C, 0, 5));
        assert_eq!(agg.point_of(0x2C, 0), Some(5));
        assert_eq!(agg.mapping_count(), 1);
        assert!(agg.unmap_point(0x2C, 0));
        assert_eq!(agg.point_of(0x2C, 0), None);
    }

    #[test]
    fn rejects_out_of_range_bindings() {
        let mut agg = Aggregator::new();
        assert!(!agg.map_point(0x2C, 0, 0));
        assert!(!agg.map_point(0x2C, 0, POINT_COUNT + 1));
        assert!(!agg.map_point(0x2C, 24, 1));
    }

    #[test]
    fn merge_combines_modules_into_one_state() {
        let mut agg = Aggregator::new();
        agg.map_point(0x2C, 0, 1);
        agg.map_point(0xB0, 3, 9);
        let frame = one_frame(&mut agg, &[(0x2C, 0b1), (0xB0, 0b1000)], 100);
        assert_eq!(frame.state, (1 << 0) | (1 << 8));
        assert_eq!(frame.events.len(), 2);
        assert!(frame
            .events
            .iter()
            .all(|e| e.edge == Edge::Press && e.timestamp_us == 100));
    }

    #[test]
    fn diff_emits_press_then_release() {
        let mut agg = Aggregator::new();
        agg.map_point(0x2C, 2, 17);
        let press = one_frame(&mut agg, &[(0x2C, 0b100)], 10);
        assert_eq!(press.events.len(), 1);
        assert_eq!(
            press.events[0],
            TouchEvent {
                point: 17,
                edge: Edge::Press,
                timestamp_us: 10
            }
        );

        let hold = one_frame(&mut agg, &[(0x2C, 0b100)], 20);
        assert!(hold.events.is_empty());

        let release = one_frame(&mut agg, &[], 30);
        assert_eq!(release.events.len(), 1);
        assert_eq!(release.events[0].edge, Edge::Release);
        assert_eq!(release.state, 0);
    }

    #[test]
    fn delay_queue_postpones_the_publish() {
        let mut agg = Aggregator::new();
        agg.map_point(0x2C, 0, 1);
        agg.set_delay_frames(2);

        assert_eq!(one_frame(&mut agg, &[(0x2C, 1)], 1).state, 0);
        assert_eq!(one_frame(&mut agg, &[(0x2C, 1)], 2).state, 0);
        let third = one_frame(&mut agg, &[(0x2C, 1)], 3);
        assert_eq!(third.state, 1);
        assert_eq!(third.events[0].timestamp_us, 3);
    }

    #[test]
    fn shrinking_the_delay_drains_forward() {
        let mut agg = Aggregator::new();
        agg.map_point(0x2C, 0, 1);
        agg.set_delay_frames(2);
        one_frame(&mut agg, &[(0x2C, 1)], 1);
        one_frame(&mut agg, &[(0x2C, 1)], 2);

        agg.set_delay_frames(0);
        let frame = one_frame(&mut agg, &[(0x2C, 1)], 3);
        // The queue drains to the newest state in one frame.
        assert_eq!(frame.state, 1);
        assert_eq!(frame.events.len(), 1);
    }

    #[test]
    fn shared_point_merges_and_reverse_lookup_finds_all_sources() {
        let mut agg = Aggregator::new();
        agg.map_point(0x2C, 0, 18);
        agg.map_point(0x0B, 7, 18);
        let frame = one_frame(&mut agg, &[(0x0B, 1 << 7)], 5);
        assert_eq!(frame.state, 1 << 17);

        let mut sources: Vec<(u8, u8), 4> = Vec::new();
        for source in agg.sources_of(18) {
            let _ = sources.push(source);
        }
        assert_eq!(sources.len(), 2);
        assert!(sources.contains(&(0x2C, 0)));
        assert!(sources.contains(&(0x0B, 7)));
    }

    #[test]
    fn area_names_follow_the_layout() {
        assert_eq!(area_name(1), "A1");
        assert_eq!(area_name(9), "B1");
        assert_eq!(area_name(17), "C1");
        assert_eq!(area_name(19), "D1");
        assert_eq!(area_name(34), "E8");
        assert_eq!(area_name(0), "--");
        assert_eq!(area_name(40), "--");
    }
}
