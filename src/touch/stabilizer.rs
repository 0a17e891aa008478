//! Fast-trigger stabilizer: per-channel peak tracking over an activation
//! window, overriding the raw threshold decision to cut jitter.
//!
//! The override can only clear bits the raw bitmap holds; the output is
//! always a subset of the input.

pub const MAX_CHANNELS: usize = 16;
pub const X_PERMILLE_DEFAULT: u16 = 70;
pub const WINDOW_MS_DEFAULT: u32 = 5;

/// Per-channel level sources for one device. `baseline` is the
/// slowly-tracked reference; `raw_filtered` the current filtered CDC.
pub trait ChannelLevels {
    fn baseline(&self, channel: usize) -> i32;
    fn raw_filtered(&self, channel: usize) -> i32;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TrackerMode {
    /// Extrema persist until consumed by a trigger decision.
    NextState,
    /// Extrema additionally expire after `window_ms`.
    Window,
}

#[derive(Clone, Copy)]
struct Extremum {
    value: i32,
    at_ms: u32,
}

#[derive(Clone, Copy)]
struct ChannelTracker {
    high: Option<Extremum>,
    low: Option<Extremum>,
    need_reset: bool,
}

impl ChannelTracker {
    const fn new() -> Self {
        Self {
            high: None,
            low: None,
            need_reset: true,
        }
    }
}

pub struct FastTrigger {
    channel_count: usize,
    x_permille: u16,
    mode: TrackerMode,
    window_ms: u32,
    channels: [ChannelTracker; MAX_CHANNELS],
}

impl FastTrigger {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count: channel_count.min(MAX_CHANNELS),
            x_permille: X_PERMILLE_DEFAULT,
            mode: TrackerMode::NextState,
            window_ms: WINDOW_MS_DEFAULT,
            channels: [ChannelTracker::new(); MAX_CHANNELS],
        }
    }

    pub fn with_window(channel_count: usize, window_ms: u32) -> Self {
        let mut trigger = Self::new(channel_count);
        trigger.mode = TrackerMode::Window;
        trigger.window_ms = window_ms;
        trigger
    }

    pub fn set_x_permille(&mut self, permille: u16) {
        self.x_permille = permille.min(1000);
    }

    /// One frame. Returns `base & override`; the override mask starts
    /// all-ones on every call and only this call's trends clear bits.
    pub fn process(&mut self, now_ms: u32, base: u32, levels: &dyn ChannelLevels) -> u32 {
        let mut override_mask = u32::MAX;

        for channel in 0..self.channel_count {
            let bit = 1u32 << channel;
            let tracker = &mut self.channels[channel];

            if base & bit == 0 {
                // Released: the next activation must reseed both trackers.
                tracker.need_reset = true;
                continue;
            }

            if tracker.need_reset {
                tracker.high = None;
                tracker.low = None;
                tracker.need_reset = false;
            }

            if self.mode == TrackerMode::Window {
                if let Some(high) = tracker.high {
                    if now_ms.wrapping_sub(high.at_ms) > self.window_ms {
                        tracker.high = None;
                    }
                }
                if let Some(low) = tracker.low {
                    if now_ms.wrapping_sub(low.at_ms) > self.window_ms {
                        tracker.low = None;
                    }
                }
            }

            let baseline = levels.baseline(channel);
            let x_delta = baseline.saturating_mul(self.x_permille as i32) / 1000;
            let d = levels.raw_filtered(channel) - baseline;

            match tracker.high {
                Some(high) if d <= high.value => {}
                _ => tracker.high = Some(Extremum { value: d, at_ms: now_ms }),
            }
            match tracker.low {
                Some(low) if d >= low.value => {}
                _ => tracker.low = Some(Extremum { value: d, at_ms: now_ms }),
            }

            let (Some(high), Some(low)) = (tracker.high, tracker.low) else {
                continue;
            };

            // Ties break toward the high tracker on both picks.
            let latest = if high.at_ms >= low.at_ms { high } else { low };
            let oldest = if high.at_ms <= low.at_ms { high } else { low };
            let diff = oldest.value - latest.value;

            if diff.unsigned_abs() > x_delta.unsigned_abs() {
                if diff > 0 {
                    override_mask &= !bit;
                    tracker.high = None;
                } else {
                    tracker.low = None;
                }
            }
        }

        base & override_mask
    }
}
