use core::sync::atomic::{AtomicU32, Ordering};

static FRAMES: AtomicU32 = AtomicU32::new(0);
static SAMPLE_FAILURES: AtomicU32 = AtomicU32::new(0);
static PENDING_APPLIES: AtomicU32 = AtomicU32::new(0);
static CALIBRATIONS_DONE: AtomicU32 = AtomicU32::new(0);
static SERIAL_COMMANDS: AtomicU32 = AtomicU32::new(0);
static FRAMES_STREAMED: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy)]
pub(crate) struct Snapshot {
    pub(crate) frames: u32,
    pub(crate) sample_failures: u32,
    pub(crate) pending_applies: u32,
    pub(crate) calibrations_done: u32,
    pub(crate) serial_commands: u32,
    pub(crate) frames_streamed: u32,
}

pub(crate) fn snapshot() -> Snapshot {
    Snapshot {
        frames: FRAMES.load(Ordering::Relaxed),
        sample_failures: SAMPLE_FAILURES.load(Ordering::Relaxed),
        pending_applies: PENDING_APPLIES.load(Ordering::Relaxed),
        calibrations_done: CALIBRATIONS_DONE.load(Ordering::Relaxed),
        serial_commands: SERIAL_COMMANDS.load(Ordering::Relaxed),
        frames_streamed: FRAMES_STREAMED.load(Ordering::Relaxed),
    }
}

pub(crate) fn record_frame(failures: u8, pending_applied: bool) {
    FRAMES.fetch_add(1, Ordering::Relaxed);
    if failures > 0 {
        SAMPLE_FAILURES.fetch_add(failures as u32, Ordering::Relaxed);
    }
    if pending_applied {
        PENDING_APPLIES.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn record_calibration_done() {
    CALIBRATIONS_DONE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_serial_command() {
    SERIAL_COMMANDS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_frame_streamed() {
    FRAMES_STREAMED.fetch_add(1, Ordering::Relaxed);
}
