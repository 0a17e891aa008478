use core::sync::atomic::AtomicU32;

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use maitouch::touch::aggregate::TouchEvent;

use super::types::ConfigRequest;

/// Frame pipeline tick. The cabinet protocol expects roughly 1 kHz
/// sampling; the I2C bursts for a two-module fleet fit well inside it.
pub(crate) const FRAME_TICK_MS: u64 = 1;
/// Serial read slice; command latency stays under one slice.
pub(crate) const SERIAL_READ_SLICE_MS: u64 = 10;
/// Strap pins settle after the pull-ups engage before the single read.
pub(crate) const STRAP_SETTLE_MS: u32 = 5;
pub(crate) const I2C_BUS_KHZ: u32 = 100;
pub(crate) const I2C_TIMEOUT_MS: u64 = 10;
pub(crate) const LINE_BUF_LEN: usize = 64;

/// Baud selections reachable through the `U` command, index 0..=6.
pub(crate) const BAUD_RATES: [u32; 7] = [
    9_600, 115_200, 250_000, 500_000, 1_000_000, 1_500_000, 2_000_000,
];

pub(crate) static CONFIG_REQUESTS: Channel<CriticalSectionRawMutex, ConfigRequest, 8> =
    Channel::new();
pub(crate) static TOUCH_FRAMES: Channel<CriticalSectionRawMutex, u64, 8> = Channel::new();
pub(crate) static TOUCH_EVENTS: Channel<CriticalSectionRawMutex, TouchEvent, 8> = Channel::new();

// Published 40-bit state, split for atomic access from the serial task.
pub(crate) static TOUCH_STATE_LO: AtomicU32 = AtomicU32::new(0);
pub(crate) static TOUCH_STATE_HI: AtomicU32 = AtomicU32::new(0);
