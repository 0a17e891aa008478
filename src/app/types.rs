use esp_hal::{uart::Uart, Async};
use maitouch::platform::HalI2c;

use super::store::{SettingsLoad, SettingsStore};

pub(crate) type SerialUart = Uart<'static, Async>;

/// Everything the frame pipeline owns: both buses, the flash store and
/// the boot-time load outcome it should act on.
pub(crate) struct SensorContext {
    pub(crate) bus0: HalI2c<'static>,
    pub(crate) bus1: HalI2c<'static>,
    pub(crate) store: SettingsStore<'static>,
    pub(crate) load: SettingsLoad,
}

/// Requests crossing from the serial task into the frame pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ConfigRequest {
    PointSensitivity { point: u8, value: u8 },
    AllSensitivity { value: u8 },
    SetLeds(bool),
    BaudSelect(u8),
    Persist,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PlayerSide {
    Left,
    Right,
}

impl PlayerSide {
    pub(crate) fn letter(self) -> u8 {
        match self {
            Self::Left => b'L',
            Self::Right => b'R',
        }
    }
}
