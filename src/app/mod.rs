pub(crate) mod config;
mod sensors;
mod serial;
pub(crate) mod store;
pub(crate) mod telemetry;
pub(crate) mod types;

use esp_hal::{
    gpio::{Input, InputConfig, Pull},
    i2c::master::{Config as I2cConfig, I2c, SoftwareTimeout},
    time::{Duration as HalDuration, Rate},
    timer::timg::TimerGroup,
    uart::{Config as UartConfig, Uart},
};
use maitouch::platform::{BusyDelay, DelayOps, HalI2c};

use self::{
    config::{BAUD_RATES, I2C_BUS_KHZ, I2C_TIMEOUT_MS, STRAP_SETTLE_MS},
    store::{SettingsLoad, SettingsStore},
    types::{PlayerSide, SensorContext},
};

pub(crate) fn run() -> ! {
    let peripherals = esp_hal::init(esp_hal::Config::default());
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // The stored baud selection must be known before the UART comes up.
    let mut store = SettingsStore::new(peripherals.FLASH);
    let load = store.load();
    let defaults = maitouch::config::GlobalConfig::default();
    let baud_select = match load {
        SettingsLoad::Loaded => store
            .global()
            .map_or(defaults.baud_select, |global| global.baud_select),
        _ => defaults.baud_select,
    };
    let baud = BAUD_RATES[baud_select as usize];

    let uart_cfg = UartConfig::default().with_baudrate(baud);
    let uart = Uart::new(peripherals.UART0, uart_cfg)
        .expect("failed to init UART0")
        .with_rx(peripherals.GPIO3)
        .with_tx(peripherals.GPIO1)
        .into_async();

    let strap_cfg = InputConfig::default().with_pull(Pull::Up);
    let strap_side = Input::new(peripherals.GPIO32, strap_cfg);
    let strap_spare = Input::new(peripherals.GPIO33, strap_cfg);
    BusyDelay::new().delay_ms(STRAP_SETTLE_MS);
    let side = if strap_side.is_low() {
        PlayerSide::Right
    } else {
        PlayerSide::Left
    };
    esp_println::println!(
        "serial: side {} baud {} spare_strap {}",
        side.letter() as char,
        baud,
        strap_spare.is_low() as u8
    );

    let i2c_cfg = I2cConfig::default()
        .with_frequency(Rate::from_khz(I2C_BUS_KHZ))
        .with_software_timeout(SoftwareTimeout::Transaction(HalDuration::from_millis(
            I2C_TIMEOUT_MS,
        )));
    let i2c0 = I2c::new(peripherals.I2C0, i2c_cfg)
        .expect("failed to init I2C0")
        .with_sda(peripherals.GPIO21)
        .with_scl(peripherals.GPIO22);
    let i2c1 = I2c::new(peripherals.I2C1, i2c_cfg)
        .expect("failed to init I2C1")
        .with_sda(peripherals.GPIO25)
        .with_scl(peripherals.GPIO26);

    let sensor_context = SensorContext {
        bus0: HalI2c::new(i2c0),
        bus1: HalI2c::new(i2c1),
        store,
        load,
    };

    let mut executor = esp_rtos::embassy::Executor::new();
    let executor = unsafe { make_static(&mut executor) };
    executor.run(move |spawner| {
        spawner.must_spawn(sensors::sensor_pipeline_task(sensor_context));
        spawner.must_spawn(serial::serial_protocol_task(uart, side));
    });
}

unsafe fn make_static<T>(value: &mut T) -> &'static mut T {
    unsafe { core::mem::transmute(value) }
}
