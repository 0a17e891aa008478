use core::sync::atomic::Ordering;

use embassy_time::{Duration, Instant, Ticker};
use maitouch::{
    config::GlobalConfig,
    platform::BusyDelay,
    touch::manager::{PendingConfig, TouchManager},
};

use super::{
    config::{CONFIG_REQUESTS, FRAME_TICK_MS, TOUCH_EVENTS, TOUCH_FRAMES, TOUCH_STATE_HI, TOUCH_STATE_LO},
    store::SettingsLoad,
    telemetry,
    types::{ConfigRequest, SensorContext},
};

#[embassy_executor::task]
pub(crate) async fn sensor_pipeline_task(context: SensorContext) {
    let SensorContext {
        mut bus0,
        mut bus1,
        mut store,
        load,
    } = context;

    let delay = BusyDelay::new();
    let mut manager = TouchManager::new();
    let found0 = manager.discover(0, &mut bus0, &delay);
    let found1 = manager.discover(1, &mut bus1, &delay);
    esp_println::println!("touch: discovered bus0={} bus1={}", found0, found1);
    for info in manager.modules() {
        esp_println::println!(
            "touch: module 0x{:02x} {} channels={}",
            info.module_mask,
            info.kind.name(),
            info.supported_channels
        );
    }
    manager.assign_default_points();

    let mut global = GlobalConfig::default();
    match load {
        SettingsLoad::Loaded => {
            global = store.global().unwrap_or_default();
            for (mask, blob) in store.module_blobs() {
                match manager.load_module_config(&mut bus0, &mut bus1, mask, blob) {
                    Ok(()) => esp_println::println!("store: module 0x{:02x} loaded", mask),
                    Err(_) => esp_println::println!("store: module 0x{:02x} rejected", mask),
                }
            }
        }
        SettingsLoad::Blank => esp_println::println!("store: blank; defaults"),
        SettingsLoad::Corrupt => {
            esp_println::println!("store: corrupt; rewriting defaults");
            let _ = store.save(&global, &manager);
        }
    }
    manager.apply_global(&global);

    let started = manager.calibrate_all(&mut bus0, &mut bus1);
    if started > 0 {
        esp_println::println!("touch: calibrating {} module(s)", started);
    }
    let mut was_calibrating = started > 0;

    let mut dirty = false;
    let mut ticker = Ticker::every(Duration::from_millis(FRAME_TICK_MS));
    loop {
        ticker.next().await;

        while let Ok(request) = CONFIG_REQUESTS.try_receive() {
            match request {
                ConfigRequest::PointSensitivity { point, value } => {
                    if manager.queue_config(PendingConfig::PointSensitivity { point, value }) {
                        dirty = true;
                    } else {
                        esp_println::println!("touch: config queue full");
                    }
                }
                ConfigRequest::AllSensitivity { value } => {
                    if manager.queue_config(PendingConfig::AllSensitivity { value }) {
                        dirty = true;
                    } else {
                        esp_println::println!("touch: config queue full");
                    }
                }
                ConfigRequest::SetLeds(on) => {
                    manager.set_leds(&mut bus0, &mut bus1, on);
                }
                ConfigRequest::BaudSelect(select) => {
                    global.baud_select = select;
                    dirty = true;
                }
                ConfigRequest::Persist => {
                    if dirty {
                        if store.save(&global, &manager) {
                            dirty = false;
                            esp_println::println!("store: saved");
                        } else {
                            esp_println::println!("store: save failed");
                        }
                    }
                }
            }
        }

        // Timestamp 0 is the failure sentinel; pin the wrap tick to 1.
        let now_us = (Instant::now().as_micros() as u32).max(1);
        let report = manager.frame(&mut bus0, &mut bus1, now_us);
        telemetry::record_frame(report.failures, report.pending_applied);

        let state = report.touch.state;
        TOUCH_STATE_LO.store(state as u32, Ordering::Relaxed);
        TOUCH_STATE_HI.store((state >> 32) as u32, Ordering::Relaxed);
        let _ = TOUCH_FRAMES.try_send(state);
        for event in &report.touch.events {
            let _ = TOUCH_EVENTS.try_send(*event);
        }

        let calibrating = manager.calibration_active();
        if was_calibrating && !calibrating {
            telemetry::record_calibration_done();
            for info in manager.modules() {
                if info.abnormal_mask != 0 {
                    esp_println::println!(
                        "touch: module 0x{:02x} abnormal=0x{:06x}",
                        info.module_mask,
                        info.abnormal_mask
                    );
                }
            }
            esp_println::println!("touch: calibration complete");
        }
        was_calibrating = calibrating;
    }
}
