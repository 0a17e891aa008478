//! Minimal async embedded-test harness for xtensa/ESP32.
//! Validates runtime wiring and the pure pipeline layers on target.

#![no_std]
#![no_main]

#[cfg(test)]
#[embedded_test::tests(executor = esp_rtos::embassy::Executor::new())]
mod tests {
    use maitouch::{
        config::GlobalConfig,
        touch::aggregate::{Aggregator, Edge},
    };

    #[init]
    fn init() {
        let peripherals = esp_hal::init(esp_hal::Config::default());
        let timg0 = esp_hal::timer::timg::TimerGroup::new(peripherals.TIMG0);
        esp_rtos::start(timg0.timer0);
    }

    #[test]
    async fn harness_smoke_async() {
        embassy_time::Timer::after(embassy_time::Duration::from_millis(10)).await;
        assert_eq!(2 + 2, 4);
    }

    #[test]
    fn global_config_round_trips() {
        let config = GlobalConfig {
            x_permille: 120,
            delay_frames: 3,
            baud_select: 2,
        };
        let blob = config.encode::<64>().unwrap();
        assert_eq!(GlobalConfig::decode(&blob), Some(config));
    }

    #[test]
    fn aggregator_publishes_a_press() {
        let mut agg = Aggregator::new();
        assert!(agg.map_point(0x30, 0, 1));
        agg.begin_frame();
        agg.merge(0x30, 0b1);
        let diff = agg.finish_frame(1_000);
        assert_eq!(diff.state, 1);
        assert_eq!(diff.events[0].edge, Edge::Press);
    }
}
