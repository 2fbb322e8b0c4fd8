#![no_main]

use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use ubms_can_decoder::battery::{PackConfig, UbmsBattery};
use ubms_can_decoder::can_frame::CanFrame;
use ubms_can_decoder::parse_ubms_frame;

// Neither classification nor state application may panic for any frame
fuzz_target!(|frame: CanFrame| {
    if let Ok(Some(parsed)) = parse_ubms_frame(&frame) {
        let config = PackConfig::new(16, 4, 130.0, 57.6).unwrap();
        let mut battery = UbmsBattery::new(config);
        let _ = battery.apply(&parsed, Instant::now());
    }
});
