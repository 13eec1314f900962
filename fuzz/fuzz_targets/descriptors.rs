#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use usbxfer::{
    descriptors::DecodeMode,
    platform::{DeviceIo, Disconnected},
    BosCapabilities, Configuration, Endpoint,
};

fuzz_target!(|data: &[u8]| {
    let io: Arc<dyn DeviceIo> = Arc::new(Disconnected);
    let control = Arc::new(Endpoint::control(io.clone(), 64));

    for mode in [DecodeMode::Standard, DecodeMode::SuperSpeed] {
        if let Ok(config) = Configuration::decode(&io, &control, data, mode) {
            assert!(config.bytes_consumed() <= data.len());
            let s = format!("{config:?}{config}");
            std::hint::black_box(s);
        }
    }

    if let Ok(bos) = BosCapabilities::decode(data) {
        let s = format!("{bos:?}{bos}");
        std::hint::black_box(s);
    }
});
