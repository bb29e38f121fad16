// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::sync::mpsc::Receiver;
use std::sync::Once;
use std::time::Duration;

use evio::{AioEngine, EngineConfig};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn start_engine(config: EngineConfig) -> AioEngine {
    init();
    let engine = AioEngine::new(config);
    engine.start(2).expect("unable to start engine");
    engine
}

/// Waits for an async completion signalled over a channel.
pub fn wait<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("timed out waiting for completion")
}
