use std::{panic, path::Path};

use anyhow::{Context, Result};
use backtrace::Backtrace;

pub const LOG_INFO: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/log/info.yml");
pub const LOG_DEBUG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/log/debug.yml");
pub const LOG_TRACE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/log/trace.yml");
pub const LOG_TESTS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/log/tests.yml");

pub fn init_log(log_config: &Path) -> Result<()> {
    set_panic_log_hook();
    log4rs::init_file(log_config, Default::default()).with_context(|| {
        format!(
            "Failed to initialize logger with config from {:?}",
            &log_config
        )
    })
}

fn set_panic_log_hook() {
    panic::set_hook(Box::new(|info| {
        let msg = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Box<Any>");

        match info.location() {
            Some(location) => {
                log::error!(
                    target: "panic", "panicked at '{}': {}:{}",
                    msg,
                    location.file(),
                    location.line()
                );
            }
            None => log::error!(target: "panic", "panicked at '{}'", msg),
        }

        log::error!(target: "panic::debug_info", "{:?}", Backtrace::new());
    }));
}
