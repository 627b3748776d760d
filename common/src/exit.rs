use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::TERM_SIGNALS;

/// clean exit at the next flag check
pub static EXIT: AtomicBool = AtomicBool::new(false);
/// shutdown without flushing
pub static TERM: AtomicBool = AtomicBool::new(false);

pub fn register_signal_handlers() -> Result<()> {
    // NOTE: DO NOT USE `log`! this may deadlock
    let on_term = || {
        if !EXIT.swap(true, Ordering::SeqCst) {
            eprintln!("Received first term signal: clean exit at next opportunity");
        } else if !TERM.swap(true, Ordering::SeqCst) {
            eprintln!("Received second term signal: shutdown without flushing");
        } else {
            eprintln!("Received third term signal: force exit");
            signal_hook::low_level::exit(1);
        }
    };

    for signal in TERM_SIGNALS {
        unsafe {
            signal_hook::low_level::register(*signal, on_term)
                .context("register signal handler")?;
        }
    }

    Ok(())
}
