//! Hosted logging sink used under `cargo test` and by host-side tooling.
//!
//! Mirrors [`crate::serial`]'s one job (push a byte somewhere) without the
//! bare-metal port dance, so the same `println!`/`info!`/... macros work
//! whether the CORE is embedded in an emulator or exercised by a test.

use std::io::Write as _;
use std::sync::Mutex;

static STDOUT_LOCK: Mutex<()> = Mutex::new(());

/// Write a single byte to the process's standard output.
pub fn write_byte(byte: u8) {
    let _guard = STDOUT_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let _ = std::io::stdout().write_all(&[byte]);
}
