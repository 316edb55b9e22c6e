//! Simple module to provide logging & printing utils

#![cfg_attr(not(feature = "std"), no_std)]
// TODO: Remove this once you fix the `as` conversion warnings
#![allow(clippy::cast_possible_truncation)]

use core::fmt::{self, Write};
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "std")]
pub mod std_sink;

/// Empty struct to implement 'Write' on
pub struct Writer;

/// A macro to print to the serial port or the hosted sink with a newline
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        let _ = core::fmt::Write::write_fmt(&mut $crate::Writer, format_args!("{}\n", format_args!($($arg)*)));
    }}
}

/// A macro to print a warning to the serial port or the hosted sink
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::println!("-> INFO: {}", format_args!($($arg)*));
    }
}

/// A macro to print an error to the serial port or the hosted sink
#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => {
        $crate::println!("-> ERROR: {}", format_args!($($arg)*));
    }
}

/// A macro to print a warning to the serial port or the hosted sink
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::println!("-> WARNING: {}", format_args!($($arg)*));
    }
}

/// A macro to print a debug message to the serial port or the hosted sink
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::println!("-> DEBUG: {}", format_args!($($arg)*));
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            #[cfg(feature = "serial")]
            #[allow(static_mut_refs)]
            unsafe {
                serial::SERIAL_WRITER.write_byte_all(byte);
            };
            #[cfg(feature = "std")]
            {
                std_sink::write_byte(byte);
            };
        }

        Ok(())
    }
}
