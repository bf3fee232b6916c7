// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Support for in-kernel debugging.
//!
//! The [`debug!`] macro formats its arguments and hands the result to the
//! writer the board registered with [`set_debug_writer`]. If no writer is
//! registered the macro does nothing, so capsules can leave calls in place on
//! boards without a console.
//!
//! ```ignore
//! debug!("conn {}: terminated, reason {:#x}", handle, reason);
//! debug_verbose!("pipeline full");
//! ```
//!
//! Debug output is synchronous. Whatever the writer does happens inside the
//! caller, which is why the Link Layer gates its trace points behind
//! [`crate::config::CONFIG`].

use core::fmt::{self, Arguments, Write};
use core::ptr::addr_of;

/// Sink for debug output, implemented by the board (UART, RTT, semihosting).
pub trait IoWrite {
    /// Write `buf`, returning how many bytes were accepted. Bytes that do
    /// not fit are dropped.
    fn write(&self, buf: &[u8]) -> usize;
}

static mut DEBUG_WRITER: Option<&'static dyn IoWrite> = None;

/// Register the writer used by [`debug!`].
///
/// # Safety
///
/// Must be called once during board setup, before any context that could
/// call [`debug!`] is running.
pub unsafe fn set_debug_writer(writer: &'static dyn IoWrite) {
    DEBUG_WRITER = Some(writer);
}

fn debug_writer() -> Option<&'static dyn IoWrite> {
    // Safety: only written by `set_debug_writer` before concurrent use.
    unsafe { *addr_of!(DEBUG_WRITER) }
}

struct WriterAdapter(&'static dyn IoWrite);

impl Write for WriterAdapter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write(s.as_bytes());
        Ok(())
    }
}

/// Write a formatted line. Called by the [`debug!`] macro.
pub fn debug_println(args: Arguments) {
    if let Some(writer) = debug_writer() {
        let mut adapter = WriterAdapter(writer);
        if adapter.write_fmt(args).is_ok() {
            writer.write(b"\r\n");
        }
    }
}

/// Write a formatted line prefixed with the call site. Called by the
/// [`debug_verbose!`] macro.
pub fn debug_verbose_println(args: Arguments, file_line: &(&'static str, u32)) {
    if let Some(writer) = debug_writer() {
        let mut adapter = WriterAdapter(writer);
        let (file, line) = *file_line;
        if write!(adapter, "{}:{}: ", file, line).is_ok() && adapter.write_fmt(args).is_ok() {
            writer.write(b"\r\n");
        }
    }
}

/// In-kernel `println()` debugging.
#[macro_export]
macro_rules! debug {
    () => ({
        // Allow an empty debug!() to print the location when hit
        debug!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_println(format_args!($msg))
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_println(format_args!($fmt, $($arg)+))
    });
}

/// In-kernel `println()` debugging with filename and line numbers.
#[macro_export]
macro_rules! debug_verbose {
    () => ({
        debug_verbose!("")
    });
    ($msg:expr $(,)?) => ({
        $crate::debug::debug_verbose_println(format_args!($msg), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        })
    });
    ($fmt:expr, $($arg:tt)+) => ({
        $crate::debug::debug_verbose_println(format_args!($fmt, $($arg)+), {
            static _FILE_LINE: (&'static str, u32) = (file!(), line!());
            &_FILE_LINE
        })
    });
}
