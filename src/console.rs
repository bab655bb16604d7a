//! Kernel console output.
//!
//! A single spinlocked writer funnels all `print!`/`println!` output to a
//! sink installed at boot (the UART on real hardware, host stdout in tests).
//! Before a sink is installed, output is dropped; the allocator and VFS must
//! stay usable without a console.

use core::fmt::{self, Write};

use spin::Mutex;

/// Where console bytes end up.
pub trait ConsoleSink: Send {
    fn putc(&mut self, c: u8);
}

pub struct Printer {
    sink: Option<&'static mut dyn ConsoleSink>,
}

impl Printer {
    pub const fn new() -> Self {
        Self { sink: None }
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = self.sink.as_mut() {
            for c in s.bytes() {
                sink.putc(c);
            }
        }
        Ok(())
    }
}

static PRINTER: Mutex<Printer> = Mutex::new(Printer::new());

/// Installs the boot console. Called once, before the first `println!`.
pub fn init(sink: &'static mut dyn ConsoleSink) {
    PRINTER.lock().sink = Some(sink);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    // Never fails; a missing sink swallows the output.
    let _ = PRINTER.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {
        $crate::console::_print(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}
