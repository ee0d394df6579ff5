use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Some(path) = record.module_path() {
                let _ = writeln!(SerialWriter, "[{} - {}] {}", record.level(), path, record.args());
            } else {
                let _ = writeln!(SerialWriter, "[{}] {}", record.level(), record.args());
            }

            // anything fatal-adjacent goes on the screen too
            if record.level() <= Level::Error {
                let _ = writeln!(VgaWriter, "[{}] {}", record.level(), record.args());
            }
        }
    }

    fn flush(&self) {}
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        unsafe {
            crate::platform::serial::puts(s);
        }
        Ok(())
    }
}

struct VgaWriter;

impl fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::platform::vga::puts(s);
        Ok(())
    }
}

static LOGGER: Logger = Logger;

pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug))
}
