use std::fmt;

use log::{Level, Log, Metadata, Record};

static LOGGER: Logger = Logger {};

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Warnings and errors go to stderr.
        if record.level() <= Level::Warn {
            eprintln!(
                "{} {} -- {}",
                record.level(),
                record.target(),
                record.args()
            );
        } else {
            println!(
                "{} {} -- {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Formats packet bytes as space-separated hex, for trace logs.
pub fn fmt_slice_hex(data: &[u8]) -> impl fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (i, b) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{b:02x}")?;
            }
            Ok(())
        }
    }
    HexSlice(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_slice() {
        assert_eq!(fmt_slice_hex(&[0x60, 0x0a, 0xff]).to_string(), "60 0a ff");
        assert_eq!(fmt_slice_hex(&[]).to_string(), "");
    }
}
