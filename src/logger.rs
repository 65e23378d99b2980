//! Console logging setup. The log level is taken from `RUST_LOG`, e.g.
//! `RUST_LOG=poolstor=trace` prints all trace!() and higher messages.

use std::{io::Write, path::Path};

use env_logger::{Builder, Env};

/// Configure the logging format and install the global logger. Safe to
/// call more than once; later calls are no-ops.
pub fn init(level: &str) {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or(level));

    builder.format(|buf, record| {
        let mut level_style = buf.default_level_style(record.level());
        level_style.set_intense(true);
        writeln!(
            buf,
            "[{} {} {}:{}] {}",
            buf.timestamp_nanos(),
            level_style.value(record.level()),
            Path::new(record.file().unwrap_or("-"))
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("-"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder.try_init().ok();
}
