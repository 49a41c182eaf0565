use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;

/// Copies every log line to stderr and to the log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the process-wide logger.
///
/// Records read `[LEVEL time]:origin: message`, where the origin is the record's
/// target (`capture`, `sync`, `compositor`, `encoder`, `output`, `fanout`,
/// `pipeline`). `level` is the default filter and `RUST_LOG` overrides it. With
/// `file` set, lines are appended there as well as written to stderr.
pub fn init(level: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .parse_filters(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}]:{}: {}",
                record.level(),
                buf.timestamp_millis(),
                record.target(),
                record.args()
            )
        });

    if let Some(path) = file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    builder.try_init().context("install logger")?;
    Ok(())
}
