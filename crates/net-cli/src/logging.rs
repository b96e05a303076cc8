//! Log bootstrap: `<rfc3339> <LEVEL> <target>: <msg>` on stderr and in the
//! log file

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use env_logger::{Builder, Env, Target};

/// Copies every log line to stderr and, when it could be opened, the log file
struct Tee {
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = &mut self.file {
            // stop writing to the file after the first failure
            if file.write_all(buf).is_err() {
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// `<tmp>/ztnet-YYYYmmdd-HHMMSS.log`
pub fn default_log_path(now: DateTime<Local>) -> PathBuf {
    std::env::temp_dir().join(format!("ztnet-{}.log", now.format("%Y%m%d-%H%M%S")))
}

pub fn format_line(now: DateTime<Local>, level: log::Level, target: &str, message: &str) -> String {
    format!(
        "{} {} {}: {}",
        now.to_rfc3339_opts(SecondsFormat::Secs, false),
        level,
        target,
        message
    )
}

/// Initialize logging; `RUST_LOG` wins over the `-v` default. Returns the
/// log file in use, if any.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Option<PathBuf> {
    let level = if verbose { "debug" } else { "info" };
    let path = log_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_log_path(Local::now()));

    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {}", path.display(), e);
            None
        }
    };
    let in_use = file.as_ref().map(|_| path);

    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_line(
                    Local::now(),
                    record.level(),
                    record.target(),
                    &record.args().to_string()
                )
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })));
    let _ = builder.try_init();

    in_use
}
