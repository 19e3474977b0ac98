use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::LocalTime},
    prelude::*,
};

use crate::configs::{Config, FileLoggingConfig};

/// Builds the filter directive string from `logging.level` and `logging.filters`.
fn filter_directives(config: &Config) -> String {
    let logging = config.logging.as_ref();
    let level = logging.and_then(|l| l.level.as_deref()).unwrap_or("info");

    match logging.and_then(|l| l.filters.as_deref()) {
        Some(filters) if !filters.trim().is_empty() => format!("{},{}", level, filters),
        _ => level.to_string(),
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the config file.
pub fn init(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let stdout_layer = fmt::layer()
        .with_timer(LocalTime::rfc_3339())
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);

    let file_layer = config
        .logging
        .as_ref()
        .and_then(|l| l.file.as_ref())
        .and_then(|file| match PrunedFileWriter::open(file) {
            Ok(writer) => Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_timer(LocalTime::rfc_3339())
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false),
            ),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", file.path, e);
                None
            }
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

/// Appends log output to a file and trims it back to the newest `max_lines`
/// lines once enough new lines have accumulated.
#[derive(Clone)]
pub(crate) struct PrunedFileWriter {
    path: PathBuf,
    max_lines: usize,
    written: Arc<Mutex<usize>>,
}

impl PrunedFileWriter {
    fn open(config: &FileLoggingConfig) -> io::Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            max_lines: config.max_lines.max(1) as usize,
            written: Arc::new(Mutex::new(0)),
        })
    }

    fn prune_threshold(&self) -> usize {
        (self.max_lines / 10).max(50)
    }

    fn prune(path: &Path, keep: usize) -> io::Result<()> {
        let reader = BufReader::new(File::open(path)?);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(keep + 1);
        let mut total = 0usize;
        for line in reader.lines() {
            tail.push_back(line?);
            total += 1;
            if tail.len() > keep {
                tail.pop_front();
            }
        }
        if total <= keep {
            return Ok(());
        }

        let mut file = File::create(path)?;
        for line in tail {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

impl Write for PrunedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .write_all(buf)?;

        *written += buf.iter().filter(|&&b| b == b'\n').count();
        if *written >= self.prune_threshold() {
            if let Err(e) = Self::prune(&self.path, self.max_lines) {
                eprintln!("Failed to prune log file: {}", e);
            }
            *written = 0;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> fmt::MakeWriter<'a> for PrunedFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
