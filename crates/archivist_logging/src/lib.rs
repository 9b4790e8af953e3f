//! Logging setup for Archivist binaries.
//!
//! One subscriber per process: a size-rotated log file plus stderr. Library
//! crates only emit `tracing` events and never install a subscriber.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "archivist=info,archivist_service=info,archivist_db=info";
const DEFAULT_MAX_LOG_FILES: usize = 5;
const DEFAULT_MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Overrides `<ARCHIVIST_HOME>/logs`.
    pub log_dir: Option<PathBuf>,
    pub max_files: usize,
    pub max_file_size: u64,
}

impl<'a> LogConfig<'a> {
    pub fn new(app_name: &'a str) -> Self {
        Self {
            app_name,
            verbose: false,
            log_dir: None,
            max_files: DEFAULT_MAX_LOG_FILES,
            max_file_size: DEFAULT_MAX_LOG_FILE_SIZE,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Install the global subscriber: rotating file layer + stderr layer.
///
/// `RUST_LOG` overrides the default filter. With `verbose` the console also
/// shows debug events for the archivist crates.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match &config.log_dir {
        Some(dir) => dir.clone(),
        None => logs_dir()?,
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_writer = SharedRollingWriter::new(
        &log_dir,
        config.app_name,
        config.max_files,
        config.max_file_size,
    )?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("archivist=debug,archivist_service=debug,archivist_db=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(())
}

/// Archivist home directory: `$ARCHIVIST_HOME` or `~/.archivist`.
pub fn archivist_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("ARCHIVIST_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".archivist"))
}

/// Default log directory: `<home>/logs`.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(archivist_home()?.join("logs"))
}

/// Size-capped log file; on overflow `app.log` becomes `app.log.1`, older
/// files shift up and the oldest beyond `max_files` is removed.
struct RollingFileAppender {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RollingFileAppender {
    fn open(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut appender = Self {
            dir: dir.to_path_buf(),
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        appender.reopen()?;
        if appender.current_size > appender.max_size {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.current_size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let keep = self.max_files - 1;
        if keep == 0 {
            fs::remove_file(self.current_path()).or_else(ignore_missing)?;
            return self.reopen();
        }

        fs::remove_file(self.rotated_path(keep)).or_else(ignore_missing)?;
        for idx in (1..keep).rev() {
            let src = self.rotated_path(idx);
            if src.exists() {
                fs::rename(&src, self.rotated_path(idx + 1))?;
            }
        }
        let current = self.current_path();
        if current.exists() {
            fs::rename(current, self.rotated_path(1))?;
        }
        self.reopen()
    }
}

fn ignore_missing(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let written = file.write(buf)?;
        self.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl SharedRollingWriter {
    fn new(dir: &Path, base_name: &str, max_files: usize, max_size: u64) -> Result<Self> {
        let appender = RollingFileAppender::open(dir, base_name, max_files, max_size)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedRollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_bounded_file_count() {
        let tmp = TempDir::new().unwrap();
        let mut appender = RollingFileAppender::open(tmp.path(), "svc", 3, 16).unwrap();

        for _ in 0..10 {
            appender.write_all(b"0123456789ab\n").unwrap();
        }
        appender.flush().unwrap();

        assert!(tmp.path().join("svc.log").exists());
        assert!(tmp.path().join("svc.log.1").exists());
        assert!(tmp.path().join("svc.log.2").exists());
        assert!(!tmp.path().join("svc.log.3").exists());
    }

    #[test]
    fn test_single_file_mode_truncates() {
        let tmp = TempDir::new().unwrap();
        let mut appender = RollingFileAppender::open(tmp.path(), "one", 1, 8).unwrap();

        appender.write_all(b"12345678").unwrap();
        appender.write_all(b"abc").unwrap();
        appender.flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("one.log")).unwrap();
        assert_eq!(content, "abc");
        assert!(!tmp.path().join("one.log.1").exists());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("archivist serve/1"), "archivist_serve_1");
        assert_eq!(sanitize_name("archive-service_2"), "archive-service_2");
    }
}
