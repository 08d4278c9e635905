use std::io::Write;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Registry;

struct TerminalWriter {}

lazy_static! {
    pub static ref TERMINAL_OUTPUT: Mutex<Option<Arc<Mutex<dyn Write + Send + Sync>>>> =
        Mutex::new(Some(Arc::new(Mutex::new(std::io::stderr()))));
}

impl Write for TerminalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let current_target = TERMINAL_OUTPUT.lock().expect("lock() should not fail");
        if let Some(target) = current_target.deref() {
            let mut target = target.lock().expect("lock() should not fail");
            target.write(buf)
        } else {
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let output = TERMINAL_OUTPUT.lock().expect("lock() should not fail");
        if let Some(target) = output.deref() {
            let mut target = target.lock().expect("lock() should not fail");
            target.flush()
        } else {
            Ok(())
        }
    }
}

pub struct LoggingOptions {
    pub file: Option<PathBuf>,
    pub level: tracing::Level,
    /// Suppress timestamps and level prefixes on the terminal layer; the
    /// file layer is always timestamped regardless.
    pub terminal_raw: bool,
}

/// Guards all logging activity. Dropping it flushes the non-blocking file
/// appender and detaches the global subscriber's file handle.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(options: LoggingOptions) -> std::result::Result<LogGuard, String> {
    let terminal_layer = fmt::Layer::default()
        .with_target(false)
        .with_ansi(!options.terminal_raw)
        .without_time()
        .with_writer(|| TerminalWriter {})
        .with_filter(LevelFilter::from(options.level));

    let (file_layer, file_guard) = match &options.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().ok_or_else(|| "log file path has no file name".to_string())?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::Layer::default()
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(LevelFilter::from(tracing::Level::TRACE));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(terminal_layer).with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| "Failed to update global default logger".to_string())?;

    Ok(LogGuard { _file_guard: file_guard })
}

pub struct ViewLogGuard {
    released: bool,
    previous_logger: Option<Arc<Mutex<dyn Write + Send + Sync>>>,
}

impl ViewLogGuard {
    fn restore_previous_(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut output = TERMINAL_OUTPUT.lock().unwrap();
        *output = self.previous_logger.take();
    }
}

impl Drop for ViewLogGuard {
    fn drop(&mut self) {
        self.restore_previous_();
    }
}

pub fn update_terminal_target(target: Arc<Mutex<dyn Write + Send + Sync>>) -> ViewLogGuard {
    let mut output = TERMINAL_OUTPUT.lock().unwrap();
    let previous_logger = output.replace(target);
    ViewLogGuard { previous_logger, released: false }
}
