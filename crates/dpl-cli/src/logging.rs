use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

/// Holds the log file open for the lifetime of `main`.
pub struct LogGuard {
    sink: TeeSink,
}

impl LogGuard {
    pub fn file_enabled(&self) -> bool {
        self.sink.file.is_some()
    }
}

/// Installs the global subscriber. Records go to stderr, keeping stdout for
/// command output, and are appended to `<log_dir>/dpl-<project>.log` when a
/// log dir is set.
pub fn init_logging(debug: bool, log_dir: &str, project_id: &str) -> Option<LogGuard> {
    let file = match open_log_file(Path::new(log_dir.trim()), project_id) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let sink = TeeSink::new(file);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(debug, non_empty_env("DPL_LOG_LEVEL")))
        .with_writer(sink.clone())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { sink })
}

/// `--debug` wins, then an explicit level, then `RUST_LOG`, then `info`.
fn log_filter(debug: bool, level: Option<String>) -> EnvFilter {
    match (debug, level) {
        (true, _) => EnvFilter::new("debug"),
        (false, Some(level)) => EnvFilter::new(level),
        (false, None) => {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    }
}

/// Cloned into every record's writer; all clones append to the same file.
#[derive(Clone)]
struct TeeSink {
    file: Option<Arc<Mutex<File>>>,
}

impl TeeSink {
    fn new(file: Option<File>) -> Self {
        Self {
            file: file.map(|file| Arc::new(Mutex::new(file))),
        }
    }
}

impl<'a> MakeWriter<'a> for TeeSink {
    type Writer = TeeSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for TeeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().lock().write_all(buf);
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().lock().flush();
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path, project_id: &str) -> io::Result<Option<File>> {
    if log_dir.as_os_str().is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(log_file_name(project_id)))
        .map(Some)
}

fn log_file_name(project_id: &str) -> String {
    let project = project_id
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect::<String>();
    if project.is_empty() {
        "dpl.log".to_string()
    } else {
        format!("dpl-{project}.log")
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
