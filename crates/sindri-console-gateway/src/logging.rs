use crate::config::Config;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "sindri-gateway.log";

/// Keeps the optional log file open for the life of the process.
pub struct LogGuard {
    file: Option<(PathBuf, Arc<File>)>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    fn make_writer(&self) -> BoxMakeWriter {
        match &self.file {
            Some((_, file)) => {
                let file = file.clone();
                BoxMakeWriter::new(move || Tee { file: file.clone() })
            }
            None => BoxMakeWriter::new(io::stdout),
        }
    }
}

/// Copies every formatted line to stdout and the log file.
struct Tee {
    file: Arc<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        let _ = (&*self.file).write_all(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        (&*self.file).flush()
    }
}

fn filter_directive(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    std::env::var("SINDRI_LOG_LEVEL")
        .ok()
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// `RUST_LOG` wins, then `SINDRI_LOG_LEVEL`, then `info` (`debug` with `--debug`). Lines go to
/// stdout and, with a log dir, are appended to `sindri-gateway.log` there too.
pub fn init_logging(config: &Config) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.debug)));
    let guard = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogGuard { file: None }
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(guard.make_writer())
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some((path, Arc::new(file))),
    })
}
