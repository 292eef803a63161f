// src/logging.rs
//! Log sink for the `tracing` subscriber.
//!
//! Lines go to `<dir>/<YYYY>_<MM>_<DD>_<name>`. The file is swapped when the
//! calendar day changes and every `split_lines` lines within one day
//! (`<...>_<name>.<n>`). In async mode lines are handed to a dedicated
//! flusher thread through a [`BlockQueue`]; a full queue falls back to a
//! synchronous write so nothing is dropped.
//!
//! ```bash
//! # filter still honors RUST_LOG
//! RUST_LOG=etude_core=debug etude -p 9006
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::block_queue::BlockQueue;
use crate::error::{EtudeError, EtudeResult};
use crate::sync::lock;

pub const DEFAULT_SPLIT_LINES: u64 = 800_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Sync,
    Async { queue_capacity: usize },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub enabled: bool,
    pub mode: LogMode,
    /// Directory plus base file name.
    pub path: PathBuf,
    pub split_lines: u64,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: LogMode::Sync,
            path: PathBuf::from("./ServerLog"),
            split_lines: DEFAULT_SPLIT_LINES,
            level: "info".to_string(),
        }
    }
}

/// Date- and size-rotated log file.
pub struct RotatingFile {
    dir: PathBuf,
    name: String,
    split_lines: u64,
    today: NaiveDate,
    count: u64,
    file: BufWriter<File>,
    current: PathBuf,
}

impl RotatingFile {
    pub fn open(path: &Path, split_lines: u64) -> io::Result<Self> {
        Self::open_on(path, split_lines, Local::now().date_naive())
    }

    fn open_on(path: &Path, split_lines: u64, today: NaiveDate) -> io::Result<Self> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"))?;
        std::fs::create_dir_all(&dir)?;

        let current = dated_path(&dir, &name, today, None);
        let file = open_append(&current)?;
        Ok(Self {
            dir,
            name,
            split_lines: split_lines.max(1),
            today,
            count: 0,
            file,
            current,
        })
    }

    pub fn current_path(&self) -> &Path {
        &self.current
    }

    pub fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_line_on(Local::now().date_naive(), line)
    }

    fn write_line_on(&mut self, today: NaiveDate, line: &[u8]) -> io::Result<()> {
        self.count += 1;
        if today != self.today || self.count % self.split_lines == 0 {
            self.file.flush()?;
            let next = if today != self.today {
                self.today = today;
                self.count = 0;
                dated_path(&self.dir, &self.name, today, None)
            } else {
                dated_path(&self.dir, &self.name, today, Some(self.count / self.split_lines))
            };
            self.file = open_append(&next)?;
            self.current = next;
        }
        self.file.write_all(line)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn dated_path(dir: &Path, name: &str, day: NaiveDate, part: Option<u64>) -> PathBuf {
    let base = format!("{}_{}", day.format("%Y_%m_%d"), name);
    match part {
        Some(n) => dir.join(format!("{}.{}", base, n)),
        None => dir.join(base),
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// `MakeWriter` handed to the fmt layer. Each event arrives as one
/// `write_all` of a complete line.
#[derive(Clone)]
pub struct LogWriter {
    file: Arc<Mutex<RotatingFile>>,
    queue: Option<Arc<BlockQueue<Vec<u8>>>>,
}

impl LogWriter {
    /// Open the sink and, in async mode, start the flusher thread.
    pub fn new(config: &LogConfig) -> EtudeResult<(Self, LogGuard)> {
        let file = RotatingFile::open(&config.path, config.split_lines)
            .map_err(|e| EtudeError::Log(format!("open {}: {}", config.path.display(), e)))?;
        let file = Arc::new(Mutex::new(file));

        let (queue, flusher) = match config.mode {
            LogMode::Sync => (None, None),
            LogMode::Async { queue_capacity } => {
                let queue = Arc::new(BlockQueue::<Vec<u8>>::new(queue_capacity));
                let handle = {
                    let queue = queue.clone();
                    let file = file.clone();
                    thread::Builder::new()
                        .name("etude-log".to_string())
                        .spawn(move || {
                            while let Some(line) = queue.pop() {
                                let _ = lock(&file).write_line(&line);
                            }
                            let _ = lock(&file).flush();
                        })
                        .map_err(|e| EtudeError::Log(format!("spawn log flusher: {}", e)))?
                };
                (Some(queue), Some(handle))
            }
        };

        let writer = Self {
            file: file.clone(),
            queue: queue.clone(),
        };
        let guard = LogGuard {
            file,
            queue,
            flusher,
        };
        Ok((writer, guard))
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(queue) = &self.queue {
            match queue.push(buf.to_vec()) {
                Ok(()) => return Ok(buf.len()),
                // full: write it here instead of dropping it
                Err(line) => {
                    lock(&self.file).write_line(&line)?;
                    return Ok(buf.len());
                }
            }
        }
        let mut file = lock(&self.file);
        file.write_line(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.file).flush()
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the sink alive. Dropping it drains the queue, joins the flusher
/// and flushes the file.
pub struct LogGuard {
    file: Arc<Mutex<RotatingFile>>,
    queue: Option<Arc<BlockQueue<Vec<u8>>>>,
    flusher: Option<JoinHandle<()>>,
}

impl LogGuard {
    pub fn current_path(&self) -> PathBuf {
        lock(&self.file).current_path().to_path_buf()
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            queue.close();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        let _ = lock(&self.file).flush();
    }
}

/// Install the global subscriber writing through a [`LogWriter`].
///
/// Returns `None` when logging is switched off; every `tracing` macro is
/// then a no-op.
pub fn init_logging(config: &LogConfig) -> EtudeResult<Option<LogGuard>> {
    if !config.enabled {
        return Ok(None);
    }
    let (writer, guard) = LogWriter::new(config)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|e| EtudeError::Log(e.to_string()))?;
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn file_name_carries_the_date() {
        let dir = tempfile::tempdir().unwrap();
        let f = RotatingFile::open_on(&dir.path().join("ServerLog"), 10, day(2024, 3, 7)).unwrap();
        assert_eq!(
            f.current_path(),
            dir.path().join("2024_03_07_ServerLog").as_path()
        );
    }

    #[test]
    fn splits_by_line_count() {
        let dir = tempfile::tempdir().unwrap();
        let today = day(2024, 3, 7);
        let mut f = RotatingFile::open_on(&dir.path().join("app"), 3, today).unwrap();
        for i in 0..7 {
            f.write_line_on(today, format!("line {}\n", i).as_bytes()).unwrap();
        }
        f.flush().unwrap();

        let first = fs::read_to_string(dir.path().join("2024_03_07_app")).unwrap();
        assert_eq!(first, "line 0\nline 1\n");
        let second = fs::read_to_string(dir.path().join("2024_03_07_app.1")).unwrap();
        assert_eq!(second, "line 2\nline 3\nline 4\n");
        let third = fs::read_to_string(dir.path().join("2024_03_07_app.2")).unwrap();
        assert_eq!(third, "line 5\nline 6\n");
    }

    #[test]
    fn new_day_reopens_and_resets_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = RotatingFile::open_on(&dir.path().join("app"), 100, day(2024, 3, 7)).unwrap();
        f.write_line_on(day(2024, 3, 7), b"before\n").unwrap();
        f.write_line_on(day(2024, 3, 8), b"after\n").unwrap();
        f.flush().unwrap();
        assert_eq!(f.current_path(), dir.path().join("2024_03_08_app").as_path());
        assert_eq!(
            fs::read_to_string(dir.path().join("2024_03_08_app")).unwrap(),
            "after\n"
        );
        assert_eq!(f.count, 0);
    }

    #[test]
    fn async_writer_drains_on_guard_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            mode: LogMode::Async { queue_capacity: 2 },
            path: dir.path().join("async"),
            ..LogConfig::default()
        };
        let (mut writer, guard) = LogWriter::new(&config).unwrap();
        // more lines than the queue holds: overflow is written inline
        for i in 0..50 {
            writer.write_all(format!("event {}\n", i).as_bytes()).unwrap();
        }
        let path = guard.current_path();
        drop(guard);

        let text = fs::read_to_string(path).unwrap();
        let mut got: Vec<usize> = text
            .lines()
            .map(|l| l.trim_start_matches("event ").parse().unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn sync_writer_flushes_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            path: dir.path().join("sync"),
            ..LogConfig::default()
        };
        let (mut writer, guard) = LogWriter::new(&config).unwrap();
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(fs::read_to_string(guard.current_path()).unwrap(), "hello\n");
    }
}
