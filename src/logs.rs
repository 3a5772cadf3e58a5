//! Log multiplexer - routes child stdout/stderr into timestamped files.
//!
//! One pump task per stream forwards lines, stamped at arrival, to a
//! single writer task that owns every open file handle. Single-stream
//! order is preserved end to end; cross-stream interleaving in the
//! combined file is arrival order. Files are opened append-only and
//! never rotated here. No other process may write to them concurrently
//! without corruption risk; that constraint is documented, not locked.

use crate::app::AppDescriptor;
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Channel depth between the stream pumps and the writer.
const LINE_BUFFER: usize = 1024;

/// Which child stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One captured line, stamped on arrival.
#[derive(Debug)]
pub struct LogLine {
    pub stream: StreamKind,
    pub line: String,
    pub at: DateTime<Local>,
}

/// Resolved file targets for one instance's output.
#[derive(Debug, Clone)]
pub struct LogTargets {
    /// stdout lines (unused when merging)
    pub out_file: Option<PathBuf>,
    /// stderr lines (unused when merging)
    pub error_file: Option<PathBuf>,
    /// both streams in arrival order
    pub log_file: Option<PathBuf>,
    /// interleave everything into `log_file` only
    pub merge_logs: bool,
    /// chrono format string for the line prefix
    pub time_format: String,
}

impl LogTargets {
    /// Resolve targets for one instance, filling defaults under
    /// `log_dir`. With multiple instances every path gets an instance
    /// suffix so each file keeps a single writer.
    pub fn for_instance(descriptor: &AppDescriptor, instance: u32, log_dir: &Path) -> Self {
        let multi = descriptor.instances > 1;
        let stem = if multi {
            format!("{}-{}", descriptor.name, instance)
        } else {
            descriptor.name.clone()
        };

        let resolve = |configured: &Option<PathBuf>, default_name: String| -> PathBuf {
            match configured {
                Some(path) if multi => instance_path(path, instance),
                Some(path) => path.clone(),
                None => log_dir.join(default_name),
            }
        };

        if descriptor.merge_logs {
            Self {
                out_file: None,
                error_file: None,
                log_file: Some(resolve(&descriptor.log_file, format!("{}.log", stem))),
                merge_logs: true,
                time_format: descriptor.time_format.clone(),
            }
        } else {
            let log_file = descriptor
                .log_file
                .as_ref()
                .map(|path| {
                    if multi {
                        instance_path(path, instance)
                    } else {
                        path.clone()
                    }
                });
            Self {
                out_file: Some(resolve(&descriptor.out_file, format!("{}-out.log", stem))),
                error_file: Some(resolve(
                    &descriptor.error_file,
                    format!("{}-error.log", stem),
                )),
                log_file,
                merge_logs: false,
                time_format: descriptor.time_format.clone(),
            }
        }
    }
}

/// Insert `-<instance>` before the extension of a configured path.
fn instance_path(path: &Path, instance: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("log");
    let name = match path.extension().and_then(std::ffi::OsStr::to_str) {
        Some(ext) => format!("{}-{}.{}", stem, instance, ext),
        None => format!("{}-{}", stem, instance),
    };
    path.with_file_name(name)
}

/// An open, append-mode log file.
struct LogSink {
    file: File,
    path: PathBuf,
}

impl LogSink {
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn open_target(path: &Option<PathBuf>) -> Option<Self> {
        let path = path.as_ref()?;
        match Self::open(path) {
            Ok(sink) => Some(sink),
            Err(error) => {
                warn!(path = %path.display(), %error, "Failed to open log file");
                None
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        if let Err(error) = writeln!(self.file, "{}", line) {
            warn!(path = %self.path.display(), %error, "Failed to append log line");
        }
    }
}

/// Spawn the single writer task for one instance's logs.
///
/// The returned sender is cloned into one pump per stream; the writer
/// drains until every sender is dropped, so awaiting the handle after
/// the pumps finish guarantees all captured lines hit the files.
pub fn spawn_writer(targets: LogTargets) -> (mpsc::Sender<LogLine>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<LogLine>(LINE_BUFFER);

    let handle = tokio::spawn(async move {
        let mut out = LogSink::open_target(&targets.out_file);
        let mut err = LogSink::open_target(&targets.error_file);
        let mut combined = LogSink::open_target(&targets.log_file);

        while let Some(entry) = rx.recv().await {
            let stamped = format!(
                "{} {}",
                entry.at.format(&targets.time_format),
                entry.line
            );

            if targets.merge_logs {
                if let Some(sink) = combined.as_mut() {
                    sink.write_line(&stamped);
                }
                continue;
            }

            let own = match entry.stream {
                StreamKind::Stdout => out.as_mut(),
                StreamKind::Stderr => err.as_mut(),
            };
            if let Some(sink) = own {
                sink.write_line(&stamped);
            }
            if let Some(sink) = combined.as_mut() {
                sink.write_line(&stamped);
            }
        }
    });

    (tx, handle)
}

/// Spawn a pump reading one child stream line by line.
pub fn pump<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<LogLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let entry = LogLine {
                        stream,
                        line,
                        at: Local::now(),
                    };
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(stream = stream.as_str(), %error, "Log pump read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn line(stream: StreamKind, text: &str) -> LogLine {
        LogLine {
            stream,
            line: text.to_string(),
            at: Local::now(),
        }
    }

    fn targets_in(dir: &Path, merge: bool) -> LogTargets {
        LogTargets {
            out_file: if merge {
                None
            } else {
                Some(dir.join("svc-out.log"))
            },
            error_file: if merge {
                None
            } else {
                Some(dir.join("svc-error.log"))
            },
            log_file: Some(dir.join("svc.log")),
            merge_logs: merge,
            time_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }

    #[tokio::test]
    async fn test_merged_logging_is_count_preserving() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, writer) = spawn_writer(targets_in(dir.path(), true));

        for i in 0..50 {
            tx.send(line(StreamKind::Stdout, &format!("out {}", i)))
                .await
                .unwrap();
            tx.send(line(StreamKind::Stderr, &format!("err {}", i)))
                .await
                .unwrap();
        }
        drop(tx);
        writer.await.unwrap();

        let combined = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        let lines: Vec<&str> = combined.lines().collect();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines.iter().filter(|l| l.contains("out ")).count(), 50);
        assert_eq!(lines.iter().filter(|l| l.contains("err ")).count(), 50);
    }

    #[tokio::test]
    async fn test_split_streams_also_feed_combined_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, writer) = spawn_writer(targets_in(dir.path(), false));

        tx.send(line(StreamKind::Stdout, "to stdout")).await.unwrap();
        tx.send(line(StreamKind::Stderr, "to stderr")).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let out = std::fs::read_to_string(dir.path().join("svc-out.log")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("svc-error.log")).unwrap();
        let combined = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        assert!(out.contains("to stdout"));
        assert!(!out.contains("to stderr"));
        assert!(err.contains("to stderr"));
        assert_eq!(combined.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_lines_carry_timestamp_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut targets = targets_in(dir.path(), true);
        targets.time_format = "%Y".to_string();
        let (tx, writer) = spawn_writer(targets);

        tx.send(line(StreamKind::Stdout, "payload")).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let combined = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        let year = Local::now().format("%Y").to_string();
        assert_eq!(combined, format!("{} payload\n", year));
    }

    #[tokio::test]
    async fn test_pump_preserves_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, writer) = spawn_writer(targets_in(dir.path(), true));

        let input: &[u8] = b"first\nsecond\nthird\n";
        pump(input, StreamKind::Stdout, tx).await.unwrap();
        writer.await.unwrap();

        let combined = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        let order: Vec<&str> = combined
            .lines()
            .map(|l| l.rsplit(' ').next().unwrap())
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_default_targets_for_single_instance() {
        let desc = AppDescriptor::new("web", "main.py");
        let targets = LogTargets::for_instance(&desc, 0, Path::new("/var/log/warden"));
        assert_eq!(
            targets.out_file.as_deref(),
            Some(Path::new("/var/log/warden/web-out.log"))
        );
        assert_eq!(
            targets.error_file.as_deref(),
            Some(Path::new("/var/log/warden/web-error.log"))
        );
        assert_eq!(targets.log_file, None);
    }

    #[test]
    fn test_instance_suffix_keeps_files_single_writer() {
        let mut desc = AppDescriptor::new("web", "main.py");
        desc.instances = 2;
        desc.out_file = Some(PathBuf::from("/tmp/web-out.log"));

        let targets = LogTargets::for_instance(&desc, 1, Path::new("/var/log/warden"));
        assert_eq!(
            targets.out_file.as_deref(),
            Some(Path::new("/tmp/web-out-1.log"))
        );
        assert_eq!(
            targets.error_file.as_deref(),
            Some(Path::new("/var/log/warden/web-1-error.log"))
        );
    }

    #[test]
    fn test_merge_uses_combined_file_only() {
        let mut desc = AppDescriptor::new("web", "main.py");
        desc.merge_logs = true;
        let targets = LogTargets::for_instance(&desc, 0, Path::new("/var/log/warden"));
        assert_eq!(targets.out_file, None);
        assert_eq!(targets.error_file, None);
        assert_eq!(
            targets.log_file.as_deref(),
            Some(Path::new("/var/log/warden/web.log"))
        );
    }
}
