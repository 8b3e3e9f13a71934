//! Log sink: mirrors controller output to the presenter and to a rotating
//! set of per-run log files.
//!
//! All output goes through one writer thread fed by a crossbeam channel, so
//! records keep their emission order and never interleave, no matter which
//! task or engine thread produced them. Files are named
//! `{prefix}_{timestamp}_v{version}_{part}.txt`; the timestamp is fixed
//! when the run starts.
//!
//! File logging is best-effort: I/O failures are reported through
//! `tracing` and the run carries on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;

use crate::config::LogConfig;
use crate::ui::Presenter;

/// Format of the run timestamp embedded in file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Messages for the writer thread.
enum SinkMessage {
    Append(String),
    CreatedFiles(oneshot::Sender<Vec<PathBuf>>),
}

/// Cloneable handle to the output writer thread.
#[derive(Clone)]
pub struct LogSink {
    tx: Sender<SinkMessage>,
}

impl LogSink {
    /// Start a writer bound to one run. With `config.dir == None` output is
    /// only mirrored to the presenter.
    pub fn spawn(config: &LogConfig, timestamp: &str, presenter: Arc<dyn Presenter>) -> Self {
        let (tx, rx) = unbounded();
        let writer = config.dir.as_ref().map(|dir| {
            PartWriter::new(
                dir.clone(),
                file_stem(&config.file_prefix, timestamp),
                config.max_part_bytes,
            )
        });

        let spawned = thread::Builder::new()
            .name("cellab-output".into())
            .spawn(move || output_worker(rx, writer, presenter));
        if let Err(e) = spawned {
            // Appends become no-ops; the run itself is unaffected.
            tracing::error!(error = %e, "failed to spawn output writer thread");
        }

        Self { tx }
    }

    /// Presenter-only sink (no files).
    pub fn presenter_only(presenter: Arc<dyn Presenter>) -> Self {
        Self::spawn(&LogConfig::default(), "", presenter)
    }

    /// Queue one record. Never blocks and never fails.
    pub fn append(&self, text: impl Into<String>) {
        if self.tx.send(SinkMessage::Append(text.into())).is_err() {
            tracing::debug!("output writer gone, dropping record");
        }
    }

    /// Files opened during this run, in creation order.
    ///
    /// Resolves after every record queued before the call has been written.
    pub async fn created_files(&self) -> Vec<PathBuf> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::CreatedFiles(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let _ = self.created_files().await;
    }
}

fn file_stem(prefix: &str, timestamp: &str) -> String {
    format!("{prefix}_{timestamp}_v{}", env!("CARGO_PKG_VERSION"))
}

fn output_worker(
    rx: Receiver<SinkMessage>,
    mut writer: Option<PartWriter>,
    presenter: Arc<dyn Presenter>,
) {
    for msg in rx.iter() {
        match msg {
            SinkMessage::Append(text) => {
                let shown =
                    std::panic::catch_unwind(AssertUnwindSafe(|| presenter.show(&text)));
                if shown.is_err() {
                    tracing::warn!("presenter panicked while showing output");
                }
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.write_record(&text) {
                        tracing::warn!(error = %e, dir = %w.dir.display(), "failed to write log record");
                    }
                }
            }
            SinkMessage::CreatedFiles(reply) => {
                let files = writer
                    .as_ref()
                    .map(|w| w.created.clone())
                    .unwrap_or_default();
                let _ = reply.send(files);
            }
        }
    }
    tracing::trace!("output writer finished");
}

/// Current part file and its tracked length.
struct OpenPart {
    file: File,
    len: u64,
}

/// Size-capped rotating part files for one run.
struct PartWriter {
    dir: PathBuf,
    stem: String,
    max_part_bytes: u64,
    part: u32,
    current: Option<OpenPart>,
    created: Vec<PathBuf>,
}

impl PartWriter {
    fn new(dir: PathBuf, stem: String, max_part_bytes: u64) -> Self {
        Self {
            dir,
            stem,
            max_part_bytes,
            part: 1,
            current: None,
            created: Vec::new(),
        }
    }

    fn part_path(&self, part: u32) -> PathBuf {
        self.dir.join(format!("{}_{part}.txt", self.stem))
    }

    fn write_record(&mut self, text: &str) -> std::io::Result<()> {
        let part = self.writable_part()?;
        let record = format!("{text}\n");
        let result = part.file.write_all(record.as_bytes());
        match result {
            Ok(()) => {
                part.len += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Reopen on the next record.
                self.current = None;
                Err(e)
            }
        }
    }

    fn writable_part(&mut self) -> std::io::Result<&mut OpenPart> {
        let full = self
            .current
            .as_ref()
            .is_some_and(|open| open.len >= self.max_part_bytes);
        if full {
            self.current = None;
            self.part += 1;
        }

        if self.current.is_none() {
            // Skip parts already at the cap (e.g. left by an earlier writer
            // with the same timestamp).
            loop {
                let len = file_len(&self.part_path(self.part));
                if len < self.max_part_bytes {
                    break;
                }
                self.part += 1;
            }

            std::fs::create_dir_all(&self.dir)?;
            let path = self.part_path(self.part);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            if !self.created.contains(&path) {
                tracing::debug!(path = %path.display(), "opened log part");
                self.created.push(path);
            }
            self.current = Some(OpenPart { file, len });
        }

        // Just populated above.
        match self.current.as_mut() {
            Some(open) => Ok(open),
            None => Err(std::io::Error::other("log part unavailable")),
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Presenter for Recorder {
        fn show(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    fn config(dir: &Path, cap: u64) -> LogConfig {
        LogConfig {
            dir: Some(dir.to_path_buf()),
            max_part_bytes: cap,
            file_prefix: "iperf3".into(),
        }
    }

    #[tokio::test]
    async fn writes_and_mirrors_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink = LogSink::spawn(&config(tmp.path(), 1024), "20250101_120000", recorder.clone());

        for i in 0..5 {
            sink.append(format!("line {i}"));
        }
        let files = sink.created_files().await;

        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("iperf3_20250101_120000_v"));
        assert!(name.ends_with("_1.txt"));

        let content = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content, "line 0\nline 1\nline 2\nline 3\nline 4\n");
        assert_eq!(recorder.0.lock().unwrap().len(), 5);
        assert_eq!(recorder.0.lock().unwrap()[4], "line 4");
    }

    #[tokio::test]
    async fn rotates_at_cap_and_records_each_part_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::spawn(&config(tmp.path(), 10), "ts", Arc::new(Recorder::default()));

        sink.append("0123456789"); // 11 bytes -> part 1 full
        sink.append("a");
        sink.append("b");
        let files = sink.created_files().await;

        assert_eq!(files.len(), 2);
        assert!(files[0].to_string_lossy().ends_with("_1.txt"));
        assert!(files[1].to_string_lossy().ends_with("_2.txt"));
        assert_eq!(std::fs::read_to_string(&files[1]).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn skips_full_parts_from_earlier_writers() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 8);
        let stem = file_stem("iperf3", "ts");
        std::fs::write(tmp.path().join(format!("{stem}_1.txt")), "full-part-1\n").unwrap();

        let sink = LogSink::spawn(&cfg, "ts", Arc::new(Recorder::default()));
        sink.append("x");
        let files = sink.created_files().await;

        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("_2.txt"));
    }

    #[tokio::test]
    async fn presenter_only_creates_no_files() {
        let recorder = Arc::new(Recorder::default());
        let sink = LogSink::presenter_only(recorder.clone());
        sink.append("hello");
        assert!(sink.created_files().await.is_empty());
        assert_eq!(*recorder.0.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn unwritable_dir_does_not_fail_the_caller() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let recorder = Arc::new(Recorder::default());
        let sink = LogSink::spawn(&config(&blocker, 1024), "ts", recorder.clone());
        sink.append("still shown");
        assert!(sink.created_files().await.is_empty());
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
