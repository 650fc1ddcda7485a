//! Archiver: appends the notification stream to rotating journal files.
//!
//! The archiver runs as its own task so that journal I/O never blocks the
//! engine's commit path. Per-instance commit order is preserved because the
//! hub's broadcast channel delivers events in publish order.
//!
//! Failure semantics: an I/O error on append, or falling behind the
//! broadcast channel (a gap would make replay lie), is fatal to this
//! archiver instance: the file is closed and the task ends with an error.
//! The in-memory engine is unaffected either way.

use crate::record::encode_record;
use kombu_events::{Notification, ThresholdTrigger};
use kombu_observe::{Counter, Gauge, Histogram, JournalEvt, JournalKind, Meter, VizEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record error: {0}")]
    Record(#[from] crate::record::RecordError),
    #[error("archiver fell {0} events behind the notification stream")]
    Lagged(u64),
    #[error("archiver task panicked")]
    TaskFailed,
}

/// Configuration for one partition's journal.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Directory holding this instance's journal files.
    pub dir: PathBuf,
    /// File name base, default "cache".
    pub base: String,
    /// File name extension, default "journal".
    pub extension: String,
    /// Rotate to a new file once this many bytes accumulate...
    pub rotate_bytes: u64,
    /// ...but never rotate twice within this interval.
    pub rotate_min_interval: Duration,
    /// Partition id for telemetry labels.
    pub partition: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("journal"),
            base: "cache".to_string(),
            extension: "journal".to_string(),
            rotate_bytes: 8 * 1024 * 1024,
            rotate_min_interval: Duration::from_secs(30),
            partition: 0,
        }
    }
}

/// Builds the path for journal file `seq`.
pub(crate) fn journal_path(config: &ArchiveConfig, seq: u64) -> PathBuf {
    config
        .dir
        .join(format!("{}.{:06}.{}", config.base, seq, config.extension))
}

/// Parses the sequence number out of a journal file path, if it matches the
/// `<base>.<seq>.<ext>` scheme.
pub(crate) fn parse_journal_seq(config: &ArchiveConfig, path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != config.extension {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (base, seq) = stem.rsplit_once('.')?;
    if base != config.base {
        return None;
    }
    seq.parse::<u64>().ok()
}

/// Lists existing journal sequence numbers in ascending order.
pub(crate) async fn existing_sequences(config: &ArchiveConfig) -> std::io::Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let mut entries = match tokio::fs::read_dir(&config.dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seqs),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(seq) = parse_journal_seq(config, &entry.path()) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Handle to a running archiver task.
pub struct Archiver {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), JournalError>>,
}

impl Archiver {
    /// Spawns an archiver consuming `notifications`. A fresh journal file is
    /// started after any existing ones, so a possibly-truncated tail from a
    /// previous run is never appended into.
    pub async fn spawn(
        config: ArchiveConfig,
        notifications: broadcast::Receiver<Notification>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self, JournalError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let start_seq = existing_sequences(&config)
            .await?
            .last()
            .map(|s| s + 1)
            .unwrap_or(0);

        let writer = Writer::open(config, start_seq, meter).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(writer, notifications, shutdown_rx));

        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    /// Stops the archiver: drains already-published events, flushes, syncs,
    /// and closes the current file.
    pub async fn close(mut self) -> Result<(), JournalError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.await.map_err(|_| JournalError::TaskFailed)?
    }
}

struct Writer {
    config: ArchiveConfig,
    file: File,
    seq: u64,
    bytes_in_file: u64,
    rotation: ThresholdTrigger,
    meter: Arc<dyn Meter>,
    appends: Box<dyn Counter>,
    file_bytes: Box<dyn Gauge>,
    fsync_ms: Box<dyn Histogram>,
}

impl Writer {
    async fn open(
        config: ArchiveConfig,
        seq: u64,
        meter: Arc<dyn Meter>,
    ) -> Result<Self, JournalError> {
        let file = open_for_append(&journal_path(&config, seq)).await?;
        let rotation = ThresholdTrigger::new(config.rotate_bytes, config.rotate_min_interval);
        let appends = meter.counter("journal_appends_total", &[]);
        let file_bytes = meter.gauge("journal_file_bytes", &[]);
        let fsync_ms = meter.histogram("journal_fsync_ms", &[]);
        Ok(Self {
            config,
            file,
            seq,
            bytes_in_file: 0,
            rotation,
            meter,
            appends,
            file_bytes,
            fsync_ms,
        })
    }

    async fn append(&mut self, note: &Notification) -> Result<(), JournalError> {
        let encoded = encode_record(note);
        self.file.write_all(&encoded).await?;
        self.bytes_in_file += encoded.len() as u64;
        self.appends.inc(1);
        self.file_bytes.set(self.bytes_in_file as i64);

        if self.rotation.offer(encoded.len() as u64) {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync().await?;
        self.meter.emit(VizEvent::Journal(JournalEvt {
            partition: self.config.partition,
            seq: self.seq,
            kind: JournalKind::FileRoll {
                bytes: self.bytes_in_file,
            },
        }));

        self.seq += 1;
        self.file = open_for_append(&journal_path(&self.config, self.seq)).await?;
        self.bytes_in_file = 0;
        self.file_bytes.set(0);
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), JournalError> {
        let start = std::time::Instant::now();
        self.file.flush().await?;
        self.file.sync_data().await?;
        let elapsed = start.elapsed();
        self.fsync_ms.observe(elapsed.as_secs_f64() * 1000.0);
        self.meter.emit(VizEvent::Journal(JournalEvt {
            partition: self.config.partition,
            seq: self.seq,
            kind: JournalKind::Fsync {
                ms: elapsed.as_millis() as u32,
            },
        }));
        Ok(())
    }

    fn fail(&self) {
        self.meter.emit(VizEvent::Journal(JournalEvt {
            partition: self.config.partition,
            seq: self.seq,
            kind: JournalKind::ArchiverFailed,
        }));
    }
}

async fn run(
    mut writer: Writer,
    mut notifications: broadcast::Receiver<Notification>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), JournalError> {
    loop {
        tokio::select! {
            note = notifications.recv() => match note {
                Ok(note) => {
                    if let Err(e) = writer.append(&note).await {
                        writer.fail();
                        tracing::error!(error = %e, "journal append failed, archiver stopping");
                        return Err(e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    writer.fail();
                    tracing::error!(skipped, "archiver lagged, journal would have a gap");
                    return Err(JournalError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut shutdown => break,
        }
    }

    // Drain whatever was already published before stopping.
    loop {
        match notifications.try_recv() {
            Ok(note) => {
                if let Err(e) = writer.append(&note).await {
                    writer.fail();
                    return Err(e);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                writer.fail();
                return Err(JournalError::Lagged(skipped));
            }
            Err(_) => break,
        }
    }

    writer.sync().await?;
    tracing::debug!(seq = writer.seq, "archiver closed cleanly");
    Ok(())
}

async fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
