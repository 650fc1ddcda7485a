//! Replay of journal files into a fresh cache instance.

use crate::archiver::{existing_sequences, journal_path, ArchiveConfig, JournalError};
use crate::record::{decode_record, RecordError};
use kombu_events::Notification;
use kombu_observe::{JournalEvt, JournalKind, Meter, VizEvent};
use std::sync::Arc;

/// What a replay pass found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoreReport {
    pub records_replayed: u64,
    pub files_scanned: u64,
    /// True if replay stopped early at a truncated or corrupt record.
    pub truncated: bool,
}

/// Replays all journal files in ascending sequence order, invoking `apply`
/// for each record in its original commit order.
///
/// A truncated or corrupt record is the expected residue of a crash
/// mid-append and is treated as the end of valid history: replay stops and
/// reports `truncated` instead of failing the whole restore. A missing
/// directory is an empty history.
pub async fn restore(
    config: &ArchiveConfig,
    meter: Arc<dyn Meter>,
    mut apply: impl FnMut(Notification),
) -> Result<RestoreReport, JournalError> {
    let mut report = RestoreReport::default();

    for seq in existing_sequences(config).await? {
        report.files_scanned += 1;
        let data = tokio::fs::read(journal_path(config, seq)).await?;

        let mut offset = 0usize;
        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok((note, consumed)) => {
                    apply(note);
                    offset += consumed;
                    report.records_replayed += 1;
                }
                Err(RecordError::Incomplete) => {
                    tracing::warn!(
                        seq,
                        offset,
                        "truncated record at journal tail, replay stops here"
                    );
                    return Ok(truncated(report, config, seq, meter));
                }
                Err(e) => {
                    tracing::warn!(seq, offset, error = %e, "corrupt journal record, replay stops here");
                    return Ok(truncated(report, config, seq, meter));
                }
            }
        }
    }

    Ok(report)
}

fn truncated(
    mut report: RestoreReport,
    config: &ArchiveConfig,
    seq: u64,
    meter: Arc<dyn Meter>,
) -> RestoreReport {
    report.truncated = true;
    meter.emit(VizEvent::Journal(JournalEvt {
        partition: config.partition,
        seq,
        kind: JournalKind::TailTruncated,
    }));
    report
}
