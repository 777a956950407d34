//! Short-horizon CSV files
//!
//! One file per local calendar day, `readings-YYYY-MM-DD.csv`, one row per
//! reading. Rows that could not be written stay queued and are written ahead
//! of the next reading.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use tracing::{debug, info, warn};

use super::error::StorageResult;
use crate::Reading;
use crate::util::local_day;

/// Rows kept while the directory is not writable
const MAX_PENDING_ROWS: usize = 10_000;

const FILE_PREFIX: &str = "readings-";
const FILE_SUFFIX: &str = ".csv";

struct PendingRow {
    day: NaiveDate,
    fields: Vec<String>,
}

pub struct ShortHorizonWriter {
    dir: PathBuf,
    retain_days: u32,
    utc_offset_minutes: i32,
    columns: Vec<String>,
    pending: VecDeque<PendingRow>,
    current_day: Option<NaiveDate>,
}

impl ShortHorizonWriter {
    /// `columns` are the parameter columns after `timestamp,meter_id`
    pub fn new(
        dir: impl Into<PathBuf>,
        retain_days: u32,
        utc_offset_minutes: i32,
        columns: Vec<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            retain_days,
            utc_offset_minutes,
            columns,
            pending: VecDeque::new(),
            current_day: None,
        }
    }

    pub fn file_name(day: NaiveDate) -> String {
        format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y-%m-%d"))
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(Self::file_name(day))
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    fn header(&self) -> Vec<String> {
        let mut header = vec!["timestamp".to_string(), "meter_id".to_string()];
        header.extend(self.columns.iter().cloned());
        header
    }

    fn row(&self, reading: &Reading) -> Vec<String> {
        let mut fields = vec![
            reading.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            reading.meter_id.to_string(),
        ];
        fields.extend(
            self.columns
                .iter()
                .map(|column| reading.get(column).map(|v| v.to_string()).unwrap_or_default()),
        );
        fields
    }

    /// Queue `reading` and write everything pending
    ///
    /// Returns the number of rows written. On error the rows not yet written
    /// stay queued.
    pub fn append(&mut self, reading: &Reading) -> StorageResult<usize> {
        let day = local_day(reading.timestamp, self.utc_offset_minutes);

        if self.pending.len() >= MAX_PENDING_ROWS {
            warn!("CSV pending queue full, dropping oldest row");
            self.pending.pop_front();
        }
        self.pending.push_back(PendingRow {
            day,
            fields: self.row(reading),
        });

        if self.current_day.is_some_and(|current| current < day) {
            info!("rotating CSV log to {}", Self::file_name(day));
            if let Err(e) = self.remove_expired(day) {
                warn!("failed to remove expired CSV files: {}", e);
            }
        }
        self.current_day = self.current_day.max(Some(day));

        self.write_pending()
    }

    fn write_pending(&mut self) -> StorageResult<usize> {
        fs::create_dir_all(&self.dir)?;

        let mut written = 0;
        while let Some(day) = self.pending.front().map(|row| row.day) {
            let path = self.path_for(day);
            let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

            if is_new {
                file.write_all(&encode_record(&self.header())?)?;
            }

            let rows = self.pending.iter().take_while(|row| row.day == day);
            let (done, result) = write_rows(&mut file, rows);
            self.pending.drain(..done);
            written += done;
            if let Err(e) = result {
                debug!("wrote {} CSV rows before failing", written);
                return Err(e);
            }
        }

        debug!("wrote {} CSV rows", written);
        Ok(written)
    }

    /// Delete day files older than the retention period, relative to `today`
    pub fn remove_expired(&self, today: NaiveDate) -> StorageResult<usize> {
        let oldest_kept = today - Duration::days(i64::from(self.retain_days.max(1)) - 1);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let Some(day) = Self::day_of(&entry.path()) else {
                continue;
            };
            if day < oldest_kept {
                fs::remove_file(entry.path())?;
                debug!("removed expired CSV file {}", entry.path().display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn day_of(path: &Path) -> Option<NaiveDate> {
        let name = path.file_name()?.to_str()?;
        let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }
}

fn encode_record(fields: &[String]) -> StorageResult<Vec<u8>> {
    let mut encoder = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    encoder.write_record(fields)?;
    encoder.flush()?;
    Ok(encoder.get_ref().clone())
}

/// Write rows one `write_all` each; returns how many made it, and the error
/// that stopped the rest
fn write_rows<'a, W: Write>(
    out: &mut W,
    rows: impl Iterator<Item = &'a PendingRow>,
) -> (usize, StorageResult<()>) {
    let mut done = 0;
    for row in rows {
        let result = encode_record(&row.fields).and_then(|line| Ok(out.write_all(&line)?));
        if let Err(e) = result {
            return (done, Err(e));
        }
        done += 1;
    }
    (done, Ok(()))
}
