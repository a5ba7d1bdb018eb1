// Consolidates cleaned export batches into the persisted master dataset.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use polars::functions::concat_df_diagonal;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::clean::{parse_export_timestamp, ExportBatch, RawRecordCleaner, DATE, DISTANCE_TO_PIN};
use crate::error::{Result, ShotError};
use crate::io::{read_frame, write_frame};

/// Name of the distance-to-pin column in the persisted master file, whose
/// cells carry a `" yds"` suffix.
pub const PERSISTED_DISTANCE_TO_PIN: &str = "DistanceToPin_Yrds";

/// Lists export files in `dir` ordered by their embedded session timestamp.
/// Files without a parseable timestamp are not exports and are skipped.
pub fn discover_exports(dir: &Path) -> Result<Vec<(NaiveDateTime, PathBuf)>> {
    let entries = fs::read_dir(dir).map_err(|e| ShotError::io(dir, e))?;
    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ShotError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        match parse_export_timestamp(&path) {
            Ok(ts) => found.push((ts, path)),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping file without export timestamp"),
        }
    }
    found.sort();
    Ok(found)
}

/// Concatenates batches in session order. Rows inside a batch keep their order
/// and no row is dropped.
pub fn merge_batches(mut batches: Vec<ExportBatch>) -> Result<DataFrame> {
    batches.sort_by_key(|b| b.timestamp);
    let frames: Vec<DataFrame> = batches.into_iter().map(|b| b.frame).collect();
    concat_frames(&frames)
}

/// Stacks frames vertically over the union of their columns. A column missing
/// from a frame is null in its rows; a name carried with two different dtypes
/// is stacked as text.
pub fn concat_frames(frames: &[DataFrame]) -> Result<DataFrame> {
    let mut dtypes: HashMap<PlSmallStr, DataType> = HashMap::new();
    for column in frames.iter().flat_map(|f| f.get_columns()) {
        let seen = dtypes
            .entry(column.name().clone())
            .or_insert_with(|| column.dtype().clone());
        if seen != column.dtype() {
            *seen = DataType::String;
        }
    }

    let aligned = frames
        .iter()
        .filter(|frame| frame.width() > 0)
        .map(|frame| {
            let columns = frame
                .get_columns()
                .iter()
                .map(|column| match dtypes.get(column.name()) {
                    Some(dtype) if dtype != column.dtype() => column.cast(dtype),
                    _ => Ok(column.clone()),
                })
                .collect::<PolarsResult<Vec<_>>>()?;
            DataFrame::new(columns)
        })
        .collect::<PolarsResult<Vec<_>>>()?;
    if aligned.is_empty() {
        return Ok(DataFrame::empty());
    }
    Ok(concat_df_diagonal(&aligned)?)
}

/// Converts a canonical frame to the persisted master layout: the numeric
/// distance to the pin becomes a `"<value> yds"` string column.
pub fn to_persisted(mut frame: DataFrame) -> Result<DataFrame> {
    let Ok(column) = frame.column(DISTANCE_TO_PIN) else {
        return Ok(frame);
    };
    let cells: Vec<Option<String>> = match column.dtype() {
        DataType::Float64 => column
            .f64()?
            .into_iter()
            .map(|v| v.map(|y| format!("{y} yds")))
            .collect(),
        DataType::String => column
            .str()?
            .into_iter()
            .map(|c| c.map(str::to_string))
            .collect(),
        _ => return Err(ShotError::schema(DISTANCE_TO_PIN, "is not a distance")),
    };
    frame.with_column(Series::new(DISTANCE_TO_PIN.into(), cells))?;
    frame.rename(DISTANCE_TO_PIN, PERSISTED_DISTANCE_TO_PIN.into())?;
    Ok(frame)
}

/// Latest session timestamp already present in a master frame.
pub fn latest_session(master: &DataFrame) -> Option<NaiveDateTime> {
    let dates = master.column(DATE).ok()?.datetime().ok()?;
    dates.as_datetime_iter().flatten().max()
}

/// What a merge run did.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub files_processed: Vec<PathBuf>,
    pub rows_added: usize,
    pub total_rows: usize,
}

/// Owns the master file and grows it from cleaned exports.
#[derive(Debug, Clone)]
pub struct DatasetMerger {
    master_path: PathBuf,
    cleaner: RawRecordCleaner,
}

impl DatasetMerger {
    pub fn new(master_path: impl Into<PathBuf>) -> Self {
        Self {
            master_path: master_path.into(),
            cleaner: RawRecordCleaner,
        }
    }

    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    /// Builds the master file from the full backlog, replacing any existing one.
    pub fn build(&self, files: &[PathBuf]) -> Result<MergeReport> {
        let batches = self.clean_all(files)?;
        let rows_added = batches.iter().map(|b| b.frame.height()).sum();
        let master = to_persisted(merge_batches(batches)?)?;
        write_frame(&self.master_path, &master)?;
        info!(
            master = %self.master_path.display(),
            files = files.len(),
            rows = master.height(),
            "master dataset created"
        );
        Ok(MergeReport {
            files_processed: files.to_vec(),
            rows_added,
            total_rows: master.height(),
        })
    }

    /// Appends new exports below the existing master rows. Existing rows are
    /// never rewritten in content or order.
    pub fn append(&self, files: &[PathBuf]) -> Result<MergeReport> {
        if files.is_empty() {
            let total_rows = read_frame(&self.master_path)?.height();
            info!("no new files to process");
            return Ok(MergeReport {
                files_processed: Vec::new(),
                rows_added: 0,
                total_rows,
            });
        }
        let batches = self.clean_all(files)?;
        let existing = read_frame(&self.master_path)?;
        let new_rows = to_persisted(merge_batches(batches)?)?;
        let rows_added = new_rows.height();
        let master = concat_frames(&[existing, new_rows])?;
        write_frame(&self.master_path, &master)?;
        info!(
            master = %self.master_path.display(),
            files = files.len(),
            rows_added,
            total = master.height(),
            "master dataset updated"
        );
        Ok(MergeReport {
            files_processed: files.to_vec(),
            rows_added,
            total_rows: master.height(),
        })
    }

    /// Appends every export in `dir` whose session date is on or after `since`.
    /// Sessions not later than the newest one already in the master are
    /// skipped, so repeating an update adds nothing.
    pub fn update(&self, dir: &Path, since: NaiveDate) -> Result<MergeReport> {
        let latest = latest_session(&read_frame(&self.master_path)?);
        let files: Vec<PathBuf> = discover_exports(dir)?
            .into_iter()
            .filter(|(ts, path)| {
                let fresh = latest.map_or(true, |l| *ts > l);
                if ts.date() >= since && !fresh {
                    debug!(file = %path.display(), "session already merged");
                }
                ts.date() >= since && fresh
            })
            .map(|(_, path)| path)
            .collect();
        self.append(&files)
    }

    // All files are cleaned before anything is written, so one bad export
    // leaves the master untouched.
    fn clean_all(&self, files: &[PathBuf]) -> Result<Vec<ExportBatch>> {
        let total = files.len();
        files
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let batch = self.cleaner.clean_file(path)?;
                info!(file = %path.display(), "processed file {}/{}", i + 1, total);
                Ok(batch)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure,
}

/// Bookkeeping record for one ingestion run, handed to whoever keeps the run log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub last_run: NaiveDate,
    pub status: RunStatus,
    pub error: Option<String>,
    pub files_processed: Vec<PathBuf>,
}

impl RunRecord {
    pub fn from_outcome(today: NaiveDate, outcome: &Result<MergeReport>) -> Self {
        match outcome {
            Ok(report) => Self {
                last_run: today,
                status: RunStatus::Success,
                error: None,
                files_processed: report.files_processed.clone(),
            },
            Err(e) => Self {
                last_run: today,
                status: RunStatus::Failure,
                error: Some(e.to_string()),
                files_processed: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_raw(dir: &Path, stamp: &str, header: &str, rows: &[&str]) -> PathBuf {
        let path = dir.join(format!("gspro-export{stamp}.csv"));
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{header}").unwrap();
        for row in rows {
            writeln!(f, "{row}").unwrap();
        }
        path
    }

    fn write_export(dir: &Path, stamp: &str, rows: &[&str]) -> PathBuf {
        write_raw(dir, stamp, "Club,Carry,DistanceToPin", rows)
    }

    fn carry(master: &Path) -> Vec<Option<f64>> {
        let frame = read_frame(master).unwrap();
        frame.column("Carry").unwrap().f64().unwrap().into_iter().collect()
    }

    #[test]
    fn test_build_concatenates_in_timestamp_order() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let later = write_export(dir.path(), "03-01-24-10-00-00", &["I7,150,15 yds"]);
        let earlier = write_export(dir.path(), "02-01-24-10-00-00", &["DR,230,30 ft", "DR,228,9 ft"]);
        let master = dir.path().join("master.csv");

        let merger = DatasetMerger::new(&master);
        let report = merger.build(&[later, earlier])?;
        assert_eq!(report.rows_added, 3);
        assert_eq!(report.total_rows, 3);

        let text = fs::read_to_string(&master)?;
        assert_eq!(text.lines().filter(|l| l.starts_with("Club,")).count(), 1);

        assert_eq!(carry(&master), vec![Some(230.0), Some(228.0), Some(150.0)]);
        let frame = read_frame(&master)?;
        let pin: Vec<Option<&str>> = frame.column(PERSISTED_DISTANCE_TO_PIN)?.str()?.into_iter().collect();
        assert_eq!(pin, vec![Some("10 yds"), Some("3 yds"), Some("15 yds")]);
        Ok(())
    }

    #[test]
    fn test_build_fills_column_missing_from_one_export() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let header = "Club,Carry,DistanceToPin,AirTime";
        let first = write_raw(dir.path(), "02-01-24-10-00-00", header, &["DR,230,30 ft,0", "DR,228,9 ft,0"]);
        let second = write_raw(dir.path(), "02-08-24-10-00-00", header, &["I7,150,15 yds,6.1"]);
        let master = dir.path().join("master.csv");

        DatasetMerger::new(&master).build(&[first, second])?;

        let frame = read_frame(&master)?;
        let air: Vec<Option<f64>> = frame.column("AirTime")?.f64()?.into_iter().collect();
        assert_eq!(air, vec![None, None, Some(6.1)]);
        assert_eq!(frame.height(), 3);
        Ok(())
    }

    #[test]
    fn test_bad_export_leaves_master_untouched() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let good = write_export(dir.path(), "02-01-24-10-00-00", &["DR,230,30 ft"]);
        let master = dir.path().join("master.csv");
        let merger = DatasetMerger::new(&master);
        merger.build(&[good])?;
        let before = fs::read_to_string(&master)?;

        let ok = write_export(dir.path(), "02-02-24-10-00-00", &["I9,120,5 yds"]);
        let bad = write_export(dir.path(), "02-03-24-10-00-00", &["I9,121,near ft"]);
        let err = merger.append(&[ok, bad.clone()]).unwrap_err();
        assert!(matches!(err, ShotError::MalformedSource { ref file, .. } if *file == bad));
        assert_eq!(fs::read_to_string(&master)?, before);
        Ok(())
    }

    #[test]
    fn test_update_appends_only_recent_exports() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let first = write_export(dir.path(), "01-05-24-10-00-00", &["DR,230,30 ft"]);
        let master = dir.path().join("master.csv");
        let merger = DatasetMerger::new(&master);
        merger.build(&[first])?;

        write_export(dir.path(), "01-20-24-08-00-00", &["I7,151,12 yds", "I7,149,6 ft"]);
        let since = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let report = merger.update(dir.path(), since)?;

        assert_eq!(report.files_processed.len(), 1);
        assert_eq!(report.rows_added, 2);
        assert_eq!(report.total_rows, 3);
        assert_eq!(carry(&master), vec![Some(230.0), Some(151.0), Some(149.0)]);
        Ok(())
    }

    #[test]
    fn test_repeated_update_adds_nothing() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let first = write_export(dir.path(), "01-05-24-10-00-00", &["DR,230,30 ft"]);
        let master = dir.path().join("master.csv");
        let merger = DatasetMerger::new(&master);
        merger.build(&[first])?;
        write_export(dir.path(), "01-20-24-08-00-00", &["I7,151,12 yds"]);

        let since = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let once = merger.update(dir.path(), since)?;
        let twice = merger.update(dir.path(), since)?;

        assert_eq!(once.rows_added, 1);
        assert!(twice.files_processed.is_empty());
        assert_eq!(twice.rows_added, 0);
        assert_eq!(twice.total_rows, 2);
        assert_eq!(carry(&master), vec![Some(230.0), Some(151.0)]);
        Ok(())
    }

    #[test]
    fn test_concat_widens_conflicting_dtypes_to_text() -> PolarsResult<()> {
        let a = df!("Club" => [1.0], "Carry" => [200.0])?;
        let b = df!("Club" => ["I7"], "Carry" => [150.0])?;
        let merged = concat_frames(&[a, b]).unwrap();
        assert_eq!(merged.column("Club")?.dtype(), &DataType::String);
        assert_eq!(merged.column("Carry")?.dtype(), &DataType::Float64);
        assert_eq!(merged.height(), 2);
        Ok(())
    }

    #[test]
    fn test_discover_skips_non_exports() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        write_export(dir.path(), "05-01-24-10-00-00", &[]);
        write_export(dir.path(), "04-01-24-10-00-00", &[]);
        File::create(dir.path().join("master.csv"))?;
        File::create(dir.path().join("notes.txt"))?;

        let found = discover_exports(dir.path())?;
        let months: Vec<String> = found.iter().map(|(ts, _)| ts.format("%m").to_string()).collect();
        assert_eq!(months, vec!["04", "05"]);
        Ok(())
    }

    #[test]
    fn test_run_record_clears_files_on_failure() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let failed: Result<MergeReport> = Err(ShotError::Fit("boom".into()));
        let record = RunRecord::from_outcome(today, &failed);
        assert_eq!(record.status, RunStatus::Failure);
        assert!(record.files_processed.is_empty());
        assert!(record.error.unwrap().contains("boom"));
    }
}
