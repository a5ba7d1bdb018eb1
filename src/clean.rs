// Normalizes one raw simulator export into the canonical shot schema.
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{Result, ShotError};
use crate::io::read_frame;

/// Column holding the free-text distance to the pin in raw exports, and the
/// numeric yards value in the canonical schema.
pub const DISTANCE_TO_PIN: &str = "DistanceToPin";
/// Session timestamp column added by the cleaner.
pub const DATE: &str = "Date";
pub const CLUB: &str = "Club";

/// Timestamp layout embedded in export file names, e.g. `export01-31-24-18-05-42.csv`.
pub const EXPORT_TIMESTAMP_FORMAT: &str = "%m-%d-%y-%H-%M-%S";

/// One cleaned export: the canonical rows plus where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    pub source: PathBuf,
    pub timestamp: NaiveDateTime,
    pub frame: DataFrame,
}

/// Stateless cleaner for raw per-session exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRecordCleaner;

impl RawRecordCleaner {
    /// Reads and cleans one export file. The file itself is never modified.
    pub fn clean_file(&self, path: &Path) -> Result<ExportBatch> {
        let timestamp = parse_export_timestamp(path)?;
        let raw = read_frame(path)?;
        let frame = self.clean_frame(raw, timestamp, path)?;
        info!(
            file = %path.display(),
            rows = frame.height(),
            session = %timestamp,
            "cleaned export"
        );
        Ok(ExportBatch {
            source: path.to_path_buf(),
            timestamp,
            frame,
        })
    }

    /// Cleans an already loaded export. `source` names the file in errors.
    pub fn clean_frame(
        &self,
        mut frame: DataFrame,
        timestamp: NaiveDateTime,
        source: &Path,
    ) -> Result<DataFrame> {
        drop_zero_columns(&mut frame, source)?;

        let raw_pin = frame
            .column(DISTANCE_TO_PIN)
            .map_err(|_| ShotError::schema(DISTANCE_TO_PIN, format!("is missing from {}", source.display())))?;
        let yards: Vec<Option<f64>> = match raw_pin.dtype() {
            DataType::String => raw_pin
                .str()?
                .into_iter()
                .map(|cell| match cell {
                    Some(raw) => parse_distance_to_pin(raw, source),
                    None => Ok(None),
                })
                .collect::<Result<_>>()?,
            // already bare magnitudes, taken as yards
            DataType::Float64 => raw_pin.f64()?.into_iter().collect(),
            _ => {
                return Err(ShotError::schema(
                    DISTANCE_TO_PIN,
                    format!("is not a distance in {}", source.display()),
                ))
            }
        };
        frame.with_column(Series::new(DISTANCE_TO_PIN.into(), yards))?;

        let rows = frame.height();
        frame.with_column(Series::new(DATE.into(), vec![timestamp; rows]))?;
        Ok(frame)
    }
}

/// Extracts the session timestamp from an export file name.
pub fn parse_export_timestamp(path: &Path) -> Result<NaiveDateTime> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ShotError::malformed(path, "file name is not valid UTF-8"))?;
    let stamp = name
        .rsplit_once("export")
        .map(|(_, rest)| rest)
        .ok_or_else(|| ShotError::malformed(path, "file name has no `export` timestamp"))?;
    let stamp = stamp.strip_suffix(".csv").unwrap_or(stamp);
    NaiveDateTime::parse_from_str(stamp, EXPORT_TIMESTAMP_FORMAT).map_err(|e| {
        ShotError::malformed(path, format!("timestamp `{stamp}` is not MM-DD-YY-HH-MM-SS: {e}"))
    })
}

/// Parses `"<number> <unit>"` into yards. Feet are divided by 3 and rounded
/// to 2 decimals; a missing or unrecognized unit is taken as yards.
pub fn parse_distance_to_pin(raw: &str, source: &Path) -> Result<Option<f64>> {
    let mut parts = raw.split_whitespace();
    let Some(magnitude) = parts.next() else {
        return Ok(None);
    };
    let value: f64 = magnitude.parse().map_err(|_| {
        ShotError::malformed(source, format!("distance to pin `{raw}` has no numeric magnitude"))
    })?;
    let yards = match parts.next() {
        Some("ft" | "feet") => (value / 3.0 * 100.0).round() / 100.0,
        Some("yds" | "yd" | "yards") | None => value,
        Some(unit) => {
            warn!(file = %source.display(), unit, "unknown distance unit, assuming yards");
            value
        }
    };
    Ok(Some(yards))
}

/// Drops numeric columns whose every value is exactly zero. These are export
/// artifacts, decided per file.
fn drop_zero_columns(frame: &mut DataFrame, source: &Path) -> Result<()> {
    if frame.height() == 0 {
        return Ok(());
    }
    let zero_columns: Vec<String> = frame
        .get_columns()
        .iter()
        .filter(|column| {
            column
                .f64()
                .is_ok_and(|values| values.into_iter().all(|v| v == Some(0.0)))
        })
        .map(|column| column.name().to_string())
        .collect();
    for name in &zero_columns {
        frame.drop_in_place(name)?;
    }
    if !zero_columns.is_empty() {
        debug!(file = %source.display(), columns = ?zero_columns, "dropped all-zero columns");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::fs::File;
    use std::io::Write;

    fn src() -> &'static Path {
        Path::new("gspro-export01-31-24-18-05-42.csv")
    }

    #[rstest]
    #[case("30 ft", 10.0)]
    #[case("15 yds", 15.0)]
    #[case("10 ft", 3.33)]
    #[case("7.5", 7.5)]
    #[case("4 yd", 4.0)]
    fn test_distance_to_pin_is_normalized_to_yards(#[case] raw: &str, #[case] yards: f64) {
        let parsed = parse_distance_to_pin(raw, src()).unwrap().unwrap();
        assert_relative_eq!(parsed, yards);
    }

    #[test]
    fn test_distance_to_pin_without_magnitude_is_malformed() {
        let err = parse_distance_to_pin("far ft", src()).unwrap_err();
        assert!(matches!(err, ShotError::MalformedSource { .. }));
    }

    #[test]
    fn test_parses_timestamp_from_file_name() {
        let ts = parse_export_timestamp(Path::new("/data/gspro-export01-31-24-18-05-42.csv")).unwrap();
        assert_eq!(ts.to_string(), "2024-01-31 18:05:42");
    }

    #[rstest]
    #[case("shots.csv")]
    #[case("gspro-export13-45-24-18-05-42.csv")]
    #[case("gspro-export.csv")]
    fn test_rejects_file_name_without_valid_timestamp(#[case] name: &str) {
        let err = parse_export_timestamp(Path::new(name)).unwrap_err();
        assert!(matches!(err, ShotError::MalformedSource { file, .. } if file == Path::new(name)));
    }

    #[test]
    fn test_clean_file_builds_canonical_batch() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gspro-export02-10-24-09-30-00.csv");
        let mut f = File::create(&path)?;
        writeln!(f, "Club,Carry,TotalDistance,Decent,DistanceToPin")?;
        writeln!(f, "DR,231.4,250.1,0,30 ft")?;
        writeln!(f, "I7,151.0,160.3,0,15 yds")?;
        drop(f);

        let batch = RawRecordCleaner.clean_file(&path)?;
        let f = &batch.frame;
        assert!(f.column("Decent").is_err());
        let pin: Vec<Option<f64>> = f.column(DISTANCE_TO_PIN)?.f64()?.into_iter().collect();
        assert_eq!(pin, vec![Some(10.0), Some(15.0)]);
        let dates = f.column(DATE)?.datetime()?;
        assert!(dates.as_datetime_iter().all(|d| d == Some(batch.timestamp)));
        assert_eq!(f.height(), 2);
        Ok(())
    }

    #[test]
    fn test_zero_column_kept_when_any_row_is_nonzero() -> PolarsResult<()> {
        let frame = df!(
            "Decent" => [Some(0.0), Some(1.0)],
            "Path" => [Some(0.0), Some(0.0)],
            DISTANCE_TO_PIN => [Some("3 ft"), None],
        )?;
        let ts = parse_export_timestamp(src()).unwrap();
        let cleaned = RawRecordCleaner.clean_frame(frame, ts, src()).unwrap();
        assert!(cleaned.column("Decent").is_ok());
        assert!(cleaned.column("Path").is_err());
        let pin: Vec<Option<f64>> = cleaned.column(DISTANCE_TO_PIN)?.f64()?.into_iter().collect();
        assert_eq!(pin, vec![Some(1.0), None]);
        Ok(())
    }

    #[test]
    fn test_missing_distance_column_is_a_schema_error() -> PolarsResult<()> {
        let frame = df!("Carry" => [1.0])?;
        let ts = parse_export_timestamp(src()).unwrap();
        let err = RawRecordCleaner.clean_frame(frame, ts, src()).unwrap_err();
        assert!(matches!(err, ShotError::Schema { column, .. } if column == DISTANCE_TO_PIN));
        Ok(())
    }
}
