// Data cleaning and statistical outlier suppression over the master dataset.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};

use crate::clean::{DATE, DISTANCE_TO_PIN};
use crate::error::{Result, ShotError};
use crate::io::{read_frame, TIMESTAMP_FORMAT};
use crate::merge::PERSISTED_DISTANCE_TO_PIN;

/// Decimal places kept for every numeric value after cleaning.
pub const ROUND_DIGITS: i32 = 3;

/// Which side of the IQR fence suppresses values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierPolicy {
    /// Suppress values below `Q1 - 1.5 * IQR`.
    Lower,
    /// Suppress values above `Q3 + 1.5 * IQR`.
    Upper,
    /// Suppress values outside both fences.
    Both,
    None,
}

impl FromStr for OutlierPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lower" => Ok(OutlierPolicy::Lower),
            "upper" => Ok(OutlierPolicy::Upper),
            "both" => Ok(OutlierPolicy::Both),
            "none" => Ok(OutlierPolicy::None),
            other => Err(format!("Unknown outlier policy: {}", other)),
        }
    }
}

/// Column name to policy. Columns that are not listed get [`OutlierPolicy::None`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    policies: HashMap<String, OutlierPolicy>,
}

#[derive(Debug, Deserialize)]
struct PolicyRow {
    column: String,
    policy: OutlierPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use OutlierPolicy as P;
        // physical distances and speeds only go wrong on the low side; signed
        // angles and sidespin can misread either way
        let defaults = [
            ("Carry", P::Lower),
            ("TotalDistance", P::Lower),
            ("rawCarryGame", P::Lower),
            ("BallSpeed", P::Lower),
            ("ClubSpeed", P::Lower),
            ("SmashFactor", P::Lower),
            ("BackSpin", P::Lower),
            ("TotalSpin", P::Lower),
            ("PeakHeight", P::Lower),
            ("VLA", P::Lower),
            ("SideSpin", P::Both),
            ("rawSpinAxis", P::Both),
            ("HLA", P::Both),
            ("Offline", P::Both),
            ("Path", P::Both),
            ("FaceToPath", P::Both),
            ("FaceToTarget", P::Both),
            ("DistanceToPin", P::None),
            ("AoA", P::None),
            ("Club", P::None),
            ("Date", P::None),
        ];
        Self {
            policies: defaults
                .into_iter()
                .map(|(name, policy)| (name.to_string(), policy))
                .collect(),
        }
    }
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self {
            policies: HashMap::new(),
        }
    }

    pub fn policy_for(&self, column: &str) -> OutlierPolicy {
        self.policies
            .get(column)
            .copied()
            .unwrap_or(OutlierPolicy::None)
    }

    pub fn set(&mut self, column: impl Into<String>, policy: OutlierPolicy) {
        self.policies.insert(column.into(), policy);
    }

    /// Defaults overridden by a `column,policy` CSV file.
    pub fn with_overrides_from(path: &Path) -> Result<Self> {
        let mut table = Self::default();
        let malformed = |e: csv::Error| ShotError::malformed(path, e.to_string());
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(malformed)?;
        for row in rdr.deserialize::<PolicyRow>() {
            let row = row.map_err(malformed)?;
            table.set(row.column, row.policy);
        }
        info!(file = %path.display(), entries = table.policies.len(), "loaded outlier policies");
        Ok(table)
    }
}

/// Acceptable band `[Q1 - 1.5 IQR, Q3 + 1.5 IQR]` over the non-missing values.
/// Quartiles follow numpy's `midpoint` convention.
pub fn iqr_fences(values: &Float64Chunked) -> Result<Option<(f64, f64)>> {
    let q1 = values.quantile(0.25, QuantileMethod::Midpoint)?;
    let q3 = values.quantile(0.75, QuantileMethod::Midpoint)?;
    Ok(q1.zip(q3).map(|(q1, q3)| {
        let iqr = q3 - q1;
        (q1 - 1.5 * iqr, q3 + 1.5 * iqr)
    }))
}

/// Replaces values outside the policy's fence with missing. Rows are kept.
pub fn suppress_outliers(values: &Float64Chunked, policy: OutlierPolicy) -> Result<Float64Chunked> {
    let fences = match policy {
        OutlierPolicy::None => None,
        _ => iqr_fences(values)?,
    };
    let Some((lower, upper)) = fences else {
        return Ok(values.clone());
    };
    let kept: Float64Chunked = values
        .into_iter()
        .map(|v| {
            v.filter(|&x| match policy {
                OutlierPolicy::Lower => x >= lower,
                OutlierPolicy::Upper => x <= upper,
                OutlierPolicy::Both => x >= lower && x <= upper,
                OutlierPolicy::None => true,
            })
        })
        .collect();
    Ok(kept.with_name(values.name().clone()))
}

pub fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round_ties_even() / scale
}

/// Applies outlier suppression and rounding to every numeric column.
/// Text and timestamp columns pass through untouched.
pub fn process(mut frame: DataFrame, policies: &PolicyTable) -> Result<DataFrame> {
    let numeric: Vec<Float64Chunked> = frame
        .get_columns()
        .iter()
        .filter(|column| column.dtype() == &DataType::Float64)
        .map(|column| column.f64().cloned())
        .collect::<PolarsResult<_>>()?;
    for values in numeric {
        let name = values.name().clone();
        let policy = policies.policy_for(&name);
        let kept = suppress_outliers(&values, policy)?;
        let suppressed = kept.null_count() - values.null_count();
        if suppressed > 0 {
            debug!(column = %name, ?policy, suppressed, "suppressed outliers");
        }
        let rounded: Float64Chunked = kept
            .into_iter()
            .map(|v| v.map(|x| round_to(x, ROUND_DIGITS)))
            .collect();
        frame.with_column(rounded.with_name(name).into_series())?;
    }
    Ok(frame)
}

/// Loads the master file and parses it back into canonical types.
pub fn load_master(path: &Path) -> Result<DataFrame> {
    let mut frame = read_frame(path)?;
    let date = frame
        .column(DATE)
        .map_err(|_| ShotError::schema(DATE, format!("is missing from {}", path.display())))?;
    match date.dtype().clone() {
        DataType::Datetime(..) => {}
        DataType::String => {
            let parsed: Vec<Option<NaiveDateTime>> = date
                .str()?
                .into_iter()
                .enumerate()
                .map(|(row, cell)| match cell {
                    Some(raw) => parse_timestamp(raw).map(Some).ok_or_else(|| {
                        ShotError::malformed(path, format!("row {row}: `{raw}` is not a timestamp"))
                    }),
                    None => Ok(None),
                })
                .collect::<Result<_>>()?;
            frame.with_column(Series::new(DATE.into(), parsed))?;
        }
        // a column without any values is read back as numbers
        DataType::Float64 if date.null_count() == date.len() => {
            let dtype = DataType::Datetime(TimeUnit::Milliseconds, None);
            let empty = Column::full_null(DATE.into(), frame.height(), &dtype);
            frame.with_column(empty)?;
        }
        _ => {
            return Err(ShotError::schema(
                DATE,
                format!("does not hold timestamps in {}", path.display()),
            ))
        }
    }

    if let Ok(column) = frame.column(PERSISTED_DISTANCE_TO_PIN) {
        let yards: Vec<Option<f64>> = match column.dtype() {
            DataType::String => column
                .str()?
                .into_iter()
                .map(|cell| match cell {
                    Some(raw) => {
                        let magnitude = raw.split(' ').next().unwrap_or_default();
                        magnitude.parse::<f64>().map(Some).map_err(|_| {
                            ShotError::malformed(path, format!("`{raw}` is not a distance in yards"))
                        })
                    }
                    None => Ok(None),
                })
                .collect::<Result<_>>()?,
            DataType::Float64 => column.f64()?.into_iter().collect(),
            _ => return Err(ShotError::schema(PERSISTED_DISTANCE_TO_PIN, "is not a distance")),
        };
        frame.with_column(Series::new(PERSISTED_DISTANCE_TO_PIN.into(), yards))?;
        frame.rename(PERSISTED_DISTANCE_TO_PIN, DISTANCE_TO_PIN.into())?;
    } else if frame
        .column(DISTANCE_TO_PIN)
        .map_or(true, |c| c.dtype() != &DataType::Float64)
    {
        return Err(ShotError::schema(
            PERSISTED_DISTANCE_TO_PIN,
            format!("is missing from {}", path.display()),
        ));
    }
    Ok(frame)
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Lazily loads and cleans the master dataset once, then serves the cached
/// result for the lifetime of the instance.
#[derive(Debug)]
pub struct Preprocessor {
    master_path: PathBuf,
    policies: PolicyTable,
    cache: OnceLock<DataFrame>,
    loads: AtomicUsize,
}

impl Preprocessor {
    pub fn new(master_path: impl Into<PathBuf>) -> Self {
        Self::with_policies(master_path, PolicyTable::default())
    }

    pub fn with_policies(master_path: impl Into<PathBuf>, policies: PolicyTable) -> Self {
        Self {
            master_path: master_path.into(),
            policies,
            cache: OnceLock::new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// The cleaned dataset. The first call runs load and process; later
    /// calls return the same cached frame.
    pub fn get_data(&self) -> Result<&DataFrame> {
        if let Some(frame) = self.cache.get() {
            return Ok(frame);
        }
        let raw = self.load()?;
        let cleaned = self.process(raw)?;
        Ok(self.cache.get_or_init(|| cleaned))
    }

    pub fn load(&self) -> Result<DataFrame> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        load_master(&self.master_path)
    }

    pub fn process(&self, raw: DataFrame) -> Result<DataFrame> {
        let cleaned = process(raw, &self.policies)?;
        info!(
            master = %self.master_path.display(),
            rows = cleaned.height(),
            cols = cleaned.width(),
            "preprocessed master dataset"
        );
        Ok(cleaned)
    }

    /// How many times the master file has been loaded by this instance.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::fs::File;
    use std::io::Write;

    fn chunk(values: &[Option<f64>]) -> Float64Chunked {
        Float64Chunked::new("v".into(), values)
    }

    #[test]
    fn test_fences_use_midpoint_quartiles() {
        // numpy: percentile([1,2,3,4], [25, 75], method='midpoint') == [1.5, 3.5]
        let even = chunk(&[Some(4.0), Some(1.0), Some(3.0), Some(2.0)]);
        let (lower, upper) = iqr_fences(&even).unwrap().unwrap();
        assert_relative_eq!(lower, 1.5 - 3.0);
        assert_relative_eq!(upper, 3.5 + 3.0);
        // Q1 = 2, Q3 = 4, nulls ignored
        let odd = chunk(&[Some(1.0), None, Some(2.0), Some(3.0), Some(4.0), Some(5.0)]);
        let (lower, upper) = iqr_fences(&odd).unwrap().unwrap();
        assert_relative_eq!(lower, -1.0);
        assert_relative_eq!(upper, 7.0);
        assert_eq!(iqr_fences(&chunk(&[None, None])).unwrap(), None);
    }

    fn sample() -> Vec<Option<f64>> {
        // Q1 = 10, Q3 = 12, IQR = 2, fences [7, 15]
        vec![
            Some(-20.0),
            Some(10.0),
            Some(10.0),
            Some(11.0),
            None,
            Some(11.0),
            Some(12.0),
            Some(12.0),
            Some(40.0),
        ]
    }

    #[rstest]
    #[case(OutlierPolicy::Both, vec![None, Some(10.0), Some(10.0), Some(11.0), None, Some(11.0), Some(12.0), Some(12.0), None])]
    #[case(OutlierPolicy::Lower, vec![None, Some(10.0), Some(10.0), Some(11.0), None, Some(11.0), Some(12.0), Some(12.0), Some(40.0)])]
    #[case(OutlierPolicy::Upper, vec![Some(-20.0), Some(10.0), Some(10.0), Some(11.0), None, Some(11.0), Some(12.0), Some(12.0), None])]
    #[case(OutlierPolicy::None, sample())]
    fn test_outlier_policy(#[case] policy: OutlierPolicy, #[case] expected: Vec<Option<f64>>) {
        let kept = suppress_outliers(&chunk(&sample()), policy).unwrap();
        assert_eq!(kept.into_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_values_on_the_fence_are_kept() {
        let values = chunk(&[Some(7.0), Some(10.0), Some(10.0), Some(11.0), Some(12.0), Some(12.0), Some(15.0)]);
        let (lower, upper) = iqr_fences(&values).unwrap().unwrap();
        let kept = suppress_outliers(&values, OutlierPolicy::Both).unwrap();
        for (v, k) in values.into_iter().zip(kept.into_iter()) {
            let x = v.unwrap();
            assert_eq!(k.is_none(), x < lower || x > upper);
        }
    }

    #[test]
    fn test_rounding_is_idempotent() {
        for x in [1.23456, -0.0005, 210.9999, 3.0, 1e-7, 12345.6785] {
            let once = round_to(x, 3);
            assert_eq!(round_to(once, 3), once);
            assert!(((once * 1000.0).round() - once * 1000.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_policy_lookup_defaults_to_none() {
        let table = PolicyTable::default();
        assert_eq!(table.policy_for("Carry"), OutlierPolicy::Lower);
        assert_eq!(table.policy_for("SideSpin"), OutlierPolicy::Both);
        assert_eq!(table.policy_for("AoA"), OutlierPolicy::None);
        assert_eq!(table.policy_for("SomethingNew"), OutlierPolicy::None);
    }

    #[test]
    fn test_policy_overrides_from_csv() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("policies.csv");
        let mut f = File::create(&path)?;
        writeln!(f, "column,policy")?;
        writeln!(f, "Carry, both")?;
        writeln!(f, "Launch,upper")?;
        drop(f);

        let table = PolicyTable::with_overrides_from(&path)?;
        assert_eq!(table.policy_for("Carry"), OutlierPolicy::Both);
        assert_eq!(table.policy_for("Launch"), OutlierPolicy::Upper);
        assert_eq!(table.policy_for("BallSpeed"), OutlierPolicy::Lower);
        Ok(())
    }

    #[test]
    fn test_process_leaves_non_numeric_columns_alone() -> PolarsResult<()> {
        let frame = df!(
            "SideSpin" => sample(),
            "AoA" => vec![Some(-1.23456); 9],
            "Club" => vec!["DR"; 9],
        )?;
        let out = process(frame, &PolicyTable::default()).unwrap();
        assert!(out.column("Club")?.str()?.into_iter().all(|c| c == Some("DR")));
        assert_eq!(out.column("AoA")?.f64()?.get(0), Some(-1.235));
        assert_eq!(out.column("SideSpin")?.f64()?.get(8), None);
        assert_eq!(out.height(), 9);
        Ok(())
    }

    fn write_master(dir: &Path) -> PathBuf {
        let path = dir.join("master.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, ",Club,Carry,Date,DistanceToPin_Yrds").unwrap();
        writeln!(f, "0,DR,230.12345,2024-01-31 18:05:42,10 yds").unwrap();
        writeln!(f, "1,I7,150.5,2024-02-01 09:00:00,3.33 yds").unwrap();
        writeln!(f, "2,I7,151.25,2024-02-01 09:00:00,").unwrap();
        path
    }

    #[test]
    fn test_load_parses_dates_and_distance() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let frame = load_master(&write_master(dir.path()))?;
        let pin: Vec<Option<f64>> = frame.column(DISTANCE_TO_PIN)?.f64()?.into_iter().collect();
        assert_eq!(pin, vec![Some(10.0), Some(3.33), None]);
        assert!(frame.column(PERSISTED_DISTANCE_TO_PIN).is_err());
        let first = frame.column(DATE)?.datetime()?.as_datetime_iter().next().flatten();
        assert_eq!(first.map(|d| d.to_string()).as_deref(), Some("2024-01-31 18:05:42"));
        Ok(())
    }

    #[test]
    fn test_policy_file_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.csv");
        std::fs::write(&path, "column,policy\nCarry,sideways\n").unwrap();
        let err = PolicyTable::with_overrides_from(&path).unwrap_err();
        assert!(matches!(err, ShotError::MalformedSource { ref file, .. } if *file == path));
    }

    #[test]
    fn test_load_without_date_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.csv");
        std::fs::write(&path, "Club,Carry,DistanceToPin_Yrds\nDR,230,10 yds\n").unwrap();
        let err = load_master(&path).unwrap_err();
        assert!(matches!(err, ShotError::Schema { column, .. } if column == DATE));
    }

    #[test]
    fn test_get_data_is_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let pre = Preprocessor::new(write_master(dir.path()));
        let first = pre.get_data().unwrap();
        let second = pre.get_data().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(pre.load_count(), 1);
        assert_eq!(first.column("Carry").unwrap().f64().unwrap().get(0), Some(230.123));
    }
}
