// Module for loading and writing shot frames. It reads the csv file, validates row widths,
// and handles missing cells and index/header artifacts left by other tooling before
// handing the surviving rows to polars for type inference.
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::error::{Result, ShotError};

/// Layout of timestamp cells in every file this crate writes.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reads a CSV file into a [`DataFrame`]. Integer columns come back as
/// `Float64` and timestamps as millisecond `Datetime`.
pub fn read_frame(path: &Path) -> Result<DataFrame> {
    let file = File::open(path).map_err(|e| ShotError::io(path, e))?;
    read_frame_from(file, path)
}

/// Same as [`read_frame`] over any reader; `origin` names the source in errors and logs.
pub fn read_frame_from<R: Read>(reader: R, origin: &Path) -> Result<DataFrame> {
    let malformed = |e: csv::Error| ShotError::malformed(origin, e.to_string());
    let mut rdr = ReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    // Grab and own the header row
    let headers = rdr.headers().map_err(malformed)?.clone();
    let expected_len = headers.len();
    if expected_len == 0 {
        return Ok(DataFrame::empty());
    }

    // pandas writes its row index as an unnamed leading column
    let keep: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !is_index_column(h))
        .map(|(i, _)| i)
        .collect();

    let mut seen = HashSet::new();
    for &i in &keep {
        let name = headers[i].trim();
        if !seen.insert(name) {
            return Err(ShotError::schema(
                name,
                format!("appears more than once in the header of {}", origin.display()),
            ));
        }
    }

    let mut body = WriterBuilder::new().from_writer(Vec::new());
    body.write_record(keep.iter().map(|&i| headers[i].trim()))
        .map_err(malformed)?;
    let mut rows = 0usize;
    for result in rdr.records() {
        let raw: StringRecord = result.map_err(malformed)?;
        let line = raw.position().map(|p| p.line()).unwrap_or(0);

        // 1) Skip completely empty lines
        if raw.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        // 2) Skip rows with the wrong number of fields
        if raw.len() != expected_len {
            warn!(
                file = %origin.display(),
                line,
                expected = expected_len,
                found = raw.len(),
                "skipping row with wrong field count"
            );
            continue;
        }

        // 3) A header repeated inside the body is a concatenation artifact
        if raw.iter().eq(headers.iter()) {
            debug!(file = %origin.display(), line, "skipping repeated header row");
            continue;
        }

        body.write_record(keep.iter().map(|&i| &raw[i]))
            .map_err(malformed)?;
        rows += 1;
    }
    let body = body
        .into_inner()
        .map_err(|e| ShotError::malformed(origin, e.to_string()))?;

    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(None)
        .map_parse_options(|opts| opts.with_try_parse_dates(true))
        .into_reader_with_file_handle(Cursor::new(body))
        .finish()
        .map_err(|e| ShotError::malformed(origin, e.to_string()))?;
    let frame = normalize(frame)?;
    debug!(
        file = %origin.display(),
        rows,
        cols = frame.width(),
        "loaded frame"
    );
    Ok(frame)
}

/// Writes a frame with a single header row. The file is replaced atomically:
/// data goes to a sibling temporary file which is then renamed over `path`.
pub fn write_frame(path: &Path, frame: &DataFrame) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let file = File::create(&tmp).map_err(|e| ShotError::io(&tmp, e))?;
        let mut out = BufWriter::new(file);
        write_frame_to(&mut out, frame)?;
        out.flush().map_err(|e| ShotError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| ShotError::io(path, e))?;
    debug!(file = %path.display(), rows = frame.height(), "wrote frame");
    Ok(())
}

pub fn write_frame_to<W: Write>(writer: W, frame: &DataFrame) -> Result<()> {
    let mut frame = frame.clone();
    CsvWriter::new(writer)
        .include_header(true)
        .with_datetime_format(Some(TIMESTAMP_FORMAT.to_string()))
        .finish(&mut frame)?;
    Ok(())
}

/// Brings inferred dtypes onto the three kinds the pipeline works with:
/// `Float64` numbers, `String` text and millisecond `Datetime`.
fn normalize(frame: DataFrame) -> Result<DataFrame> {
    let columns = frame
        .get_columns()
        .iter()
        .map(|column| {
            let dtype = column.dtype();
            let all_missing = column.null_count() == column.len();
            let target = match dtype {
                d if d.is_integer() => Some(DataType::Float64),
                DataType::Float32 | DataType::Null => Some(DataType::Float64),
                // a column with no values at all carries no text either
                DataType::String if all_missing => Some(DataType::Float64),
                DataType::Date => Some(DataType::Datetime(TimeUnit::Milliseconds, None)),
                DataType::Datetime(unit, zone) if *unit != TimeUnit::Milliseconds || zone.is_some() => {
                    Some(DataType::Datetime(TimeUnit::Milliseconds, None))
                }
                _ => None,
            };
            match target {
                Some(dtype) => column.cast(&dtype),
                None => Ok(column.clone()),
            }
        })
        .collect::<PolarsResult<Vec<_>>>()?;
    Ok(DataFrame::new(columns)?)
}

fn is_index_column(header: &str) -> bool {
    let h = header.trim();
    h.is_empty() || h.starts_with("Unnamed: ")
}
