//! Sample ingestion from zip archives.
//!
//! An archive holds one CSV per series (latitude, longitude, horizontal
//! accuracy). Every row is `timestamp, duration, value`, and the rows of the
//! three files describe the same observation by position. Values are stored
//! as bracketed lists such as `"[44.123,657.456]"`; usually there is a single
//! number, but some recorders append extra readings of unknown origin. How
//! those are treated is controlled by [`CellStrategy`].

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use log::{debug, info};
use zip::ZipArchive;

use crate::error::IngestError;
use crate::Sample;

/// How to read a cell holding more than one bracketed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellStrategy {
    /// Keep the first value and ignore the rest.
    #[default]
    First,
    /// Treat any cell with more than one value as malformed.
    Reject,
    /// Use the mean of all values.
    Average,
}

/// Where the three series live inside the archive.
///
/// Each field lists file name fragments, tried in order; the first fragment
/// that matches any CSV wins. Matching ignores case and punctuation, so
/// `"horizontal-radius"` matches `raw_location_horizontal-radius.csv` and
/// `"horizontal-accuracy"` matches `HorizontalAccuracy.csv`.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub radius: Vec<String>,
    /// Whether each CSV starts with a header row
    pub has_headers: bool,
    pub cell_strategy: CellStrategy,
}

impl Default for ArchiveLayout {
    fn default() -> Self {
        Self {
            latitude: vec!["latitude".to_string()],
            longitude: vec!["longitude".to_string()],
            radius: vec![
                "horizontal-radius".to_string(),
                "horizontal-accuracy".to_string(),
            ],
            has_headers: true,
            cell_strategy: CellStrategy::First,
        }
    }
}

/// Reads an archive from disk.
pub fn ingest_path(path: &Path, layout: &ArchiveLayout) -> Result<Vec<Sample>, IngestError> {
    info!("[Ingest] Reading {}", path.display());
    let file = File::open(path)?;
    ingest_archive(BufReader::new(file), layout)
}

/// Reads the three series out of a zip archive and joins them row by row.
///
/// Rows are joined by position, in file order; nothing is re-sorted here.
/// The timestamp of each sample comes from the latitude series.
pub fn ingest_archive<R: Read + Seek>(
    reader: R,
    layout: &ArchiveLayout,
) -> Result<Vec<Sample>, IngestError> {
    let mut archive = ZipArchive::new(reader)?;

    let latitude = read_series(&mut archive, &layout.latitude, layout)?;
    let longitude = read_series(&mut archive, &layout.longitude, layout)?;
    let radius = read_series(&mut archive, &layout.radius, layout)?;

    if latitude.len() != longitude.len() || latitude.len() != radius.len() {
        return Err(IngestError::LengthMismatch {
            latitude: latitude.len(),
            longitude: longitude.len(),
            radius: radius.len(),
        });
    }

    let samples: Vec<Sample> = latitude
        .into_iter()
        .zip(longitude)
        .zip(radius)
        .map(|(((timestamp, lat), (_, lon)), (_, r))| Sample::new(timestamp, lon, lat, Some(r)))
        .collect();

    info!("[Ingest] Read {} samples", samples.len());
    Ok(samples)
}

/// Lowercase alphanumerics only.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn find_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    fragments: &[String],
) -> Result<(usize, String), IngestError> {
    let mut csv_files = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let file_name = name.rsplit('/').next().unwrap_or(&name).to_ascii_lowercase();
        if entry.is_file() && file_name.ends_with(".csv") {
            csv_files.push((i, name, normalize(file_name.trim_end_matches(".csv"))));
        }
    }

    for fragment in fragments.iter().map(|f| normalize(f)).filter(|f| !f.is_empty()) {
        if let Some((i, name, _)) = csv_files.iter().find(|(_, _, n)| n.contains(&fragment)) {
            return Ok((*i, name.clone()));
        }
    }
    Err(IngestError::MissingEntry {
        name: fragments.join(" | "),
    })
}

fn read_series<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    fragments: &[String],
    layout: &ArchiveLayout,
) -> Result<Vec<(DateTime<FixedOffset>, f64)>, IngestError> {
    let (index, name) = find_entry(archive, fragments)?;
    let entry = archive.by_index(index)?;
    let rows = parse_series(entry, &name, layout.has_headers, layout.cell_strategy)?;
    debug!("[Ingest] {}: {} rows", name, rows.len());
    Ok(rows)
}

/// Parses one `timestamp, duration, value` CSV.
///
/// An unquoted multi-value cell such as `[44.1,657.4]` spans several CSV
/// fields; everything from the third field on is read back as one cell.
/// `row` in [`IngestError::Malformed`] counts data rows from 1, not
/// counting the header.
pub fn parse_series<R: Read>(
    reader: R,
    file: &str,
    has_headers: bool,
    strategy: CellStrategy,
) -> Result<Vec<(DateTime<FixedOffset>, f64)>, IngestError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let malformed = |row: usize| IngestError::Malformed {
        file: file.to_string(),
        row,
    };

    let mut rows = Vec::new();
    for (i, record) in csv.records().enumerate() {
        let row = i + 1;
        let record = record.map_err(|_| malformed(row))?;
        if record.len() < 3 {
            return Err(malformed(row));
        }
        let cell = record.iter().skip(2).collect::<Vec<_>>().join(",");
        let timestamp = parse_timestamp(&record[0]).ok_or_else(|| malformed(row))?;
        let value = parse_cell(&cell, strategy).ok_or_else(|| malformed(row))?;
        rows.push((timestamp, value));
    }
    Ok(rows)
}

/// Parses a timestamp, keeping its UTC offset.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]±HHMM` (with or without a space
/// before the offset) and offset-less `YYYY-MM-DD HH:MM:SS[.f]`, read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%z"))
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z"))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().fixed_offset())
        })
}

/// Extracts a number from a cell like `[1.5]`, `[1.5,999.0]` or `1.5`.
///
/// Returns `None` for an empty list, unbalanced brackets, unparsable or
/// non-finite numbers, or (with [`CellStrategy::Reject`]) multiple values.
pub fn parse_cell(cell: &str, strategy: CellStrategy) -> Option<f64> {
    let cell = cell.trim();
    let inner = match (cell.strip_prefix('['), cell.ends_with(']')) {
        (Some(rest), true) => rest.strip_suffix(']')?,
        (None, false) => cell,
        _ => return None,
    };

    let mut parts = inner.split(',').map(str::trim).filter(|p| !p.is_empty());
    let value = match strategy {
        CellStrategy::First => parts.next()?.parse::<f64>().ok()?,
        CellStrategy::Reject => {
            let first = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            first.parse::<f64>().ok()?
        }
        CellStrategy::Average => {
            let values = parts
                .map(|p| p.parse::<f64>().ok())
                .collect::<Option<Vec<f64>>>()?;
            if values.is_empty() {
                return None;
            }
            values.iter().sum::<f64>() / values.len() as f64
        }
    };

    value.is_finite().then_some(value)
}
