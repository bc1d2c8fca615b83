//! # Trackmatch
//!
//! Map-matches archived GPS samples against an OSRM server and rasterizes
//! the matched routes into per-day images plus one accumulated composite.
//!
//! This library provides:
//! - Archive ingestion of row-aligned latitude/longitude/accuracy series
//! - Web Mercator projection and `polyline6` encoding
//! - An OSRM `match` client with retry and dispatch rate limiting
//! - Antialiased route rasterization and ordered "over" compositing
//! - A pipeline that matches and rasterizes batches in parallel
//!
//! ## Features
//!
//! - **`http`** (default) - OSRM HTTP client and the `trackmatch` binary
//!
//! ## Quick Start
//!
//! ```rust
//! use trackmatch::{filter_by_accuracy, group_batches, sort_samples, Sample};
//! use chrono::{DateTime, Datelike};
//!
//! let ts = |s: &str| DateTime::parse_from_rfc3339(s).unwrap();
//! let samples = vec![
//!     Sample::new(ts("2024-05-02T08:00:00+02:00"), 13.40, 52.52, Some(8.0)),
//!     Sample::new(ts("2024-05-01T08:00:00+02:00"), 13.41, 52.52, Some(12.0)),
//!     Sample::new(ts("2024-05-01T08:01:00+02:00"), 13.42, 52.52, Some(900.0)),
//! ];
//!
//! let samples = filter_by_accuracy(sort_samples(samples), 50.0);
//! let batches = group_batches(samples, |s| s.timestamp.date_naive());
//!
//! assert_eq!(batches.len(), 2);
//! assert_eq!(batches[0].key.day(), 1);
//! ```

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use geo::{LineString, Point};

pub mod composite;
pub mod error;
pub mod export;
pub mod ingest;
pub mod matching;
pub mod pipeline;
pub mod projection;
pub mod raster;

// OSRM client
#[cfg(feature = "http")]
pub mod http;

pub use composite::accumulate;
pub use error::{CompositeError, IngestError, MatchError, PipelineError, PolylineError, RasterError};
pub use ingest::{ingest_archive, ingest_path, ArchiveLayout, CellStrategy};
pub use matching::{decode_polyline6, encode_polyline6, MatchService};
pub use pipeline::{
    by_local_date, filter_by_accuracy, group_batches, run_pipeline, run_samples, sort_samples,
    PipelineConfig, RunReport,
};
pub use raster::{rasterize, Extent, RasterLayer, StrokeStyle};

#[cfg(feature = "http")]
pub use http::{OsrmClient, OsrmConfig};

// ============================================================================
// Core Types
// ============================================================================

/// One raw location observation.
///
/// `position` follows the `geo` convention: x is longitude, y is latitude
/// (WGS84 degrees).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<FixedOffset>,
    pub position: Point<f64>,
    /// Horizontal accuracy radius in meters, if the source recorded one.
    pub accuracy_radius: Option<f64>,
}

impl Sample {
    pub fn new(
        timestamp: DateTime<FixedOffset>,
        longitude: f64,
        latitude: f64,
        accuracy_radius: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            position: Point::new(longitude, latitude),
            accuracy_radius,
        }
    }

    pub fn longitude(&self) -> f64 {
        self.position.x()
    }

    pub fn latitude(&self) -> f64 {
        self.position.y()
    }

    /// Calendar date of the sample in its own UTC offset.
    pub fn local_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Samples sharing one bucket key, sorted by timestamp.
///
/// Only [`group_batches`] builds these, so a batch is never empty.
#[derive(Debug, Clone)]
pub struct SampleBatch<K> {
    pub key: K,
    pub samples: Vec<Sample>,
}

/// Matched geometry for one batch.
///
/// Each leg is a polyline the service matched with confidence. Zero legs
/// means nothing could be matched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedRoute {
    pub legs: Vec<LineString<f64>>,
}

impl MatchedRoute {
    pub fn new(legs: Vec<LineString<f64>>) -> Self {
        Self { legs }
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    /// Legs with at least two vertices, i.e. the ones that can be stroked.
    pub fn drawable_legs(&self) -> impl Iterator<Item = &LineString<f64>> {
        self.legs.iter().filter(|leg| leg.0.len() >= 2)
    }
}

/// Grouping key for batches.
///
/// Keys order the final composite and name the per-batch image files, so
/// their `Display` output should be filesystem friendly.
pub trait BucketKey: Ord + Clone + fmt::Display + Send + Sync + 'static {}

impl<T> BucketKey for T where T: Ord + Clone + fmt::Display + Send + Sync + 'static {}

// ============================================================================
// Tests
// ============================================================================
