//! End-to-end orchestration.
//!
//! A run ingests the archive, sorts and quality-filters the samples, groups
//! them into batches (one per calendar day by default), then:
//!
//! 1. matches every batch concurrently; failed batches are logged and skipped,
//! 2. rasterizes every matched route on a worker pool and writes one PNG per
//!    batch,
//! 3. folds the written layers onto an opaque background in ascending key
//!    order and writes `composite.png`.
//!
//! Steps 1 and 2 may finish batches in any order. Step 3 is sequential and
//! owns the only mutable accumulator.
//!
//! ## Memory
//!
//! Every rasterization in flight holds a full-size RGBA buffer plus a
//! coverage mask of the same pixel count, so peak memory grows linearly with
//! [`PipelineConfig::raster_workers`]. Size the pool against available
//! memory, not core count.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use geo::Rect;
use image::Rgba;
use log::{info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use rayon::prelude::*;

use crate::composite::accumulate;
use crate::error::{CompositeError, MatchError, PipelineError, RasterError};
use crate::export::write_geojson;
use crate::ingest::{ingest_path, ArchiveLayout};
use crate::matching::MatchService;
use crate::raster::{rasterize, Extent, RasterLayer, StrokeStyle};
use crate::{BucketKey, MatchedRoute, Sample, SampleBatch};

/// File name of the accumulated image inside the output directory.
pub const COMPOSITE_FILE: &str = "composite.png";

/// Bytes escaped in layer file names. `%` is escaped too, so distinct keys
/// always give distinct names.
const LAYER_NAME: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'/')
    .add(b'\\')
    .add(b':')
    .add(b'*')
    .add(b'?')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'|');

/// Configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where to find the series inside the archive
    pub archive: ArchiveLayout,
    /// Routing profile passed to the match service
    pub profile: String,
    /// Samples with an accuracy radius above this are dropped (meters)
    pub max_accuracy: f64,
    /// Directory for per-batch layers and the composite
    pub output_dir: PathBuf,
    /// Fixed geographic output box; derived from the matched routes when unset
    pub bbox: Option<Rect<f64>>,
    /// Margin around derived bounds (planar meters)
    pub padding_meters: f64,
    /// Output scale
    pub pixels_per_meter: f64,
    pub stroke: StrokeStyle,
    /// Opaque base the layers are composited onto
    pub background: Rgba<u8>,
    /// Batches in flight against the match service at once
    pub match_concurrency: usize,
    /// Rasterization threads; see the module docs on memory
    pub raster_workers: usize,
    /// Write all ingested samples as GeoJSON here
    pub export_geojson: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            archive: ArchiveLayout::default(),
            profile: "foot".to_string(),
            max_accuracy: 50.0,
            output_dir: PathBuf::from("out"),
            bbox: None,
            padding_meters: 250.0,
            pixels_per_meter: 0.1, // 10m per pixel
            stroke: StrokeStyle::default(),
            background: Rgba([255, 255, 255, 255]),
            match_concurrency: 4,
            raster_workers: 2,
            export_geojson: None,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Samples read from the archive
    pub ingested: usize,
    /// Samples removed by the accuracy filter
    pub filtered_out: usize,
    /// Batches sent to the match service
    pub attempted: usize,
    /// Batches that matched
    pub matched: usize,
    /// Batches whose match failed
    pub skipped: usize,
    /// Matched batches that could not be rasterized or written
    pub raster_failed: usize,
    /// Written per-batch layers, in ascending key order
    pub layers: Vec<(String, PathBuf)>,
    /// Keys of every batch that did not produce a layer
    pub failed_buckets: Vec<String>,
    /// The accumulated image, if one was written
    pub composite: Option<PathBuf>,
}

/// Default bucket key: the sample's calendar date in its own offset.
pub fn by_local_date(sample: &Sample) -> NaiveDate {
    sample.local_date()
}

/// Stable sort by timestamp; equal timestamps keep their input order.
pub fn sort_samples(mut samples: Vec<Sample>) -> Vec<Sample> {
    samples.sort_by_key(|s| s.timestamp);
    samples
}

/// Drops samples whose accuracy radius exceeds `max_accuracy`.
///
/// Samples without a radius are kept; a NaN radius is dropped.
pub fn filter_by_accuracy(samples: Vec<Sample>, max_accuracy: f64) -> Vec<Sample> {
    samples
        .into_iter()
        .filter(|s| s.accuracy_radius.map_or(true, |r| r <= max_accuracy))
        .collect()
}

/// Groups samples by `key_fn`, in ascending key order.
///
/// Input order is preserved inside each batch, so sorted input gives sorted
/// batches.
pub fn group_batches<K, F>(samples: Vec<Sample>, key_fn: F) -> Vec<SampleBatch<K>>
where
    K: Ord,
    F: Fn(&Sample) -> K,
{
    let mut groups: BTreeMap<K, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        groups.entry(key_fn(&sample)).or_default().push(sample);
    }
    groups
        .into_iter()
        .map(|(key, samples)| SampleBatch { key, samples })
        .collect()
}

/// Matches every batch with at most `concurrency` requests in flight.
///
/// Results come back in ascending key order regardless of completion order.
pub async fn match_batches<K: BucketKey>(
    batches: Vec<SampleBatch<K>>,
    matcher: &dyn MatchService,
    profile: &str,
    concurrency: usize,
) -> Vec<(K, Result<MatchedRoute, MatchError>)> {
    let mut results: Vec<_> = stream::iter(batches)
        .map(|batch| async move {
            let result = matcher.match_batch(profile, &batch.samples).await;
            (batch.key, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

/// Path of the layer written for `key`, with path separators and other
/// unportable bytes percent-encoded.
pub fn layer_path(output_dir: &Path, key: &impl std::fmt::Display) -> PathBuf {
    let name = utf8_percent_encode(&key.to_string(), LAYER_NAME).to_string();
    output_dir.join(format!("{name}.png"))
}

fn is_reserved(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case(COMPOSITE_FILE))
}

/// Rasterizes and writes every route on a pool of `workers` threads.
///
/// Returns per-key results in the input order. A key whose layer would
/// overwrite [`COMPOSITE_FILE`] fails with [`RasterError::ReservedName`].
pub fn rasterize_batches<K: BucketKey>(
    routes: Vec<(K, MatchedRoute)>,
    extent: Extent,
    stroke: &StrokeStyle,
    output_dir: &Path,
    workers: usize,
) -> Result<Vec<(K, Result<PathBuf, RasterError>)>, PipelineError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;

    Ok(pool.install(|| {
        routes
            .into_par_iter()
            .map(|(key, route)| {
                let path = layer_path(output_dir, &key);
                if is_reserved(&path) {
                    let name = key.to_string();
                    return (key, Err(RasterError::ReservedName { name }));
                }
                let result = rasterize(&route, &extent, stroke)
                    .save(&path)
                    .map(|_| path)
                    .map_err(RasterError::from);
                (key, result)
            })
            .collect()
    }))
}

/// Folds the layers at `paths`, in the given order, onto a `background` layer.
///
/// Layers are read one at a time.
pub fn composite_layers(
    paths: &[PathBuf],
    extent: Extent,
    background: Rgba<u8>,
) -> Result<RasterLayer, CompositeError> {
    let mut accumulator = RasterLayer::filled(extent, background);
    for path in paths {
        let layer = RasterLayer::load(path, extent)?;
        accumulate(&mut accumulator, &layer)?;
    }
    Ok(accumulator)
}

/// Ingests `archive` and runs the pipeline on it.
pub async fn run_pipeline<K, F>(
    archive: &Path,
    config: &PipelineConfig,
    matcher: &dyn MatchService,
    key_fn: F,
) -> Result<RunReport, PipelineError>
where
    K: BucketKey,
    F: Fn(&Sample) -> K,
{
    let samples = ingest_path(archive, &config.archive)?;
    run_samples(samples, config, matcher, key_fn).await
}

/// Runs the pipeline on already-ingested samples.
///
/// Per-batch match and raster failures are logged and counted in the
/// report; only ingestion, I/O and compositing errors fail the run. An
/// unusable output extent fails every matched batch but not the run.
/// All layers are written before compositing starts, so they survive a
/// compositing failure.
pub async fn run_samples<K, F>(
    samples: Vec<Sample>,
    config: &PipelineConfig,
    matcher: &dyn MatchService,
    key_fn: F,
) -> Result<RunReport, PipelineError>
where
    K: BucketKey,
    F: Fn(&Sample) -> K,
{
    let start = Instant::now();
    let mut report = RunReport {
        ingested: samples.len(),
        ..RunReport::default()
    };

    fs::create_dir_all(&config.output_dir)?;

    let samples = sort_samples(samples);
    if let Some(path) = &config.export_geojson {
        write_geojson(&samples, path).map_err(PipelineError::Export)?;
    }

    let samples = filter_by_accuracy(samples, config.max_accuracy);
    report.filtered_out = report.ingested - samples.len();

    let batches = group_batches(samples, key_fn);
    report.attempted = batches.len();
    info!(
        "[Pipeline] {} samples ({} above {}m dropped) in {} batches",
        report.ingested, report.filtered_out, config.max_accuracy, report.attempted
    );

    // Stage 1: match
    let matched = match_batches(batches, matcher, &config.profile, config.match_concurrency).await;
    let mut routes = Vec::with_capacity(matched.len());
    for (key, result) in matched {
        match result {
            Ok(route) => {
                report.matched += 1;
                routes.push((key, route));
            }
            Err(e) => {
                warn!("[Pipeline] Skipping batch {}: {} ({})", key, e.kind(), e);
                report.skipped += 1;
                report.failed_buckets.push(key.to_string());
            }
        }
    }
    info!(
        "[Pipeline] Matched {}/{} batches ({} skipped)",
        report.matched, report.attempted, report.skipped
    );

    let extent = match config.bbox {
        Some(bbox) => Extent::new(bbox, config.pixels_per_meter).map(Some),
        None => Extent::covering(
            routes.iter().map(|(_, route)| route),
            config.padding_meters,
            config.pixels_per_meter,
        )
        .transpose(),
    };
    let extent = match extent {
        Ok(Some(extent)) => extent,
        Ok(None) => {
            warn!("[Pipeline] Nothing matched and no bbox configured; no images written");
            return Ok(report);
        }
        Err(e) => {
            // Every layer shares the extent, so no matched batch can be drawn.
            warn!(
                "[Pipeline] Unusable output extent: {}; {} matched batches not rasterized",
                e,
                routes.len()
            );
            report.raster_failed += routes.len();
            report
                .failed_buckets
                .extend(routes.iter().map(|(key, _)| key.to_string()));
            return Ok(report);
        }
    };
    let (width, height) = extent.dimensions();
    info!("[Pipeline] Output extent {}x{} px", width, height);

    // Stage 2: rasterize
    let stroke = config.stroke.clone();
    let output_dir = config.output_dir.clone();
    let workers = config.raster_workers;
    let rendered = tokio::task::spawn_blocking(move || {
        rasterize_batches(routes, extent, &stroke, &output_dir, workers)
    })
    .await??;

    for (key, result) in rendered {
        match result {
            Ok(path) => report.layers.push((key.to_string(), path)),
            Err(e) => {
                warn!("[Pipeline] Failed to rasterize batch {}: {}", key, e);
                report.raster_failed += 1;
                report.failed_buckets.push(key.to_string());
            }
        }
    }

    // Stage 3: ordered fold
    let paths: Vec<PathBuf> = report.layers.iter().map(|(_, path)| path.clone()).collect();
    let composite_path = config.output_dir.join(COMPOSITE_FILE);
    let background = config.background;
    let target = composite_path.clone();
    tokio::task::spawn_blocking(move || -> Result<(), CompositeError> {
        composite_layers(&paths, extent, background)?.save(&target)?;
        Ok(())
    })
    .await??;
    report.composite = Some(composite_path);

    info!(
        "[Pipeline] DONE: {} layers, {} batches failed, composite written in {:.2}s",
        report.layers.len(),
        report.failed_buckets.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(report)
}
