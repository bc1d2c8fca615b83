//! Error types for every pipeline stage.
//!
//! Ingestion and compositing failures are fatal to a run and surface through
//! [`PipelineError`]. Matching and rasterization failures only ever affect a
//! single batch; the orchestrator records them in the run report instead.

use thiserror::Error;

/// Failure while reading the sample archive.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("unreadable archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive has no entry matching `{name}`")]
    MissingEntry { name: String },

    #[error("malformed row {row} in {file}")]
    Malformed { file: String, row: usize },

    #[error("series lengths differ: latitude={latitude}, longitude={longitude}, radius={radius}")]
    LengthMismatch {
        latitude: usize,
        longitude: usize,
        radius: usize,
    },
}

/// Failure encoding or decoding a polyline string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolylineError {
    #[error("invalid character {byte:#04x} at position {position}")]
    InvalidCharacter { position: usize, byte: u8 },

    #[error("polyline ends in the middle of a coordinate")]
    Truncated,

    #[error("encoded value overflows at position {position}")]
    Overflow { position: usize },

    #[error("cannot encode coordinates: {0}")]
    Encode(String),

    #[error("cannot decode polyline: {0}")]
    Decode(String),
}

/// Failure matching one batch against the map-matching service.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("cannot match an empty batch")]
    EmptyBatch,

    #[error("need at least 2 samples to match, got {count}")]
    TooFewSamples { count: usize },

    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("service returned {code}: {message}")]
    Service { code: String, message: String },

    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("bad geometry: {0}")]
    Polyline(#[from] PolylineError),
}

impl MatchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MatchError::Transport(_) | MatchError::Timeout => true,
            MatchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short machine-friendly name, used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::EmptyBatch => "empty_batch",
            MatchError::TooFewSamples { .. } => "too_few_samples",
            MatchError::Url(_) => "url",
            MatchError::Transport(_) => "transport",
            MatchError::Timeout => "timeout",
            MatchError::Status { .. } => "status",
            MatchError::Service { .. } => "service",
            MatchError::Body(_) => "body",
            MatchError::Polyline(_) => "polyline",
        }
    }
}

/// Failure producing a raster layer for one batch.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("invalid extent: {reason}")]
    InvalidExtent { reason: String },

    #[error("raster of {width}x{height} exceeds the {max} pixel limit per side")]
    TooLarge { width: u64, height: u64, max: u32 },

    #[error("layer name `{name}` is reserved")]
    ReservedName { name: String },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failure folding layers into the accumulated image.
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("layer is {found:?} pixels, accumulator is {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("layer was rendered with a different extent than the accumulator")]
    ExtentMismatch,

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Fatal failure of a whole pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to export samples: {0}")]
    Export(#[source] std::io::Error),
}
