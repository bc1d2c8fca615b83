//! Route rasterization.
//!
//! Renders matched routes into RGBA layers using Web Mercator projection.
//! Every vertex is projected to planar meters before stroking, so stroke
//! width and the output extent are both in planar units. Layers produced
//! with the same [`Extent`] always have identical pixel dimensions.

use std::path::Path;

use geo::{Coord, MapCoords, Rect};
use image::{ImageBuffer, ImageFormat, Rgba, RgbaImage};
use log::debug;

use crate::error::RasterError;
use crate::projection::{coord_to_planar, to_geographic, to_planar, MAX_LATITUDE};
use crate::MatchedRoute;

/// Largest width or height of a layer, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

/// How routes are stroked.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeStyle {
    /// Line width in planar meters
    pub width_meters: f64,
    /// Straight (non-premultiplied) RGBA color
    pub color: Rgba<u8>,
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            width_meters: 15.0,
            color: Rgba([252, 76, 2, 255]),
        }
    }
}

/// Geographic bounding box plus the planar-meters-to-pixels scale.
///
/// Pixel (0, 0) is the north-west corner; y grows southwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    bbox: Rect<f64>,
    pixels_per_meter: f64,
    min_x: f64,
    max_y: f64,
    width: u32,
    height: u32,
}

impl Extent {
    /// Validates `bbox` (longitude/latitude degrees) and `pixels_per_meter`.
    pub fn new(bbox: Rect<f64>, pixels_per_meter: f64) -> Result<Self, RasterError> {
        let invalid = |reason: &str| RasterError::InvalidExtent {
            reason: reason.to_string(),
        };

        let (min, max) = (bbox.min(), bbox.max());
        if ![min.x, min.y, max.x, max.y, pixels_per_meter]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(invalid("non-finite bounds or scale"));
        }
        if pixels_per_meter <= 0.0 {
            return Err(invalid("scale must be positive"));
        }
        if min.x < -180.0 || max.x > 180.0 || min.y < -MAX_LATITUDE || max.y > MAX_LATITUDE {
            return Err(invalid("bounds outside the projectable range"));
        }

        let (min_x, min_y) = to_planar(min.x, min.y);
        let (max_x, max_y) = to_planar(max.x, max.y);
        let width = ((max_x - min_x) * pixels_per_meter).ceil();
        let height = ((max_y - min_y) * pixels_per_meter).ceil();

        if width < 1.0 || height < 1.0 {
            return Err(invalid("zero-sized output"));
        }
        if width > MAX_DIMENSION as f64 || height > MAX_DIMENSION as f64 {
            return Err(RasterError::TooLarge {
                width: width as u64,
                height: height as u64,
                max: MAX_DIMENSION,
            });
        }

        Ok(Self {
            bbox,
            pixels_per_meter,
            min_x,
            max_y,
            width: width as u32,
            height: height as u32,
        })
    }

    /// Smallest extent holding every leg of `routes`, padded by
    /// `padding_meters` on each side. `None` when there are no vertices.
    pub fn covering<'a>(
        routes: impl IntoIterator<Item = &'a MatchedRoute>,
        padding_meters: f64,
        pixels_per_meter: f64,
    ) -> Option<Result<Self, RasterError>> {
        let mut min = Coord { x: f64::INFINITY, y: f64::INFINITY };
        let mut max = Coord { x: f64::NEG_INFINITY, y: f64::NEG_INFINITY };

        for leg in routes.into_iter().flat_map(|r| r.legs.iter()) {
            for c in leg.coords() {
                let p = coord_to_planar(*c);
                min.x = min.x.min(p.x);
                min.y = min.y.min(p.y);
                max.x = max.x.max(p.x);
                max.y = max.y.max(p.y);
            }
        }
        if !min.x.is_finite() {
            return None;
        }

        let (west, south) = to_geographic(min.x - padding_meters, min.y - padding_meters);
        let (east, north) = to_geographic(max.x + padding_meters, max.y + padding_meters);
        let bbox = Rect::new(
            Coord { x: west.max(-180.0), y: south.max(-MAX_LATITUDE) },
            Coord { x: east.min(180.0), y: north.min(MAX_LATITUDE) },
        );
        Some(Self::new(bbox, pixels_per_meter))
    }

    pub fn bbox(&self) -> Rect<f64> {
        self.bbox
    }

    pub fn pixels_per_meter(&self) -> f64 {
        self.pixels_per_meter
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Planar meters to fractional pixel coordinates.
    #[inline]
    pub fn to_pixel(&self, planar: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (planar.x - self.min_x) * self.pixels_per_meter,
            y: (self.max_y - planar.y) * self.pixels_per_meter,
        }
    }
}

/// A rendered RGBA image (straight alpha) and the extent it covers.
#[derive(Debug, Clone)]
pub struct RasterLayer {
    pub image: RgbaImage,
    pub extent: Extent,
}

impl RasterLayer {
    /// Fully transparent layer.
    pub fn transparent(extent: Extent) -> Self {
        Self::filled(extent, Rgba([0, 0, 0, 0]))
    }

    /// Layer filled with one color, e.g. an opaque compositing background.
    pub fn filled(extent: Extent, color: Rgba<u8>) -> Self {
        let (width, height) = extent.dimensions();
        Self {
            image: ImageBuffer::from_pixel(width, height, color),
            extent,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Writes the layer as a PNG.
    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        self.image.save_with_format(path, ImageFormat::Png)
    }

    /// Reads a layer previously written with [`RasterLayer::save`].
    ///
    /// The pixel dimensions are not checked against `extent` here;
    /// compositing does that.
    pub fn load(path: &Path, extent: Extent) -> Result<Self, image::ImageError> {
        let image = image::open(path)?.to_rgba8();
        Ok(Self { image, extent })
    }
}

/// Strokes every drawable leg of `route` into a new transparent layer.
///
/// All legs form one path: where segments overlap, a pixel takes the
/// highest coverage rather than blending twice. Caps and joins are round.
pub fn rasterize(route: &MatchedRoute, extent: &Extent, stroke: &StrokeStyle) -> RasterLayer {
    let (width, height) = extent.dimensions();
    let mut coverage = vec![0f32; width as usize * height as usize];
    let half_width = (stroke.width_meters * extent.pixels_per_meter() / 2.0).max(0.5);

    let mut segments = 0usize;
    for leg in route.drawable_legs() {
        let pixels = leg
            .map_coords(coord_to_planar)
            .map_coords(|c| extent.to_pixel(c));
        for line in pixels.lines() {
            stamp_segment(&mut coverage, width, height, line.start, line.end, half_width);
            segments += 1;
        }
    }

    let Rgba([r, g, b, a]) = stroke.color;
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        let c = coverage[(y * width + x) as usize];
        if c > 0.0 {
            Rgba([r, g, b, (a as f32 * c).round() as u8])
        } else {
            Rgba([0, 0, 0, 0])
        }
    });

    debug!(
        "[Raster] Stroked {} segments from {} legs into {}x{}",
        segments,
        route.legs.len(),
        width,
        height
    );

    RasterLayer {
        image,
        extent: *extent,
    }
}

/// Records antialiased coverage of a round-capped segment.
fn stamp_segment(
    coverage: &mut [f32],
    width: u32,
    height: u32,
    a: Coord<f64>,
    b: Coord<f64>,
    half_width: f64,
) {
    let reach = half_width + 1.0;
    let x_lo = (a.x.min(b.x) - reach).floor().max(0.0);
    let y_lo = (a.y.min(b.y) - reach).floor().max(0.0);
    let x_hi = (a.x.max(b.x) + reach).ceil().min(width as f64 - 1.0);
    let y_hi = (a.y.max(b.y) + reach).ceil().min(height as f64 - 1.0);
    if x_lo > x_hi || y_lo > y_hi {
        return;
    }

    for py in y_lo as u32..=y_hi as u32 {
        for px in x_lo as u32..=x_hi as u32 {
            let center = Coord {
                x: px as f64 + 0.5,
                y: py as f64 + 0.5,
            };
            let d = distance_to_segment(center, a, b);
            let c = (half_width + 0.5 - d).clamp(0.0, 1.0) as f32;
            let cell = &mut coverage[(py * width + px) as usize];
            if c > *cell {
                *cell = c;
            }
        }
    }
}

fn distance_to_segment(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    let ab = b - a;
    let len_sq = ab.x * ab.x + ab.y * ab.y;
    let t = if len_sq > 0.0 {
        (((p.x - a.x) * ab.x + (p.y - a.y) * ab.y) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let closest = a + ab * t;
    (p.x - closest.x).hypot(p.y - closest.y)
}
