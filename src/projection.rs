//! # Web Mercator Projection
//!
//! Forward and inverse transforms between WGS84 longitude/latitude (degrees)
//! and spherical Web Mercator (EPSG:3857) planar meters.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`to_planar`] | Geographic degrees to planar meters |
//! | [`to_geographic`] | Planar meters back to geographic degrees |
//! | [`coord_to_planar`] | Same as [`to_planar`] on a [`geo::Coord`] |
//!
//! Latitudes beyond [`MAX_LATITUDE`] are clamped to `±R·π` instead of
//! diverging towards infinity.
//!
//! ```rust
//! use trackmatch::projection::{to_planar, to_geographic};
//!
//! let (x, y) = to_planar(-0.1278, 51.5074);
//! let (lon, lat) = to_geographic(x, y);
//! assert!((lon + 0.1278).abs() < 1e-9);
//! assert!((lat - 51.5074).abs() < 1e-9);
//! ```

use std::f64::consts::{FRAC_PI_4, PI};

use geo::Coord;

/// WGS84 equatorial radius in meters.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude (degrees) beyond which `y` is clamped.
///
/// The curve already passes `R·π` near 85.0511°, so `y` at exactly 85.06°
/// (about 20_048_966 m) is slightly larger than the clamped [`MAX_Y`]: `y`
/// steps down by roughly 11 km just past this latitude.
pub const MAX_LATITUDE: f64 = 85.06;

/// Planar `y` used for clamped latitudes.
pub const MAX_Y: f64 = EARTH_RADIUS * PI;

/// Project longitude/latitude degrees to Web Mercator meters.
#[inline]
pub fn to_planar(lon: f64, lat: f64) -> (f64, f64) {
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = if lat.abs() <= MAX_LATITUDE {
        EARTH_RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln()
    } else {
        MAX_Y.copysign(lat)
    };
    (x, y)
}

/// Inverse of [`to_planar`] for unclamped inputs.
#[inline]
pub fn to_geographic(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

/// [`to_planar`] for a `geo` coordinate (x = longitude, y = latitude).
#[inline]
pub fn coord_to_planar(c: Coord<f64>) -> Coord<f64> {
    let (x, y) = to_planar(c.x, c.y);
    Coord { x, y }
}

/// [`to_geographic`] for a `geo` coordinate.
#[inline]
pub fn coord_to_geographic(c: Coord<f64>) -> Coord<f64> {
    let (x, y) = to_geographic(c.x, c.y);
    Coord { x, y }
}
