//! Ordered "over" compositing of raster layers.

use image::Rgba;

use crate::error::CompositeError;
use crate::raster::RasterLayer;

/// Blends `overlay` onto `base` in place with the Porter-Duff "over" operator.
///
/// Transparent overlay pixels leave `base` untouched and opaque ones replace
/// it. The operation is not commutative: later layers draw on top.
pub fn accumulate(base: &mut RasterLayer, overlay: &RasterLayer) -> Result<(), CompositeError> {
    if base.dimensions() != overlay.dimensions() {
        return Err(CompositeError::DimensionMismatch {
            expected: base.dimensions(),
            found: overlay.dimensions(),
        });
    }
    if base.extent != overlay.extent {
        return Err(CompositeError::ExtentMismatch);
    }

    for (dst, src) in base.image.pixels_mut().zip(overlay.image.pixels()) {
        blend_over(dst, src);
    }
    Ok(())
}

/// Straight-alpha "over" for one pixel.
#[inline]
fn blend_over(dst: &mut Rgba<u8>, src: &Rgba<u8>) {
    match src[3] {
        0 => {}
        255 => *dst = *src,
        alpha => {
            let src_a = alpha as f32 / 255.0;
            let dst_a = dst[3] as f32 / 255.0;
            let out_a = src_a + dst_a * (1.0 - src_a);

            for i in 0..3 {
                let s = src[i] as f32;
                let d = dst[i] as f32;
                dst[i] = ((s * src_a + d * dst_a * (1.0 - src_a)) / out_a).round() as u8;
            }
            dst[3] = (out_a * 255.0).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Extent;
    use geo::{Coord, Rect};
    use image::Rgba;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn extent() -> Extent {
        Extent::new(
            Rect::new(Coord { x: 13.40, y: 52.515 }, Coord { x: 13.41, y: 52.521 }),
            0.01,
        )
        .unwrap()
    }

    fn layer_with(pixels: &[(u32, u32, Rgba<u8>)]) -> RasterLayer {
        let mut layer = RasterLayer::transparent(extent());
        for &(x, y, color) in pixels {
            layer.image.put_pixel(x, y, color);
        }
        layer
    }

    #[test]
    fn test_transparent_overlay_is_noop() {
        let mut base = layer_with(&[(0, 0, RED), (3, 2, Rgba([10, 20, 30, 77]))]);
        let before = base.image.clone();

        accumulate(&mut base, &RasterLayer::transparent(extent())).unwrap();
        assert_eq!(base.image, before);
    }

    #[test]
    fn test_opaque_overlay_replaces() {
        let mut base = RasterLayer::filled(extent(), WHITE);
        accumulate(&mut base, &layer_with(&[(1, 1, BLUE)])).unwrap();

        assert_eq!(*base.image.get_pixel(1, 1), BLUE);
        assert_eq!(*base.image.get_pixel(0, 0), WHITE);
    }

    #[test]
    fn test_partial_alpha_blends() {
        let mut base = RasterLayer::filled(extent(), WHITE);
        accumulate(&mut base, &layer_with(&[(0, 0, Rgba([0, 0, 0, 128]))])).unwrap();

        let p = base.image.get_pixel(0, 0);
        assert_eq!(p[3], 255);
        assert!(p[0] > 120 && p[0] < 135, "got {:?}", p);
        assert_eq!(p[0], p[1]);
    }

    #[test]
    fn test_order_matters() {
        let a = layer_with(&[(2, 2, RED)]);
        let b = layer_with(&[(2, 2, BLUE)]);

        let mut ab = RasterLayer::filled(extent(), WHITE);
        accumulate(&mut ab, &a).unwrap();
        accumulate(&mut ab, &b).unwrap();

        let mut ba = RasterLayer::filled(extent(), WHITE);
        accumulate(&mut ba, &b).unwrap();
        accumulate(&mut ba, &a).unwrap();

        assert_ne!(ab.image, ba.image);
        assert_eq!(*ab.image.get_pixel(2, 2), BLUE);
        assert_eq!(*ba.image.get_pixel(2, 2), RED);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut base = RasterLayer::filled(extent(), WHITE);
        let other = Extent::new(
            Rect::new(Coord { x: 13.40, y: 52.515 }, Coord { x: 13.42, y: 52.521 }),
            0.01,
        )
        .unwrap();

        let err = accumulate(&mut base, &RasterLayer::transparent(other)).unwrap_err();
        assert!(matches!(err, CompositeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_extent_mismatch() {
        let mut base = RasterLayer::filled(extent(), WHITE);
        let mut shifted = RasterLayer::transparent(extent());
        shifted.extent = Extent::new(
            Rect::new(Coord { x: 13.401, y: 52.515 }, Coord { x: 13.411, y: 52.521 }),
            0.01,
        )
        .unwrap();
        assert_eq!(shifted.extent.dimensions(), base.dimensions());

        let err = accumulate(&mut base, &shifted).unwrap_err();
        assert!(matches!(err, CompositeError::ExtentMismatch));
    }
}
