//! Quadrant downsampling kernels.
//!
//! Each kernel writes one `w/2 x h/2` quadrant of the destination tile from a
//! full `w x h` source tile. Odd dimensions drop the last row or column.

use crate::tile::{Quadrant, SampleType, TileLayout};

struct Geometry {
    width: usize,
    height: usize,
    bpp: usize,
    rowstride: usize,
}

impl Geometry {
    fn new(layout: &TileLayout) -> Self {
        Self {
            width: layout.tile_width as usize,
            height: layout.tile_height as usize,
            bpp: layout.bytes_per_pixel as usize,
            rowstride: layout.rowstride(),
        }
    }

    /// Byte offset of the destination pixel `(x, y)` inside `quadrant`.
    fn dst_offset(&self, quadrant: Quadrant, x: usize, y: usize) -> usize {
        let (i, j) = quadrant.offsets();
        (y + j * (self.height / 2)) * self.rowstride + (x + i * (self.width / 2)) * self.bpp
    }

    fn src_offset(&self, x: usize, y: usize) -> usize {
        y * self.rowstride + x * self.bpp
    }
}

/// Writes `src` reduced by half into `quadrant` of `dst`.
///
/// `RGBA float`-style and `u8` formats are box filtered per component; any
/// other encoding, or a pixel size that does not match the component count,
/// falls back to nearest neighbour.
pub(crate) fn downscale_into(layout: &TileLayout, src: &[u8], dst: &mut [u8], quadrant: Quadrant) {
    let components = layout.format.components();
    let bpp = layout.bytes_per_pixel as usize;

    match layout.format.sample() {
        SampleType::Float if bpp == components * 4 => box_f32(layout, components, src, dst, quadrant),
        SampleType::U8 if bpp == components => box_u8(layout, components, src, dst, quadrant),
        _ => nearest(layout, src, dst, quadrant),
    }
}

/// Zero-fills `quadrant` of `dst`.
pub(crate) fn blank(layout: &TileLayout, dst: &mut [u8], quadrant: Quadrant) {
    let g = Geometry::new(layout);
    let bytes = (g.width / 2) * g.bpp;
    for y in 0..g.height / 2 {
        let start = g.dst_offset(quadrant, 0, y);
        dst[start..start + bytes].fill(0);
    }
}

fn box_f32(layout: &TileLayout, components: usize, src: &[u8], dst: &mut [u8], quadrant: Quadrant) {
    let g = Geometry::new(layout);
    let sample = |offset: usize| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&src[offset..offset + 4]);
        f32::from_ne_bytes(bytes)
    };

    for y in 0..g.height / 2 {
        for x in 0..g.width / 2 {
            let tl = g.src_offset(2 * x, 2 * y);
            let tr = tl + g.bpp;
            let bl = tl + g.rowstride;
            let br = bl + g.bpp;
            let out = g.dst_offset(quadrant, x, y);

            for c in 0..components {
                let k = c * 4;
                let avg = (sample(tl + k) + sample(tr + k) + sample(bl + k) + sample(br + k)) / 4.0;
                dst[out + k..out + k + 4].copy_from_slice(&avg.to_ne_bytes());
            }
        }
    }
}

fn box_u8(layout: &TileLayout, components: usize, src: &[u8], dst: &mut [u8], quadrant: Quadrant) {
    let g = Geometry::new(layout);

    for y in 0..g.height / 2 {
        for x in 0..g.width / 2 {
            let tl = g.src_offset(2 * x, 2 * y);
            let tr = tl + g.bpp;
            let bl = tl + g.rowstride;
            let br = bl + g.bpp;
            let out = g.dst_offset(quadrant, x, y);

            for c in 0..components {
                let sum = src[tl + c] as u16 + src[tr + c] as u16 + src[bl + c] as u16 + src[br + c] as u16;
                dst[out + c] = (sum / 4) as u8;
            }
        }
    }
}

fn nearest(layout: &TileLayout, src: &[u8], dst: &mut [u8], quadrant: Quadrant) {
    let g = Geometry::new(layout);

    for y in 0..g.height / 2 {
        for x in 0..g.width / 2 {
            let from = g.src_offset(2 * x, 2 * y);
            let to = g.dst_offset(quadrant, x, y);
            dst[to..to + g.bpp].copy_from_slice(&src[from..from + g.bpp]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::PixelFormat;

    #[test]
    fn u8_box_filter_truncates() {
        let layout = TileLayout::new(2, 2, PixelFormat::parse("Y u8")).unwrap();
        let src = [1u8, 2, 3, 5];
        let mut dst = [0u8; 4];

        downscale_into(&layout, &src, &mut dst, Quadrant::BottomRight);

        assert_eq!(dst, [0, 0, 0, 2]);
    }

    #[test]
    fn float_box_filter_averages_each_component() {
        let layout = TileLayout::new(2, 2, PixelFormat::parse("YA float")).unwrap();
        let pixels: [[f32; 2]; 4] = [[0.0, 1.0], [1.0, 1.0], [0.5, 0.0], [0.5, 0.0]];
        let src: Vec<u8> = pixels.iter().flatten().flat_map(|v| v.to_ne_bytes()).collect();
        let mut dst = vec![0u8; src.len()];

        downscale_into(&layout, &src, &mut dst, Quadrant::TopLeft);

        let y = f32::from_ne_bytes(dst[0..4].try_into().unwrap());
        let a = f32::from_ne_bytes(dst[4..8].try_into().unwrap());
        assert!((y - 0.5).abs() < 1e-6);
        assert!((a - 0.5).abs() < 1e-6);
        assert!(dst[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn opaque_formats_take_the_top_left_pixel() {
        let layout =
            TileLayout::with_bytes_per_pixel(4, 2, 2, PixelFormat::parse("CIE Lab half")).unwrap();
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0xffu8; 16];

        downscale_into(&layout, &src, &mut dst, Quadrant::TopRight);

        // row 0 right half gets source pixels (0,0) and (2,0)
        assert_eq!(&dst[4..8], &[0, 1, 4, 5]);
        assert_eq!(&dst[0..4], &[0xff; 4]);
    }

    #[test]
    fn blank_clears_only_its_quadrant() {
        let layout = TileLayout::new(2, 2, PixelFormat::parse("Y u8")).unwrap();
        let mut dst = [9u8; 4];

        blank(&layout, &mut dst, Quadrant::TopRight);

        assert_eq!(dst, [9, 0, 9, 9]);
    }
}
