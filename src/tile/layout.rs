//! Tile geometry and pixel encodings.

use eyre::{ensure, Result};

use crate::config::DESCRIPTION_LEN;

/// Numeric type of one pixel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U8,
    Float,
    /// Anything else; only copied, never averaged.
    Opaque,
}

/// A pixel-format descriptor such as `"RGBA float"` or `"R'G'B'A u8"`.
///
/// The descriptor is stored verbatim in the file header. Only the component
/// count and sample type matter to the tile store (for mipmap averaging).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    description: String,
    components: usize,
    sample: SampleType,
}

impl PixelFormat {
    /// Parses `"<model> <type>"`. The component count is the number of
    /// uppercase letters in the model (`R'G'B'A` has 4).
    pub fn parse(description: &str) -> Self {
        let mut words = description.split_whitespace();
        let model = words.next().unwrap_or("");
        let type_name = words.last().unwrap_or("");

        let components = model.chars().filter(|c| c.is_ascii_uppercase()).count();
        let sample = match type_name {
            "u8" => SampleType::U8,
            "float" => SampleType::Float,
            _ => SampleType::Opaque,
        };

        Self {
            description: description.to_string(),
            components: components.max(1),
            sample,
        }
    }

    pub fn rgba_float() -> Self {
        Self::parse("RGBA float")
    }

    pub fn rgba_u8() -> Self {
        Self::parse("R'G'B'A u8")
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn sample(&self) -> SampleType {
        self.sample
    }

    /// Bytes per pixel implied by the descriptor, if it names a known type.
    pub fn implied_bytes_per_pixel(&self) -> Option<usize> {
        match self.sample {
            SampleType::U8 => Some(self.components),
            SampleType::Float => Some(self.components * 4),
            SampleType::Opaque => None,
        }
    }
}

/// Shape of every tile in one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    pub tile_width: u32,
    pub tile_height: u32,
    pub bytes_per_pixel: u16,
    pub format: PixelFormat,
}

impl TileLayout {
    pub fn new(tile_width: u32, tile_height: u32, format: PixelFormat) -> Result<Self> {
        let bytes_per_pixel = format.implied_bytes_per_pixel().ok_or_else(|| {
            eyre::eyre!(
                "pixel format '{}' does not imply a pixel size",
                format.description()
            )
        })?;
        Self::with_bytes_per_pixel(tile_width, tile_height, bytes_per_pixel as u16, format)
    }

    pub fn with_bytes_per_pixel(
        tile_width: u32,
        tile_height: u32,
        bytes_per_pixel: u16,
        format: PixelFormat,
    ) -> Result<Self> {
        ensure!(
            tile_width > 0 && tile_height > 0,
            "tile dimensions must be non-zero: {}x{}",
            tile_width,
            tile_height
        );
        ensure!(bytes_per_pixel > 0, "bytes per pixel must be non-zero");
        let tile_size = (tile_width as u64)
            .checked_mul(tile_height as u64)
            .and_then(|pixels| pixels.checked_mul(bytes_per_pixel as u64));
        ensure!(
            tile_size.is_some_and(|size| size <= u32::MAX as u64),
            "tile of {}x{} pixels at {} bytes each is too large",
            tile_width,
            tile_height,
            bytes_per_pixel
        );
        ensure!(
            format.description().len() < DESCRIPTION_LEN,
            "pixel format description '{}' exceeds {} bytes",
            format.description(),
            DESCRIPTION_LEN - 1
        );

        Ok(Self {
            tile_width,
            tile_height,
            bytes_per_pixel,
            format,
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * self.bytes_per_pixel as usize
    }

    pub fn rowstride(&self) -> usize {
        self.tile_width as usize * self.bytes_per_pixel as usize
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_counts_components_and_type() {
        let float = PixelFormat::parse("RGBA float");
        assert_eq!(float.components(), 4);
        assert_eq!(float.sample(), SampleType::Float);
        assert_eq!(float.implied_bytes_per_pixel(), Some(16));

        let u8 = PixelFormat::parse("R'G'B' u8");
        assert_eq!(u8.components(), 3);
        assert_eq!(u8.sample(), SampleType::U8);

        let other = PixelFormat::parse("Y u16");
        assert_eq!(other.sample(), SampleType::Opaque);
        assert_eq!(other.implied_bytes_per_pixel(), None);
    }

    #[test]
    fn layout_computes_tile_size() {
        let layout = TileLayout::new(64, 32, PixelFormat::rgba_u8()).unwrap();

        assert_eq!(layout.bytes_per_pixel, 4);
        assert_eq!(layout.tile_size(), 64 * 32 * 4);
        assert_eq!(layout.rowstride(), 256);
    }

    #[test]
    fn layout_rejects_zero_dimensions() {
        assert!(TileLayout::new(0, 32, PixelFormat::rgba_u8()).is_err());
    }

    #[test]
    fn layout_rejects_oversized_tiles() {
        assert!(TileLayout::new(u32::MAX, u32::MAX, PixelFormat::rgba_float()).is_err());
        assert!(TileLayout::new(65536, 65536, PixelFormat::rgba_u8()).is_err());
    }

    #[test]
    fn opaque_formats_need_an_explicit_pixel_size() {
        assert!(TileLayout::new(8, 8, PixelFormat::parse("Y u16")).is_err());

        let layout =
            TileLayout::with_bytes_per_pixel(8, 8, 2, PixelFormat::parse("Y u16")).unwrap();
        assert_eq!(layout.tile_size(), 128);
    }
}
