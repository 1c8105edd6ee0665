use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, RgbImage, RgbaImage};
use resizer_core::{CoreError, ImageCodec, ImageSize, OutputFormat, Raster};
use tracing::debug;

pub const DEFAULT_MAX_RASTER_BYTES: u64 = 512 * 1024 * 1024;

pub fn estimate_rgba_bytes(size: ImageSize) -> u64 {
    (size.width as u64)
        .saturating_mul(size.height as u64)
        .saturating_mul(4)
}

/// Codec backed by the `image` crate, with `webp` for lossy WebP output.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    filter: FilterType,
    max_raster_bytes: u64,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self {
            filter: FilterType::Triangle,
            max_raster_bytes: DEFAULT_MAX_RASTER_BYTES,
        }
    }
}

impl ImageCrateCodec {
    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_raster_bytes(mut self, max_raster_bytes: u64) -> Self {
        self.max_raster_bytes = max_raster_bytes;
        self
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, CoreError> {
        image::load_from_memory(bytes).map_err(codec_error)
    }
}

impl ImageCodec for ImageCrateCodec {
    fn probe(&self, bytes: &[u8]) -> Result<ImageSize, CoreError> {
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(codec_error)?
            .into_dimensions()
            .map_err(codec_error)?;
        Ok(ImageSize { width, height })
    }

    fn rasterize(&self, bytes: &[u8], width: u32, height: u32) -> Result<Raster, CoreError> {
        let needed = estimate_rgba_bytes(ImageSize { width, height });
        if width == 0 || height == 0 || needed > self.max_raster_bytes {
            return Err(CoreError::Codec(format!(
                "cannot rasterize at {}x{} ({} bytes, limit {})",
                width, height, needed, self.max_raster_bytes
            )));
        }
        let source = self.decode(bytes)?;
        debug!(
            "drawing {}x{} source at {}x{}",
            source.width(),
            source.height(),
            width,
            height
        );
        let drawn = if source.width() == width && source.height() == height {
            source.to_rgba8()
        } else {
            source.resize_exact(width, height, self.filter).to_rgba8()
        };
        Raster::new(width, height, drawn.into_raw())
    }

    fn encode(&self, raster: &Raster, format: OutputFormat, quality: Option<f32>) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        match format {
            OutputFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, quality_percent(quality));
                DynamicImage::ImageRgb8(flatten_onto_black(raster))
                    .write_with_encoder(encoder)
                    .map_err(codec_error)?;
            }
            OutputFormat::Png => {
                let rgba = RgbaImage::from_raw(raster.width(), raster.height(), raster.pixels().to_vec())
                    .ok_or_else(|| CoreError::Codec("raster buffer does not match its size".to_string()))?;
                DynamicImage::ImageRgba8(rgba)
                    .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                    .map_err(codec_error)?;
            }
            OutputFormat::Webp => {
                let encoded = webp::Encoder::from_rgba(raster.pixels(), raster.width(), raster.height())
                    .encode_simple(false, quality_percent(quality) as f32)
                    .map_err(|err| CoreError::Codec(format!("webp encode failed: {:?}", err)))?;
                out.extend_from_slice(&encoded);
            }
        }
        Ok(out)
    }
}

/// Maps a `[0, 1]` quality onto the 1..=100 scale encoders expect; `None` means best.
fn quality_percent(quality: Option<f32>) -> u8 {
    match quality {
        Some(value) => (value.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8,
        None => 100,
    }
}

// JPEG has no alpha channel; transparent pixels end up black.
fn flatten_onto_black(raster: &Raster) -> RgbImage {
    let mut flat = Vec::with_capacity(raster.pixels().len() / 4 * 3);
    for px in raster.pixels().chunks_exact(4) {
        let alpha = px[3] as u16;
        for channel in &px[..3] {
            flat.push(((*channel as u16 * alpha + 127) / 255) as u8);
        }
    }
    RgbImage::from_raw(raster.width(), raster.height(), flat).unwrap_or_else(|| RgbImage::new(raster.width(), raster.height()))
}

fn codec_error(err: impl std::fmt::Display) -> CoreError {
    CoreError::Codec(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([10, 10, 10])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("sample png");
        out
    }

    #[test]
    fn probe_reads_native_size_without_full_decode() {
        let size = ImageCrateCodec::default().probe(&sample_png(16, 8)).expect("probe");
        assert_eq!(size, ImageSize { width: 16, height: 8 });
    }

    #[test]
    fn probe_rejects_garbage() {
        let err = ImageCrateCodec::default().probe(b"not an image").expect_err("garbage");
        assert!(matches!(err, CoreError::Codec(_)));
    }

    #[test]
    fn rasterize_draws_at_target_size() {
        let raster = ImageCrateCodec::default()
            .rasterize(&sample_png(16, 8), 5, 3)
            .expect("rasterize");
        assert_eq!((raster.width(), raster.height()), (5, 3));
        assert_eq!(raster.pixels().len(), 5 * 3 * 4);
    }

    #[test]
    fn rasterize_refuses_oversized_targets() {
        let codec = ImageCrateCodec::default().with_max_raster_bytes(1024);
        let err = codec.rasterize(&sample_png(4, 4), 100, 100).expect_err("too large");
        assert!(err.to_string().contains("cannot rasterize"));
    }

    #[test]
    fn encodes_every_output_format() {
        let codec = ImageCrateCodec::default();
        let raster = codec.rasterize(&sample_png(8, 8), 8, 8).expect("rasterize");

        let jpeg = codec.encode(&raster, OutputFormat::Jpeg, Some(0.8)).expect("jpeg");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let png = codec.encode(&raster, OutputFormat::Png, None).expect("png");
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
        let decoded = image::load_from_memory(&png).expect("png decodes");
        assert_eq!((decoded.width(), decoded.height()), (8, 8));

        let webp = codec.encode(&raster, OutputFormat::Webp, Some(0.5)).expect("webp");
        assert_eq!(&webp[..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
    }

    #[test]
    fn quality_maps_to_percent() {
        assert_eq!(quality_percent(Some(0.8)), 80);
        assert_eq!(quality_percent(Some(0.0)), 1);
        assert_eq!(quality_percent(Some(2.0)), 100);
        assert_eq!(quality_percent(None), 100);
    }

    #[test]
    fn transparent_pixels_flatten_to_black() {
        let raster = Raster::new(2, 1, vec![200, 100, 50, 0, 200, 100, 50, 255]).expect("raster");
        let flat = flatten_onto_black(&raster);
        assert_eq!(flat.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([200, 100, 50]));
    }
}
