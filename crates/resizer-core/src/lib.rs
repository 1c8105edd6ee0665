use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod session;

pub use session::{parse_dimension, IngestReport, ResizeSession, SkippedFile, TrackedImage};

pub const DEFAULT_ARCHIVE_NAME: &str = "resized-images.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn all() -> [OutputFormat; 3] {
        [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Webp]
    }

    /// Extension used in output file names; also the format's wire label.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(self, Self::Png)
    }

    /// Quality handed to the codec in `[0, 1]`, or `None` for lossless formats.
    pub fn codec_quality(self, quality: Quality) -> Option<f32> {
        if self.is_lossless() {
            None
        } else {
            Some(quality.as_unit())
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            other => Err(CoreError::UnknownFormat(other.to_string())),
        }
    }
}

/// Encoder quality in percent, always within `1..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub const DEFAULT: Quality = Quality(80);

    pub fn new(value: u8) -> Result<Self, CoreError> {
        if (1..=100).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CoreError::InvalidQuality(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn as_unit(self) -> f32 {
        self.0 as f32 / 100.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Quality {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Axis {
    Width,
    Height,
}

impl Axis {
    pub fn opposite(self) -> Self {
        match self {
            Self::Width => Self::Height,
            Self::Height => Self::Width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(u64);

impl ImageId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Rasterized RGBA8 pixels at a fixed size.
#[derive(Debug, Clone)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Raster {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, CoreError> {
        let expected = (width as u64).saturating_mul(height as u64).saturating_mul(4);
        if pixels.len() as u64 != expected {
            return Err(CoreError::Codec(format!(
                "raster of {}x{} expects {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// A file handed to the ingestion boundary, tagged with its content type.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn is_image(&self) -> bool {
        self.content_type.trim().to_ascii_lowercase().starts_with("image/")
    }
}

/// Source bytes whose native size is already known.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub name: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub trait ImageCodec {
    fn probe(&self, bytes: &[u8]) -> Result<ImageSize, CoreError>;

    fn rasterize(&self, bytes: &[u8], width: u32, height: u32) -> Result<Raster, CoreError>;

    /// `quality` is in `[0, 1]` and `None` for lossless formats.
    fn encode(&self, raster: &Raster, format: OutputFormat, quality: Option<f32>) -> Result<Vec<u8>, CoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveEntry<'a> {
    pub name: &'a str,
    pub bytes: &'a [u8],
}

pub trait Packager {
    fn package(&self, entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>, CoreError>;
}

pub trait DeliverySink {
    fn deliver(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    IngestSuccess,
    IngestRejected,
    ExportStart,
    ExportSuccess,
    ExportError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub format: OutputFormat,
    pub image_count: usize,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no valid image files in selection")]
    NoValidFiles,
    #[error("no images to export")]
    NoImagesToExport,
    #[error("an export is already in progress")]
    ExportInProgress,
    #[error("unknown image {0}")]
    UnknownImage(ImageId),
    #[error("quality must be between 1 and 100 (received {0})")]
    InvalidQuality(u8),
    #[error("unknown output format '{0}'; expected one of: jpeg, png, webp")]
    UnknownFormat(String),
    #[error("image has an unusable native size {width}x{height}")]
    InvalidNativeSize { width: u32, height: u32 },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("packaging error: {0}")]
    Packaging(String),
    #[error("delivery error: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NoValidFiles,
    NoImagesToExport,
    ExportInProgress,
    InvalidArgument,
    ProcessingError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    /// Codec, packaging and delivery failures all surface as one processing error.
    pub fn is_processing_error(&self) -> bool {
        self.code == ErrorCode::ProcessingError
    }
}

impl CoreError {
    pub fn as_error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::NoValidFiles => ErrorCode::NoValidFiles,
            Self::NoImagesToExport => ErrorCode::NoImagesToExport,
            Self::ExportInProgress => ErrorCode::ExportInProgress,
            Self::UnknownImage(_) | Self::InvalidQuality(_) | Self::UnknownFormat(_) | Self::InvalidNativeSize { .. } => {
                ErrorCode::InvalidArgument
            }
            Self::Codec(_) | Self::Packaging(_) | Self::Delivery(_) => ErrorCode::ProcessingError,
        };
        ErrorInfo {
            code,
            message: self.to_string(),
        }
    }
}

/// Typed settings a session starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub format: OutputFormat,
    pub quality: Quality,
    pub aspect_locked: bool,
    pub archive_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality: Quality::DEFAULT,
            aspect_locked: true,
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub format: String,
    pub quality: u8,
    pub keep_aspect_ratio: bool,
    pub archive_name: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: "jpeg".to_string(),
            quality: Quality::DEFAULT.get(),
            keep_aspect_ratio: true,
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
        }
    }
}

impl ExportConfig {
    pub fn into_options(self) -> Result<SessionOptions, CoreError> {
        Ok(SessionOptions {
            format: self.format.parse()?,
            quality: Quality::new(self.quality)?,
            aspect_locked: self.keep_aspect_ratio,
            archive_name: self.archive_name,
        })
    }
}

/// Empty strings and a zero quality keep the built-in defaults.
pub fn resolve_export_config(overrides: ExportConfig) -> ExportConfig {
    let mut cfg = ExportConfig::default();
    if !overrides.format.trim().is_empty() {
        cfg.format = overrides.format;
    }
    if overrides.quality > 0 {
        cfg.quality = overrides.quality;
    }
    if !overrides.archive_name.trim().is_empty() {
        cfg.archive_name = overrides.archive_name;
    }
    cfg.keep_aspect_ratio = overrides.keep_aspect_ratio;
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_drops_quality_for_codec() {
        let quality = Quality::new(80).expect("valid quality");
        assert_eq!(OutputFormat::Png.codec_quality(quality), None);
        assert_eq!(OutputFormat::Jpeg.codec_quality(quality), Some(0.8));
        assert_eq!(OutputFormat::Webp.codec_quality(quality), Some(0.8));
    }

    #[test]
    fn quality_rejects_out_of_range_values() {
        assert!(matches!(Quality::new(0), Err(CoreError::InvalidQuality(0))));
        assert!(matches!(Quality::new(101), Err(CoreError::InvalidQuality(101))));
        assert_eq!(Quality::new(1).expect("lower bound").get(), 1);
        assert_eq!(Quality::new(100).expect("upper bound").get(), 100);
    }

    #[test]
    fn format_parses_common_aliases() {
        assert_eq!("JPG".parse::<OutputFormat>().expect("jpg alias"), OutputFormat::Jpeg);
        assert_eq!("webp".parse::<OutputFormat>().expect("webp"), OutputFormat::Webp);
        let err = "gif".parse::<OutputFormat>().expect_err("gif is not an output format");
        assert!(err.to_string().contains("unknown output format"));
    }

    #[test]
    fn processing_failures_share_one_error_code() {
        for err in [
            CoreError::Codec("decode".to_string()),
            CoreError::Packaging("zip".to_string()),
            CoreError::Delivery("disk full".to_string()),
        ] {
            assert!(err.as_error_info().is_processing_error());
        }
        assert_eq!(CoreError::NoValidFiles.as_error_info().code, ErrorCode::NoValidFiles);
        assert!(!CoreError::NoImagesToExport.as_error_info().is_processing_error());
    }

    #[test]
    fn resolve_keeps_defaults_for_blank_overrides() {
        let cfg = resolve_export_config(ExportConfig {
            format: " ".to_string(),
            quality: 0,
            keep_aspect_ratio: false,
            archive_name: String::new(),
        });
        assert_eq!(cfg.format, "jpeg");
        assert_eq!(cfg.quality, 80);
        assert!(!cfg.keep_aspect_ratio);
        assert_eq!(cfg.archive_name, DEFAULT_ARCHIVE_NAME);

        let options = cfg.into_options().expect("defaults are valid");
        assert_eq!(options.format, OutputFormat::Jpeg);
        assert!(!options.aspect_locked);
    }

    #[test]
    fn raster_checks_buffer_length() {
        assert!(Raster::new(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(Raster::new(2, 2, vec![0; 15]), Err(CoreError::Codec(_))));
    }
}
