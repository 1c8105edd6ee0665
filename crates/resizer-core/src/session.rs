use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    Axis, CoreError, DecodedImage, ImageCodec, ImageId, ImageSize, OutputFormat, Quality, SessionOptions, SourceFile,
};

#[derive(Debug, Clone)]
pub struct TrackedImage {
    id: ImageId,
    source_bytes: Vec<u8>,
    original_name: String,
    native_width: u32,
    native_height: u32,
    target_width: String,
    target_height: String,
}

impl TrackedImage {
    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn source_bytes(&self) -> &[u8] {
        &self.source_bytes
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn native_width(&self) -> u32 {
        self.native_width
    }

    pub fn native_height(&self) -> u32 {
        self.native_height
    }

    pub fn native(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Width => self.native_width,
            Axis::Height => self.native_height,
        }
    }

    /// Raw target text; may be empty or non-numeric while being edited.
    pub fn target(&self, axis: Axis) -> &str {
        match axis {
            Axis::Width => &self.target_width,
            Axis::Height => &self.target_height,
        }
    }

    pub fn target_width(&self) -> &str {
        &self.target_width
    }

    pub fn target_height(&self) -> &str {
        &self.target_height
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.native_width as f64 / self.native_height as f64
    }

    /// Size used at export: a positive parsed target, else the native size.
    pub fn effective_size(&self) -> ImageSize {
        ImageSize {
            width: effective_dimension(&self.target_width, self.native_width),
            height: effective_dimension(&self.target_height, self.native_height),
        }
    }

    fn target_mut(&mut self, axis: Axis) -> &mut String {
        match axis {
            Axis::Width => &mut self.target_width,
            Axis::Height => &mut self.target_height,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFile {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub added: Vec<ImageId>,
    pub skipped: Vec<SkippedFile>,
}

/// Leading-integer parse of a dimension field: `" 12px"` is 12, `"1.9"` is 1, `"abc"` is `None`.
pub fn parse_dimension(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

fn derive_dimension(edited: Axis, value: i64, ratio: f64) -> i64 {
    let derived = match edited {
        Axis::Width => value as f64 / ratio,
        Axis::Height => value as f64 * ratio,
    };
    derived.round() as i64
}

fn effective_dimension(raw: &str, native: u32) -> u32 {
    parse_dimension(raw)
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(native)
}

/// Images being resized together plus the shared settings that drive them.
#[derive(Debug, Clone)]
pub struct ResizeSession {
    images: Vec<TrackedImage>,
    shared_width: String,
    shared_height: String,
    aspect_locked: bool,
    last_edited: Option<Axis>,
    format: OutputFormat,
    quality: Quality,
    archive_name: String,
    next_id: u64,
}

impl Default for ResizeSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl ResizeSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            images: Vec::new(),
            shared_width: String::new(),
            shared_height: String::new(),
            aspect_locked: options.aspect_locked,
            last_edited: None,
            format: options.format,
            quality: options.quality,
            archive_name: options.archive_name,
            next_id: 1,
        }
    }

    pub fn images(&self) -> &[TrackedImage] {
        &self.images
    }

    pub fn image(&self, id: ImageId) -> Option<&TrackedImage> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn shared(&self, axis: Axis) -> &str {
        match axis {
            Axis::Width => &self.shared_width,
            Axis::Height => &self.shared_height,
        }
    }

    pub fn shared_width(&self) -> &str {
        &self.shared_width
    }

    pub fn shared_height(&self) -> &str {
        &self.shared_height
    }

    pub fn is_aspect_locked(&self) -> bool {
        self.aspect_locked
    }

    pub fn last_edited_axis(&self) -> Option<Axis> {
        self.last_edited
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn set_format(&mut self, format: OutputFormat) {
        self.format = format;
    }

    pub fn set_quality(&mut self, quality: u8) -> Result<(), CoreError> {
        self.quality = Quality::new(quality)?;
        Ok(())
    }

    pub fn set_archive_name(&mut self, name: impl Into<String>) {
        self.archive_name = name.into();
    }

    /// Adds one decoded image. The first image of an empty session keeps its
    /// native size and seeds the shared fields; later ones take the shared fields.
    pub fn ingest(&mut self, image: DecodedImage) -> Result<&TrackedImage, CoreError> {
        validate_native_size(&image)?;
        let index = self.images.len();
        if self.images.is_empty() {
            let (width, height) = (image.width.to_string(), image.height.to_string());
            self.shared_width = width.clone();
            self.shared_height = height.clone();
            self.push_tracked(image, width, height);
        } else {
            let (width, height) = (self.shared_width.clone(), self.shared_height.clone());
            self.push_tracked(image, width, height);
        }
        Ok(&self.images[index])
    }

    /// Adds a whole selection at once. When the session was empty every image
    /// of the selection keeps its own native size; otherwise all of them take
    /// the shared fields. Nothing is added if any image has an unusable size.
    pub fn ingest_batch(&mut self, images: Vec<DecodedImage>) -> Result<Vec<ImageId>, CoreError> {
        for image in &images {
            validate_native_size(image)?;
        }
        let first_upload = self.images.is_empty();
        let mut added = Vec::with_capacity(images.len());
        for image in images {
            let (width, height) = if first_upload {
                (image.width.to_string(), image.height.to_string())
            } else {
                (self.shared_width.clone(), self.shared_height.clone())
            };
            added.push(self.push_tracked(image, width, height));
        }
        if first_upload {
            if let Some(first) = self.images.first() {
                self.shared_width = first.native_width.to_string();
                self.shared_height = first.native_height.to_string();
            }
        }
        Ok(added)
    }

    /// Ingestion boundary: keeps `image/*` files, probes their native size and
    /// ingests the ones that decode. Non-image files are dropped silently.
    pub fn ingest_files(&mut self, codec: &dyn ImageCodec, files: Vec<SourceFile>) -> Result<IngestReport, CoreError> {
        let candidates: Vec<SourceFile> = files.into_iter().filter(SourceFile::is_image).collect();
        if candidates.is_empty() {
            return Err(CoreError::NoValidFiles);
        }

        let mut decoded = Vec::with_capacity(candidates.len());
        let mut skipped = Vec::new();
        for file in candidates {
            match codec.probe(&file.bytes) {
                Ok(size) if size.width > 0 && size.height > 0 => decoded.push(DecodedImage {
                    name: file.name,
                    bytes: file.bytes,
                    width: size.width,
                    height: size.height,
                }),
                Ok(size) => skipped.push(SkippedFile {
                    reason: format!("unusable native size {}x{}", size.width, size.height),
                    name: file.name,
                }),
                Err(err) => {
                    warn!("skipping {}: {}", file.name, err);
                    skipped.push(SkippedFile {
                        name: file.name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let added = self.ingest_batch(decoded)?;
        debug!("ingested {} image(s), skipped {}", added.len(), skipped.len());
        Ok(IngestReport { added, skipped })
    }

    /// Applies a width or height to every image. Input that does not parse is
    /// ignored. Returns whether the edit was applied.
    pub fn set_shared_dimension(&mut self, axis: Axis, value: &str) -> bool {
        let Some(parsed) = parse_dimension(value) else {
            return false;
        };
        let normalized = parsed.to_string();
        *self.shared_mut(axis) = normalized.clone();
        self.last_edited = Some(axis);

        let Some(first_ratio) = self.images.first().map(TrackedImage::aspect_ratio) else {
            return true;
        };
        if self.aspect_locked {
            *self.shared_mut(axis.opposite()) = derive_dimension(axis, parsed, first_ratio).to_string();
        }

        let locked = self.aspect_locked;
        for image in &mut self.images {
            *image.target_mut(axis) = normalized.clone();
            if locked {
                // Each image keeps its own ratio; only the edited axis is shared.
                let derived = derive_dimension(axis, parsed, image.aspect_ratio());
                *image.target_mut(axis.opposite()) = derived.to_string();
            }
        }
        true
    }

    /// Edits one image. The raw text is kept as typed; the opposite axis
    /// follows only when locked and the text parses.
    pub fn set_individual_dimension(&mut self, id: ImageId, axis: Axis, value: &str) -> Result<(), CoreError> {
        let locked = self.aspect_locked;
        let image = self
            .images
            .iter_mut()
            .find(|image| image.id == id)
            .ok_or(CoreError::UnknownImage(id))?;
        *image.target_mut(axis) = value.to_string();
        if locked {
            if let Some(parsed) = parse_dimension(value) {
                let derived = derive_dimension(axis, parsed, image.aspect_ratio());
                *image.target_mut(axis.opposite()) = derived.to_string();
            }
        }
        Ok(())
    }

    /// Flips the lock without touching any target; returns the new state.
    pub fn toggle_aspect_lock(&mut self) -> bool {
        self.aspect_locked = !self.aspect_locked;
        self.aspect_locked
    }

    pub fn set_aspect_locked(&mut self, locked: bool) {
        self.aspect_locked = locked;
    }

    pub fn remove(&mut self, id: ImageId) -> Option<TrackedImage> {
        let index = self.images.iter().position(|image| image.id == id)?;
        let removed = self.images.remove(index);
        if self.images.is_empty() {
            self.reset_shared();
        }
        Some(removed)
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.images.len();
        self.images.clear();
        self.reset_shared();
        removed
    }

    fn reset_shared(&mut self) {
        self.shared_width.clear();
        self.shared_height.clear();
        self.last_edited = None;
    }

    fn shared_mut(&mut self, axis: Axis) -> &mut String {
        match axis {
            Axis::Width => &mut self.shared_width,
            Axis::Height => &mut self.shared_height,
        }
    }

    fn push_tracked(&mut self, image: DecodedImage, target_width: String, target_height: String) -> ImageId {
        let id = ImageId(self.next_id);
        self.next_id += 1;
        self.images.push(TrackedImage {
            id,
            source_bytes: image.bytes,
            original_name: image.name,
            native_width: image.width,
            native_height: image.height,
            target_width,
            target_height,
        });
        id
    }
}

fn validate_native_size(image: &DecodedImage) -> Result<(), CoreError> {
    if image.width == 0 || image.height == 0 {
        return Err(CoreError::InvalidNativeSize {
            width: image.width,
            height: image.height,
        });
    }
    Ok(())
}
