use std::cell::Cell;
use std::collections::HashSet;
use std::time::Instant;

use resizer_core::{
    ArchiveEntry, CoreError, DeliverySink, ImageCodec, OutputFormat, Packager, Quality, ResizeSession, TelemetryEvent,
    TelemetryEventType, TelemetrySink, TrackedImage,
};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const ARCHIVE_MIME_TYPE: &str = "application/zip";

#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// One file handed back directly, or several bundled into one archive.
#[derive(Debug, Clone)]
pub enum DeliveryPlan {
    Single(EncodedOutput),
    Archive { name: String, entries: Vec<EncodedOutput> },
}

impl DeliveryPlan {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Single(output) => &output.name,
            Self::Archive { name, .. } => name,
        }
    }

    pub fn entries(&self) -> &[EncodedOutput] {
        match self {
            Self::Single(output) => std::slice::from_ref(output),
            Self::Archive { entries, .. } => entries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredEntry {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: usize,
    pub archived: bool,
    pub entries: Vec<DeliveredEntry>,
}

/// Everything before the last `.`; a name without one has an empty stem.
pub fn file_stem(original_name: &str) -> &str {
    match original_name.rfind('.') {
        Some(index) => &original_name[..index],
        None => "",
    }
}

pub fn output_file_name(original_name: &str, width: u32, height: u32, format: OutputFormat) -> String {
    format!("{}_{}x{}.{}", file_stem(original_name), width, height, format.extension())
}

pub fn render_one(
    codec: &dyn ImageCodec,
    image: &TrackedImage,
    format: OutputFormat,
    quality: Quality,
) -> Result<EncodedOutput, CoreError> {
    let size = image.effective_size();
    let raster = codec.rasterize(image.source_bytes(), size.width, size.height)?;
    let bytes = codec.encode(&raster, format, format.codec_quality(quality))?;
    debug!(
        "rendered {} at {}x{} as {} ({} bytes)",
        image.original_name(),
        size.width,
        size.height,
        format,
        bytes.len()
    );
    Ok(EncodedOutput {
        name: output_file_name(image.original_name(), size.width, size.height, format),
        bytes,
        mime_type: format.mime_type(),
        width: size.width,
        height: size.height,
    })
}

/// Renders every image in order, one at a time. The first failure aborts the
/// batch and everything rendered so far is dropped.
pub fn render_batch(
    codec: &dyn ImageCodec,
    images: &[TrackedImage],
    format: OutputFormat,
    quality: Quality,
    archive_name: &str,
) -> Result<DeliveryPlan, CoreError> {
    if images.is_empty() {
        return Err(CoreError::NoImagesToExport);
    }
    let mut outputs = Vec::with_capacity(images.len());
    for image in images {
        outputs.push(render_one(codec, image, format, quality)?);
    }
    if outputs.len() == 1 {
        if let Some(single) = outputs.pop() {
            return Ok(DeliveryPlan::Single(single));
        }
    }
    disambiguate_names(&mut outputs);
    Ok(DeliveryPlan::Archive {
        name: archive_name.to_string(),
        entries: outputs,
    })
}

/// Same source name and size would collide inside the archive; later ones get `-2`, `-3`, ...
fn disambiguate_names(outputs: &mut [EncodedOutput]) {
    let mut taken = HashSet::new();
    for output in outputs.iter_mut() {
        if taken.insert(output.name.clone()) {
            continue;
        }
        let (stem, ext) = match output.name.rfind('.') {
            Some(index) => (output.name[..index].to_string(), output.name[index..].to_string()),
            None => (output.name.clone(), String::new()),
        };
        let mut counter = 2;
        loop {
            let candidate = format!("{}-{}{}", stem, counter, ext);
            if taken.insert(candidate.clone()) {
                output.name = candidate;
                break;
            }
            counter += 1;
        }
    }
}

pub fn deliver(plan: &DeliveryPlan, packager: &dyn Packager, sink: &dyn DeliverySink) -> Result<DeliveryReceipt, CoreError> {
    let entries = plan
        .entries()
        .iter()
        .map(|output| DeliveredEntry {
            name: output.name.clone(),
            width: output.width,
            height: output.height,
            bytes: output.bytes.len(),
        })
        .collect();
    match plan {
        DeliveryPlan::Single(output) => {
            sink.deliver(&output.name, output.mime_type, &output.bytes)?;
            Ok(DeliveryReceipt {
                file_name: output.name.clone(),
                mime_type: output.mime_type.to_string(),
                bytes: output.bytes.len(),
                archived: false,
                entries,
            })
        }
        DeliveryPlan::Archive { name, entries: outputs } => {
            let archive_entries: Vec<ArchiveEntry<'_>> = outputs
                .iter()
                .map(|output| ArchiveEntry {
                    name: &output.name,
                    bytes: &output.bytes,
                })
                .collect();
            let archive = packager.package(&archive_entries)?;
            sink.deliver(name, ARCHIVE_MIME_TYPE, &archive)?;
            Ok(DeliveryReceipt {
                file_name: name.clone(),
                mime_type: ARCHIVE_MIME_TYPE.to_string(),
                bytes: archive.len(),
                archived: true,
                entries,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportState {
    Idle,
    Processing,
    Delivered,
    Failed,
}

/// Holds the export slot while processing; dropping it always returns the
/// exporter to `Idle`.
pub struct ExportGuard<'e> {
    state: &'e Cell<ExportState>,
    last_outcome: &'e Cell<Option<ExportState>>,
    outcome: Option<ExportState>,
}

impl ExportGuard<'_> {
    fn finish(mut self, outcome: ExportState) {
        self.outcome = Some(outcome);
    }
}

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(ExportState::Failed);
        self.state.set(outcome);
        self.last_outcome.set(Some(outcome));
        self.state.set(ExportState::Idle);
    }
}

pub struct Exporter<'a> {
    codec: &'a dyn ImageCodec,
    packager: &'a dyn Packager,
    delivery: &'a dyn DeliverySink,
    telemetry: Option<&'a dyn TelemetrySink>,
    state: Cell<ExportState>,
    last_outcome: Cell<Option<ExportState>>,
}

impl<'a> Exporter<'a> {
    pub fn new(codec: &'a dyn ImageCodec, packager: &'a dyn Packager, delivery: &'a dyn DeliverySink) -> Self {
        Self {
            codec,
            packager,
            delivery,
            telemetry: None,
            state: Cell::new(ExportState::Idle),
            last_outcome: Cell::new(None),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Option<&'a dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn state(&self) -> ExportState {
        self.state.get()
    }

    /// `Delivered` or `Failed` for the most recent export that got past `Idle`.
    pub fn last_outcome(&self) -> Option<ExportState> {
        self.last_outcome.get()
    }

    pub fn begin(&self) -> Result<ExportGuard<'_>, CoreError> {
        if self.state.get() != ExportState::Idle {
            return Err(CoreError::ExportInProgress);
        }
        self.state.set(ExportState::Processing);
        Ok(ExportGuard {
            state: &self.state,
            last_outcome: &self.last_outcome,
            outcome: None,
        })
    }

    /// Renders and delivers the whole session. All-or-nothing: on any failure
    /// nothing is delivered and the session is left as it was.
    pub fn export(&self, session: &ResizeSession) -> Result<DeliveryReceipt, CoreError> {
        if session.is_empty() {
            return Err(CoreError::NoImagesToExport);
        }
        let guard = self.begin()?;
        let start = Instant::now();
        self.emit(session, TelemetryEventType::ExportStart, None, None);

        let result = render_batch(
            self.codec,
            session.images(),
            session.format(),
            session.quality(),
            session.archive_name(),
        )
        .and_then(|plan| deliver(&plan, self.packager, self.delivery));
        let elapsed = Some(start.elapsed().as_millis() as u64);

        match &result {
            Ok(receipt) => {
                guard.finish(ExportState::Delivered);
                info!("delivered {} ({} bytes)", receipt.file_name, receipt.bytes);
                self.emit(
                    session,
                    TelemetryEventType::ExportSuccess,
                    elapsed,
                    Some(format!("file={},archived={}", receipt.file_name, receipt.archived)),
                );
            }
            Err(err) => {
                guard.finish(ExportState::Failed);
                warn!("export failed: {}", err);
                self.emit(session, TelemetryEventType::ExportError, elapsed, Some(err.to_string()));
            }
        }
        result
    }

    fn emit(&self, session: &ResizeSession, event_type: TelemetryEventType, duration_ms: Option<u64>, detail: Option<String>) {
        if let Some(sink) = self.telemetry {
            sink.emit(TelemetryEvent {
                event_type,
                format: session.format(),
                image_count: session.len(),
                duration_ms,
                detail,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Mutex;

    use resizer_core::{Axis, DecodedImage, ImageSize, Raster};

    #[derive(Default)]
    struct StubCodec {
        fail_on_call: Option<usize>,
        calls: RefCell<Vec<(u32, u32)>>,
        qualities: RefCell<Vec<Option<f32>>>,
    }

    impl ImageCodec for StubCodec {
        fn probe(&self, _bytes: &[u8]) -> Result<ImageSize, CoreError> {
            Ok(ImageSize { width: 1, height: 1 })
        }

        fn rasterize(&self, _bytes: &[u8], width: u32, height: u32) -> Result<Raster, CoreError> {
            let mut calls = self.calls.borrow_mut();
            calls.push((width, height));
            if self.fail_on_call == Some(calls.len()) {
                return Err(CoreError::Codec("decode failed".to_string()));
            }
            Raster::new(width, height, vec![0; (width * height * 4) as usize])
        }

        fn encode(&self, raster: &Raster, format: OutputFormat, quality: Option<f32>) -> Result<Vec<u8>, CoreError> {
            self.qualities.borrow_mut().push(quality);
            Ok(format!("{}:{}x{}", format, raster.width(), raster.height()).into_bytes())
        }
    }

    #[derive(Default)]
    struct RecordingPackager {
        packaged: RefCell<Vec<Vec<String>>>,
        fail: bool,
    }

    impl Packager for RecordingPackager {
        fn package(&self, entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>, CoreError> {
            if self.fail {
                return Err(CoreError::Packaging("disk full".to_string()));
            }
            let names: Vec<String> = entries.iter().map(|entry| entry.name.to_string()).collect();
            self.packaged.borrow_mut().push(names);
            Ok(b"archive".to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: RefCell<Vec<(String, String, Vec<u8>)>>,
    }

    impl DeliverySink for RecordingSink {
        fn deliver(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<(), CoreError> {
            self.delivered
                .borrow_mut()
                .push((file_name.to_string(), mime_type.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl TelemetrySink for RecordingTelemetry {
        fn emit(&self, event: TelemetryEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }

    fn session_with(images: &[(&str, u32, u32)]) -> ResizeSession {
        let mut session = ResizeSession::default();
        session
            .ingest_batch(
                images
                    .iter()
                    .map(|(name, width, height)| DecodedImage {
                        name: name.to_string(),
                        bytes: vec![1],
                        width: *width,
                        height: *height,
                    })
                    .collect(),
            )
            .expect("valid images");
        session
    }

    #[test]
    fn output_names_use_stem_and_effective_size() {
        assert_eq!(output_file_name("photo.png", 800, 600, OutputFormat::Jpeg), "photo_800x600.jpeg");
        assert_eq!(output_file_name("archive.tar.gz", 1, 2, OutputFormat::Png), "archive.tar_1x2.png");
        assert_eq!(output_file_name("noext", 3, 4, OutputFormat::Webp), "_3x4.webp");
    }

    #[test]
    fn single_image_is_delivered_directly() {
        let mut session = session_with(&[("photo.png", 1600, 1200)]);
        let id = session.images()[0].id();
        session.set_individual_dimension(id, Axis::Width, "800").expect("known image");
        assert_eq!(session.images()[0].target_height(), "600");

        let codec = StubCodec::default();
        let packager = RecordingPackager::default();
        let sink = RecordingSink::default();
        let exporter = Exporter::new(&codec, &packager, &sink);
        let receipt = exporter.export(&session).expect("export");

        assert_eq!(receipt.file_name, "photo_800x600.jpeg");
        assert!(!receipt.archived);
        let delivered = sink.delivered.borrow();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "photo_800x600.jpeg");
        assert_eq!(delivered[0].1, "image/jpeg");
        assert_eq!(delivered[0].2, b"jpeg:800x600".to_vec());
        assert_eq!(*codec.qualities.borrow(), vec![Some(0.8)]);
        assert!(packager.packaged.borrow().is_empty());
        assert_eq!(exporter.last_outcome(), Some(ExportState::Delivered));
        assert_eq!(exporter.state(), ExportState::Idle);
    }

    #[test]
    fn png_export_omits_quality() {
        let mut session = session_with(&[("a.jpg", 10, 10)]);
        session.set_format(OutputFormat::Png);
        let codec = StubCodec::default();
        let sink = RecordingSink::default();
        Exporter::new(&codec, &RecordingPackager::default(), &sink)
            .export(&session)
            .expect("export");
        assert_eq!(*codec.qualities.borrow(), vec![None]);
        assert_eq!(sink.delivered.borrow()[0].0, "a_10x10.png");
    }

    #[test]
    fn several_images_are_packaged_into_one_archive() {
        let mut session = session_with(&[("a.png", 1000, 500), ("b.png", 400, 400), ("c.png", 900, 300)]);
        session.set_shared_dimension(Axis::Width, "500");

        let codec = StubCodec::default();
        let packager = RecordingPackager::default();
        let sink = RecordingSink::default();
        let receipt = Exporter::new(&codec, &packager, &sink).export(&session).expect("export");

        assert_eq!(*codec.calls.borrow(), vec![(500, 250), (500, 500), (500, 167)]);
        assert_eq!(
            packager.packaged.borrow()[0],
            vec!["a_500x250.jpeg", "b_500x500.jpeg", "c_500x167.jpeg"]
        );
        let delivered = sink.delivered.borrow();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, resizer_core::DEFAULT_ARCHIVE_NAME);
        assert_eq!(delivered[0].1, ARCHIVE_MIME_TYPE);
        assert!(receipt.archived);
        assert_eq!(receipt.entries.len(), 3);
    }

    #[test]
    fn codec_failure_mid_batch_delivers_nothing() {
        let session = session_with(&[("a.png", 10, 10), ("b.png", 20, 20), ("c.png", 30, 30)]);
        let codec = StubCodec {
            fail_on_call: Some(2),
            ..StubCodec::default()
        };
        let packager = RecordingPackager::default();
        let sink = RecordingSink::default();
        let telemetry = RecordingTelemetry::default();
        let exporter = Exporter::new(&codec, &packager, &sink).with_telemetry(Some(&telemetry));

        let err = exporter.export(&session).expect_err("second image fails");
        assert!(err.as_error_info().is_processing_error());
        assert_eq!(codec.calls.borrow().len(), 2);
        assert!(packager.packaged.borrow().is_empty());
        assert!(sink.delivered.borrow().is_empty());
        assert_eq!(exporter.last_outcome(), Some(ExportState::Failed));
        assert_eq!(exporter.state(), ExportState::Idle);
        assert_eq!(session.len(), 3);

        let events = telemetry.events.lock().expect("events");
        let errors = events
            .iter()
            .filter(|event| matches!(event.event_type, TelemetryEventType::ExportError))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn packaging_failure_delivers_nothing() {
        let session = session_with(&[("a.png", 10, 10), ("b.png", 20, 20)]);
        let packager = RecordingPackager {
            fail: true,
            ..RecordingPackager::default()
        };
        let sink = RecordingSink::default();
        let err = Exporter::new(&StubCodec::default(), &packager, &sink)
            .export(&session)
            .expect_err("packager fails");
        assert!(matches!(err, CoreError::Packaging(_)));
        assert!(sink.delivered.borrow().is_empty());
    }

    #[test]
    fn empty_session_never_enters_processing() {
        let session = ResizeSession::default();
        let codec = StubCodec::default();
        let packager = RecordingPackager::default();
        let sink = RecordingSink::default();
        let exporter = Exporter::new(&codec, &packager, &sink);
        let err = exporter.export(&session).expect_err("nothing to export");
        assert!(matches!(err, CoreError::NoImagesToExport));
        assert_eq!(exporter.last_outcome(), None);
        assert!(sink.delivered.borrow().is_empty());
    }

    #[test]
    fn export_is_refused_while_processing() {
        let session = session_with(&[("a.png", 10, 10)]);
        let codec = StubCodec::default();
        let packager = RecordingPackager::default();
        let sink = RecordingSink::default();
        let exporter = Exporter::new(&codec, &packager, &sink);

        let guard = exporter.begin().expect("idle exporter");
        assert_eq!(exporter.state(), ExportState::Processing);
        assert!(matches!(exporter.export(&session), Err(CoreError::ExportInProgress)));
        drop(guard);

        assert_eq!(exporter.state(), ExportState::Idle);
        assert!(exporter.export(&session).is_ok());
    }

    #[test]
    fn colliding_archive_names_are_disambiguated() {
        let session = session_with(&[("same.png", 10, 10), ("same.png", 10, 10), ("same.png", 10, 10)]);
        let plan = render_batch(
            &StubCodec::default(),
            session.images(),
            OutputFormat::Png,
            Quality::DEFAULT,
            "out.zip",
        )
        .expect("render");
        let names: Vec<&str> = plan.entries().iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["same_10x10.png", "same_10x10-2.png", "same_10x10-3.png"]);
        assert_eq!(plan.file_name(), "out.zip");
    }

    #[test]
    fn invalid_targets_fall_back_to_native_size() {
        let mut session = session_with(&[("a.png", 64, 32)]);
        session.set_aspect_locked(false);
        let id = session.images()[0].id();
        session.set_individual_dimension(id, Axis::Width, "").expect("known image");
        session.set_individual_dimension(id, Axis::Height, "-3").expect("known image");
        let output = render_one(&StubCodec::default(), &session.images()[0], OutputFormat::Webp, Quality::DEFAULT)
            .expect("render");
        assert_eq!((output.width, output.height), (64, 32));
        assert_eq!(output.name, "a_64x32.webp");
    }
}
