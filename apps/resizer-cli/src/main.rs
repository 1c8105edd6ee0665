use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use resizer_archive::ZipPackager;
use resizer_core::{
    resolve_export_config, Axis, CoreError, DeliverySink, ExportConfig, OutputFormat, Quality, ResizeSession, SourceFile,
    TelemetryEvent, TelemetryEventType, TelemetrySink,
};
use resizer_export::{output_file_name, Exporter};
use resizer_image::ImageCrateCodec;
use resizer_settings::{
    load_or_default, merge_settings, reset_settings, resolve_settings_paths, write_settings, SettingsUpdate,
};
use resizer_telemetry::sink_from_env;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "resizer", version, about = "Batch image resizing and re-encoding")]
struct Cli {
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    Resize(ResizeArgs),
    Settings(SettingsCommand),
}

#[derive(Args, Debug)]
struct SettingsCommand {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Subcommand, Debug)]
enum SettingsSubcommand {
    Show(CommonSettingsArgs),
    Set(SetSettingsArgs),
    Reset(CommonSettingsArgs),
}

#[derive(Args, Debug)]
struct CommonSettingsArgs {
    #[arg(long)]
    settings_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SetSettingsArgs {
    #[arg(long)]
    settings_dir: Option<PathBuf>,
    #[arg(long)]
    format: Option<String>,
    #[arg(long)]
    quality: Option<u8>,
    #[arg(long, action = clap::ArgAction::Set)]
    keep_aspect_ratio: Option<bool>,
    #[arg(long)]
    archive_name: Option<String>,
}

#[derive(Args, Debug)]
struct ResizeArgs {
    /// File, directory, or a regex matched against file names under --input-root.
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// Width applied to every image.
    #[arg(long, short = 'W')]
    width: Option<String>,
    /// Height applied to every image; applied after --width.
    #[arg(long, short = 'H')]
    height: Option<String>,
    #[arg(long, action = clap::ArgAction::Set)]
    keep_aspect_ratio: Option<bool>,
    #[arg(long, short = 'f')]
    format: Option<String>,
    #[arg(long, short = 'q')]
    quality: Option<u8>,
    /// Per-image width as INDEX=VALUE, INDEX being the 1-based position in the plan.
    #[arg(long = "image-width", value_name = "INDEX=VALUE")]
    image_widths: Vec<String>,
    /// Per-image height as INDEX=VALUE, INDEX being the 1-based position in the plan.
    #[arg(long = "image-height", value_name = "INDEX=VALUE")]
    image_heights: Vec<String>,
    /// Where the file or archive is written (defaults to current directory).
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    archive_name: Option<String>,
    #[arg(long)]
    settings_dir: Option<PathBuf>,
    /// Print the resolved plan without encoding anything.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        TopLevelCommand::Resize(args) => run_resize(args)?,
        TopLevelCommand::Settings(settings) => match settings.command {
            SettingsSubcommand::Show(args) => {
                let paths = resolve_settings_paths(args.settings_dir.as_deref())?;
                let settings = load_or_default(&paths)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "path": paths.settings_file,
                        "settings": settings,
                        "supportedFormats": OutputFormat::all(),
                    }))?
                );
            }
            SettingsSubcommand::Set(args) => {
                let update = SettingsUpdate {
                    format: args.format.as_deref().map(|v| v.parse::<OutputFormat>()).transpose()?,
                    quality: args.quality.map(Quality::new).transpose()?,
                    keep_aspect_ratio: args.keep_aspect_ratio,
                    archive_name: args.archive_name,
                };
                if update.is_empty() {
                    return Err(anyhow!(
                        "nothing to update; pass at least one of --format, --quality, --keep-aspect-ratio, --archive-name"
                    ));
                }
                let paths = resolve_settings_paths(args.settings_dir.as_deref())?;
                let merged = merge_settings(load_or_default(&paths)?, update);
                write_settings(&paths, &merged)?;
                println!("{}", serde_json::to_string_pretty(&merged)?);
            }
            SettingsSubcommand::Reset(args) => {
                let paths = resolve_settings_paths(args.settings_dir.as_deref())?;
                let removed = reset_settings(&paths)?;
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "removed": removed }))?);
            }
        },
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run_resize(args: ResizeArgs) -> Result<()> {
    let total_start = Instant::now();
    let settings_paths = resolve_settings_paths(args.settings_dir.as_deref())?;
    let settings = load_or_default(&settings_paths)
        .with_context(|| format!("reading settings from {}", settings_paths.settings_file.display()))?;
    if let Some(quality) = args.quality {
        Quality::new(quality)?;
    }
    let base = settings.to_export_config();
    let cfg = resolve_export_config(ExportConfig {
        format: args.format.clone().unwrap_or(base.format),
        quality: args.quality.unwrap_or(base.quality),
        keep_aspect_ratio: args.keep_aspect_ratio.unwrap_or(base.keep_aspect_ratio),
        archive_name: args.archive_name.clone().unwrap_or(base.archive_name),
    });
    let mut session = ResizeSession::new(cfg.into_options()?);

    let inputs = resolve_inputs(&args)?;
    if inputs.is_empty() {
        return Err(anyhow!("no input files matched"));
    }
    let read_start = Instant::now();
    let mut files = Vec::with_capacity(inputs.len());
    for path in &inputs {
        match std::fs::read(path) {
            Ok(bytes) => files.push(SourceFile {
                name: display_name(path),
                content_type: content_type_for_path(path).to_string(),
                bytes,
            }),
            Err(err) => warn!("failed to read {}: {}", path.display(), err),
        }
    }
    let read_done = Instant::now();

    let codec = ImageCrateCodec::default();
    let telemetry = sink_from_env();
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());
    let ingest = match session.ingest_files(&codec, files) {
        Ok(report) => {
            emit(
                telemetry_ref,
                &session,
                TelemetryEventType::IngestSuccess,
                Some(format!("added={},skipped={}", report.added.len(), report.skipped.len())),
            );
            report
        }
        Err(err) => {
            emit(telemetry_ref, &session, TelemetryEventType::IngestRejected, Some(err.to_string()));
            return Err(err.into());
        }
    };
    let ingest_done = Instant::now();

    if let Some(width) = args.width.as_deref() {
        if !session.set_shared_dimension(Axis::Width, width) {
            warn!("ignoring width '{}': not a number", width);
        }
    }
    if let Some(height) = args.height.as_deref() {
        if !session.set_shared_dimension(Axis::Height, height) {
            warn!("ignoring height '{}': not a number", height);
        }
    }
    for (axis, edits) in [(Axis::Width, &args.image_widths), (Axis::Height, &args.image_heights)] {
        for edit in edits {
            let (position, value) = parse_image_edit(edit)?;
            let id = session
                .images()
                .get(position - 1)
                .map(|image| image.id())
                .ok_or_else(|| anyhow!("image index {} is out of range (1..={})", position, session.len()))?;
            session.set_individual_dimension(id, axis, value)?;
        }
    }

    let plan: Vec<serde_json::Value> = session
        .images()
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let size = image.effective_size();
            serde_json::json!({
                "index": index + 1,
                "input": image.original_name(),
                "nativeWidth": image.native_width(),
                "nativeHeight": image.native_height(),
                "targetWidth": image.target_width(),
                "targetHeight": image.target_height(),
                "outputWidth": size.width,
                "outputHeight": size.height,
                "output": output_file_name(image.original_name(), size.width, size.height, session.format()),
            })
        })
        .collect();

    let summary = serde_json::json!({
        "format": session.format(),
        "quality": session.quality(),
        "aspectLocked": session.is_aspect_locked(),
        "sharedWidth": session.shared_width(),
        "sharedHeight": session.shared_height(),
        "lastEditedAxis": session.last_edited_axis(),
    });

    if args.dry_run {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "dryRun": true,
                "session": summary,
                "images": plan,
                "skipped": ingest.skipped,
            }))?
        );
        return Ok(());
    }

    let output_dir = match args.output_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let delivery = DirectoryDelivery::new(output_dir);
    let packager = ZipPackager;
    let export_start = Instant::now();
    let exporter = Exporter::new(&codec, &packager, &delivery).with_telemetry(telemetry_ref);
    let receipt = exporter.export(&session).context("processing error")?;
    let done = Instant::now();

    let timings = if args.profile {
        Some(serde_json::json!({
            "readInputs": read_done.duration_since(read_start).as_millis(),
            "ingest": ingest_done.duration_since(read_done).as_millis(),
            "export": done.duration_since(export_start).as_millis(),
            "total": done.duration_since(total_start).as_millis(),
        }))
    } else {
        None
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "session": summary,
            "images": plan,
            "skipped": ingest.skipped,
            "delivery": receipt,
            "outputPath": delivery.written().last(),
            "timingsMs": timings,
        }))?
    );
    Ok(())
}

fn emit(telemetry: Option<&dyn TelemetrySink>, session: &ResizeSession, event_type: TelemetryEventType, detail: Option<String>) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type,
            format: session.format(),
            image_count: session.len(),
            duration_ms: None,
            detail,
        });
    }
}

/// Writes delivered files into one directory, keeping only the file name part.
struct DirectoryDelivery {
    dir: PathBuf,
    written: RefCell<Vec<PathBuf>>,
}

impl DirectoryDelivery {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            written: RefCell::new(Vec::new()),
        }
    }

    fn written(&self) -> Vec<PathBuf> {
        self.written.borrow().clone()
    }
}

impl DeliverySink for DirectoryDelivery {
    fn deliver(&self, file_name: &str, _mime_type: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| CoreError::Delivery(format!("invalid output file name '{}'", file_name)))?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| CoreError::Delivery(format!("creating {}: {}", self.dir.display(), err)))?;
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).map_err(|err| CoreError::Delivery(format!("writing {}: {}", path.display(), err)))?;
        self.written.borrow_mut().push(path);
        Ok(())
    }
}

fn parse_image_edit(raw: &str) -> Result<(usize, &str)> {
    let (index, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected INDEX=VALUE, got '{}'", raw))?;
    let index: usize = index
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid image index '{}' in '{}'", index, raw))?;
    if index == 0 {
        return Err(anyhow!("image indexes start at 1 (got '{}')", raw));
    }
    Ok((index, value))
}

fn resolve_inputs(args: &ResizeArgs) -> Result<Vec<PathBuf>> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return collect_files(&candidate, args.recursive, None);
        }
        return Ok(vec![candidate]);
    }
    // Treat as regex matching file name under input_root.
    let root = match args.input_root.clone() {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let re = Regex::new(&args.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    collect_files(&root, args.recursive, Some(&re))
}

fn collect_files(root: &Path, recursive: bool, name_filter: Option<&Regex>) -> Result<Vec<PathBuf>> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    let mut out = Vec::new();
    for entry in walker.into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.into_path();
        if let Some(re) = name_filter {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !re.is_match(name) {
                continue;
            }
        }
        out.push(p);
    }
    out.sort();
    Ok(out)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Content-type tag for the ingestion boundary, guessed from the extension.
fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}
