use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use resizer_core::{TelemetryEvent, TelemetrySink};
use serde::Serialize;
use tracing::debug;

pub const SINK_ENV: &str = "RESIZER_TELEMETRY_SINK";
pub const FILE_ENV: &str = "RESIZER_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "RESIZER_TELEMETRY_ENDPOINT";

const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    sink_from_lookup(|key| std::env::var(key).ok())
}

/// Same selection as [`sink_from_env`], reading variables through `lookup`.
/// An unknown mode or a missing file/endpoint disables telemetry.
pub fn sink_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Box<dyn TelemetrySink>> {
    let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mode = non_blank(SINK_ENV)?.trim().to_ascii_lowercase();
    let sink: Box<dyn TelemetrySink> = match mode.as_str() {
        "console" | "stderr" | "stdout" => Box::new(ConsoleSink),
        "file" => Box::new(FileSink::new(PathBuf::from(non_blank(FILE_ENV)?))),
        "http" => Box::new(HttpSink::new(non_blank(ENDPOINT_ENV)?)),
        other => {
            debug!("unknown telemetry sink '{}', telemetry disabled", other);
            return None;
        }
    };
    Some(sink)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'e> {
    source: &'static str,
    emitted_at_ms: u64,
    event_type: String,
    format: &'static str,
    image_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'e str>,
}

impl<'e> Envelope<'e> {
    fn wrap(event: &'e TelemetryEvent) -> Self {
        let emitted_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            source: "resizer",
            emitted_at_ms,
            event_type: format!("{:?}", event.event_type),
            format: event.format.extension(),
            image_count: event.image_count,
            duration_ms: event.duration_ms,
            detail: event.detail.as_deref(),
        }
    }
}

fn json_line(event: &TelemetryEvent) -> Option<String> {
    serde_json::to_string(&Envelope::wrap(event)).ok()
}

/// One JSON line per event on stderr; stdout carries the CLI report.
pub struct ConsoleSink;

impl TelemetrySink for ConsoleSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = json_line(&event) {
            eprintln!("{}", line);
        }
    }
}

/// Appends JSON lines to a file opened on first use and kept for later events.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut slot = self.file.lock().map_err(|_| anyhow!("telemetry file lock poisoned"))?;
        if slot.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening {}", self.path.display()))?;
            *slot = Some(opened);
        }
        if let Some(file) = slot.as_mut() {
            writeln!(file, "{}", line).context("appending telemetry line")?;
        }
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        let Some(line) = json_line(&event) else {
            return;
        };
        if let Err(err) = self.append(&line) {
            debug!("telemetry file sink dropped an event: {:#}", err);
        }
    }
}

/// Posts each event as JSON; failures are logged at debug level and dropped.
pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { endpoint, client }
    }

    fn post(&self, event: &TelemetryEvent) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&Envelope::wrap(event))
            .send()
            .context("sending telemetry event")?
            .error_for_status()
            .context("telemetry endpoint rejected event")?;
        Ok(())
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Err(err) = self.post(&event) {
            debug!("telemetry http sink dropped an event: {:#}", err);
        }
    }
}
