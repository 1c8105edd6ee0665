use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use resizer_core::{ExportConfig, OutputFormat, Quality, DEFAULT_ARCHIVE_NAME};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SETTINGS_FILE_NAME: &str = "resizer-settings.json";
pub const SCHEMA_VERSION: u32 = 1;

/// Export defaults persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(alias = "schema_version")]
    pub schema_version: u32,
    pub format: OutputFormat,
    pub quality: Quality,
    #[serde(alias = "keep_aspect_ratio")]
    pub keep_aspect_ratio: bool,
    #[serde(alias = "archive_name")]
    pub archive_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            format: OutputFormat::Jpeg,
            quality: Quality::DEFAULT,
            keep_aspect_ratio: true,
            archive_name: DEFAULT_ARCHIVE_NAME.to_string(),
        }
    }
}

impl Settings {
    pub fn to_export_config(&self) -> ExportConfig {
        ExportConfig {
            format: self.format.extension().to_string(),
            quality: self.quality.get(),
            keep_aspect_ratio: self.keep_aspect_ratio,
            archive_name: self.archive_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub format: Option<OutputFormat>,
    pub quality: Option<Quality>,
    pub keep_aspect_ratio: Option<bool>,
    pub archive_name: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.format.is_none() && self.quality.is_none() && self.keep_aspect_ratio.is_none() && self.archive_name.is_none()
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine a default settings directory")]
    NoDefaultSettingsDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SettingsPaths {
    pub root: PathBuf,
    pub settings_file: PathBuf,
}

pub fn default_settings_dir() -> Result<PathBuf, SettingsError> {
    let home = dirs::home_dir().ok_or(SettingsError::NoDefaultSettingsDir)?;
    Ok(home.join(".resizer").join("settings"))
}

pub fn resolve_settings_paths(settings_dir: Option<&Path>) -> Result<SettingsPaths, SettingsError> {
    let root = if let Some(dir) = settings_dir {
        dir.to_path_buf()
    } else {
        default_settings_dir()?
    };

    Ok(SettingsPaths {
        settings_file: root.join(SETTINGS_FILE_NAME),
        root,
    })
}

pub fn read_settings(paths: &SettingsPaths) -> Result<Settings, SettingsError> {
    let data = fs::read(&paths.settings_file)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_settings(paths: &SettingsPaths, settings: &Settings) -> Result<(), SettingsError> {
    fs::create_dir_all(&paths.root)?;
    let data = serde_json::to_vec_pretty(settings)?;
    fs::write(&paths.settings_file, data)?;
    Ok(())
}

/// A missing file means built-in defaults; a corrupt one is still an error.
pub fn load_or_default(paths: &SettingsPaths) -> Result<Settings, SettingsError> {
    match read_settings(paths) {
        Ok(settings) => Ok(settings),
        Err(SettingsError::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(Settings::default()),
        Err(err) => Err(err),
    }
}

pub fn merge_settings(existing: Settings, update: SettingsUpdate) -> Settings {
    Settings {
        schema_version: SCHEMA_VERSION,
        format: update.format.unwrap_or(existing.format),
        quality: update.quality.unwrap_or(existing.quality),
        keep_aspect_ratio: update.keep_aspect_ratio.unwrap_or(existing.keep_aspect_ratio),
        archive_name: update
            .archive_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(existing.archive_name),
    }
}

pub fn reset_settings(paths: &SettingsPaths) -> Result<bool, SettingsError> {
    match fs::remove_file(&paths.settings_file) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = resolve_settings_paths(Some(dir.path())).expect("paths");
        assert_eq!(load_or_default(&paths).expect("defaults"), Settings::default());
    }

    #[test]
    fn written_settings_read_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = resolve_settings_paths(Some(&dir.path().join("nested"))).expect("paths");
        let settings = merge_settings(
            Settings::default(),
            SettingsUpdate {
                format: Some(OutputFormat::Webp),
                quality: Some(Quality::new(55).expect("quality")),
                keep_aspect_ratio: Some(false),
                archive_name: Some("batch.zip".to_string()),
            },
        );
        write_settings(&paths, &settings).expect("write");
        let loaded = read_settings(&paths).expect("read");
        assert_eq!(loaded, settings);
        assert_eq!(loaded.to_export_config().format, "webp");
        assert!(reset_settings(&paths).expect("reset"));
        assert!(!reset_settings(&paths).expect("already gone"));
    }

    #[test]
    fn out_of_range_quality_is_rejected_on_read() {
        let dir = tempfile::tempdir().expect("temp dir");
        let paths = resolve_settings_paths(Some(dir.path())).expect("paths");
        fs::write(
            &paths.settings_file,
            r#"{"schemaVersion":1,"format":"png","quality":0,"keepAspectRatio":true,"archiveName":"x.zip"}"#,
        )
        .expect("write raw");
        assert!(matches!(load_or_default(&paths), Err(SettingsError::Json(_))));
    }

    #[test]
    fn merge_keeps_existing_values_for_blank_update() {
        let existing = Settings {
            archive_name: "keep.zip".to_string(),
            ..Settings::default()
        };
        let update = SettingsUpdate {
            archive_name: Some("  ".to_string()),
            ..SettingsUpdate::default()
        };
        assert!(!update.is_empty());
        let merged = merge_settings(existing.clone(), update);
        assert_eq!(merged, existing);
    }
}
