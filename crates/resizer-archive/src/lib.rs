use std::io::{Cursor, Write};

use resizer_core::{ArchiveEntry, CoreError, Packager};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Writes entries into an in-memory zip. Encoded images are already
/// compressed, so entries are stored as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipPackager;

impl Packager for ZipPackager {
    fn package(&self, entries: &[ArchiveEntry<'_>]) -> Result<Vec<u8>, CoreError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for entry in entries {
            writer.start_file(entry.name, options).map_err(packaging_error)?;
            writer.write_all(entry.bytes).map_err(packaging_error)?;
        }
        let cursor = writer.finish().map_err(packaging_error)?;
        Ok(cursor.into_inner())
    }
}

fn packaging_error(err: impl std::fmt::Display) -> CoreError {
    CoreError::Packaging(err.to_string())
}
