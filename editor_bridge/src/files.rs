//! File import and export.
//!
//! Imports dispatch on the file extension (`.yml`, `.yaml`, `.json`).
//! Exports are named `delivery-time-config-<variant>.<ext>`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use config_engine::{Config, DocumentKind, ParseError, SerializationEngine};
use log::info;
use thiserror::Error;

use crate::settings::DEFAULT_MAX_IMPORT_BYTES;

const EXPORT_PREFIX: &str = "delivery-time-config";

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Unsupported file type '{0}': expected .yml, .yaml or .json")]
    UnsupportedExtension(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is {size} bytes, above the {limit} byte import limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Encode(#[from] ParseError),
}

/// Text read from an import file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSource {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub text: String,
}

/// A generated export, not yet written anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub kind: DocumentKind,
    pub contents: String,
}

pub fn document_kind(path: &Path) -> Result<DocumentKind, FileError> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    DocumentKind::from_extension(extension).ok_or_else(|| FileError::UnsupportedExtension(extension.to_string()))
}

pub fn import_file(path: &Path) -> Result<ImportSource, FileError> {
    import_file_with_limit(path, DEFAULT_MAX_IMPORT_BYTES)
}

/// Reads an import file, refusing unsupported extensions and oversized files.
pub fn import_file_with_limit(path: &Path, max_bytes: u64) -> Result<ImportSource, FileError> {
    let kind = document_kind(path)?;

    let read_error = |source| FileError::Read {
        path: path.to_path_buf(),
        source,
    };
    let size = fs::metadata(path).map_err(read_error)?.len();
    if size > max_bytes {
        return Err(FileError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit: max_bytes,
        });
    }
    let text = fs::read_to_string(path).map_err(read_error)?;

    info!("Read {} import from {} ({} bytes)", kind, path.display(), size);
    Ok(ImportSource {
        path: path.to_path_buf(),
        kind,
        text,
    })
}

pub fn export_file_name(variant: &str, kind: DocumentKind) -> String {
    let variant: String = variant
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let variant = if variant.is_empty() { "default".to_string() } else { variant };
    format!("{}-{}.{}", EXPORT_PREFIX, variant, kind.extension())
}

/// Renders the config in the requested format.
pub fn export(config: &Config, kind: DocumentKind) -> Result<ExportArtifact, FileError> {
    let contents = match kind {
        DocumentKind::Yaml => SerializationEngine::generate(config),
        DocumentKind::Json => SerializationEngine::to_json(config)?,
    };
    Ok(ExportArtifact {
        file_name: export_file_name(&config.variant, kind),
        kind,
        contents,
    })
}

/// Writes an artifact into `dir` under its own file name.
pub fn write_artifact(dir: &Path, artifact: &ExportArtifact) -> Result<PathBuf, FileError> {
    let path = dir.join(&artifact.file_name);
    fs::write(&path, &artifact.contents).map_err(|source| FileError::Write {
        path: path.clone(),
        source,
    })?;
    info!("Exported {} to {}", artifact.kind, path.display());
    Ok(path)
}
