//! Reading author-declared plugin metadata without instantiating anything
//!
//! Source plugins carry `Key: value` tags in their leading comment block:
//!
//! ```text
//! ;; Name: Contour Lines
//! ;; Description: Draws contour lines over the active grid
//! ;; Version: 1.2
//! ;; References: geo.wasm, mathlib
//! ;; AutoLoad: true
//! ```
//!
//! Precompiled modules may ship the same fields as JSON in `<stem>.plugin.json`.

use crate::compiler::is_precompiled_extension;
use plugrt_api::PluginMetadata;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading a plugin's declared metadata
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid metadata in {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

const COMMENT_CHARS: &[char] = &[';', '/', '#', '-', '*', '!'];

/// Sidecar metadata path for a precompiled module
pub fn sidecar_path(module_path: &Path) -> PathBuf {
    let stem = module_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    module_path.with_file_name(format!("{}.plugin.json", stem))
}

/// Parse the tags of a source file's leading comment block
pub fn parse_header(source: &str) -> PluginMetadata {
    let mut meta = PluginMetadata::default();

    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with(COMMENT_CHARS) {
            break;
        }
        let body = line.trim_start_matches(COMMENT_CHARS).trim();
        let Some((key, value)) = body.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_ascii_lowercase().as_str() {
            "name" => meta.name = Some(value.to_string()),
            "description" => meta.description = Some(value.to_string()),
            "version" => meta.version = Some(value.to_string()),
            "references" => meta.references = split_references(value),
            "autoload" | "auto_load" | "auto-load" => meta.auto_load = parse_flag(value),
            _ => {}
        }
    }

    meta
}

/// Split a comma-separated reference list, dropping empty tokens
pub fn split_references(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

/// Read the metadata declared for the plugin file at `path`
///
/// Precompiled modules without a sidecar get default metadata.
pub fn read_metadata(path: &Path, extension: &str) -> Result<PluginMetadata, MetadataError> {
    if is_precompiled_extension(extension) {
        let sidecar = sidecar_path(path);
        if !sidecar.is_file() {
            return Ok(PluginMetadata::default());
        }
        let text = std::fs::read_to_string(&sidecar).map_err(|source| MetadataError::Read {
            path: sidecar.clone(),
            source,
        })?;
        return serde_json::from_str(&text).map_err(|source| MetadataError::Sidecar {
            path: sidecar,
            source,
        });
    }

    let source = std::fs::read(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_header(&String::from_utf8_lossy(&source)))
}
