//! Documents and their metadata

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identifier of an indexed document
pub type DocId = u32;

/// Per-document metadata kept alongside the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMetadata {
    /// Inactive documents are excluded from search (soft delete)
    pub active: bool,
    /// Original upload file name
    pub name: String,
}

impl DocMetadata {
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            active: true,
            name: name.into(),
        }
    }
}

/// Restricts search results by document metadata. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub active: Option<bool>,
    pub name: Option<String>,
}

impl MetadataFilter {
    pub fn active_only() -> Self {
        Self {
            active: Some(true),
            name: None,
        }
    }

    pub fn matches(&self, metadata: &DocMetadata) -> bool {
        self.active.map_or(true, |active| metadata.active == active)
            && self
                .name
                .as_deref()
                .map_or(true, |name| metadata.name == name)
    }
}

/// Next free document id: one past the largest, or 0 for an empty collection
pub fn next_doc_id<V>(docs: &BTreeMap<DocId, V>) -> DocId {
    docs.keys().next_back().map_or(0, |max| max + 1)
}

/// The document itself cannot be indexed, as opposed to an I/O or encoder
/// service failure
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Unsupported document type for '{name}': {mime}")]
    Unsupported { name: String, mime: String },

    #[error("Could not read '{name}': {reason}")]
    Unreadable { name: String, reason: String },

    #[error("'{name}' has no indexable pages")]
    Empty { name: String },
}

/// Supported upload types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    /// Image with its MIME type (e.g. `image/png`)
    Image(String),
}

/// A document on disk waiting to be indexed
#[derive(Debug, Clone)]
pub struct Document {
    /// Display name, usually the uploaded file name
    pub name: String,
    /// Where the bytes live (may be a temp file with an unrelated name)
    pub path: PathBuf,
}

impl Document {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Detect the document type from its display name
    pub fn kind(&self) -> Result<DocumentKind> {
        let mime = mime_guess::from_path(Path::new(&self.name)).first_or_octet_stream();
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("application", "pdf") => Ok(DocumentKind::Pdf),
            ("image", _) => Ok(DocumentKind::Image(mime.essence_str().to_string())),
            _ => Err(DocumentError::Unsupported {
                name: self.name.clone(),
                mime: mime.essence_str().to_string(),
            }
            .into()),
        }
    }

    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path)
            .with_context(|| format!("Failed to read document: {}", self.path.display()))
    }
}
