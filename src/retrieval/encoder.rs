//! Page encoders
//!
//! A [`PageEncoder`] turns a document into pages with embeddings, and a query
//! into an embedding in the same space. [`HashPageEncoder`] is a self-contained
//! token-hashing encoder; [`super::HttpPageEncoder`] delegates to an external
//! multimodal retrieval model.

use super::document::{Document, DocumentError, DocumentKind};
use anyhow::Result;
use base64::Engine;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::debug;

/// Rendered page image, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub mime: String,
    pub base64: String,
}

impl PageImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// One encoded page of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedPage {
    /// 1-based page number within the document
    pub page_num: u32,
    pub image: Option<PageImage>,
    pub text: Option<String>,
    pub embedding: Vec<f32>,
}

/// Encodes documents and queries into a shared embedding space.
///
/// Calls are blocking and may be slow; callers run them off the async runtime.
pub trait PageEncoder: Send + Sync {
    fn encode_document(&self, document: &Document, device: &str) -> Result<Vec<EncodedPage>>;

    fn encode_query(&self, query: &str, device: &str) -> Result<Vec<f32>>;

    fn embedding_dim(&self) -> usize;

    fn name(&self) -> &str;
}

const HASH_EMBEDDING_DIM: usize = 128;

/// Token-hashing encoder that needs no model files.
///
/// Text is tokenized, each token hashed into one of 128 buckets, and the
/// frequency vector L2-normalized. Images become a single page embedded from
/// the file name; PDFs become text pages split on form feeds.
pub struct HashPageEncoder {
    embedding_dim: usize,
}

impl HashPageEncoder {
    pub fn new() -> Self {
        Self {
            embedding_dim: HASH_EMBEDDING_DIM,
        }
    }

    /// Embed free text
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.embedding_dim];

        for token in tokenize(text) {
            let mut hasher = FxHasher::default();
            hasher.write(token.as_bytes());
            let idx = (hasher.finish() % self.embedding_dim as u64) as usize;
            embedding[idx] += 1.0;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for val in &mut embedding {
                *val /= norm;
            }
        }

        embedding
    }

    fn encode_pdf(&self, document: &Document, bytes: &[u8]) -> Result<Vec<EncodedPage>> {
        let text = pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
            DocumentError::Unreadable {
                name: document.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let pages: Vec<EncodedPage> = text
            .split('\u{c}')
            .map(str::trim)
            .filter(|page| !page.is_empty())
            .enumerate()
            .map(|(i, page)| EncodedPage {
                page_num: i as u32 + 1,
                image: None,
                embedding: self.embed_text(&format!("{} {}", document.name, page)),
                text: Some(page.to_string()),
            })
            .collect();

        if pages.is_empty() {
            // Scanned manuals need the HTTP encoder
            return Err(DocumentError::Empty {
                name: document.name.clone(),
            }
            .into());
        }
        Ok(pages)
    }
}

impl Default for HashPageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PageEncoder for HashPageEncoder {
    fn encode_document(&self, document: &Document, _device: &str) -> Result<Vec<EncodedPage>> {
        let kind = document.kind()?;
        let bytes = document.read_bytes()?;

        let pages = match kind {
            DocumentKind::Image(mime) => vec![EncodedPage {
                page_num: 1,
                image: Some(PageImage {
                    mime,
                    base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                }),
                text: None,
                embedding: self.embed_text(&document.name),
            }],
            DocumentKind::Pdf => self.encode_pdf(document, &bytes)?,
        };

        debug!(document = %document.name, pages = pages.len(), "Encoded document");
        Ok(pages)
    }

    fn encode_query(&self, query: &str, _device: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(query))
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Lowercased alphanumeric tokens longer than two characters
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() > 2)
        .map(str::to_lowercase)
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_embed_text_normalized() {
        let encoder = HashPageEncoder::new();
        let embedding = encoder.embed_text("hydraulic system pressure");
        assert_eq!(embedding.len(), 128);

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_embed_empty_text_is_zero() {
        let encoder = HashPageEncoder::new();
        assert!(encoder.embed_text("a b").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_similar_texts() {
        let encoder = HashPageEncoder::new();
        let emb1 = encoder.embed_text("landing gear extension procedure");
        let emb2 = encoder.embed_text("procedure for landing gear extension");
        let emb3 = encoder.embed_text("cabin pressurization controller");

        assert!(cosine_similarity(&emb1, &emb2) > cosine_similarity(&emb1, &emb3));
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.01);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.01);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn test_encode_image_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        std::fs::write(&path, [0x89, b'P', b'N', b'G', 1, 2, 3]).unwrap();

        let encoder = HashPageEncoder::new();
        let pages = encoder
            .encode_document(&Document::new("fuel_panel.png", &path), "cpu")
            .unwrap();

        assert_eq!(pages.len(), 1);
        let image = pages[0].image.as_ref().unwrap();
        assert_eq!(image.mime, "image/png");
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&image.base64)
                .unwrap(),
            vec![0x89, b'P', b'N', b'G', 1, 2, 3]
        );
        assert!(image.data_url().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_encode_unsupported_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "plain text").unwrap();

        let encoder = HashPageEncoder::new();
        assert!(encoder
            .encode_document(&Document::new("notes.txt", &path), "cpu")
            .is_err());
    }

    #[test]
    fn test_encode_unreadable_pdf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.tmp");
        std::fs::write(&path, b"scanned page bytes").unwrap();

        let err = HashPageEncoder::new()
            .encode_document(&Document::new("scan.pdf", &path), "cpu")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DocumentError>(),
            Some(DocumentError::Unreadable { .. })
        ));
    }
}
