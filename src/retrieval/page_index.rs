//! Persisted page index
//!
//! A `PageIndex` lives in `<root>/<name>/index.bin` and stores the whole
//! collection: document metadata, page images/text, and page embeddings.
//! Every mutation rewrites the file (temp file + rename).

use super::document::{
    next_doc_id, DocId, DocMetadata, Document, DocumentError, MetadataFilter,
};
use super::encoder::{EncodedPage, PageEncoder, PageImage};
use super::vector_index::VectorIndex;
use crate::cache::IndexLoader;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

const INDEX_FILE: &str = "index.bin";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPage {
    doc_id: DocId,
    page_num: u32,
    image: Option<PageImage>,
    text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexState {
    version: u32,
    docs: BTreeMap<DocId, DocMetadata>,
    /// Indexed by page id
    pages: Vec<StoredPage>,
    vectors: VectorIndex,
}

impl IndexState {
    fn empty(embedding_dim: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            docs: BTreeMap::new(),
            pages: Vec::new(),
            vectors: VectorIndex::new(embedding_dim),
        }
    }

    fn insert_document(
        &mut self,
        doc_id: DocId,
        metadata: DocMetadata,
        pages: Vec<EncodedPage>,
    ) -> Result<()> {
        if self.docs.contains_key(&doc_id) {
            anyhow::bail!("Document id {} already exists in index", doc_id);
        }
        if pages.is_empty() {
            return Err(DocumentError::Empty {
                name: metadata.name,
            }
            .into());
        }
        // Validate every page before touching state
        let dim = self.vectors.embedding_dim();
        if let Some(page) = pages.iter().find(|p| p.embedding.len() != dim) {
            anyhow::bail!(
                "Page {} of '{}' has {} dimensions, index expects {}",
                page.page_num,
                metadata.name,
                page.embedding.len(),
                dim
            );
        }

        for page in pages {
            let page_id = self.pages.len() as u32;
            self.vectors.add(page_id, page.embedding)?;
            self.pages.push(StoredPage {
                doc_id,
                page_num: page.page_num,
                image: page.image,
                text: page.text,
            });
        }
        self.docs.insert(doc_id, metadata);
        Ok(())
    }
}

/// One retrieved page
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub page_num: u32,
    pub score: f32,
    /// Document file name
    pub name: String,
    /// Base64 page image, when requested and available
    pub base64: Option<String>,
    pub mime: Option<String>,
    pub text: Option<String>,
}

impl SearchHit {
    pub fn data_url(&self) -> Option<String> {
        match (&self.mime, &self.base64) {
            (Some(mime), Some(data)) => Some(format!("data:{};base64,{}", mime, data)),
            _ => None,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub num_documents: usize,
    pub num_active_documents: usize,
    pub num_pages: usize,
    pub embedding_dim: usize,
}

/// Loaded page index; the handle type held by the model cache
pub struct PageIndex {
    name: String,
    dir: PathBuf,
    device: String,
    encoder: Arc<dyn PageEncoder>,
    state: RwLock<IndexState>,
}

impl PageIndex {
    pub fn index_dir(root: &Path, name: &str) -> PathBuf {
        root.join(name)
    }

    pub fn exists(root: &Path, name: &str) -> bool {
        Self::index_dir(root, name).join(INDEX_FILE).is_file()
    }

    /// Create an empty index on disk. Fails if one already exists.
    pub fn create(
        root: &Path,
        name: &str,
        device: &str,
        encoder: Arc<dyn PageEncoder>,
    ) -> Result<Self> {
        if Self::exists(root, name) {
            anyhow::bail!("Index '{}' already exists in {}", name, root.display());
        }

        let dir = Self::index_dir(root, name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;

        let index = Self {
            name: name.to_string(),
            dir,
            device: device.to_string(),
            state: RwLock::new(IndexState::empty(encoder.embedding_dim())),
            encoder,
        };
        index.persist(&*index.read_state()?)?;

        info!(index = name, root = %root.display(), "Created page index");
        Ok(index)
    }

    /// Load an existing index from disk
    pub fn open(
        root: &Path,
        name: &str,
        device: &str,
        encoder: Arc<dyn PageEncoder>,
    ) -> Result<Self> {
        let dir = Self::index_dir(root, name);
        let path = dir.join(INDEX_FILE);
        let data = std::fs::read(&path)
            .with_context(|| format!("Index '{}' not found at {}", name, path.display()))?;
        let state: IndexState = bincode::deserialize(&data)
            .with_context(|| format!("Failed to decode index file: {}", path.display()))?;

        if state.version != FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported index format version {} in {} (expected {})",
                state.version,
                path.display(),
                FORMAT_VERSION
            );
        }
        if state.vectors.embedding_dim() != encoder.embedding_dim() {
            anyhow::bail!(
                "Index '{}' was built with {}-dimensional embeddings, encoder '{}' produces {}",
                name,
                state.vectors.embedding_dim(),
                encoder.name(),
                encoder.embedding_dim()
            );
        }

        info!(
            index = name,
            documents = state.docs.len(),
            pages = state.pages.len(),
            device = device,
            "Opened page index"
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            device: device.to_string(),
            encoder,
            state: RwLock::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Rebuild the index from a single document, which gets id 0
    pub fn index(&self, document: &Document, metadata: DocMetadata) -> Result<DocId> {
        let pages = self.encoder.encode_document(document, &self.device)?;

        let mut fresh = IndexState::empty(self.encoder.embedding_dim());
        fresh.insert_document(0, metadata, pages)?;

        let mut state = self.write_state()?;
        self.persist(&fresh)?;
        *state = fresh;

        info!(index = %self.name, document = %document.name, "Indexed document");
        Ok(0)
    }

    /// Add a document under an explicit id. Fails if the id is taken.
    pub fn add_to_index(
        &self,
        document: &Document,
        doc_id: DocId,
        metadata: DocMetadata,
    ) -> Result<()> {
        let pages = self.encoder.encode_document(document, &self.device)?;

        let mut state = self.write_state()?;
        let mut next = state.clone();
        next.insert_document(doc_id, metadata, pages)?;
        self.commit(&mut state, next)?;

        info!(index = %self.name, document = %document.name, doc_id = doc_id, "Added document");
        Ok(())
    }

    /// Add a document under the next free id and return that id
    pub fn add_document(&self, document: &Document, metadata: DocMetadata) -> Result<DocId> {
        let pages = self.encoder.encode_document(document, &self.device)?;

        let mut state = self.write_state()?;
        let doc_id = next_doc_id(&state.docs);
        let mut next = state.clone();
        next.insert_document(doc_id, metadata, pages)?;
        self.commit(&mut state, next)?;

        info!(index = %self.name, document = %document.name, doc_id = doc_id, "Added document");
        Ok(doc_id)
    }

    /// Retrieve the `k` best pages for `query` among documents matching `filter`
    pub fn search(
        &self,
        query: &str,
        filter: &MetadataFilter,
        k: usize,
        return_base64: bool,
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = self.encoder.encode_query(query, &self.device)?;
        let state = self.read_state()?;

        let keep = |page_id: u32| {
            state
                .pages
                .get(page_id as usize)
                .and_then(|page| state.docs.get(&page.doc_id))
                .is_some_and(|metadata| filter.matches(metadata))
        };
        let neighbors = state.vectors.search_filtered(&query_embedding, k, keep);

        let hits: Vec<SearchHit> = neighbors
            .into_iter()
            .filter_map(|(page_id, score)| {
                let page = state.pages.get(page_id as usize)?;
                let metadata = state.docs.get(&page.doc_id)?;
                let (mime, base64) = match (&page.image, return_base64) {
                    (Some(image), true) => (Some(image.mime.clone()), Some(image.base64.clone())),
                    _ => (None, None),
                };
                Some(SearchHit {
                    doc_id: page.doc_id,
                    page_num: page.page_num,
                    score,
                    name: metadata.name.clone(),
                    base64,
                    mime,
                    text: page.text.clone(),
                })
            })
            .collect();

        debug!(index = %self.name, k = k, hits = hits.len(), "Page search completed");
        Ok(hits)
    }

    /// Snapshot of all document metadata
    pub fn doc_id_to_metadata(&self) -> Result<BTreeMap<DocId, DocMetadata>> {
        Ok(self.read_state()?.docs.clone())
    }

    /// Mark every document named `name` inactive. Returns how many changed.
    pub fn deactivate_by_name(&self, name: &str) -> Result<usize> {
        let mut state = self.write_state()?;
        let mut next = state.clone();
        let mut changed = 0;
        for metadata in next.docs.values_mut() {
            if metadata.name == name && metadata.active {
                metadata.active = false;
                changed += 1;
            }
        }

        if changed > 0 {
            self.commit(&mut state, next)?;
        }
        info!(index = %self.name, file_name = name, deactivated = changed, "Deactivated documents");
        Ok(changed)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let state = self.read_state()?;
        Ok(IndexStats {
            num_documents: state.docs.len(),
            num_active_documents: state.docs.values().filter(|m| m.active).count(),
            num_pages: state.pages.len(),
            embedding_dim: state.vectors.embedding_dim(),
        })
    }

    /// Persist `next`, then make it the live state. On a failed write the
    /// live state is left as it was.
    fn commit(&self, state: &mut IndexState, next: IndexState) -> Result<()> {
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp_path = self.dir.join(format!("{}.tmp", INDEX_FILE));

        let data = bincode::serialize(state).context("Failed to encode index")?;
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("Failed to write index file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to replace index file: {}", path.display()))?;

        debug!(path = %path.display(), pages = state.pages.len(), "Index saved");
        Ok(())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, IndexState>> {
        self.state
            .read()
            .map_err(|_| anyhow::anyhow!("Page index '{}' lock poisoned", self.name))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, IndexState>> {
        self.state
            .write()
            .map_err(|_| anyhow::anyhow!("Page index '{}' lock poisoned", self.name))
    }
}

/// Loads [`PageIndex`] handles for the model cache
#[derive(Clone)]
pub struct PageIndexLoader {
    encoder: Arc<dyn PageEncoder>,
}

impl PageIndexLoader {
    pub fn new(encoder: Arc<dyn PageEncoder>) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &Arc<dyn PageEncoder> {
        &self.encoder
    }

    pub fn index_exists(&self, index_root: &str, index_name: &str) -> bool {
        PageIndex::exists(Path::new(index_root), index_name)
    }

    /// Create an empty index unless one exists. Returns `true` if created.
    pub fn create_if_missing(
        &self,
        index_root: &str,
        index_name: &str,
        device: &str,
    ) -> Result<bool> {
        if self.index_exists(index_root, index_name) {
            return Ok(false);
        }
        PageIndex::create(
            Path::new(index_root),
            index_name,
            device,
            Arc::clone(&self.encoder),
        )?;
        Ok(true)
    }
}

impl IndexLoader for PageIndexLoader {
    type Handle = PageIndex;

    fn load(&self, index_path: &str, index_root: &str, device: &str) -> Result<PageIndex> {
        PageIndex::open(
            Path::new(index_root),
            index_path,
            device,
            Arc::clone(&self.encoder),
        )
    }
}
