//! Page retrieval over uploaded manuals
//!
//! Documents are split into pages by a [`PageEncoder`], embedded, and stored
//! in a persisted [`PageIndex`]. The index is the handle type kept in the
//! model cache.

pub mod document;
pub mod encoder;
pub mod http_encoder;
pub mod page_index;
pub mod vector_index;

pub use document::{
    next_doc_id, DocId, DocMetadata, Document, DocumentError, DocumentKind, MetadataFilter,
};
pub use encoder::{EncodedPage, HashPageEncoder, PageEncoder, PageImage};
pub use http_encoder::HttpPageEncoder;
pub use page_index::{IndexStats, PageIndex, PageIndexLoader, SearchHit};
pub use vector_index::VectorIndex;
