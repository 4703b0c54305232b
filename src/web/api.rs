//! REST API handlers for manual_rag

use super::{ApiError, ApiResult, WebState};
use crate::llm::reference_content;
use crate::retrieval::{DocId, DocMetadata, Document, MetadataFilter, PageIndex};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Question request body
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub document_ids: BTreeMap<DocId, DocMetadata>,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub document_ids: BTreeMap<DocId, DocMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveFileParams {
    pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveFileResponse {
    pub message: BTreeMap<DocId, DocMetadata>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cached_indexes: usize,
}

/// Handle document uploads (multipart field `file`)
///
/// The first upload creates the index and builds it from the document;
/// later uploads append under the next free document id.
pub async fn upload_handler(
    State(state): State<WebState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let (file_name, data) = read_upload(&mut multipart).await?;

    let staged = {
        let dir = PathBuf::from(&state.index.upload_dir);
        let name = file_name.clone();
        run_blocking(move || stage_upload(&dir, &name, &data)).await?
    };
    let document = Document::new(file_name.clone(), staged.path());
    document
        .kind()
        .map_err(|e| ApiError::from(e).reject_document())?;
    let metadata = DocMetadata::active(file_name.clone());

    let gate = state.create_gate.lock().await;
    let (message, index) = if state.cache.loader().index_exists(&state.index.root, &state.index.name) {
        drop(gate);
        let index = load_index(&state).await?;
        let handle = Arc::clone(&index);
        let doc_id = run_blocking(move || handle.add_document(&document, metadata))
            .await
            .map_err(ApiError::reject_document)?;
        info!(file_name = %file_name, doc_id = doc_id, "File uploaded");
        ("File uploaded", index)
    } else {
        let loader = state.cache.loader().clone();
        let config = Arc::clone(&state.index);
        run_blocking(move || loader.create_if_missing(&config.root, &config.name, &config.device))
            .await?;

        let index = load_index(&state).await?;
        let handle = Arc::clone(&index);
        run_blocking(move || handle.index(&document, metadata))
            .await
            .map_err(ApiError::reject_document)?;
        drop(gate);
        info!(file_name = %file_name, "Index created");
        ("Index created", index)
    };

    let document_ids = run_blocking(move || index.doc_id_to_metadata()).await?;
    drop(staged);

    Ok(Json(UploadResponse {
        message,
        document_ids,
    }))
}

/// Answer a question from the indexed manuals
pub async fn query_handler(
    State(state): State<WebState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err(ApiError::BadRequest("Query must not be empty".to_string()));
    }
    require_index(&state)?;

    let index = load_index(&state).await?;
    let top_k = state.index.top_k;
    let search_query = query.clone();
    let hits = run_blocking(move || {
        index.search(&search_query, &MetadataFilter::active_only(), top_k, true)
    })
    .await?;
    debug!(hits = hits.len(), "Retrieved reference pages");

    let content = reference_content(&query, &hits, &state.llm.image_detail);
    let start = Instant::now();
    let answer = state
        .chat
        .complete(state.system_prompt(), content)
        .await
        .context("Answer synthesis failed")?;

    info!(
        model = state.chat.model_name(),
        pages = hits.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Query answered"
    );
    Ok(Json(QueryResponse { response: answer }))
}

/// List every document in the index, active or not
pub async fn get_all_files_handler(
    State(state): State<WebState>,
) -> ApiResult<Json<FilesResponse>> {
    if !state.cache.loader().index_exists(&state.index.root, &state.index.name) {
        return Ok(Json(FilesResponse {
            document_ids: BTreeMap::new(),
        }));
    }

    let index = load_index(&state).await?;
    let document_ids = run_blocking(move || index.doc_id_to_metadata()).await?;
    Ok(Json(FilesResponse { document_ids }))
}

/// Mark every document with the given file name inactive
pub async fn remove_file_handler(
    State(state): State<WebState>,
    Query(params): Query<RemoveFileParams>,
) -> ApiResult<Json<RemoveFileResponse>> {
    require_index(&state)?;

    let index = load_index(&state).await?;
    let message = run_blocking(move || {
        index.deactivate_by_name(&params.file_name)?;
        index.doc_id_to_metadata()
    })
    .await?;
    Ok(Json(RemoveFileResponse { message }))
}

/// Handle health check requests
pub async fn health_handler(State(state): State<WebState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        cached_indexes: state.cache.len(),
    })
}

async fn load_index(state: &WebState) -> ApiResult<Arc<PageIndex>> {
    let config = &state.index;
    Ok(state
        .cache
        .get_or_load(&config.name, &config.root, &config.device)
        .await?)
}

fn require_index(state: &WebState) -> ApiResult<()> {
    if state.cache.loader().index_exists(&state.index.root, &state.index.name) {
        Ok(())
    } else {
        Err(ApiError::NotFound(
            "No documents have been uploaded yet".to_string(),
        ))
    }
}

/// Run blocking index work off the async runtime
async fn run_blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("Blocking task failed: {}", e))?;
    Ok(result?)
}

async fn read_upload(multipart: &mut Multipart) -> ApiResult<(String, Bytes)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .and_then(sanitize_file_name)
            .ok_or_else(|| ApiError::BadRequest("Upload is missing a file name".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if data.is_empty() {
            return Err(ApiError::BadRequest(format!("Uploaded file '{}' is empty", file_name)));
        }

        return Ok((file_name, data));
    }

    Err(ApiError::BadRequest(
        "Multipart field 'file' is required".to_string(),
    ))
}

/// Keep only the final path component of a client-supplied file name
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    match name {
        "" | "." | ".." => None,
        _ => Some(name.to_string()),
    }
}

/// Write the upload to a temp file that is removed when dropped
fn stage_upload(dir: &Path, file_name: &str, data: &[u8]) -> anyhow::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create upload directory: {}", dir.display()))?;

    let suffix = Path::new(file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

    file.write_all(data).context("Failed to write upload")?;
    file.flush().context("Failed to write upload")?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("afm.pdf").as_deref(), Some("afm.pdf"));
        assert_eq!(
            sanitize_file_name("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_file_name("C:\\manuals\\qrh.png").as_deref(),
            Some("qrh.png")
        );
        assert_eq!(sanitize_file_name("manuals/"), None);
        assert_eq!(sanitize_file_name(".."), None);
    }

    #[test]
    fn test_staged_upload_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let upload_dir = dir.path().join("temp_files");

        let staged = stage_upload(&upload_dir, "limits.png", b"png-bytes").unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&path).unwrap(), b"png-bytes");

        drop(staged);
        assert!(!path.exists());
    }
}
