//! REST API for manual_rag

mod api;
mod error;

pub use error::{ApiError, ApiResult};

use crate::cache::ModelCache;
use crate::config::{IndexConfig, LlmConfig};
use crate::llm::{ChatClient, DEFAULT_SYSTEM_PROMPT};
use crate::retrieval::PageIndexLoader;
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared model cache; handles are `PageIndex`es keyed by index root
pub type IndexCache = ModelCache<PageIndexLoader>;

/// State shared by all handlers
#[derive(Clone)]
pub struct WebState {
    pub cache: Arc<IndexCache>,
    pub chat: Arc<dyn ChatClient>,
    pub index: Arc<IndexConfig>,
    pub llm: Arc<LlmConfig>,
    /// Held while an index is being created so concurrent first uploads
    /// cannot both build it
    pub create_gate: Arc<tokio::sync::Mutex<()>>,
}

impl WebState {
    pub fn new(
        cache: Arc<IndexCache>,
        chat: Arc<dyn ChatClient>,
        index: IndexConfig,
        llm: LlmConfig,
    ) -> Self {
        Self {
            cache,
            chat,
            index: Arc::new(index),
            llm: Arc::new(llm),
            create_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn system_prompt(&self) -> &str {
        self.llm
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

/// Create the router with all routes
pub fn create_router(
    state: WebState,
    allowed_origins: &[String],
    max_body_bytes: usize,
) -> Result<Router> {
    let allow_origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let origins = allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("Invalid CORS origin: {}", origin))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/upload", post(api::upload_handler))
        .route("/query", post(api::query_handler))
        .route("/get_all_files", get(api::get_all_files_handler))
        .route("/remove_file", post(api::remove_file_handler))
        .route("/api/health", get(api::health_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}
