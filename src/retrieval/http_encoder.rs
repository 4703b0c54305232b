//! Page encoder backed by an external retrieval model service
//!
//! The service owns page rasterization and multimodal embedding. It exposes:
//!
//! - `POST {url}/encode/document` with `{file_name, mime, data, device}`
//!   (document bytes base64 encoded), answering `{pages: [{page_num, image, text, embedding}]}`
//! - `POST {url}/encode/query` with `{query, device}`, answering `{embedding}`

use super::document::Document;
use super::encoder::{EncodedPage, PageEncoder};
use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

/// Calls run on the blocking pool, so requests are driven with
/// [`Handle::block_on`] on the runtime captured at construction.
pub struct HttpPageEncoder {
    http_client: reqwest::Client,
    runtime: Handle,
    url: String,
    api_key: Option<String>,
    embedding_dim: usize,
}

#[derive(Serialize)]
struct EncodeDocumentRequest<'a> {
    file_name: &'a str,
    mime: String,
    data: String,
    device: &'a str,
}

#[derive(Deserialize)]
struct EncodeDocumentResponse {
    pages: Vec<EncodedPage>,
}

#[derive(Serialize)]
struct EncodeQueryRequest<'a> {
    query: &'a str,
    device: &'a str,
}

#[derive(Deserialize)]
struct EncodeQueryResponse {
    embedding: Vec<f32>,
}

impl HttpPageEncoder {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        embedding_dim: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("HTTP encoder must be created inside a tokio runtime")?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build encoder HTTP client")?;

        Ok(Self {
            http_client,
            runtime,
            url: url.into().trim_end_matches('/').to_string(),
            api_key,
            embedding_dim,
        })
    }

    fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.url, path);
        let mut req = self.http_client.post(&url).json(body);
        if let Some(ref api_key) = self.api_key {
            req = req.bearer_auth(api_key);
        }

        self.runtime.block_on(async {
            let response = req
                .send()
                .await
                .with_context(|| format!("Encoder request failed: {}", url))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("Encoder service error (HTTP {}): {}", status, body);
            }

            response
                .json()
                .await
                .with_context(|| format!("Invalid encoder response from {}", url))
        })
    }

    fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.embedding_dim {
            anyhow::bail!(
                "Encoder returned {} dimensions, expected {}",
                embedding.len(),
                self.embedding_dim
            );
        }
        Ok(())
    }
}

impl PageEncoder for HttpPageEncoder {
    fn encode_document(&self, document: &Document, device: &str) -> Result<Vec<EncodedPage>> {
        let kind = document.kind()?;
        let mime = match kind {
            super::DocumentKind::Pdf => "application/pdf".to_string(),
            super::DocumentKind::Image(mime) => mime,
        };
        let bytes = document.read_bytes()?;

        let request = EncodeDocumentRequest {
            file_name: &document.name,
            mime,
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            device,
        };

        let response: EncodeDocumentResponse = self.post("/encode/document", &request)?;
        for page in &response.pages {
            self.check_dim(&page.embedding)?;
        }

        debug!(
            document = %document.name,
            pages = response.pages.len(),
            "Encoded document via encoder service"
        );
        Ok(response.pages)
    }

    fn encode_query(&self, query: &str, device: &str) -> Result<Vec<f32>> {
        let response: EncodeQueryResponse =
            self.post("/encode/query", &EncodeQueryRequest { query, device })?;
        self.check_dim(&response.embedding)?;
        Ok(response.embedding)
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trailing_slash_trimmed() {
        let encoder =
            HttpPageEncoder::new("http://localhost:9000/", None, 128, Duration::from_secs(5))
                .unwrap();
        assert_eq!(encoder.url, "http://localhost:9000");
        assert_eq!(encoder.embedding_dim(), 128);
    }

    #[test]
    fn test_requires_runtime() {
        let result = HttpPageEncoder::new("http://localhost:9000", None, 128, Duration::from_secs(5));
        assert!(result.is_err());
    }

    #[test]
    fn test_page_response_shape() {
        let json = r#"{"pages":[{"page_num":1,"image":{"mime":"image/jpeg","base64":"AAA="},"text":null,"embedding":[0.5,0.5]}]}"#;
        let response: EncodeDocumentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.pages.len(), 1);
        assert_eq!(response.pages[0].image.as_ref().unwrap().mime, "image/jpeg");
    }
}
