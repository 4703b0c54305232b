//! Answer synthesis through a multimodal chat-completion model

pub mod openai;
pub mod prompt;

pub use openai::OpenAiChatClient;
pub use prompt::{reference_content, DEFAULT_SYSTEM_PROMPT};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Chat-completion backend
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a system instruction plus one multi-part user message and return
    /// the model's text answer
    async fn complete(&self, system: &str, content: Vec<ContentPart>) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// One part of a multi-part user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: detail.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    /// `low`, `high` or `auto`
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_part_wire_shape() {
        let parts = vec![
            ContentPart::text("What is VMO?"),
            ContentPart::image("data:image/jpeg;base64,AAA=", "high"),
        ];
        let json = serde_json::to_value(&parts).unwrap();

        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[0]["text"], "What is VMO?");
        assert_eq!(json[1]["type"], "image_url");
        assert_eq!(json[1]["image_url"]["url"], "data:image/jpeg;base64,AAA=");
        assert_eq!(json[1]["image_url"]["detail"], "high");
    }
}
