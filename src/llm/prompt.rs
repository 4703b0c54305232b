//! Prompt assembly for answer synthesis

use super::ContentPart;
use crate::retrieval::SearchHit;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant to a part 135 charter company \
that operates Gulfstream G550s. You will be given a question about the G550 and you will be given \
some reference material. If the reference material does not answer the question, just say that \
you do not have enough information to answer the question.";

/// Build the user message: the question first, then each retrieved page.
///
/// Pages with an image are attached as data URLs at `detail`; text-only
/// pages are attached as a labelled text part.
pub fn reference_content(query: &str, hits: &[SearchHit], detail: &str) -> Vec<ContentPart> {
    let mut content = Vec::with_capacity(hits.len() + 1);
    content.push(ContentPart::text(query));

    for hit in hits {
        if let Some(url) = hit.data_url() {
            content.push(ContentPart::image(url, detail));
        } else if let Some(text) = hit.text.as_deref() {
            content.push(ContentPart::text(format!(
                "Reference material ({}, page {}):\n{}",
                hit.name, hit.page_num, text
            )));
        }
    }

    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(name: &str, image: bool, text: Option<&str>) -> SearchHit {
        SearchHit {
            doc_id: 0,
            page_num: 4,
            score: 0.9,
            name: name.to_string(),
            base64: image.then(|| "AAA=".to_string()),
            mime: image.then(|| "image/jpeg".to_string()),
            text: text.map(str::to_string),
        }
    }

    #[test]
    fn test_query_comes_first() {
        let content = reference_content("Max altitude?", &[], "high");
        assert_eq!(content, vec![ContentPart::text("Max altitude?")]);
    }

    #[test]
    fn test_images_and_text_pages() {
        let hits = vec![
            hit("limits.png", true, None),
            hit("afm.pdf", false, Some("Maximum operating altitude 51,000 ft")),
            hit("blank.pdf", false, None),
        ];
        let content = reference_content("Max altitude?", &hits, "high");

        assert_eq!(content.len(), 3);
        assert_eq!(
            content[1],
            ContentPart::image("data:image/jpeg;base64,AAA=", "high")
        );
        match &content[2] {
            ContentPart::Text { text } => {
                assert!(text.starts_with("Reference material (afm.pdf, page 4)"));
                assert!(text.contains("51,000 ft"));
            }
            other => panic!("expected text part, got {:?}", other),
        }
    }
}
