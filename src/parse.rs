//! Raw document bytes → plain text plus whatever metadata the format yields.

use anyhow::{Context, Result};
use tracing::warn;

use crate::models::ChunkMetadata;

/// Extracted text and document-level metadata.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Extract text from raw bytes according to the declared MIME type.
///
/// Unknown types degrade to lossy UTF-8 with a warning rather than failing
/// the document — a few replacement characters beat a dead ingestion.
pub fn parse(bytes: &[u8], mime_type: &str) -> Result<ParsedDocument> {
    match mime_type {
        "application/pdf" => parse_pdf(bytes),
        "text/plain" | "text/markdown" | "text/csv" | "text/html" | "application/json" => {
            Ok(ParsedDocument {
                text: String::from_utf8_lossy(bytes).into_owned(),
                metadata: ChunkMetadata::default(),
            })
        }
        other => {
            warn!(mime_type = other, "unknown mime type, treating as utf-8 text");
            Ok(ParsedDocument {
                text: String::from_utf8_lossy(bytes).into_owned(),
                metadata: ChunkMetadata::default(),
            })
        }
    }
}

fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .context("failed to extract text from pdf")?;
    Ok(ParsedDocument {
        text,
        metadata: ChunkMetadata::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passthrough() {
        let doc = parse(b"hello world", "text/plain").unwrap();
        assert_eq!(doc.text, "hello world");
    }

    #[test]
    fn test_unknown_mime_degrades_to_lossy_utf8() {
        let doc = parse(b"some bytes", "application/x-whatever").unwrap();
        assert_eq!(doc.text, "some bytes");
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let doc = parse(&[0x68, 0x69, 0xff, 0xfe], "text/plain").unwrap();
        assert!(doc.text.starts_with("hi"));
        assert!(doc.text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_malformed_pdf_errors() {
        assert!(parse(b"not a pdf at all", "application/pdf").is_err());
    }
}
