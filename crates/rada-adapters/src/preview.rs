//! Short plain-text previews of downloaded attachments, used for classification
//! and for recovering a druk number the link text did not carry.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use rada_core::split_extension;
use regex::Regex;
use tracing::warn;

pub const DEFAULT_PREVIEW_WORDS: usize = 35;
const DOCX_PARAGRAPHS: usize = 10;

pub trait PreviewExtractor: Send + Sync {
    /// Best-effort preview; unsupported formats and unreadable files yield "".
    fn preview(&self, path: &Path) -> String;
}

/// PDF (first page) and DOCX (leading paragraphs) previews.
#[derive(Debug, Clone)]
pub struct DocumentPreviewer {
    max_words: usize,
}

impl Default for DocumentPreviewer {
    fn default() -> Self {
        Self {
            max_words: DEFAULT_PREVIEW_WORDS,
        }
    }
}

impl DocumentPreviewer {
    pub fn new(max_words: usize) -> Self {
        Self { max_words }
    }

    fn extract(&self, path: &Path) -> Result<String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match split_extension(&name).1.to_lowercase().as_str() {
            ".pdf" => pdf_first_page_text(path),
            ".docx" => docx_leading_text(path, self.max_words),
            _ => Ok(String::new()),
        }
    }
}

impl PreviewExtractor for DocumentPreviewer {
    fn preview(&self, path: &Path) -> String {
        match self.extract(path) {
            Ok(text) => limit_words(&text, self.max_words),
            Err(err) => {
                warn!(file = %path.display(), error = %err, "preview extraction failed");
                String::new()
            }
        }
    }
}

pub fn limit_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

fn pdf_first_page_text(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path).with_context(|| format!("loading pdf {}", path.display()))?;
    let Some(first_page) = doc.get_pages().keys().next().copied() else {
        return Ok(String::new());
    };
    doc.extract_text(&[first_page])
        .with_context(|| format!("extracting text from {}", path.display()))
}

fn docx_leading_text(path: &Path, max_words: usize) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file).with_context(|| format!("reading docx container {}", path.display()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("docx without word/document.xml")?
        .read_to_string(&mut xml)
        .context("reading word/document.xml")?;
    docx_xml_text(&xml, max_words)
}

/// Text of the leading `<w:p>` paragraphs of a WordprocessingML body.
pub fn docx_xml_text(xml: &str, max_words: usize) -> Result<String> {
    let run = Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>")?;
    let entity = Regex::new(r"&(#[xX][0-9A-Fa-f]+|#[0-9]+|lt|gt|quot|apos|amp);")?;
    let mut text = String::new();
    for paragraph in xml.split("</w:p>").take(DOCX_PARAGRAPHS) {
        for caps in run.captures_iter(paragraph) {
            text.push_str(&decode_xml_entities(&entity, &caps[1]));
        }
        text.push(' ');
        if text.split_whitespace().count() >= max_words {
            break;
        }
    }
    Ok(text)
}

/// Single pass, so `&amp;lt;` stays `&lt;`. Unknown or invalid references are
/// kept verbatim.
fn decode_xml_entities(entity: &Regex, s: &str) -> String {
    entity
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = match name {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let code = match name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => name[1..].parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}
