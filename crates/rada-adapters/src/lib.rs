//! Portal markup adapters: named text matchers, roman numeral decoding, and the
//! session / agenda / attachment link parsers for the council document portal.

use percent_encoding::percent_decode_str;
use rada_core::{is_attachment_extension, split_extension, AgendaRef, AttachmentLink, DrukNumber, SessionRef};
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod preview;

pub use preview::{DocumentPreviewer, PreviewExtractor};

pub const CRATE_NAME: &str = "rada-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no council sessions found on the listing page")]
    NoSessions,
    #[error("no session numeral in link text {0:?}")]
    MissingSessionNumber(String),
    #[error("no agenda found on the session page")]
    NoAgenda,
    #[error("invalid roman numeral glyph {0:?}")]
    InvalidNumeral(char),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Decodes a roman numeral right-to-left; values smaller than the largest seen
/// so far are subtracted. Non-canonical forms such as `IIII` still decode.
pub fn roman_to_int(token: &str) -> Result<u32, AdapterError> {
    let mut total: i64 = 0;
    let mut max_seen = 0;
    for ch in token.chars().rev() {
        let value = match ch {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            'C' => 100,
            'D' => 500,
            'M' => 1000,
            other => return Err(AdapterError::InvalidNumeral(other)),
        };
        if value < max_seen {
            total -= value;
        } else {
            total += value;
            max_seen = value;
        }
    }
    Ok(total.max(0) as u32)
}

/// Portal wording, kept as configurable patterns so label drift on the portal
/// can be handled without touching the sync logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalPatterns {
    /// Case-insensitive; matched against session anchor text.
    pub session_label: String,
    /// Case-sensitive; first match (group 1) is the session numeral.
    pub session_numeral: String,
    /// Case-insensitive; matched against agenda anchor text.
    pub agenda_label: String,
    /// Case-sensitive; group 1 is the agenda revision number.
    pub agenda_number: String,
    /// Case-insensitive; group 1 is the druk identifier.
    pub druk: String,
}

impl Default for PortalPatterns {
    fn default() -> Self {
        Self {
            session_label: "Sesja Rady Miasta Piły".to_string(),
            session_numeral: r"\b([IVXLCDM]+)\b".to_string(),
            agenda_label: "porządek obrad".to_string(),
            agenda_number: r"nr\s*([1-9])".to_string(),
            druk: r"DRUK\s*NR\s*(\d+)".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortalMatchers {
    session_label: Regex,
    session_numeral: Regex,
    agenda_label: Regex,
    agenda_number: Regex,
    druk: Regex,
}

impl PortalMatchers {
    pub fn compile(patterns: &PortalPatterns) -> Result<Self, AdapterError> {
        let ci = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        Ok(Self {
            session_label: ci(&patterns.session_label)?,
            session_numeral: Regex::new(&patterns.session_numeral)?,
            agenda_label: ci(&patterns.agenda_label)?,
            agenda_number: Regex::new(&patterns.agenda_number)?,
            druk: ci(&patterns.druk)?,
        })
    }

    pub fn is_session_label(&self, text: &str) -> bool {
        self.session_label.is_match(text)
    }

    pub fn is_agenda_label(&self, text: &str) -> bool {
        self.agenda_label.is_match(text)
    }

    /// Session number from the first roman numeral run in `text`.
    pub fn session_number(&self, text: &str) -> Result<u32, AdapterError> {
        let numeral = first_group(&self.session_numeral, text)
            .ok_or_else(|| AdapterError::MissingSessionNumber(text.to_string()))?;
        roman_to_int(numeral)
    }

    pub fn agenda_number(&self, text: &str) -> Option<u32> {
        first_group(&self.agenda_number, text)?.parse().ok()
    }

    /// Works on link text and on free-form document previews alike.
    pub fn druk_in_text(&self, text: &str) -> Option<DrukNumber> {
        DrukNumber::new(first_group(&self.druk, text)?)
    }
}

impl Default for PortalMatchers {
    fn default() -> Self {
        Self::compile(&PortalPatterns::default()).expect("built-in portal patterns are valid")
    }
}

fn first_group<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)
        .and_then(|c| c.get(1).or_else(|| c.get(0)))
        .map(|m| m.as_str())
}

/// Which agenda revision on a session page is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgendaPolicy {
    /// Highest "nr N" wins; without numbered agendas the first unnumbered one is
    /// used as number 1.
    #[default]
    HighestNumbered,
    /// First matching agenda link in document order.
    FirstListed,
}

#[derive(Debug, Clone, Default)]
pub struct PortalParser {
    matchers: PortalMatchers,
    agenda_policy: AgendaPolicy,
}

struct Anchor {
    text: String,
    href: String,
}

impl PortalParser {
    pub fn new(matchers: PortalMatchers, agenda_policy: AgendaPolicy) -> Self {
        Self {
            matchers,
            agenda_policy,
        }
    }

    pub fn matchers(&self) -> &PortalMatchers {
        &self.matchers
    }

    /// First session link in document order (the portal lists newest first).
    pub fn latest_session(&self, html: &str, base_url: &str) -> Result<SessionRef, AdapterError> {
        let anchor = anchors(html)?
            .into_iter()
            .find(|a| self.matchers.is_session_label(&a.text))
            .ok_or(AdapterError::NoSessions)?;
        Ok(SessionRef {
            number: self.matchers.session_number(&anchor.text)?,
            url: resolve_href(base_url, &anchor.href)?,
        })
    }

    /// Every session link in document order; links without a numeral are skipped.
    pub fn all_sessions(&self, html: &str, base_url: &str) -> Result<Vec<SessionRef>, AdapterError> {
        let matching = anchors(html)?
            .into_iter()
            .filter(|a| self.matchers.is_session_label(&a.text))
            .collect::<Vec<_>>();
        if matching.is_empty() {
            return Err(AdapterError::NoSessions);
        }

        let mut sessions = Vec::with_capacity(matching.len());
        for anchor in matching {
            let number = match self.matchers.session_number(&anchor.text) {
                Ok(n) => n,
                Err(AdapterError::MissingSessionNumber(_)) => continue,
                Err(err) => return Err(err),
            };
            sessions.push(SessionRef {
                number,
                url: resolve_href(base_url, &anchor.href)?,
            });
        }
        Ok(sessions)
    }

    pub fn latest_agenda(&self, html: &str, page_url: &str) -> Result<AgendaRef, AdapterError> {
        let candidates = anchors(html)?
            .into_iter()
            .filter(|a| self.matchers.is_agenda_label(&a.text))
            .map(|a| (self.matchers.agenda_number(&a.text), a))
            .collect::<Vec<_>>();

        let chosen = match self.agenda_policy {
            AgendaPolicy::HighestNumbered => {
                let mut best: Option<(u32, &Anchor)> = None;
                for (number, anchor) in &candidates {
                    if let Some(n) = number {
                        if best.map_or(true, |(b, _)| *n > b) {
                            best = Some((*n, anchor));
                        }
                    }
                }
                best.or_else(|| {
                    candidates
                        .iter()
                        .find(|(number, _)| number.is_none())
                        .map(|(_, anchor)| (1, anchor))
                })
            }
            AgendaPolicy::FirstListed => candidates
                .first()
                .map(|(number, anchor)| (number.unwrap_or(1), anchor)),
        };

        let (number, anchor) = chosen.ok_or(AdapterError::NoAgenda)?;
        Ok(AgendaRef {
            number,
            url: resolve_href(page_url, &anchor.href)?,
        })
    }

    /// Attachment anchors on an agenda page, in document order.
    pub fn attachments(&self, html: &str, page_url: &str) -> Result<Vec<AttachmentLink>, AdapterError> {
        let mut out = Vec::new();
        for anchor in anchors(html)? {
            let url = Url::parse(page_url)?.join(&anchor.href)?;
            let Some(filename) = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .and_then(decode_filename)
            else {
                continue;
            };
            if !is_attachment_extension(split_extension(&filename).1) {
                continue;
            }
            out.push(AttachmentLink {
                url: url.to_string(),
                druk: self.matchers.druk_in_text(&anchor.text),
                original_filename: filename,
                link_text: anchor.text,
            });
        }
        Ok(out)
    }
}

/// Filename as the portal wrote it. Separators smuggled in through `%2F` or
/// `%5C` are replaced so the name stays a single path component.
fn decode_filename(segment: &str) -> Option<String> {
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    let name = decoded.replace(['/', '\\'], "_");
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

fn anchors(html: &str) -> Result<Vec<Anchor>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("a[href]").map_err(|e| AdapterError::Selector(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|node| {
            let href = node.value().attr("href")?.trim().to_string();
            let text = node.text().collect::<String>();
            Some(Anchor {
                text: text.split_whitespace().collect::<Vec<_>>().join(" "),
                href,
            })
        })
        .collect())
}

pub fn resolve_href(base_url: &str, href: &str) -> Result<String, AdapterError> {
    Ok(Url::parse(base_url)?.join(href)?.to_string())
}
