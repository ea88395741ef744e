//! Core domain model for the council session mirror: portal references,
//! druk identity, mirror entry naming and sweep status types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rada-core";

/// File extensions treated as agenda attachments (lowercase, no dot).
pub const ATTACHMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "gml"];

pub const DRUK_PREFIX: &str = "DRUK_NR";
/// Marker carried by every mirrored `.gml` file; such entries count as enriched.
pub const GML_MARKER: &str = "_załącznik";
pub const TEMP_PREFIX: &str = "temp_";
pub const SESSION_DIR_PREFIX: &str = "Sesja";
pub const AGENDA_DIR_PREFIX: &str = "Porzadek";

/// Portal identifier of a single agenda document ("DRUK NR 223" → `223`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrukNumber(String);

impl DrukNumber {
    /// Accepts a non-empty run of ASCII digits.
    pub fn new(digits: impl Into<String>) -> Option<Self> {
        let digits = digits.into();
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(digits))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bare mirror stem, e.g. `DRUK_NR223`.
    pub fn stem(&self) -> String {
        format!("{DRUK_PREFIX}{}", self.0)
    }
}

impl fmt::Display for DrukNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One council session discovered on the year index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub number: u32,
    pub url: String,
}

/// The authoritative agenda page of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaRef {
    pub number: u32,
    pub url: String,
}

/// A downloadable attachment anchor found on an agenda page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentLink {
    pub url: String,
    pub original_filename: String,
    pub link_text: String,
    pub druk: Option<DrukNumber>,
}

impl AttachmentLink {
    /// Lowercased extension including the dot, or empty.
    pub fn extension(&self) -> String {
        split_extension(&self.original_filename).1.to_lowercase()
    }
}

/// Descriptive tokens produced by content classification (at most three).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Keywords(Vec<String>);

impl Keywords {
    pub const MAX_TOKENS: usize = 3;

    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            tokens
                .into_iter()
                .map(Into::into)
                .filter(|t| !t.is_empty())
                .take(Self::MAX_TOKENS)
                .collect(),
        )
    }

    pub fn from_whitespace(text: &str) -> Self {
        Self::new(text.split_whitespace())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Underscore-joined form used inside filenames.
    pub fn joined(&self) -> String {
        self.0.join("_")
    }
}

/// State of a druk identifier inside one agenda directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorEntry {
    Absent,
    Bare { filename: String },
    Enriched { filename: String },
}

impl MirrorEntry {
    pub fn exists(&self) -> bool {
        !matches!(self, MirrorEntry::Absent)
    }

    pub fn is_enriched(&self) -> bool {
        matches!(self, MirrorEntry::Enriched { .. })
    }

    pub fn filename(&self) -> Option<&str> {
        match self {
            MirrorEntry::Absent => None,
            MirrorEntry::Bare { filename } | MirrorEntry::Enriched { filename } => Some(filename),
        }
    }

    /// Classifies a filename already known to belong to `druk`.
    pub fn classify(druk: &DrukNumber, filename: &str) -> Self {
        let (stem, _) = split_extension(filename);
        if stem == druk.stem() {
            MirrorEntry::Bare {
                filename: filename.to_string(),
            }
        } else {
            MirrorEntry::Enriched {
                filename: filename.to_string(),
            }
        }
    }
}

/// Splits `name` into stem and extension (with dot). Leading-dot names have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

pub fn is_attachment_extension(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    ATTACHMENT_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
}

/// Name for a freshly fetched attachment that has no mirror entry yet.
pub fn final_filename(druk: Option<&DrukNumber>, original_filename: &str, keywords: &Keywords) -> String {
    let (stem, ext) = split_extension(original_filename);
    let ext = ext.to_lowercase();

    let Some(druk) = druk else {
        if keywords.is_empty() {
            return original_filename.to_string();
        }
        return format!("{}{}", keywords.joined(), ext);
    };

    let mut base = druk.stem();
    if !keywords.is_empty() {
        base.push('_');
        base.push_str(&keywords.joined());
    }
    if ext == ".gml" {
        format!("{base}{GML_MARKER}.gml")
    } else if is_attachment_extension(&ext) {
        format!("{base}{ext}")
    } else {
        format!("{base}_{stem}{ext}")
    }
}

/// Name for a bare entry upgraded with keywords; unchanged when there are none.
pub fn upgraded_filename(druk: &DrukNumber, existing_filename: &str, keywords: &Keywords) -> String {
    if keywords.is_empty() {
        return existing_filename.to_string();
    }
    let (_, ext) = split_extension(existing_filename);
    format!("{}_{}{}", druk.stem(), keywords.joined(), ext)
}

pub fn temp_filename(original_filename: &str) -> String {
    format!("{TEMP_PREFIX}{original_filename}")
}

pub fn session_dir_name(session_number: u32) -> String {
    format!("{SESSION_DIR_PREFIX}{session_number}")
}

pub fn agenda_dir_name(agenda_number: u32) -> String {
    format!("{AGENDA_DIR_PREFIX}{agenda_number}")
}

pub fn parse_session_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix(SESSION_DIR_PREFIX)?.parse().ok()
}

/// One end-to-end discovery-and-sync run mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "session")]
pub enum SweepMode {
    Latest,
    UpdateExisting,
    Session(u32),
    Backfill,
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepMode::Latest => f.write_str("latest"),
            SweepMode::UpdateExisting => f.write_str("update-existing"),
            SweepMode::Session(n) => write!(f, "session {n}"),
            SweepMode::Backfill => f.write_str("backfill"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Coarse progress of the current (or last) sweep, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepStatus {
    pub run_id: Option<Uuid>,
    pub phase: SweepPhase,
    pub mode: Option<SweepMode>,
    pub current_task: String,
    pub progress: u8,
    pub last_update: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SweepStatus {
    pub fn is_running(&self) -> bool {
        self.phase == SweepPhase::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: String,
}
