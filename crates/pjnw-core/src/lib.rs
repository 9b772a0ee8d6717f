//! Core domain model for pjn-watch: identities, scraped records and their document keys.

use std::collections::BTreeMap;
use std::fmt;

use askama_escape::{escape, Html};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pjnw-core";

/// Sentinel used in document keys when a record has no parseable event date.
pub const UNKNOWN_DATE: &str = "unknown_date";

/// Sentinel returned by [`normalize_case_ref`] for empty input.
pub const UNKNOWN_CASE: &str = "unknown_causa";

/// Kind label used when the portal leaves the type cell empty.
pub const UNKNOWN_KIND: &str = "DESCONOCIDO";

/// Credentials and display name for one portal user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: String,
    pub secret: String,
    pub display_name: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Resolved identity table, keyed by the opaque user key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityTable {
    identities: BTreeMap<String, Identity>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Identity) {
        self.identities.insert(identity.key.clone(), identity);
    }

    pub fn get(&self, key: &str) -> Option<&Identity> {
        self.identities.get(key)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }
}

impl FromIterator<Identity> for IdentityTable {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        let mut table = Self::new();
        for identity in iter {
            table.insert(identity);
        }
        table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Novedad,
    Notificacion,
    Unknown(String),
}

impl RecordKind {
    /// Maps the portal's type cell (`d`, `n`, anything else) to a kind.
    pub fn from_type_code(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("d") {
            Self::Novedad
        } else if raw.eq_ignore_ascii_case("n") {
            Self::Notificacion
        } else if raw.is_empty() {
            Self::Unknown(UNKNOWN_KIND.to_string())
        } else {
            Self::Unknown(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Novedad => "NOVEDAD",
            Self::Notificacion => "NOTIFICACION",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One case-update notification ready for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub subject: String,
    pub kind: RecordKind,
    pub case_ref: String,
    pub title: String,
    pub event_date: Option<NaiveDate>,
    pub link: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub accepted: bool,
    pub filed: bool,
    pub summary: String,
}

impl Record {
    /// Builds a freshly scraped record with the operator fields at their defaults.
    pub fn scraped(
        subject: impl Into<String>,
        kind: RecordKind,
        case_ref: impl Into<String>,
        title: impl Into<String>,
        event_date: Option<NaiveDate>,
        link: Option<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            kind,
            case_ref: case_ref.into(),
            title: title.into(),
            event_date,
            link,
            scraped_at,
            accepted: false,
            filed: false,
            summary: String::new(),
        }
    }

    /// Key over the unescaped text, so it matches keys written from the raw portal values.
    pub fn document_key(&self) -> DocumentKey {
        let kind = match &self.kind {
            RecordKind::Unknown(raw) => RecordKind::Unknown(unescape_markup(raw)),
            known => known.clone(),
        };
        DocumentKey::new(
            &unescape_markup(&self.subject),
            &kind,
            self.event_date,
            &unescape_markup(&self.case_ref),
        )
    }
}

/// Deterministic document identity derived from subject, kind, event date and case reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(
        subject: &str,
        kind: &RecordKind,
        event_date: Option<NaiveDate>,
        case_ref: &str,
    ) -> Self {
        let date = event_date
            .map(|d| d.format("%d-%m-%Y").to_string())
            .unwrap_or_else(|| UNKNOWN_DATE.to_string());
        let raw = format!(
            "{}_{}_{}_{}",
            subject,
            kind.as_str(),
            date,
            normalize_case_ref(case_ref)
        );
        Self(raw.replace(' ', "_").to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a case reference for use inside document keys.
pub fn normalize_case_ref(case_ref: &str) -> String {
    let normalized = case_ref
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '/' || c == '-' { '_' } else { c })
        .collect::<String>()
        .to_lowercase();
    if normalized.is_empty() {
        UNKNOWN_CASE.to_string()
    } else {
        normalized
    }
}

/// HTML-escapes text scraped from the portal before it is persisted.
pub fn escape_markup(text: &str) -> String {
    escape(text, Html).to_string()
}

const MARKUP_ENTITIES: [(&str, char); 8] = [
    ("&amp;", '&'),
    ("&lt;", '<'),
    ("&gt;", '>'),
    ("&quot;", '"'),
    ("&#x27;", '\''),
    ("&#39;", '\''),
    ("&#x2f;", '/'),
    ("&#47;", '/'),
];

/// Inverse of [`escape_markup`]. Unknown entities are left as they are.
pub fn unescape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find('&') {
        out.push_str(&rest[..at]);
        rest = &rest[at..];
        match MARKUP_ENTITIES
            .iter()
            .find(|(entity, _)| rest.starts_with(entity))
        {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &rest[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
