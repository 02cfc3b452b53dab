//! Core domain model for the business registry crawler.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bizreg-core";

/// Placeholder written to files for a field that could not be extracted.
pub const NOT_FOUND: &str = "not found";

/// Registry-assigned company identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub u64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid company id {0:?}")]
pub struct InvalidCompanyId(pub String);

impl FromStr for CompanyId {
    type Err = InvalidCompanyId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(CompanyId)
            .map_err(|_| InvalidCompanyId(s.to_string()))
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracted text for an agent or owner, or a typed marker that the page had none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldValue {
    Found(String),
    Absent,
}

impl FieldValue {
    /// Wraps extracted text; blank text counts as absent.
    pub fn from_extracted(text: Option<&str>) -> Self {
        match text.map(str::trim) {
            Some(t) if !t.is_empty() && !is_sentinel(t) => FieldValue::Found(t.to_string()),
            _ => FieldValue::Absent,
        }
    }

    pub fn as_found(&self) -> Option<&str> {
        match self {
            FieldValue::Found(text) => Some(text),
            FieldValue::Absent => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, FieldValue::Found(_))
    }

    /// Drops everything from the first line break on, which strips the
    /// address lines the registry appends after a name.
    pub fn first_line(&self) -> Self {
        match self {
            FieldValue::Found(text) => FieldValue::from_extracted(Some(truncate_at_line_break(text))),
            FieldValue::Absent => FieldValue::Absent,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::from_extracted(Some(&value))
    }
}

impl From<FieldValue> for String {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Found(text) => text,
            FieldValue::Absent => NOT_FOUND.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Found(text) => f.write_str(text),
            FieldValue::Absent => f.write_str(NOT_FOUND),
        }
    }
}

/// Older exports spelled the sentinel "Not Found" and "Not found".
fn is_sentinel(text: &str) -> bool {
    text.eq_ignore_ascii_case(NOT_FOUND)
}

pub fn truncate_at_line_break(text: &str) -> &str {
    match text.find(['\r', '\n']) {
        Some(idx) => &text[..idx],
        None => text,
    }
}

/// One row of the registry search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyListing {
    pub id: CompanyId,
    pub name: String,
}

/// Agent and owner text pulled from one filing detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyDetail {
    pub id: CompanyId,
    pub source_url: String,
    pub agent: FieldValue,
    pub owner: FieldValue,
}

/// Listing joined with its detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: CompanyId,
    pub name: String,
    pub agent: FieldValue,
    pub owner: FieldValue,
}
