//! Client records: conversion of the raw export and per-record state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FIRST_NAME_COLUMN: &str = "First Name";
pub const LAST_NAME_COLUMN: &str = "Last Name";

/// Marker the remote appends to last names of case-managed clients.
const ECM_SUFFIX: &str = " ECM";

static RE_ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());
static RE_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<t[hd][^>]*>(.*?)</t[hd]>").unwrap());
static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static RE_TABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<table[\s>]").unwrap());

/// Column name to cell value.
pub type Fields = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("export is not valid UTF-8 text")]
    NotText,

    #[error("unrecognized export format (expected a JSON array or an HTML table)")]
    UnknownFormat,

    #[error("malformed JSON export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("export row {row} is not an object")]
    RowNotObject { row: usize },

    #[error("export is missing required column '{0}'")]
    MissingColumn(&'static str),
}

/// Natural key used to find a client in the remote system.
///
/// Built from the separate first/last name columns; a combined full name
/// is never split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub first: String,
    pub last: String,
    /// Last name as exported, before marker stripping.
    pub original_last: String,
}

impl RecordIdentity {
    /// Returns `None` when either name is blank.
    pub fn new(first: &str, last: &str) -> Option<Self> {
        let first = clean_name(first)?;
        let original_last = clean_name(last)?;
        let last = original_last
            .strip_suffix(ECM_SUFFIX)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|| original_last.clone());
        if last.is_empty() {
            return None;
        }
        Some(Self {
            first,
            last,
            original_last,
        })
    }

    /// `Last, First`, the form the remote search box expects.
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last, self.first)
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.last, self.first)
    }
}

fn clean_name(raw: &str) -> Option<String> {
    let cleaned = decode_entities(raw);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Enriched,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Enriched => "enriched",
            RecordStatus::Failed => "failed",
        }
    }
}

/// One client to enrich, with every exported row that belongs to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub identity: RecordIdentity,
    pub rows: Vec<Fields>,
    pub enrichment: Option<Fields>,
    pub status: RecordStatus,
    pub failure: Option<String>,
}

impl ClientRecord {
    fn new(identity: RecordIdentity) -> Self {
        Self {
            identity,
            rows: Vec::new(),
            enrichment: None,
            status: RecordStatus::Pending,
            failure: None,
        }
    }

    pub fn enrich(&mut self, fields: Fields) {
        self.enrichment = Some(fields);
        self.status = RecordStatus::Enriched;
        self.failure = None;
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = RecordStatus::Failed;
        self.failure = Some(reason.to_string());
    }
}

/// Converts a raw export into records, one per distinct client, sorted by
/// `Last, First`.
///
/// Accepts a JSON array of objects or an HTML table (the remote's
/// spreadsheet export is HTML in disguise). Rows without a usable name are
/// skipped. Shape errors are never retried by the caller.
pub fn parse_export(bytes: &[u8]) -> Result<Vec<ClientRecord>, ConvertError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ConvertError::NotText)?;
    let text = text.trim_start_matches('\u{feff}').trim();

    let rows = if text.starts_with('[') {
        parse_json_rows(text)?
    } else if RE_TABLE.is_match(text) {
        parse_html_rows(text)
    } else {
        return Err(ConvertError::UnknownFormat);
    };

    group_rows(rows)
}

fn parse_json_rows(text: &str) -> Result<Vec<Fields>, ConvertError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(text)?;
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| match value {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| (key, json_cell(value)))
                .collect()),
            _ => Err(ConvertError::RowNotObject { row: idx }),
        })
        .collect()
}

fn json_cell(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn parse_html_rows(text: &str) -> Vec<Fields> {
    let mut rows = RE_ROW.captures_iter(text).map(|row| {
        RE_CELL
            .captures_iter(&row[1])
            .map(|cell| {
                let stripped = RE_TAG.replace_all(&cell[1], "");
                decode_entities(&stripped).trim().to_string()
            })
            .collect::<Vec<_>>()
    });

    let Some(headers) = rows.next() else {
        return Vec::new();
    };

    rows.filter(|cells| cells.iter().any(|c| !c.is_empty()))
        .map(|cells| {
            headers
                .iter()
                .cloned()
                .zip(cells.into_iter().chain(std::iter::repeat(String::new())))
                .collect()
        })
        .collect()
}

fn group_rows(rows: Vec<Fields>) -> Result<Vec<ClientRecord>, ConvertError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    for column in [FIRST_NAME_COLUMN, LAST_NAME_COLUMN] {
        if !rows.iter().any(|row| row.contains_key(column)) {
            return Err(ConvertError::MissingColumn(column));
        }
    }

    let mut by_name: BTreeMap<String, ClientRecord> = BTreeMap::new();
    let mut skipped = 0usize;

    for row in rows {
        let first = row.get(FIRST_NAME_COLUMN).map(String::as_str).unwrap_or("");
        let last = row.get(LAST_NAME_COLUMN).map(String::as_str).unwrap_or("");
        let Some(identity) = RecordIdentity::new(first, last) else {
            skipped += 1;
            continue;
        };
        by_name
            .entry(identity.display_name())
            .or_insert_with(|| ClientRecord::new(identity))
            .rows
            .push(row);
    }

    if skipped > 0 {
        log::debug!("Skipped {} export rows without a client name", skipped);
    }

    Ok(by_name.into_values().collect())
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
