//! Output workbook for a completed job.
//!
//! Writes a minimal Office Open XML spreadsheet: one sheet, inline strings,
//! a header row, then one line per exported row with the client's
//! enrichment alongside.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use quick_xml::escape::escape;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::records::ClientRecord;
use crate::worker::job::{Artifact, JobId, JobKind};

pub const STATUS_COLUMN: &str = "record_status";

const SHEET_NAME: &str = "Client Notes";

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to write artifact '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build workbook: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// `{output_dir}/{job_id}/{kind}_{YYYYmmdd_HHMMSS}.xlsx`
pub fn artifact_path(output_dir: &Path, job_id: JobId, kind: JobKind, at: NaiveDateTime) -> PathBuf {
    output_dir
        .join(job_id.to_string())
        .join(format!("{}_{}.xlsx", kind.as_str(), at.format("%Y%m%d_%H%M%S")))
}

/// Writes the workbook to `path`. The file only appears under its final
/// name once complete.
pub fn write_workbook(path: &Path, records: &[ClientRecord]) -> Result<Artifact, ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let partial = path.with_extension("xlsx.part");
    let written = write_parts(&partial, records)
        .and_then(|()| fs::rename(&partial, path).map_err(io_err));
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&partial) {
            log::debug!("No partial artifact to remove at {}: {}", partial.display(), cleanup);
        }
        return Err(e);
    }
    let size_bytes = fs::metadata(path).map_err(io_err)?.len();

    log::info!(
        "Wrote artifact {} ({} clients, {} bytes)",
        path.display(),
        records.len(),
        size_bytes
    );

    Ok(Artifact {
        path: path.to_path_buf(),
        size_bytes,
    })
}

fn write_parts(partial: &Path, records: &[ClientRecord]) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: partial.to_path_buf(),
        source,
    };

    let file = File::create(partial).map_err(io_err)?;
    let mut zip = ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let parts = [
        ("[Content_Types].xml", CONTENT_TYPES.to_string()),
        ("_rels/.rels", ROOT_RELS.to_string()),
        ("xl/workbook.xml", workbook_xml()),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.to_string()),
        ("xl/worksheets/sheet1.xml", sheet_xml(records)),
    ];
    for (name, content) in parts {
        zip.start_file(name, options)?;
        zip.write_all(content.as_bytes()).map_err(io_err)?;
    }
    zip.finish()?;
    Ok(())
}

fn workbook_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        escape(SHEET_NAME)
    )
}

/// Header plus body rows: raw columns, enrichment columns, status.
fn table(records: &[ClientRecord]) -> Vec<Vec<String>> {
    let raw_columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.rows.iter())
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let enrichment_columns: BTreeSet<&str> = records
        .iter()
        .filter_map(|r| r.enrichment.as_ref())
        .flat_map(|fields| fields.keys().map(String::as_str))
        .collect();

    let mut header: Vec<String> = raw_columns.iter().map(|c| c.to_string()).collect();
    header.extend(enrichment_columns.iter().map(|c| c.to_string()));
    header.push(STATUS_COLUMN.to_string());

    let mut lines = vec![header];
    for record in records {
        for row in &record.rows {
            let mut line: Vec<String> = raw_columns
                .iter()
                .map(|c| row.get(*c).cloned().unwrap_or_default())
                .collect();
            line.extend(enrichment_columns.iter().map(|c| {
                record
                    .enrichment
                    .as_ref()
                    .and_then(|fields| fields.get(*c))
                    .cloned()
                    .unwrap_or_default()
            }));
            line.push(record.status.as_str().to_string());
            lines.push(line);
        }
    }
    lines
}

fn sheet_xml(records: &[ClientRecord]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );

    for (row_idx, line) in table(records).iter().enumerate() {
        let row_num = row_idx + 1;
        xml.push_str(&format!(r#"<row r="{}">"#, row_num));
        for (col_idx, value) in line.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            xml.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                column_letters(col_idx),
                row_num,
                escape(value.as_str())
            ));
        }
        xml.push_str("</row>");
    }

    xml.push_str("</sheetData></worksheet>");
    xml
}

/// Spreadsheet column name for a 0-based index: A..Z, AA..ZZ, AAA...
fn column_letters(mut idx: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (idx % 26) as u8);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}
