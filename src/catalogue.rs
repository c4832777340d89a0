//! Per-chunk catalogues
//!
//! Every chunk that has not been burnt carries a `_META` directory listing the
//! whole archive, so any single disc tells where every other file went:
//!
//! - `catalogue.json`: array of `{path, chunk_id, hash, size}`
//! - `catalogue.csv`: the same rows with a header line
//! - `catalogue.html`: a table with this chunk's own files highlighted
//!
//! Catalogues are derived data. They are regenerated after every command that
//! changes the layout and never read back. Burnt chunks keep the catalogue
//! they were written with.

use crate::error::{ArchiveError, Result};
use crate::layout::Layout;
use crate::metadata::ArchiveMetadata;
use crate::types::{ChunkId, FileRecord, ItemFailure};
use crate::utils::atomic_write;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// One catalogue row
#[derive(Debug, Serialize)]
pub struct CatalogueEntry<'a> {
    /// Source path
    pub path: &'a Path,
    /// Chunk holding the file
    pub chunk_id: ChunkId,
    /// Content hash, if known
    pub hash: Option<&'a str>,
    /// Size in bytes
    pub size: u64,
}

impl<'a> From<&'a FileRecord> for CatalogueEntry<'a> {
    fn from(record: &'a FileRecord) -> Self {
        Self {
            path: &record.path,
            chunk_id: record.chunk_id,
            hash: record.hash.as_deref(),
            size: record.size,
        }
    }
}

/// Chunks that received catalogues
#[derive(Debug, Clone, Default)]
pub struct CatalogueReport {
    /// Chunks written
    pub written: Vec<ChunkId>,
    /// Chunks whose catalogue could not be written
    pub failures: Vec<ItemFailure>,
}

/// Write catalogues into every unburnt chunk
pub fn write_catalogues(layout: &Layout, metadata: &ArchiveMetadata) -> Result<CatalogueReport> {
    let entries: Vec<CatalogueEntry<'_>> = metadata.files.iter().map(CatalogueEntry::from).collect();
    let json = serde_json::to_string_pretty(&entries)?;
    let csv = render_csv(&entries);

    let mut report = CatalogueReport::default();
    for chunk in metadata.chunks.iter().filter(|c| !c.burnt) {
        let dir = layout.meta_dir(chunk.id);
        let html = render_html(&entries, chunk.id);
        let written = fs::create_dir_all(&dir)
            .map_err(ArchiveError::from)
            .and_then(|_| atomic_write(&dir.join("catalogue.json"), json.as_bytes()))
            .and_then(|_| atomic_write(&dir.join("catalogue.csv"), csv.as_bytes()))
            .and_then(|_| atomic_write(&dir.join("catalogue.html"), html.as_bytes()));

        match written {
            Ok(()) => report.written.push(chunk.id),
            Err(e) => {
                warn!("Failed to write catalogue for chunk {}: {}", chunk.id, e);
                report.failures.push(ItemFailure::new(dir, e));
            }
        }
    }

    debug!(
        "Wrote catalogues ({} entries) into {} chunks",
        entries.len(),
        report.written.len()
    );
    Ok(report)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render rows as CSV with a header line
pub fn render_csv(entries: &[CatalogueEntry<'_>]) -> String {
    let mut out = String::from("Path,Chunk,SHA-256,Size (bytes)\n");
    for entry in entries {
        let _ = writeln!(
            out,
            "{},{},{},{}",
            csv_field(&entry.path.to_string_lossy()),
            entry.chunk_id,
            entry.hash.unwrap_or(""),
            entry.size
        );
    }
    out
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render rows as an HTML table, highlighting the files of `chunk_id`
pub fn render_html(entries: &[CatalogueEntry<'_>], chunk_id: ChunkId) -> String {
    let mut rows = String::new();
    for entry in entries {
        let class = if entry.chunk_id == chunk_id {
            " class=\"in-chunk\""
        } else {
            ""
        };
        let _ = writeln!(
            rows,
            "      <tr{}><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            class,
            html_escape(&entry.path.to_string_lossy()),
            entry.chunk_id,
            entry.hash.unwrap_or(""),
            entry.size
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <title>Chunk {id} Catalogue</title>
    <style>
      body {{ font-family: sans-serif; }}
      table {{ border-collapse: collapse; width: 100%; }}
      th, td {{ border: 1px solid #444; padding: 4px 8px; text-align: left; }}
      tr.in-chunk {{ background-color: #ffffcc; }}
    </style>
  </head>
  <body>
    <h1>Chunk {id} Catalogue</h1>
    <table>
      <tr><th>Path</th><th>Chunk</th><th>SHA-256</th><th>Size (bytes)</th></tr>
{rows}    </table>
  </body>
</html>
"#,
        id = chunk_id,
        rows = rows
    )
}
