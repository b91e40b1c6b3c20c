//! Format parser dispatch.
//!
//! Converts a materialized file to plain UTF-8 text. The strategy is picked
//! by file extension from an [`ExtractorRegistry`]; the set of formats is
//! closed, so an unregistered extension is a hard
//! [`SpiderError::UnsupportedFormat`] rather than a silent skip.
//!
//! | Extension | Strategy |
//! |-----------|----------|
//! | `doc`  | external `antiword -f` subprocess |
//! | `pdf`  | per-page extraction with `lopdf`, unreadable pages skipped |
//! | `xlsx` | OOXML sheets read with `zip` + `quick-xml`, rendered as tables |

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ParsingConfig;
use crate::error::{Result, SpiderError};
use crate::models::FileRecord;
use crate::stats::RunStats;

/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum sheets to render from one workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Columns in a worksheet (`A` through `XFD`).
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Table slots, filled or padding, allowed per sheet.
const XLSX_MAX_SLOTS_PER_SHEET: usize = 1_000_000;

/// Capability to turn the file at `path` into plain text.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String>;
}

/// Extension → extractor table.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `doc`, `pdf` and `xlsx` strategies.
    pub fn with_defaults(config: &ParsingConfig) -> Self {
        let mut registry = Self::new();
        registry.register("doc", Arc::new(DocExtractor::new(&config.antiword_bin)));
        registry.register("pdf", Arc::new(PdfExtractor));
        registry.register("xlsx", Arc::new(XlsxExtractor));
        registry
    }

    /// Add or replace the strategy for `extension` (matched lowercased).
    pub fn register(&mut self, extension: &str, extractor: Arc<dyn Extractor>) {
        self.extractors
            .insert(extension.to_ascii_lowercase(), extractor);
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.extractors.contains_key(&extension.to_ascii_lowercase())
    }

    /// Extract the text of `record` from `record.target_path`, recording
    /// `file.<name>.text_len` (and `parsed` when non-empty) in `stats`.
    pub async fn extract(&self, record: &FileRecord, stats: &mut RunStats) -> Result<String> {
        let extension = record.extension();
        let extractor = self.extractors.get(&extension).ok_or_else(|| {
            SpiderError::UnsupportedFormat {
                file: record.name.clone(),
                extension: extension.clone(),
            }
        })?;

        info!(file = %record.name, path = %record.target_path.display(), format = %extension, "parsing");
        let text = extractor.extract(&record.target_path).await?;

        let len = text.chars().count() as i64;
        stats.set(&["file", &record.name, "text_len"], len);
        if len > 0 {
            stats.set(&["file", &record.name, "parsed"], 1);
        }
        info!(file = %record.name, text_len = len, "parsed");
        Ok(text)
    }
}

fn extraction_error(path: &Path, reason: impl ToString) -> SpiderError {
    SpiderError::Extraction {
        file: path.display().to_string(),
        reason: reason.to_string(),
    }
}

// ---------------------------------------------------------------------------
// doc

/// Legacy Word documents through the `antiword` command-line tool.
pub struct DocExtractor {
    bin: String,
}

impl DocExtractor {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }
}

#[async_trait]
impl Extractor for DocExtractor {
    async fn extract(&self, path: &Path) -> Result<String> {
        let output = tokio::process::Command::new(&self.bin)
            .arg("-f")
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    extraction_error(path, format!("{} is required but not installed", self.bin))
                } else {
                    extraction_error(path, format!("failed to run {}: {}", self.bin, e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(extraction_error(
                path,
                format!("{} exited with {}: {}", self.bin, output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// pdf

/// A paged document whose pages can be read independently.
pub trait PageSource {
    /// Page numbers in document order, 1-based.
    fn page_numbers(&self) -> Vec<u32>;
    fn page_text(&self, page: u32) -> std::result::Result<String, String>;
}

impl PageSource for lopdf::Document {
    fn page_numbers(&self) -> Vec<u32> {
        self.get_pages().keys().copied().collect()
    }

    fn page_text(&self, page: u32) -> std::result::Result<String, String> {
        self.extract_text(&[page]).map_err(|e| e.to_string())
    }
}

/// Concatenate every readable page as `"Page N:\n{text}\n\n"`.
///
/// Pages that fail or yield no text contribute nothing.
pub fn join_pages(file: &str, source: &dyn PageSource) -> String {
    let mut out = String::new();
    for page in source.page_numbers() {
        match source.page_text(page) {
            Ok(text) if !text.trim().is_empty() => {
                out.push_str(&format!("Page {}:\n{}\n\n", page, text));
            }
            Ok(_) => {}
            Err(e) => warn!(file, page, error = %e, "skipping unreadable page"),
        }
    }
    out
}

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    async fn extract(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| extraction_error(path, e))?;
        let file = path.display().to_string();

        let text = tokio::task::spawn_blocking(move || {
            let doc = lopdf::Document::load_mem(&bytes).map_err(|e| e.to_string())?;
            Ok::<_, String>(join_pages(&file, &doc))
        })
        .await
        .map_err(|e| extraction_error(path, e))?
        .map_err(|e| extraction_error(path, e))?;

        if text.is_empty() {
            info!(path = %path.display(), "no text extracted from pdf");
        }
        Ok(text)
    }
}

// ---------------------------------------------------------------------------
// xlsx

/// OOXML workbooks: each sheet becomes `"Sheet: {name}\n{table}\n\n"`.
pub struct XlsxExtractor;

#[async_trait]
impl Extractor for XlsxExtractor {
    async fn extract(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| extraction_error(path, e))?;
        let text = tokio::task::spawn_blocking(move || xlsx_to_text(&bytes))
            .await
            .map_err(|e| extraction_error(path, e))?
            .map_err(|e| extraction_error(path, e))?;
        if text.is_empty() {
            return Err(extraction_error(path, "no text extracted from workbook"));
        }
        Ok(text)
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;
type XmlResult<T> = std::result::Result<T, String>;

/// Render every sheet of a workbook, in workbook order.
pub fn xlsx_to_text(bytes: &[u8]) -> XmlResult<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let shared = read_shared_strings(&mut archive)?;
    let sheets = list_sheets(&mut archive)?;

    let mut out = String::new();
    for (name, entry) in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &entry)?;
        let rows = read_sheet_rows(&xml, &shared)?;
        out.push_str(&format!("Sheet: {}\n", name));
        out.push_str(&render_table(&rows));
        out.push_str("\n\n");
    }
    Ok(out)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> XmlResult<Vec<u8>> {
    let entry = archive.by_name(name).map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        ));
    }
    Ok(out)
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Sheet display names paired with their ZIP entry, in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> XmlResult<Vec<(String, String)>> {
    use quick_xml::events::Event;

    let rels_xml = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels")?;
    let mut targets: HashMap<String, String> = HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(rels_xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr_value(&e, b"Id"), attr_value(&e, b"Target")) {
                    let entry = match target.strip_prefix('/') {
                        Some(abs) => abs.to_string(),
                        None => format!("xl/{}", target),
                    };
                    targets.insert(id, entry);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }

    let workbook_xml = read_zip_entry_bounded(archive, "xl/workbook.xml")?;
    let mut sheets = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(workbook_xml.as_slice());
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr_value(&e, b"name").unwrap_or_default();
                let entry = attr_value(&e, b"id").and_then(|rid| targets.get(&rid).cloned());
                match entry {
                    Some(entry) => sheets.push((name, entry)),
                    None => warn!(sheet = %name, "sheet has no worksheet part"),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// Shared string table; absent in workbooks without text cells.
fn read_shared_strings(archive: &mut Archive<'_>) -> XmlResult<Vec<String>> {
    use quick_xml::events::Event;

    if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Zero-based column index from a cell reference such as `"AB12"`.
/// `Ok(None)` when the reference has no column letters.
fn column_index(cell_ref: &str) -> XmlResult<Option<usize>> {
    let out_of_range = || format!("cell reference '{}' is beyond column XFD", cell_ref);
    let mut col = 0usize;
    let mut seen = false;
    for ch in cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()) {
        let digit = ch.to_ascii_uppercase() as usize - 'A' as usize + 1;
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add(digit))
            .filter(|c| *c <= XLSX_MAX_COLUMNS)
            .ok_or_else(out_of_range)?;
        seen = true;
    }
    Ok(seen.then(|| col - 1))
}

fn read_sheet_rows(xml: &[u8], shared: &[String]) -> XmlResult<Vec<Vec<String>>> {
    use quick_xml::events::Event;

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row: Vec<String> = Vec::new();
    let mut col = 0usize;
    let mut cell_type = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;
    let mut slots = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = Vec::new();
                    col = 0;
                }
                b"c" => {
                    col = match attr_value(&e, b"r") {
                        Some(r) => column_index(&r)?.unwrap_or(row.len()),
                        None => row.len(),
                    };
                    cell_type = attr_value(&e, b"t").unwrap_or_default();
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match cell_type.as_str() {
                        "s" => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        "b" => (if value.trim() == "1" { "TRUE" } else { "FALSE" }).to_string(),
                        _ => value.clone(),
                    };
                    if row.len() <= col {
                        slots += col + 1 - row.len();
                        if slots > XLSX_MAX_SLOTS_PER_SHEET {
                            return Err(format!(
                                "sheet exceeds {} table slots",
                                XLSX_MAX_SLOTS_PER_SHEET
                            ));
                        }
                        row.resize(col + 1, String::new());
                    }
                    row[col] = text;
                    cells += 1;
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            warn!(cells, "sheet truncated at cell limit");
            break;
        }
    }
    Ok(rows)
}

/// Right-aligned columns separated by a single space.
fn render_table(rows: &[Vec<String>]) -> String {
    let n_cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; n_cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            (0..n_cols)
                .map(|i| {
                    let cell = row.get(i).map(String::as_str).unwrap_or("");
                    format!("{:>width$}", cell, width = widths[i])
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
