//! Text extraction over a closed set of document kinds.
//!
//! [`DocumentKind::classify`] maps a declared MIME type (falling back to the
//! display name's extension) onto one of four kinds, and [`extract`]
//! dispatches on it:
//!
//! | Kind | Handling |
//! |------|----------|
//! | `PlainText` | decoded as-is |
//! | `StructuredText` | decoded as-is (JSON, XML, CSV, YAML, TOML) |
//! | `PaginatedDocument` | PDF via `pdf-extract`, OOXML via `zip` + `quick-xml` |
//! | `Unsupported` | not extractable |
//!
//! Every failure ends as [`Extraction::NotExtractable`]; extraction never
//! errors, and a file that cannot be extracted stays stored, just unindexed.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Trimmed text shorter than this is not worth indexing.
pub const MIN_EXTRACTED_CHARS: usize = 50;

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from one ZIP entry (zip-bomb bound).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Share of printable bytes required before trying a single-byte decode.
const MIN_PRINTABLE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatedFormat {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    StructuredText,
    PaginatedDocument(PaginatedFormat),
    Unsupported,
}

/// Outcome of extraction. `NotExtractable` is expected, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    NotExtractable(String),
}

#[derive(Debug, Error)]
enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

impl DocumentKind {
    /// Classify by declared type, using the extension of `display_name`
    /// when the type is missing or generic.
    pub fn classify(declared_type: &str, display_name: &str) -> Self {
        let mime = declared_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if let Some(kind) = classify_mime(&mime) {
            return kind;
        }
        let ext = display_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        classify_extension(&ext).unwrap_or(DocumentKind::Unsupported)
    }
}

fn classify_mime(mime: &str) -> Option<DocumentKind> {
    let kind = match mime {
        "application/json" | "application/xml" | "text/xml" | "text/csv"
        | "application/yaml" | "application/x-yaml" | "text/yaml" | "application/toml" => {
            DocumentKind::StructuredText
        }
        MIME_PDF => DocumentKind::PaginatedDocument(PaginatedFormat::Pdf),
        MIME_DOCX => DocumentKind::PaginatedDocument(PaginatedFormat::Docx),
        MIME_PPTX => DocumentKind::PaginatedDocument(PaginatedFormat::Pptx),
        MIME_XLSX => DocumentKind::PaginatedDocument(PaginatedFormat::Xlsx),
        m if m.starts_with("text/") => DocumentKind::PlainText,
        _ => return None,
    };
    Some(kind)
}

fn classify_extension(ext: &str) -> Option<DocumentKind> {
    let kind = match ext {
        "txt" | "md" | "markdown" | "rst" | "log" => DocumentKind::PlainText,
        "json" | "xml" | "csv" | "yaml" | "yml" | "toml" => DocumentKind::StructuredText,
        "pdf" => DocumentKind::PaginatedDocument(PaginatedFormat::Pdf),
        "docx" => DocumentKind::PaginatedDocument(PaginatedFormat::Docx),
        "pptx" => DocumentKind::PaginatedDocument(PaginatedFormat::Pptx),
        "xlsx" => DocumentKind::PaginatedDocument(PaginatedFormat::Xlsx),
        _ => return None,
    };
    Some(kind)
}

/// Best-effort MIME type for a file name, for callers that have none.
pub fn guess_declared_type(display_name: &str) -> &'static str {
    let ext = display_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "rst" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "html" | "htm" => "text/html",
        "pdf" => MIME_PDF,
        "docx" => MIME_DOCX,
        "pptx" => MIME_PPTX,
        "xlsx" => MIME_XLSX,
        _ => MIME_OCTET_STREAM,
    }
}

/// Pluggable extraction, so the orchestrator can be driven with fakes.
pub trait Extractor: Send + Sync {
    fn extract(&self, bytes: &[u8], declared_type: &str, display_name: &str) -> Extraction;
}

/// The built-in extractor over [`DocumentKind`].
#[derive(Debug, Clone, Default)]
pub struct DefaultExtractor;

impl Extractor for DefaultExtractor {
    fn extract(&self, bytes: &[u8], declared_type: &str, display_name: &str) -> Extraction {
        extract(bytes, declared_type, display_name)
    }
}

/// Extract plain text from stored bytes.
pub fn extract(bytes: &[u8], declared_type: &str, display_name: &str) -> Extraction {
    let kind = DocumentKind::classify(declared_type, display_name);
    let text = match kind {
        DocumentKind::PlainText | DocumentKind::StructuredText => match decode_text(bytes) {
            Some(text) => text,
            None => return Extraction::NotExtractable("undecodable text".to_string()),
        },
        DocumentKind::PaginatedDocument(format) => {
            let result = match format {
                PaginatedFormat::Pdf => extract_pdf(bytes),
                PaginatedFormat::Docx => extract_docx(bytes),
                PaginatedFormat::Pptx => extract_pptx(bytes),
                PaginatedFormat::Xlsx => extract_xlsx(bytes),
            };
            match result {
                Ok(text) => text,
                Err(e) => return Extraction::NotExtractable(e.to_string()),
            }
        }
        DocumentKind::Unsupported => {
            return Extraction::NotExtractable(format!(
                "unsupported type: {}",
                if declared_type.is_empty() {
                    MIME_OCTET_STREAM
                } else {
                    declared_type
                }
            ))
        }
    };

    if text.trim().chars().count() < MIN_EXTRACTED_CHARS {
        return Extraction::NotExtractable("insufficient text".to_string());
    }
    Extraction::Text(text)
}

/// Decode bytes as text: UTF-8 (BOM stripped), UTF-16 by BOM, then
/// windows-1252 if the bytes look textual. `None` for binary data.
pub fn decode_text(bytes: &[u8]) -> Option<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return std::str::from_utf8(rest).ok().map(str::to_string);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }

    if bytes.contains(&0) {
        return None;
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some(text.to_string());
    }

    let printable = bytes
        .iter()
        .filter(|&&b| {
            matches!(b, b'\t' | b'\n' | b'\r') || windows_1252(b).is_some_and(|c| !c.is_control())
        })
        .count();
    if (printable as f64) < MIN_PRINTABLE_RATIO * bytes.len() as f64 {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|&b| windows_1252(b).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    )
}

/// windows-1252 byte to char. The C1 range maps to typographic
/// punctuation; 0x81, 0x8D, 0x8F, 0x90 and 0x9D are undefined.
fn windows_1252(byte: u8) -> Option<char> {
    let c = match byte {
        0x80 => '\u{20AC}',
        0x82 => '\u{201A}',
        0x83 => '\u{0192}',
        0x84 => '\u{201E}',
        0x85 => '\u{2026}',
        0x86 => '\u{2020}',
        0x87 => '\u{2021}',
        0x88 => '\u{02C6}',
        0x89 => '\u{2030}',
        0x8A => '\u{0160}',
        0x8B => '\u{2039}',
        0x8C => '\u{0152}',
        0x8E => '\u{017D}',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '\u{2022}',
        0x96 => '\u{2013}',
        0x97 => '\u{2014}',
        0x98 => '\u{02DC}',
        0x99 => '\u{2122}',
        0x9A => '\u{0161}',
        0x9B => '\u{203A}',
        0x9C => '\u{0153}',
        0x9E => '\u{017E}',
        0x9F => '\u{0178}',
        0x81 | 0x8D | 0x8F | 0x90 | 0x9D => return None,
        _ => byte as char,
    };
    Some(c)
}

fn decode_utf16(bytes: &[u8], read: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|p| read([p[0], p[1]])).collect();
    String::from_utf16(&units).ok()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_elements(&xml, " ")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut out = String::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_elements(&xml, " ")?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// Concatenate the text of every `<*:t>` element.
fn collect_text_elements(xml: &[u8], separator: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut parts: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_t = false,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().unwrap_or_default();
                if !text.is_empty() {
                    parts.push(text.into_owned());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(parts.join(separator))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let has_shared = archive.file_names().any(|n| n == "xl/sharedStrings.xml");
    let shared_strings = if has_shared {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared_strings)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n"))
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Text of a worksheet's cells: shared strings resolved, inline values kept.
fn sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if value.is_empty() {
                    // nothing
                } else if shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(s.clone());
                    }
                } else {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
