//! Knowledge-base ingestion
//!
//! Best-effort plain-text extraction from files dropped into a knowledge
//! directory. Unreadable or unsupported files are skipped.

use calamine::{open_workbook_auto, Data, Reader};
use quick_xml::events::Event;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_PATTERNS: &[&str] = &["*.txt", "*.md", "*.csv", "*.xlsx", "*.xls", "*.docx"];

/// Reads one knowledge file. `None` when the file is unreadable or its
/// format is not supported.
pub fn extract_text(path: &Path) -> Option<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" => std::fs::read_to_string(path).ok(),
        "csv" => extract_csv(path),
        "xlsx" | "xls" => extract_workbook(path),
        "docx" => extract_docx(path),
        _ => None,
    }
}

fn extract_csv(path: &Path) -> Option<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .ok()?;
    let mut lines = Vec::new();
    for record in reader.records() {
        let record = record.ok()?;
        lines.push(record.iter().collect::<Vec<_>>().join("\t"));
    }
    Some(lines.join("\n"))
}

fn extract_workbook(path: &Path) -> Option<String> {
    let mut workbook = open_workbook_auto(path).ok()?;
    let mut lines = Vec::new();
    for (_, range) in workbook.worksheets() {
        for row in range.rows() {
            let cells: Vec<String> = row
                .iter()
                .map(|cell| match cell {
                    Data::Empty => String::new(),
                    other => other.to_string(),
                })
                .collect();
            lines.push(cells.join("\t"));
        }
    }
    Some(lines.join("\n"))
}

fn extract_docx(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .ok()?
        .read_to_string(&mut xml)
        .ok()?;
    docx_paragraphs(&xml).map(|paragraphs| paragraphs.join("\n"))
}

/// Text of each `<w:p>` paragraph in a WordprocessingML body.
fn docx_paragraphs(xml: &str) -> Option<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:p" => paragraphs.push(String::new()),
            Ok(Event::Text(t)) if in_text => current.push_str(&t.unescape().ok()?),
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }
    Some(paragraphs)
}

/// Extracted texts of all files in `dir` matching the comma-separated
/// `patterns` (defaults to `DEFAULT_PATTERNS`). Blank results are dropped.
pub fn load_docs_from_dir(dir: &Path, patterns: Option<&str>) -> Vec<String> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut pats: Vec<String> = patterns
        .map(|p| {
            p.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if pats.is_empty() {
        pats = DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect();
    }

    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut texts = Vec::new();

    for pat in &pats {
        let full = format!("{}/{}", base.trim_end_matches('/'), pat);
        let paths = match glob::glob(&full) {
            Ok(paths) => paths,
            Err(e) => {
                debug!("Skipping invalid knowledge pattern '{}': {}", pat, e);
                continue;
            }
        };
        for path in paths.flatten() {
            if !seen.insert(path.clone()) {
                continue;
            }
            match extract_text(&path) {
                Some(text) if !text.trim().is_empty() => texts.push(text),
                _ => debug!("No text extracted from {}", path.display()),
            }
        }
    }

    info!("Loaded {} knowledge documents from {}", texts.len(), dir.display());
    texts
}
