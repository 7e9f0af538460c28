use crate::error::AtmarkError;
use crate::interp::DEFAULT_PREFIX;
use crate::value::Value;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENSIONS: &[&str] = &[".atm"];

/// One scanned template document and the significators it declares.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub filename: PathBuf,
    pub significators: BTreeMap<String, Value>,
}

/// Harvests `@%key value` significator lines from a hierarchy of template
/// files without expanding them, so surrounding tooling can discover
/// template-declared metadata cheaply.
pub struct Processor {
    pattern: Regex,
    documents: BTreeMap<String, Document>,
}

impl Processor {
    pub fn new(prefix: char) -> Result<Self, AtmarkError> {
        let pattern = Regex::new(&format!(
            r"{}%(\S+)[ \t]*(.*?)[ \t]*$",
            regex::escape(&prefix.to_string())
        ))
        .map_err(|error| AtmarkError::setup(format!("bad significator pattern: {}", error)))?;
        Ok(Self {
            pattern,
            documents: BTreeMap::new(),
        })
    }

    pub fn with_default_prefix() -> Result<Self, AtmarkError> {
        Self::new(DEFAULT_PREFIX)
    }

    pub fn documents(&self) -> &BTreeMap<String, Document> {
        &self.documents
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }

    /// Recursively scan a directory for template files with one of the
    /// given extensions.
    pub fn scan(&mut self, base: &Path, extensions: &[&str]) -> Result<(), AtmarkError> {
        let mut entries: Vec<PathBuf> = fs::read_dir(base)
            .map_err(AtmarkError::io)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                self.scan(&path, extensions)?;
            } else if extensions
                .iter()
                .any(|ext| path.to_string_lossy().ends_with(ext))
            {
                self.scan_file(&path)?;
            }
        }
        Ok(())
    }

    /// Scan a single template file for significator lines.
    pub fn scan_file(&mut self, path: &Path) -> Result<(), AtmarkError> {
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let mut document = Document {
            id: id.clone(),
            filename: path.to_path_buf(),
            significators: BTreeMap::new(),
        };
        let file = fs::File::open(path).map_err(AtmarkError::io)?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line.map_err(AtmarkError::io)?;
            self.line(&mut document, &line);
        }
        self.documents.insert(id, document);
        Ok(())
    }

    fn line(&self, document: &mut Document, line: &str) {
        if let Some(captures) = self.pattern.captures(line) {
            let key = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let value = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
            if !key.is_empty() {
                document
                    .significators
                    .insert(key.to_string(), parse_literal(value));
            }
        }
    }
}

/// Parse a significator value as a plain literal.  Anything that is not a
/// recognizable literal is kept as its raw text; full evaluation is the
/// interpreter's job, not the harvester's.
fn parse_literal(text: &str) -> Value {
    let text = text.trim();
    if text.is_empty() {
        return Value::Nil;
    }
    match text {
        "nil" => return Value::Nil,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(value) = text.parse::<i64>() {
        return Value::Int(value);
    }
    if let Ok(value) = text.parse::<f64>() {
        return Value::Double(value);
    }
    let quoted = (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
        || (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2);
    if quoted {
        return Value::String(text[1..text.len() - 1].to_string());
    }
    Value::String(text.to_string())
}
