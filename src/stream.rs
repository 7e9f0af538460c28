use crate::error::AtmarkError;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

/// The ultimate output target at the bottom of a stream's filter chain.
pub trait TextSink {
    fn write_str(&mut self, data: &str) -> Result<(), AtmarkError>;
    fn flush(&mut self) -> Result<(), AtmarkError>;
    fn close(&mut self) -> Result<(), AtmarkError>;
    /// Discard anything not yet committed.  Only meaningful for buffered
    /// file sinks; everything else ignores it.
    fn abort(&mut self) {}
}

/// A sink that discards everything.
pub struct NullSink;

impl TextSink for NullSink {
    fn write_str(&mut self, _data: &str) -> Result<(), AtmarkError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AtmarkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), AtmarkError> {
        Ok(())
    }
}

/// A sink over a shared in-memory buffer; used to capture nested
/// expansions.
pub struct StringSink {
    buffer: Rc<RefCell<String>>,
}

impl StringSink {
    pub fn new() -> Self {
        Self {
            buffer: Rc::new(RefCell::new(String::new())),
        }
    }

    /// A handle onto the captured text, shared with the sink.
    pub fn handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.buffer)
    }
}

impl Default for StringSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSink for StringSink {
    fn write_str(&mut self, data: &str) -> Result<(), AtmarkError> {
        self.buffer.borrow_mut().push_str(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AtmarkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), AtmarkError> {
        Ok(())
    }
}

/// Standard output.  Close only flushes; the process owns stdout.
pub struct StdoutSink;

impl TextSink for StdoutSink {
    fn write_str(&mut self, data: &str) -> Result<(), AtmarkError> {
        std::io::stdout()
            .write_all(data.as_bytes())
            .map_err(AtmarkError::io)
    }

    fn flush(&mut self) -> Result<(), AtmarkError> {
        std::io::stdout().flush().map_err(AtmarkError::io)
    }

    fn close(&mut self) -> Result<(), AtmarkError> {
        self.flush()
    }
}

/// An output file.  When buffered, nothing touches the filesystem until
/// close; an abort in between discards everything, so a failed run leaves
/// no partial output behind.
pub struct FileSink {
    path: PathBuf,
    append: bool,
    state: FileState,
}

enum FileState {
    Buffered(String),
    Open(File),
    Done,
}

impl FileSink {
    pub fn new(path: PathBuf, append: bool, buffered: bool) -> Result<Self, AtmarkError> {
        let state = if buffered {
            FileState::Buffered(String::new())
        } else {
            FileState::Open(Self::open(&path, append)?)
        };
        Ok(Self {
            path,
            append,
            state,
        })
    }

    fn open(path: &PathBuf, append: bool) -> Result<File, AtmarkError> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(AtmarkError::io)
    }
}

impl TextSink for FileSink {
    fn write_str(&mut self, data: &str) -> Result<(), AtmarkError> {
        match &mut self.state {
            FileState::Buffered(buffer) => {
                buffer.push_str(data);
                Ok(())
            }
            FileState::Open(file) => file.write_all(data.as_bytes()).map_err(AtmarkError::io),
            FileState::Done => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<(), AtmarkError> {
        match &mut self.state {
            FileState::Open(file) => file.flush().map_err(AtmarkError::io),
            _ => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), AtmarkError> {
        match std::mem::replace(&mut self.state, FileState::Done) {
            FileState::Buffered(buffer) => {
                let mut file = Self::open(&self.path, self.append)?;
                file.write_all(buffer.as_bytes()).map_err(AtmarkError::io)?;
                file.flush().map_err(AtmarkError::io)
            }
            FileState::Open(mut file) => file.flush().map_err(AtmarkError::io),
            FileState::Done => Ok(()),
        }
    }

    fn abort(&mut self) {
        if matches!(self.state, FileState::Buffered(_)) {
            self.state = FileState::Done;
        }
    }
}

/// A named, temporarily buffered redirection of output.
pub struct Diversion {
    buffer: String,
}

impl Diversion {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn write_str(&mut self, data: &str) {
        self.buffer.push_str(data);
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

/// One stage of a stream's filter chain.  Each write may emit zero or more
/// chunks downstream; flush and close release whatever the stage was
/// withholding.
pub trait FilterStage {
    fn write_stage(&mut self, data: &str) -> Vec<String>;

    fn flush_stage(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn close_stage(&mut self) -> Vec<String> {
        self.flush_stage()
    }
}

/// Discards everything fed to it.
pub struct NullStage;

impl FilterStage for NullStage {
    fn write_stage(&mut self, _data: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Pumps its input through a string-to-string function.
pub struct FunctionStage {
    function: Box<dyn FnMut(&str) -> String>,
}

impl FunctionStage {
    pub fn new(function: Box<dyn FnMut(&str) -> String>) -> Self {
        Self { function }
    }
}

impl FilterStage for FunctionStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        vec![(self.function)(data)]
    }
}

/// Maps each byte-valued character through a 256-entry translation table.
pub struct TranslateStage {
    table: Vec<char>,
}

impl TranslateStage {
    pub fn new(table: &str) -> Result<Self, AtmarkError> {
        let table: Vec<char> = table.chars().collect();
        if table.len() != 256 {
            return Err(AtmarkError::filter(
                "translation table must be a 256-character string",
            ));
        }
        Ok(Self { table })
    }
}

impl FilterStage for TranslateStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        let translated = data
            .chars()
            .map(|c| {
                let code = c as usize;
                if code < 256 {
                    self.table[code]
                } else {
                    c
                }
            })
            .collect();
        vec![translated]
    }
}

/// Withholds everything until the next flush.
pub struct BufferedStage {
    buffer: String,
}

impl BufferedStage {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }
}

impl Default for BufferedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for BufferedStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        Vec::new()
    }

    fn flush_stage(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(&mut self.buffer)]
        }
    }
}

/// Releases data only in fixed-size chunks (excepting the final one).
pub struct SizeBufferedStage {
    buffer: String,
    size: usize,
}

impl SizeBufferedStage {
    pub fn new(size: usize) -> Result<Self, AtmarkError> {
        if size == 0 {
            return Err(AtmarkError::filter("buffer size must be positive"));
        }
        Ok(Self {
            buffer: String::new(),
            size,
        })
    }
}

impl FilterStage for SizeBufferedStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        let mut chunks = Vec::new();
        while self.buffer.chars().count() > self.size {
            let split: usize = self.buffer.chars().take(self.size).map(char::len_utf8).sum();
            let rest = self.buffer.split_off(split);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    fn flush_stage(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(&mut self.buffer)]
        }
    }
}

/// Only lets whole lines through.
pub struct LineBufferedStage {
    buffer: String,
}

impl LineBufferedStage {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }
}

impl Default for LineBufferedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for LineBufferedStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(pos + 1);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    fn flush_stage(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(&mut self.buffer)]
        }
    }
}

/// Accumulates all output and releases it only on the final close; flushes
/// are ignored.  Lets a template post-process everything exactly once at
/// the very end.
pub struct MaximallyBufferedStage {
    buffer: String,
}

impl MaximallyBufferedStage {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }
}

impl Default for MaximallyBufferedStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for MaximallyBufferedStage {
    fn write_stage(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        Vec::new()
    }

    fn flush_stage(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn close_stage(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            Vec::new()
        } else {
            vec![std::mem::take(&mut self.buffer)]
        }
    }
}

/// A wrapper around an output sink which supports named diversions and a
/// chain of text filters.  Diverted writes are invisible to the real sink
/// until undiverted; filtered writes pass through every stage in order
/// before reaching the sink.
pub struct Stream {
    sink: Box<dyn TextSink>,
    filters: Vec<Box<dyn FilterStage>>,
    diversions: BTreeMap<String, Diversion>,
    current: Option<String>,
    done: bool,
}

impl Stream {
    pub fn new(sink: Box<dyn TextSink>) -> Self {
        Self {
            sink,
            filters: Vec::new(),
            diversions: BTreeMap::new(),
            current: None,
            done: false,
        }
    }

    pub fn write_str(&mut self, data: &str) -> Result<(), AtmarkError> {
        match &self.current {
            Some(name) => {
                // The diversion is guaranteed to exist while it is current.
                if let Some(diversion) = self.diversions.get_mut(name) {
                    diversion.write_str(data);
                }
                Ok(())
            }
            None => self.filter_write(data),
        }
    }

    fn filter_write(&mut self, data: &str) -> Result<(), AtmarkError> {
        let mut chunks = vec![data.to_string()];
        for stage in &mut self.filters {
            let mut passed = Vec::new();
            for chunk in chunks.drain(..) {
                passed.extend(stage.write_stage(&chunk));
            }
            chunks = passed;
        }
        for chunk in chunks {
            self.sink.write_str(&chunk)?;
        }
        Ok(())
    }

    /// Propagate buffered content down the chain, then flush the sink.
    pub fn flush(&mut self) -> Result<(), AtmarkError> {
        let mut pending: Vec<String> = Vec::new();
        for stage in &mut self.filters {
            let mut passed = Vec::new();
            for chunk in pending.drain(..) {
                passed.extend(stage.write_stage(&chunk));
            }
            passed.extend(stage.flush_stage());
            pending = passed;
        }
        for chunk in pending {
            self.sink.write_str(&chunk)?;
        }
        self.sink.flush()
    }

    /// Close the stream: replay any remaining diversions, release every
    /// stage, and close the sink.  Idempotent.
    pub fn close(&mut self) -> Result<(), AtmarkError> {
        if self.done {
            return Ok(());
        }
        self.undivert_all(true)?;
        let mut pending: Vec<String> = Vec::new();
        for stage in &mut self.filters {
            let mut passed = Vec::new();
            for chunk in pending.drain(..) {
                passed.extend(stage.write_stage(&chunk));
            }
            passed.extend(stage.close_stage());
            pending = passed;
        }
        for chunk in pending {
            self.sink.write_str(&chunk)?;
        }
        self.sink.close()?;
        self.done = true;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.sink.abort();
    }

    /// Install a new filter chain; an empty chain means writes bypass
    /// straight to the sink.  The previous chain is flushed first.
    pub fn install(&mut self, stages: Vec<Box<dyn FilterStage>>) -> Result<(), AtmarkError> {
        self.flush()?;
        self.filters = stages;
        Ok(())
    }

    /// Attach a single stage at the end of the current chain.
    pub fn attach(&mut self, stage: Box<dyn FilterStage>) {
        self.filters.push(stage);
    }

    /// Discard the filter chain and all diversions without flushing.  Used
    /// when the interpreter resets after an error.
    pub fn reset_state(&mut self) {
        self.filters.clear();
        self.diversions.clear();
        self.current = None;
    }

    /// Stop any diverting.
    pub fn revert(&mut self) {
        self.current = None;
    }

    fn check_name(name: &str) -> Result<(), AtmarkError> {
        if name.is_empty() {
            Err(AtmarkError::diversion("diversion name must be nonempty"))
        } else {
            Ok(())
        }
    }

    /// Create a diversion without diverting to it.
    pub fn create(&mut self, name: &str) -> Result<(), AtmarkError> {
        Self::check_name(name)?;
        self.diversions
            .entry(name.to_string())
            .or_insert_with(Diversion::new);
        Ok(())
    }

    /// Start diverting.
    pub fn divert(&mut self, name: &str) -> Result<(), AtmarkError> {
        self.create(name)?;
        self.current = Some(name.to_string());
        Ok(())
    }

    /// Copy a diversion's contents to the filter chain, optionally purging
    /// it afterwards.
    pub fn undivert(&mut self, name: &str, purge_afterwards: bool) -> Result<(), AtmarkError> {
        Self::check_name(name)?;
        let contents = match self.diversions.get(name) {
            Some(diversion) => diversion.as_str().to_string(),
            None => {
                return Err(AtmarkError::diversion(format!(
                    "nonexistent diversion: {}",
                    name
                )))
            }
        };
        self.filter_write(&contents)?;
        if purge_afterwards {
            self.purge(name);
        }
        Ok(())
    }

    /// Eliminate a diversion; no-op if it does not exist.
    pub fn purge(&mut self, name: &str) {
        if self.diversions.remove(name).is_some() && self.current.as_deref() == Some(name) {
            self.current = None;
        }
    }

    /// Undivert every diversion in name-sorted order.  Any active
    /// diversion is reverted first, otherwise the replayed content would
    /// itself be re-diverted.
    pub fn undivert_all(&mut self, purge_afterwards: bool) -> Result<(), AtmarkError> {
        if self.diversions.is_empty() {
            return Ok(());
        }
        self.revert();
        let names: Vec<String> = self.diversions.keys().cloned().collect();
        for name in names {
            self.undivert(&name, purge_afterwards)?;
        }
        Ok(())
    }

    pub fn purge_all(&mut self) {
        self.diversions.clear();
        self.current = None;
    }

    pub fn current_diversion(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn diversion_names(&self) -> Vec<String> {
        self.diversions.keys().cloned().collect()
    }
}
