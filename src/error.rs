use ariadne::{Color, Fmt, Label, Report, ReportKind, Source};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn single(pos: usize) -> Self {
        Self {
            start: pos,
            end: pos + 1,
        }
    }
}

/// Where processing currently is, for error attribution.  One frame per
/// nested source (file, include, expand).
#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub line: usize,
    pub bytes: bool,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.bytes {
            write!(f, "{}:{}[bytes]", self.name, self.line)
        } else {
            write!(f, "{}:{}", self.name, self.line)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Markup that cannot be completed with the data currently buffered.
    /// Always caught internally; reaching the top at true end of input means
    /// an unexpected EOF.
    Transient,
    /// Malformed markup.
    Parse,
    /// A syntax error in embedded host code.  Never catchable from
    /// templates.
    Syntax,
    /// A runtime error raised by the host evaluator.
    Runtime,
    /// continue/break escaped its enclosing loop.
    Flow,
    Diversion,
    Filter,
    Hook,
    StackUnderflow,
    /// Interpreter misconfiguration (e.g. pseudo-module name collision).
    Setup,
    Io,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Transient => "Incomplete Markup",
            ErrorKind::Parse => "Parse Error",
            ErrorKind::Syntax => "Syntax Error",
            ErrorKind::Runtime => "Runtime Error",
            ErrorKind::Flow => "Flow Error",
            ErrorKind::Diversion => "Diversion Error",
            ErrorKind::Filter => "Filter Error",
            ErrorKind::Hook => "Hook Error",
            ErrorKind::StackUnderflow => "Stack Underflow",
            ErrorKind::Setup => "Setup Error",
            ErrorKind::Io => "I/O Error",
        }
    }

    /// The name `@[except <kind>]` clauses match against.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Parse => "parse",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Flow => "flow",
            ErrorKind::Diversion => "diversion",
            ErrorKind::Filter => "filter",
            ErrorKind::Hook => "hook",
            ErrorKind::StackUnderflow => "underflow",
            ErrorKind::Setup => "setup",
            ErrorKind::Io => "io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AtmarkError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub message: String,
    pub help: Option<String>,
    /// Host code snippet the span refers to, when the error came out of
    /// embedded evaluation.
    pub code: Option<String>,
    /// Context backtrace, innermost first.
    pub frames: Vec<Frame>,
}

impl AtmarkError {
    pub fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            span: None,
            message,
            help: None,
            code: None,
            frames: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message.into())
    }

    pub fn syntax(span: Span, message: String) -> Self {
        let mut error = Self::new(ErrorKind::Syntax, message);
        error.span = Some(span);
        error
    }

    pub fn syntax_with_help(span: Span, message: String, help: String) -> Self {
        let mut error = Self::syntax(span, message);
        error.help = Some(help);
        error
    }

    pub fn runtime(span: Span, message: String) -> Self {
        let mut error = Self::new(ErrorKind::Runtime, message);
        error.span = Some(span);
        error
    }

    pub fn runtime_with_help(span: Span, message: String, help: String) -> Self {
        let mut error = Self::runtime(span, message);
        error.help = Some(help);
        error
    }

    /// A runtime error with no particular span in host code.
    pub fn eval(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message.into())
    }

    pub fn flow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Flow, message.into())
    }

    pub fn diversion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Diversion, message.into())
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Filter, message.into())
    }

    pub fn hook(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Hook, message.into())
    }

    pub fn underflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StackUnderflow, message.into())
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Setup, message.into())
    }

    pub fn io(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, error.to_string())
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_syntax(&self) -> bool {
        self.kind == ErrorKind::Syntax
    }

    /// Promote a transient error at true end of input into a hard parse
    /// error.
    pub fn promote(mut self) -> Self {
        if self.kind == ErrorKind::Transient {
            self.kind = ErrorKind::Parse;
            self.message = format!("unexpected end of input ({})", self.message);
        }
        self
    }

    /// Attach the host code the span refers to, if not already present.
    pub fn with_code(mut self, code: &str) -> Self {
        if self.code.is_none() && self.span.is_some() {
            self.code = Some(code.to_string());
        }
        self
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Print the compiler-style backtrace: the innermost context carries the
    /// actual description, every enclosing context a generic marker.
    pub fn report(&self) {
        if self.frames.is_empty() {
            eprintln!("{}: {}", self.kind.label(), self.message);
        } else {
            for (i, frame) in self.frames.iter().enumerate() {
                if i == 0 {
                    eprintln!("{}: error: {}: {}", frame, self.kind.label(), self.message);
                } else {
                    eprintln!("{}: from this context", frame);
                }
            }
        }
        self.report_snippet();
    }

    /// Pretty ariadne report against the host code snippet, when one is
    /// attached.
    pub fn report_snippet(&self) {
        let (span, code) = match (&self.span, &self.code) {
            (Some(span), Some(code)) => (span, code),
            _ => return,
        };

        let color = match self.kind {
            ErrorKind::Syntax => Color::Yellow,
            ErrorKind::Runtime => Color::Magenta,
            _ => Color::Red,
        };

        let end = span.end.min(code.len());
        let start = span.start.min(end);
        let mut builder = Report::build(ReportKind::Error, "<code>", start)
            .with_message(format!("{}: {}", self.kind.label().fg(color), self.message))
            .with_label(
                Label::new(("<code>", start..end))
                    .with_message(&self.message)
                    .with_color(color),
            );

        if let Some(ref help_text) = self.help {
            builder = builder.with_note(format!("{}: {}", "help".fg(Color::Cyan), help_text));
        }

        let _ = builder
            .finish()
            .eprint(("<code>", Source::from(code.as_str())));
    }
}

impl fmt::Display for AtmarkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AtmarkError {}

impl From<std::io::Error> for AtmarkError {
    fn from(error: std::io::Error) -> Self {
        AtmarkError::io(error)
    }
}
