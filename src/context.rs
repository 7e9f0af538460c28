use crate::error::Frame;
use std::fmt;

/// How a context counts its position: text sources count lines, binary
/// sources count bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Lines,
    Bytes,
}

/// A processing context: one per nested source (main document, each
/// included file, each expanded string), used to attribute errors.
#[derive(Debug, Clone)]
pub struct Context {
    pub name: String,
    pub line: usize,
    pub units: Units,
    /// Set by the `@!line` directive so the next bump is suppressed; the
    /// directive's own newline would otherwise immediately skew the count.
    pub pause: bool,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line: 0,
            units: Units::Lines,
            pause: false,
        }
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self {
            units: Units::Bytes,
            ..Self::new(name)
        }
    }

    pub fn bump(&mut self, quantity: usize) {
        if self.pause {
            self.pause = false;
        } else {
            self.line += quantity;
        }
    }

    pub fn frame(&self) -> Frame {
        Frame {
            name: self.name.clone(),
            line: self.line,
            bytes: self.units == Units::Bytes,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.units == Units::Bytes {
            write!(f, "{}:{}[bytes]", self.name, self.line)
        } else {
            write!(f, "{}:{}", self.name, self.line)
        }
    }
}
