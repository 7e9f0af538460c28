use crate::error::AtmarkError;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// A scanner holds a lookahead buffer over incrementally fed input and can
/// scan for markup boundaries, quoted-string boundaries, and balanced
/// delimiter spans inside it.
///
/// All positions are character indices relative to the read pointer.  Every
/// failure to find something that more input could still supply is a
/// transient error; a genuine malformation is a parse error.
pub struct Scanner {
    prefix: char,
    buffer: Vec<char>,
    pointer: usize,
    lock: u32,
}

impl Scanner {
    pub fn new(prefix: char) -> Self {
        Self {
            prefix,
            buffer: Vec::new(),
            pointer: 0,
            lock: 0,
        }
    }

    pub fn with_data(prefix: char, data: &str) -> Self {
        let mut scanner = Self::new(prefix);
        scanner.feed(data);
        scanner
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    pub fn len(&self) -> usize {
        self.buffer.len() - self.pointer
    }

    pub fn is_empty(&self) -> bool {
        self.pointer >= self.buffer.len()
    }

    fn at(&self, index: usize) -> char {
        self.buffer[self.pointer + index]
    }

    /// Feed more data to the scanner.  Never blocks, never fails.
    pub fn feed(&mut self, data: &str) {
        self.buffer.extend(data.chars());
    }

    pub fn advance(&mut self, count: usize) {
        self.pointer += count;
    }

    pub fn retreat(&mut self, count: usize) -> Result<(), AtmarkError> {
        if count > self.pointer {
            return Err(AtmarkError::parse(
                "can't retreat back over synced out characters",
            ));
        }
        self.pointer -= count;
        Ok(())
    }

    /// Consume and return the next `count` characters, advancing the
    /// pointer by `count + slop`.
    pub fn chop(&mut self, count: usize, slop: usize) -> Result<String, AtmarkError> {
        if count + slop > self.len() {
            return Err(AtmarkError::transient("not enough data to read"));
        }
        let result = self.buffer[self.pointer..self.pointer + count]
            .iter()
            .collect();
        self.advance(count + slop);
        Ok(result)
    }

    pub fn chop_char(&mut self) -> Result<char, AtmarkError> {
        if self.is_empty() {
            return Err(AtmarkError::transient("not enough data to read"));
        }
        let c = self.at(0);
        self.advance(1);
        Ok(c)
    }

    /// Consume and return everything remaining.
    pub fn chop_rest(&mut self) -> String {
        let result = self.buffer[self.pointer..].iter().collect();
        self.pointer = self.buffer.len();
        result
    }

    /// Everything remaining, without consuming it.
    pub fn rest(&self) -> String {
        self.buffer[self.pointer..].iter().collect()
    }

    /// Lock the scanner so nested lookahead survives a sync.  Reentrant.
    pub fn lock(&mut self) {
        self.lock += 1;
    }

    pub fn unlock(&mut self) {
        if self.lock > 0 {
            self.lock -= 1;
        }
    }

    /// Discard consumed characters, unless a lookahead lock is held.
    pub fn sync(&mut self) {
        if self.lock == 0 && self.pointer != 0 {
            self.buffer.drain(..self.pointer);
            self.pointer = 0;
        }
    }

    /// Undo in-progress consumption: reset the read pointer to the last
    /// sync point and release any lookahead locks.
    pub fn unsync(&mut self) {
        if self.pointer != 0 {
            self.lock = 0;
            self.pointer = 0;
        }
    }

    /// Find the next occurrence of a character, starting at `start`.
    pub fn find(&self, target: char, start: usize) -> Option<usize> {
        (start..self.len()).find(|&i| self.at(i) == target)
    }

    /// Detect whether position `i` begins a single or triple quote,
    /// returning the quote run.  A triple quote is atomic: it is never
    /// split into three single quotes.  `archetype` is the quote run the
    /// caller is already inside, if any.
    pub fn quote_run(
        &self,
        i: usize,
        archetype: Option<&str>,
    ) -> Result<Option<String>, AtmarkError> {
        if i >= self.len() {
            return Err(AtmarkError::transient("need more data to scan quote"));
        }
        let c = self.at(i);
        if c != '\'' && c != '"' {
            return Ok(None);
        }
        let quote = if self.len() - i >= 3 {
            if self.at(i + 1) == c && self.at(i + 2) == c {
                c.to_string().repeat(3)
            } else {
                c.to_string()
            }
        } else if (i..self.len()).all(|j| self.at(j) == c) {
            // Every remaining character is this quote; a further one could
            // still complete a triple.
            return Err(AtmarkError::transient("need to scan for rest of quote"));
        } else {
            c.to_string()
        };
        match archetype {
            None => Ok(Some(quote)),
            Some(archetype) => {
                if archetype == quote {
                    Ok(Some(quote))
                } else if archetype.len() < quote.len() && archetype.starts_with(c) {
                    Ok(Some(archetype.to_string()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Scan for the first unquoted occurrence of any character in
    /// `targets`, honoring quote state and backslash escaping inside
    /// quotes.  Mandatory scans (used only when an absolute end is known)
    /// fail hard; otherwise the failure is transient.
    pub fn next_of(
        &self,
        targets: &str,
        start: usize,
        end: Option<usize>,
        mandatory: bool,
    ) -> Result<usize, AtmarkError> {
        let end = end.unwrap_or_else(|| self.len());
        let mut quote: Option<String> = None;
        let mut i = start;
        while i < end {
            match self.quote_run(i, quote.as_deref())? {
                Some(run) => {
                    if quote.as_deref() == Some(run.as_str()) {
                        quote = None;
                    } else {
                        quote = Some(run.clone());
                    }
                    i += run.chars().count();
                }
                None => {
                    let c = self.at(i);
                    if quote.is_some() {
                        if c == '\\' {
                            i += 1;
                        }
                    } else if targets.contains(c) {
                        return Ok(i);
                    }
                    i += 1;
                }
            }
        }
        if mandatory {
            Err(AtmarkError::parse(format!(
                "expecting one of '{}', not found",
                targets
            )))
        } else {
            Err(AtmarkError::transient("expecting ending character"))
        }
    }

    /// Scan for the end of the quote beginning at `start`; returns the
    /// index just past the closing quote run.
    pub fn quote_end(
        &self,
        start: usize,
        end: Option<usize>,
        mandatory: bool,
    ) -> Result<usize, AtmarkError> {
        let quote = match self.quote_run(start, None)? {
            Some(run) => run,
            None => return Err(AtmarkError::parse("expecting string literal")),
        };
        let end = end.unwrap_or_else(|| self.len());
        let mut i = start + quote.chars().count();
        while i < end {
            match self.quote_run(i, Some(&quote))? {
                Some(run) => {
                    i += run.chars().count();
                    if run == quote {
                        return Ok(i);
                    }
                }
                None => {
                    if self.at(i) == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
        }
        if mandatory {
            Err(AtmarkError::parse("expecting end of string literal"))
        } else {
            Err(AtmarkError::transient("expecting end of string literal"))
        }
    }

    /// Track nesting depth of `enter`/`exit` characters, respecting quote
    /// state, and return the index of the unmatched `exit` that would take
    /// the depth negative.  An enter/exit immediately following `skip` is
    /// ignored.
    pub fn balanced(
        &self,
        enter: char,
        exit: char,
        start: usize,
        end: Option<usize>,
        skip: Option<char>,
    ) -> Result<usize, AtmarkError> {
        let end = end.unwrap_or_else(|| self.len());
        let mut quote: Option<String> = None;
        let mut depth = 0i32;
        let mut last: Option<char> = None;
        let mut i = start;
        while i < end {
            match self.quote_run(i, quote.as_deref())? {
                Some(run) => {
                    if quote.as_deref() == Some(run.as_str()) {
                        quote = None;
                    } else {
                        quote = Some(run.clone());
                    }
                    i += run.chars().count();
                    last = None;
                }
                None => {
                    let c = self.at(i);
                    if quote.is_some() {
                        if c == '\\' {
                            i += 1;
                        }
                    } else if skip.is_none() || last != skip {
                        if c == enter {
                            depth += 1;
                        } else if c == exit {
                            depth -= 1;
                            if depth < 0 {
                                return Ok(i);
                            }
                        }
                    }
                    last = Some(c);
                    i += 1;
                }
            }
        }
        Err(AtmarkError::transient("expecting end of complex expression"))
    }

    /// Scan forward over a bare identifier.
    pub fn word(&self, start: usize) -> Result<usize, AtmarkError> {
        (start..self.len())
            .find(|&i| !is_word_char(self.at(i)))
            .ok_or_else(|| AtmarkError::transient("expecting end of word"))
    }

    /// Scan over a phrase: an identifier plus any call/index suffixes,
    /// e.g. `word`, `f(a, b)`, `a[i]`, or combinations like `x[i](a)`.
    pub fn phrase(&self, start: usize) -> Result<usize, AtmarkError> {
        let mut i = self.word(start)?;
        while i < self.len() && matches!(self.at(i), '(' | '[' | '{') {
            let enter = self.at(i);
            if enter == '{' {
                return Err(AtmarkError::parse(
                    "curly braces can't open simple expressions",
                ));
            }
            i = self.balanced(enter, closing_for(enter), i + 1, None, None)? + 1;
        }
        Ok(i)
    }

    /// Scan over a simple expression: one or more phrases separated by
    /// dots.  A trailing dot is never included.
    pub fn simple(&self, start: usize) -> Result<usize, AtmarkError> {
        let mut i = self.phrase(start)?;
        while i < self.len() && self.at(i) == '.' {
            i = self.phrase(i + 1)?;
        }
        while i > 0 && self.at(i - 1) == '.' {
            i -= 1;
        }
        Ok(i)
    }
}
