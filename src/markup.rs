use crate::error::AtmarkError;
use crate::scanner::Scanner;

/// One parsed unit of expansion.  Tokens are executed immediately after
/// classification; only control tokens own children, gathered by a
/// recursive sub-scan until the matching terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A chunk of data not containing markup.
    Text(String),
    /// The doubled prefix; expands to one literal prefix character.
    Prefix,
    /// Prefix followed by whitespace: a line continuation, no output.
    Whitespace(char),
    /// A literal closing bracket passthrough: `@)`, `@]`, `@}`.
    Literal(char),
    /// A decoded `@\` escape.
    Escape(char),
    /// `@# ...` through the newline; discarded.
    Comment(String),
    /// `@?name` renames the current context.
    ContextName(String),
    /// `@!line` repositions the current context.
    ContextLine(usize),
    /// `@%key value` metadata declaration.
    Significator {
        key: String,
        value: Option<String>,
    },
    /// `@(test ? then ! else $ except)` expression markup.
    Expression {
        test: String,
        then: String,
        otherwise: String,
        except: String,
    },
    /// `@"..."` string literal markup; evaluated by the host.
    StringLit(String),
    /// `@identifier.attr(args)[index]` simple expression.
    Simple(String),
    /// ``@`expr` `` writes the debug representation.
    Repr(String),
    /// `@:expr::` in-place markup; output can be re-expanded.
    InPlace(String),
    /// `@{statements}` host statement block.
    Statement(String),
    /// `@[...]` control markup.
    Control(ControlNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    If,
    Elif,
    Else,
    For,
    While,
    Try,
    Except,
    Finally,
    Continue,
    Break,
    Def,
    End,
}

impl ControlKind {
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "if" => Some(ControlKind::If),
            "elif" => Some(ControlKind::Elif),
            "else" => Some(ControlKind::Else),
            "for" => Some(ControlKind::For),
            "while" => Some(ControlKind::While),
            "try" => Some(ControlKind::Try),
            "except" => Some(ControlKind::Except),
            "finally" => Some(ControlKind::Finally),
            "continue" => Some(ControlKind::Continue),
            "break" => Some(ControlKind::Break),
            "def" => Some(ControlKind::Def),
            "end" => Some(ControlKind::End),
            _ => None,
        }
    }

    pub fn word(self) -> &'static str {
        match self {
            ControlKind::If => "if",
            ControlKind::Elif => "elif",
            ControlKind::Else => "else",
            ControlKind::For => "for",
            ControlKind::While => "while",
            ControlKind::Try => "try",
            ControlKind::Except => "except",
            ControlKind::Finally => "finally",
            ControlKind::Continue => "continue",
            ControlKind::Break => "break",
            ControlKind::Def => "def",
            ControlKind::End => "end",
        }
    }

    /// Primary kinds open a block and greedily sub-scan until `end <kind>`.
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            ControlKind::If
                | ControlKind::For
                | ControlKind::While
                | ControlKind::Try
                | ControlKind::Def
        )
    }

    /// Secondary kinds divide a primary block into segments.
    pub fn is_secondary(self) -> bool {
        matches!(
            self,
            ControlKind::Elif | ControlKind::Else | ControlKind::Except | ControlKind::Finally
        )
    }

    /// Kinds that require arguments.
    pub fn is_greedy(self) -> bool {
        matches!(
            self,
            ControlKind::If
                | ControlKind::Elif
                | ControlKind::For
                | ControlKind::While
                | ControlKind::Def
                | ControlKind::End
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlNode {
    pub kind: ControlKind,
    pub rest: Option<String>,
    pub children: Vec<Token>,
}

impl Token {
    /// Reconstruct the source text of this token, with `prefix` as the
    /// markup trigger.  Used to capture macro bodies verbatim.
    pub fn source(&self, prefix: char) -> String {
        match self {
            Token::Text(data) => data.clone(),
            Token::Prefix => format!("{}{}", prefix, prefix),
            Token::Whitespace(c) => format!("{}{}", prefix, c),
            Token::Literal(c) => format!("{}{}", prefix, c),
            Token::Escape(c) => {
                let code = *c as u32;
                if code <= 0xff {
                    format!("{}\\x{:02x}", prefix, code)
                } else if code <= 0xffff {
                    format!("{}\\u{:04x}", prefix, code)
                } else {
                    format!("{}\\U{:08x}", prefix, code)
                }
            }
            Token::Comment(text) => format!("{}#{}\n", prefix, text),
            Token::ContextName(name) => format!("{}?{}\n", prefix, name),
            Token::ContextLine(line) => format!("{}!{}\n", prefix, line),
            Token::Significator { key, value } => match value {
                Some(value) => format!("{}%{} {}\n", prefix, key, value),
                None => format!("{}%{}\n", prefix, key),
            },
            Token::Expression {
                test,
                then,
                otherwise,
                except,
            } => {
                let mut code = test.clone();
                if !then.is_empty() {
                    code.push('?');
                    code.push_str(then);
                }
                if !otherwise.is_empty() {
                    code.push('!');
                    code.push_str(otherwise);
                }
                if !except.is_empty() {
                    code.push('$');
                    code.push_str(except);
                }
                format!("{}({})", prefix, code)
            }
            Token::StringLit(literal) => format!("{}{}", prefix, literal),
            Token::Simple(code) => format!("{}{}", prefix, code),
            Token::Repr(code) => format!("{}`{}`", prefix, code),
            Token::InPlace(code) => format!("{}:{}::", prefix, code),
            Token::Statement(code) => format!("{}{{{}}}", prefix, code),
            Token::Control(node) => {
                let contents = match &node.rest {
                    Some(rest) => format!("{} {}", node.kind.word(), rest),
                    None => node.kind.word().to_string(),
                };
                if node.kind.is_primary() {
                    let body: String =
                        node.children.iter().map(|t| t.source(prefix)).collect();
                    format!(
                        "{}[{}]{}{}[end {}]",
                        prefix,
                        contents,
                        body,
                        prefix,
                        node.kind.word()
                    )
                } else {
                    format!("{}[{}]", prefix, contents)
                }
            }
        }
    }
}

/// Classify and consume exactly one markup unit from the scanner, or
/// return None if the buffer is empty.  A transient error means the markup
/// cannot be completed with the data currently buffered; the read pointer
/// is reset so the scan can be retried after more input arrives.
pub fn next_token(scanner: &mut Scanner) -> Result<Option<Token>, AtmarkError> {
    if scanner.is_empty() {
        return Ok(None);
    }
    let token = match scanner.find(scanner.prefix(), 0) {
        None => Token::Text(scanner.chop_rest()),
        Some(0) => match scan_markup(scanner) {
            Ok(token) => token,
            Err(error) => {
                if error.is_transient() {
                    scanner.unsync();
                }
                return Err(error);
            }
        },
        Some(loc) => Token::Text(scanner.chop(loc, 0)?),
    };
    scanner.sync();
    Ok(Some(token))
}

fn scan_markup(scanner: &mut Scanner) -> Result<Token, AtmarkError> {
    let prefix = scanner.prefix();
    scanner.chop(1, 0)?; // the prefix itself
    let first = scanner.chop_char()?;

    match first {
        c if c == prefix => Ok(Token::Prefix),
        c if c.is_whitespace() => Ok(Token::Whitespace(c)),
        ')' | ']' | '}' => Ok(Token::Literal(first)),
        '\\' => Ok(Token::Escape(scan_escape(scanner)?)),
        '#' => {
            let loc = scanner
                .find('\n', 0)
                .ok_or_else(|| AtmarkError::transient("comment expects newline"))?;
            Ok(Token::Comment(scanner.chop(loc, 1)?))
        }
        '?' => {
            let loc = scanner
                .find('\n', 0)
                .ok_or_else(|| AtmarkError::transient("context name expects newline"))?;
            Ok(Token::ContextName(scanner.chop(loc, 1)?.trim().to_string()))
        }
        '!' => {
            let loc = scanner
                .find('\n', 0)
                .ok_or_else(|| AtmarkError::transient("context line expects newline"))?;
            let text = scanner.chop(loc, 1)?;
            let line = text
                .trim()
                .parse::<usize>()
                .map_err(|_| AtmarkError::parse("context line requires integer"))?;
            Ok(Token::ContextLine(line))
        }
        '%' => scan_significator(scanner),
        '(' => scan_expression(scanner),
        '`' => {
            let loc = scanner.next_of("`", 0, None, false)?;
            Ok(Token::Repr(scanner.chop(loc, 1)?))
        }
        ':' => {
            let i = scanner.next_of(":", 0, None, false)?;
            let j = scanner.next_of(":", i + 1, None, false)?;
            Ok(Token::InPlace(scanner.chop(i, j - i + 1)?))
        }
        '[' => scan_control(scanner),
        '{' => {
            let loc = scanner.balanced('{', '}', 0, None, Some('\\'))?;
            Ok(Token::Statement(scanner.chop(loc, 1)?))
        }
        '\'' | '"' => {
            scanner.retreat(1)?;
            let loc = scanner.quote_end(0, None, false)?;
            Ok(Token::StringLit(scanner.chop(loc, 0)?))
        }
        c if c.is_alphabetic() || c == '_' => {
            let loc = scanner.simple(0)?;
            let mut code = String::new();
            code.push(c);
            code.push_str(&scanner.chop(loc, 0)?);
            Ok(Token::Simple(code))
        }
        other => Err(AtmarkError::parse(format!(
            "unknown markup: {}{}",
            prefix, other
        ))),
    }
}

/// Decode one `@\` escape.  Fixed-width numeric forms consume exactly as
/// many characters as their base requires; out-of-range or malformed codes
/// are hard parse errors.
fn scan_escape(scanner: &mut Scanner) -> Result<char, AtmarkError> {
    let code = scanner.chop_char()?;
    match code {
        '(' | ')' | '[' | ']' | '{' | '}' | '\'' | '"' | '\\' => Ok(code),
        '0' => Ok('\0'),
        'a' => Ok('\x07'),
        'b' => Ok('\x08'),
        'd' => numeric_escape(scanner, 3, 10),
        'e' => Ok('\x1b'),
        'f' => Ok('\x0c'),
        'h' => Ok('\x7f'),
        'n' => Ok('\n'),
        'o' => numeric_escape(scanner, 3, 8),
        'q' => numeric_escape(scanner, 4, 4),
        'r' => Ok('\r'),
        's' | ' ' => Ok(' '),
        't' => Ok('\t'),
        'u' => numeric_escape(scanner, 4, 16),
        'U' => numeric_escape(scanner, 8, 16),
        'v' => Ok('\x0b'),
        'x' => numeric_escape(scanner, 2, 16),
        'z' => Ok('\x04'),
        '^' => {
            let control = scanner
                .chop_char()?
                .to_ascii_uppercase();
            if ('@'..='`').contains(&control) {
                Ok((control as u8 - b'@') as char)
            } else if control == '?' {
                Ok('\x7f')
            } else {
                Err(AtmarkError::parse("invalid escape control code"))
            }
        }
        _ => Err(AtmarkError::parse("unrecognized escape code")),
    }
}

fn numeric_escape(scanner: &mut Scanner, width: usize, radix: u32) -> Result<char, AtmarkError> {
    let digits = scanner.chop(width, 0)?;
    let code = u32::from_str_radix(&digits, radix)
        .map_err(|_| AtmarkError::parse("invalid numeric escape code"))?;
    char::from_u32(code).ok_or_else(|| AtmarkError::parse("numeric escape code out of range"))
}

fn scan_significator(scanner: &mut Scanner) -> Result<Token, AtmarkError> {
    let loc = scanner
        .find('\n', 0)
        .ok_or_else(|| AtmarkError::transient("significator expects newline"))?;
    let line = scanner.chop(loc, 1)?;
    if line.is_empty() {
        return Err(AtmarkError::parse("significator must have nonblank key"));
    }
    if line.starts_with(|c: char| c.is_whitespace()) {
        return Err(AtmarkError::parse("no whitespace between % and key"));
    }
    let trimmed = line.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((key, value)) => {
            let value = value.trim();
            Ok(Token::Significator {
                key: key.to_string(),
                value: if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                },
            })
        }
        None => Ok(Token::Significator {
            key: trimmed.to_string(),
            value: None,
        }),
    }
}

/// Partition a balanced-parenthesis span into test/then/else/except parts
/// at its unquoted secondary delimiters.
fn scan_expression(scanner: &mut Scanner) -> Result<Token, AtmarkError> {
    let z = scanner.balanced('(', ')', 0, None, Some('\\'))?;
    let q = scanner.next_of("$", 0, Some(z), true).unwrap_or(z);
    let (i, j) = match scanner.next_of("?", 0, Some(q), true) {
        Ok(i) => {
            let j = scanner
                .next_of("!", i, Some(q), true)
                .or_else(|_| scanner.next_of(":", i, Some(q), true)) // DEPRECATED
                .unwrap_or(q);
            (i, j)
        }
        Err(_) => (q, q),
    };
    let code: Vec<char> = scanner.chop(z, 1)?.chars().collect();
    let segment = |from: usize, to: usize| -> String {
        if from >= to || from >= code.len() {
            String::new()
        } else {
            code[from..to.min(code.len())].iter().collect()
        }
    };
    Ok(Token::Expression {
        test: segment(0, i),
        then: segment(i + 1, j),
        otherwise: segment(j + 1, q),
        except: segment(q + 1, z),
    })
}

fn scan_control(scanner: &mut Scanner) -> Result<Token, AtmarkError> {
    // The lock keeps the buffer intact while children are sub-scanned; on
    // a transient error the unlock is skipped and unsync clears the lock
    // along with the in-progress consumption.
    scanner.lock();
    let node = scan_control_inner(scanner)?;
    scanner.unlock();
    Ok(Token::Control(node))
}

fn scan_control_inner(scanner: &mut Scanner) -> Result<ControlNode, AtmarkError> {
    let loc = scanner.balanced('[', ']', 0, None, None)?;
    let contents = scanner.chop(loc, 1)?;
    let trimmed = contents.trim();
    let (word, rest) = match trimmed.split_once(' ') {
        Some((word, rest)) => (word, Some(rest.trim().to_string())),
        None => (trimmed, None),
    };
    let kind = ControlKind::from_word(word)
        .ok_or_else(|| AtmarkError::parse(format!("unknown control markup: '{}'", word)))?;
    if kind.is_greedy() && rest.is_none() {
        return Err(AtmarkError::parse(format!(
            "control '{}' needs arguments",
            word
        )));
    }
    let mut children = Vec::new();
    if kind.is_primary() {
        loop {
            match next_token(scanner)? {
                None => {
                    return Err(AtmarkError::transient(format!(
                        "control '{}' needs more tokens",
                        word
                    )))
                }
                Some(Token::Control(end)) if end.kind == ControlKind::End => {
                    if end.rest.as_deref() != Some(word) {
                        return Err(AtmarkError::parse(format!(
                            "control must end with 'end {}'",
                            word
                        )));
                    }
                    break;
                }
                Some(token) => children.push(token),
            }
        }
    }
    Ok(ControlNode {
        kind,
        rest,
        children,
    })
}
