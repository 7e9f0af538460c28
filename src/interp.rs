use crate::context::Context;
use crate::error::{AtmarkError, Frame};
use crate::evaluator::{call_callable, Bindings, Engine, ExprEngine};
use crate::markup::{next_token, ControlKind, ControlNode, Token};
use crate::scanner::Scanner;
use crate::stream::{NullSink, Stream, StringSink, TextSink};
use crate::value::{MacroDef, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::rc::Rc;
use tracing::debug;

pub const FAILURE_CODE: i32 = 1;
pub const DEFAULT_PREFIX: char = '@';
pub const DEFAULT_PSEUDO_NAME: &str = "atmark";
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

const BANGPATH: &str = "#!";

/// The fixed vocabulary of lifecycle events hooks may be registered
/// against.
pub const HOOK_EVENTS: &[&str] = &[
    "at_parse",
    "at_shutdown",
    "at_handle",
    "at_quote",
    "at_escape",
    "before_file",
    "after_file",
    "before_binary",
    "after_binary",
    "before_string",
    "after_string",
    "before_include",
    "after_include",
    "before_expand",
    "after_expand",
    "before_evaluate",
    "after_evaluate",
    "before_execute",
    "after_execute",
    "before_significate",
    "after_significate",
    "before_control",
    "after_control",
];

pub struct HookEvent<'a> {
    pub name: &'static str,
    pub details: &'a [(&'static str, String)],
}

pub type Hook = Box<dyn FnMut(&HookEvent)>;

/// Loop-control signal threaded up through token execution.  Distinct
/// from errors: a template `try` can never catch it, and a signal that
/// reaches the parse loop is a hard flow error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Continue,
    Break,
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Replace a leading `#!` line with a comment.
    pub bangpath: bool,
    /// The output sink is fully buffered; abort it on failure.
    pub buffered: bool,
    /// Report errors undecorated instead of with the context backtrace.
    pub raw_errors: bool,
    /// Exit the process with the failure code on an unhandled error.
    pub exit_on_error: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bangpath: true,
            buffered: false,
            raw_errors: false,
            exit_on_error: true,
        }
    }
}

/// An assignment target: a plain name or a nested sequence to unpack.
enum Target {
    Name(String),
    Seq(Vec<Target>),
}

struct Segment<'a> {
    kind: ControlKind,
    rest: Option<&'a str>,
    tokens: Vec<&'a Token>,
}

/// The interpreter processes chunks of markup against a binding
/// environment, writing expanded text to its current stream.
pub struct Interpreter {
    prefix: char,
    pseudo_name: String,
    options: Options,
    globals: Bindings,
    contexts: Vec<Context>,
    streams: Vec<Stream>,
    hooks: HashMap<&'static str, Vec<(usize, Hook)>>,
    /// None means "disabled until a hook is added".
    hooks_enabled: Option<bool>,
    next_hook_id: usize,
    finals: Vec<Value>,
    engine: Rc<dyn Engine>,
    dead: bool,
}

impl Interpreter {
    pub fn new(output: Box<dyn TextSink>) -> Result<Self, AtmarkError> {
        Self::with_config(output, DEFAULT_PREFIX, None, Options::default(), None)
    }

    pub fn with_config(
        output: Box<dyn TextSink>,
        prefix: char,
        pseudo_name: Option<String>,
        options: Options,
        globals: Option<Bindings>,
    ) -> Result<Self, AtmarkError> {
        let mut interp = Self {
            prefix,
            pseudo_name: pseudo_name.unwrap_or_else(|| DEFAULT_PSEUDO_NAME.to_string()),
            options,
            globals: globals.unwrap_or_default(),
            contexts: Vec::new(),
            streams: vec![Stream::new(output)],
            hooks: HashMap::new(),
            hooks_enabled: None,
            next_hook_id: 0,
            finals: Vec::new(),
            engine: Rc::new(ExprEngine),
            dead: false,
        };
        interp.fix()?;
        Ok(interp)
    }

    /// Stamp the pseudo-module into the globals.  A user variable already
    /// holding the reserved name is a fatal setup error.
    fn fix(&mut self) -> Result<(), AtmarkError> {
        let collision = matches!(
            self.globals.get(&self.pseudo_name),
            Some(existing) if !matches!(existing, Value::Pseudo)
        );
        if collision {
            return Err(AtmarkError::setup(format!(
                "interpreter globals collision on '{}'",
                self.pseudo_name
            )));
        }
        let name = self.pseudo_name.clone();
        self.globals.insert(name, Value::Pseudo);
        Ok(())
    }

    /// Replace the evaluator bridge.
    pub fn set_engine(&mut self, engine: Rc<dyn Engine>) {
        self.engine = engine;
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    pub fn set_prefix(&mut self, prefix: char) {
        self.prefix = prefix;
    }

    pub fn pseudo_name(&self) -> &str {
        &self.pseudo_name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn globals(&self) -> &Bindings {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Bindings {
        &mut self.globals
    }

    pub fn is_active(&self) -> bool {
        !self.dead
    }

    // Stack access.

    pub fn stream_mut(&mut self) -> Result<&mut Stream, AtmarkError> {
        self.streams
            .last_mut()
            .ok_or_else(|| AtmarkError::underflow("stream stack is empty"))
    }

    pub fn context(&self) -> Result<&Context, AtmarkError> {
        self.contexts
            .last()
            .ok_or_else(|| AtmarkError::underflow("context stack is empty"))
    }

    pub fn context_mut(&mut self) -> Result<&mut Context, AtmarkError> {
        self.contexts
            .last_mut()
            .ok_or_else(|| AtmarkError::underflow("context stack is empty"))
    }

    pub fn write(&mut self, data: &str) -> Result<(), AtmarkError> {
        self.stream_mut()?.write_str(data)
    }

    pub fn flush(&mut self) -> Result<(), AtmarkError> {
        self.stream_mut()?.flush()
    }

    // The evaluator bridge.

    /// Evaluate a host expression.  Boolean literals short-circuit full
    /// evaluation; they dominate control conditions.
    pub fn evaluate(
        &mut self,
        code: &str,
        locals: Option<&mut Bindings>,
    ) -> Result<Value, AtmarkError> {
        let code = code.trim();
        match code {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
        self.invoke_hook("before_evaluate", &[("code", code.to_string())]);
        let engine = Rc::clone(&self.engine);
        let result = engine
            .evaluate(code, self, locals)
            .map_err(|error| error.with_code(code));
        if result.is_ok() {
            self.invoke_hook("after_evaluate", &[]);
        }
        result
    }

    /// Execute host statements.  Single-line bodies are trimmed so `@{ x = 1 }`
    /// works; multi-line bodies run as-is.
    pub fn execute(
        &mut self,
        code: &str,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let mut statements = code.replace('\r', "");
        if !statements.contains('\n') {
            statements = statements.trim().to_string();
        }
        self.invoke_hook("before_execute", &[("code", statements.clone())]);
        let engine = Rc::clone(&self.engine);
        let result = engine
            .execute(&statements, self, locals)
            .map_err(|error| error.with_code(&statements));
        if result.is_ok() {
            self.invoke_hook("after_execute", &[]);
        }
        result
    }

    /// Evaluate an expression and write its stringification, unless the
    /// result is nil.
    pub fn serialize(
        &mut self,
        code: &str,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let value = self.evaluate(code, locals.as_deref_mut())?;
        if value != Value::Nil {
            self.write(&value.to_string())?;
        }
        Ok(())
    }

    /// Record a significator: bind `__key__` in the environment.
    pub fn significate(
        &mut self,
        key: &str,
        value: Value,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        self.invoke_hook(
            "before_significate",
            &[("key", key.to_string()), ("value", value.to_string())],
        );
        let name = format!("__{}__", key);
        self.atomic(&name, value, locals);
        self.invoke_hook("after_significate", &[]);
        Ok(())
    }

    /// An atomic assignment, into the locals when present.
    pub fn atomic(&mut self, name: &str, value: Value, locals: Option<&mut Bindings>) {
        match locals {
            Some(locals) => {
                locals.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    /// A potentially destructuring assignment: the name may be a single
    /// identifier or a (possibly nested, parenthesized) comma-separated
    /// target list.
    pub fn assign(
        &mut self,
        spec: &str,
        value: Value,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let target = parse_targets(spec)?;
        self.bind(&target, value, locals.as_deref_mut())
    }

    fn bind(
        &mut self,
        target: &Target,
        value: Value,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        match target {
            Target::Name(name) => {
                self.atomic(name, value, locals);
                Ok(())
            }
            Target::Seq(targets) => {
                let values = value.iter_values().ok_or_else(|| {
                    AtmarkError::eval(format!("cannot unpack {}", value.type_name()))
                })?;
                if values.len() != targets.len() {
                    return Err(AtmarkError::eval(format!(
                        "cannot unpack sequence of {} into {} targets",
                        values.len(),
                        targets.len()
                    )));
                }
                for (target, value) in targets.iter().zip(values) {
                    self.bind(target, value, locals.as_deref_mut())?;
                }
                Ok(())
            }
        }
    }

    pub fn defined(&self, name: &str, locals: Option<&Bindings>) -> bool {
        if let Some(locals) = locals {
            if locals.contains_key(name) {
                return true;
            }
        }
        self.globals.contains_key(name)
    }

    // Higher-level operations.

    /// Process an included file against the current stream.
    pub fn include(
        &mut self,
        filename: &str,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        debug!(filename, "including file");
        let file = std::fs::File::open(filename).map_err(AtmarkError::io)?;
        let mut reader = BufReader::new(file);
        self.invoke_hook("before_include", &[("name", filename.to_string())]);
        self.process_file(&mut reader, filename, locals)?;
        self.invoke_hook("after_include", &[]);
        Ok(())
    }

    /// Expand a string against a private stream and return the result,
    /// leaving the real output untouched.
    pub fn expand(
        &mut self,
        data: &str,
        locals: Option<&mut Bindings>,
    ) -> Result<String, AtmarkError> {
        self.invoke_hook("before_expand", &[("string", data.to_string())]);
        let sink = StringSink::new();
        let handle = sink.handle();
        self.streams.push(Stream::new(Box::new(sink)));
        let mut result = self.process_string(data, "<expand>", locals);
        if result.is_ok() {
            result = self.stream_mut().and_then(Stream::flush);
        }
        let _ = self.streams.pop();
        result?;
        self.invoke_hook("after_expand", &[]);
        let expansion = handle.borrow().clone();
        Ok(expansion)
    }

    /// Quote a string so that expanding the result reproduces the
    /// original.
    pub fn quote(&mut self, data: &str) -> String {
        self.invoke_hook("at_quote", &[("string", data.to_string())]);
        let mut result = String::with_capacity(data.len());
        for c in data.chars() {
            if c == self.prefix {
                result.push(self.prefix);
            }
            result.push(c);
        }
        result
    }

    /// Escape nonprintable characters with compatible markup escapes; any
    /// character in `more` is escaped as well.
    pub fn escape(&mut self, data: &str, more: &str) -> String {
        self.invoke_hook("at_escape", &[("string", data.to_string())]);
        let mut result = String::with_capacity(data.len());
        for c in data.chars() {
            if c < ' ' || c > '~' {
                result.push(self.prefix);
                result.push('\\');
                match escape_letter(c) {
                    Some(letter) => result.push(letter),
                    None => {
                        let code = c as u32;
                        if code <= 0xff {
                            result.push_str(&format!("x{:02x}", code));
                        } else if code <= 0xffff {
                            result.push_str(&format!("u{:04x}", code));
                        } else {
                            result.push_str(&format!("U{:08x}", code));
                        }
                    }
                }
            } else if more.contains(c) {
                result.push(self.prefix);
                result.push('\\');
                result.push(c);
            } else {
                result.push(c);
            }
        }
        result
    }

    // Processing drivers.

    /// Process a file-like source line by line.
    pub fn process_file(
        &mut self,
        reader: &mut dyn BufRead,
        name: &str,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        debug!(name, "processing file");
        self.contexts.push(Context::new(name));
        self.invoke_hook("before_file", &[("name", name.to_string())]);
        let mut scanner = Scanner::new(self.prefix);
        let mut first = true;
        let mut done = false;
        while !done {
            self.context_mut()?.bump(1);
            let mut line = String::new();
            let count = reader.read_line(&mut line).map_err(AtmarkError::io)?;
            if first && self.options.bangpath && line.starts_with(BANGPATH) {
                line = format!("{}#{}", self.prefix, &line[BANGPATH.len()..]);
            }
            first = false;
            if count == 0 {
                done = true;
            } else {
                scanner.feed(&line);
            }
            self.safe_parse(&mut scanner, done, locals.as_deref_mut())?;
        }
        self.invoke_hook("after_file", &[]);
        self.contexts.pop();
        Ok(())
    }

    /// Process a binary source in fixed-size chunks, tracking position in
    /// bytes.  Chunk boundaries may split UTF-8 sequences; the partial
    /// tail is carried into the next chunk.
    pub fn process_binary(
        &mut self,
        reader: &mut dyn Read,
        name: &str,
        chunk_size: usize,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        debug!(name, chunk_size, "processing binary source");
        self.contexts.push(Context::binary(name));
        self.invoke_hook("before_binary", &[("name", name.to_string())]);
        let mut scanner = Scanner::new(self.prefix);
        let mut buffer = vec![0u8; chunk_size];
        let mut pending: Vec<u8> = Vec::new();
        let mut done = false;
        while !done {
            let count = reader.read(&mut buffer).map_err(AtmarkError::io)?;
            if count == 0 {
                done = true;
                if !pending.is_empty() {
                    return Err(AtmarkError::parse("incomplete UTF-8 at end of input"));
                }
            } else {
                pending.extend_from_slice(&buffer[..count]);
                let valid = match std::str::from_utf8(&pending) {
                    Ok(chunk) => {
                        scanner.feed(chunk);
                        pending.len()
                    }
                    Err(error) => {
                        if error.error_len().is_some() {
                            return Err(AtmarkError::parse("invalid UTF-8 in input"));
                        }
                        let valid = error.valid_up_to();
                        if let Ok(chunk) = std::str::from_utf8(&pending[..valid]) {
                            scanner.feed(chunk);
                        }
                        valid
                    }
                };
                pending.drain(..valid);
            }
            self.safe_parse(&mut scanner, done, locals.as_deref_mut())?;
            self.context_mut()?.bump(count);
        }
        self.invoke_hook("after_binary", &[]);
        self.contexts.pop();
        Ok(())
    }

    /// Process a pre-materialized string.
    pub fn process_string(
        &mut self,
        data: &str,
        name: &str,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        self.contexts.push(Context::new(name));
        self.invoke_hook("before_string", &[("name", name.to_string())]);
        self.context_mut()?.bump(1);
        let mut scanner = Scanner::with_data(self.prefix, data);
        self.safe_parse(&mut scanner, true, locals)?;
        self.invoke_hook("after_string", &[]);
        self.contexts.pop();
        Ok(())
    }

    /// The protected parse pass: swallow transient errors while more
    /// input is pending; on the final chunk, try a synthetic terminator
    /// first and then promote a lingering transient error to a genuine
    /// unexpected-end-of-input error.
    fn safe_parse(
        &mut self,
        scanner: &mut Scanner,
        final_pass: bool,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        match self.parse_pass(scanner, locals.as_deref_mut()) {
            Err(error) if error.is_transient() => {
                if !final_pass {
                    return Ok(());
                }
                let rest = scanner.rest();
                if !rest.is_empty() && !rest.ends_with('\n') {
                    scanner.feed(&format!("{}\n", self.prefix));
                }
                self.parse_pass(scanner, locals)
                    .map_err(AtmarkError::promote)
            }
            result => result,
        }
    }

    /// Parse and run as much from this scanner as possible.  Tokens are
    /// executed as soon as they are classified.
    fn parse_pass(
        &mut self,
        scanner: &mut Scanner,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        self.invoke_hook("at_parse", &[]);
        while let Some(token) = next_token(scanner)? {
            match self.run_token(&token, locals.as_deref_mut())? {
                Flow::Normal => {}
                Flow::Continue => {
                    return Err(AtmarkError::flow(
                        "control 'continue' without 'for', 'while'",
                    ))
                }
                Flow::Break => {
                    return Err(AtmarkError::flow("control 'break' without 'for', 'while'"))
                }
            }
        }
        Ok(())
    }

    // Token execution.

    fn run_token(
        &mut self,
        token: &Token,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        match token {
            Token::Text(data) => self.write(data)?,
            Token::Prefix => {
                let prefix = self.prefix;
                self.write(&prefix.to_string())?;
            }
            Token::Whitespace(_) | Token::Comment(_) => {}
            Token::Literal(c) | Token::Escape(c) => self.write(&c.to_string())?,
            Token::ContextName(name) => {
                self.context_mut()?.name = name.clone();
            }
            Token::ContextLine(line) => {
                let context = self.context_mut()?;
                context.line = *line;
                context.pause = true;
            }
            Token::Significator { key, value } => {
                let value = match value {
                    Some(code) => self.evaluate(code, locals.as_deref_mut())?,
                    None => Value::Nil,
                };
                self.significate(key, value, locals)?;
            }
            Token::Expression {
                test,
                then,
                otherwise,
                except,
            } => self.run_expression(test, then, otherwise, except, locals)?,
            Token::StringLit(literal) => self.serialize(literal, locals)?,
            Token::Simple(code) => self.serialize(code, locals)?,
            Token::Repr(code) => {
                let value = self.evaluate(code, locals)?;
                self.write(&value.repr())?;
            }
            Token::InPlace(code) => {
                let prefix = self.prefix;
                self.write(&format!("{}:{}:", prefix, code))?;
                let result = self.serialize(code, locals);
                self.write(":")?;
                result?;
            }
            Token::Statement(code) => self.execute(code, locals)?,
            Token::Control(node) => return self.run_control(node, locals),
        }
        Ok(Flow::Normal)
    }

    fn run_expression(
        &mut self,
        test: &str,
        then: &str,
        otherwise: &str,
        except: &str,
        mut locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let outcome = self.eval_conditional(test, then, otherwise, locals.as_deref_mut());
        let value = match outcome {
            Ok(value) => value,
            // Host syntax errors mean the template itself is malformed;
            // they are never the kind of runtime condition an except part
            // guards against.
            Err(error) if !error.is_syntax() && !except.is_empty() => {
                self.evaluate(except, locals)?
            }
            Err(error) => return Err(error),
        };
        if value != Value::Nil {
            self.write(&value.to_string())?;
        }
        Ok(())
    }

    fn eval_conditional(
        &mut self,
        test: &str,
        then: &str,
        otherwise: &str,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Value, AtmarkError> {
        let test_value = self.evaluate(test, locals.as_deref_mut())?;
        if then.is_empty() {
            return Ok(test_value);
        }
        if test_value.is_truthy() {
            self.evaluate(then, locals)
        } else if !otherwise.is_empty() {
            self.evaluate(otherwise, locals)
        } else {
            Ok(Value::Nil)
        }
    }

    // Control markup.

    fn run_control(
        &mut self,
        node: &ControlNode,
        locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        self.invoke_hook(
            "before_control",
            &[("type", node.kind.word().to_string())],
        );
        let flow = match node.kind {
            ControlKind::If => self.run_if(node, locals)?,
            ControlKind::For => self.run_for(node, locals)?,
            ControlKind::While => self.run_while(node, locals)?,
            ControlKind::Try => self.run_try(node, locals)?,
            ControlKind::Def => {
                self.run_def(node, locals)?;
                Flow::Normal
            }
            ControlKind::Continue => Flow::Continue,
            ControlKind::Break => Flow::Break,
            ControlKind::End => {
                return Err(AtmarkError::parse("control 'end' requires primary markup"))
            }
            other => {
                return Err(AtmarkError::parse(format!(
                    "control '{}' cannot be at this level",
                    other.word()
                )))
            }
        };
        self.invoke_hook("after_control", &[]);
        Ok(flow)
    }

    fn subrun(
        &mut self,
        tokens: &[&Token],
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        for token in tokens {
            match self.run_token(token, locals.as_deref_mut())? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn run_if(
        &mut self,
        node: &ControlNode,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        let mut segments = build_segments(node, &[ControlKind::Elif, ControlKind::Else])?;
        let else_tokens = pop_trailing_else(&mut segments);
        for segment in &segments {
            if !matches!(segment.kind, ControlKind::If | ControlKind::Elif) {
                return Err(AtmarkError::parse(format!(
                    "control 'if' unexpected secondary: '{}'",
                    segment.kind.word()
                )));
            }
            let condition = segment.rest.unwrap_or_default();
            if self
                .evaluate(condition, locals.as_deref_mut())?
                .is_truthy()
            {
                return self.subrun(&segment.tokens, locals.as_deref_mut());
            }
        }
        match else_tokens {
            Some(tokens) => self.subrun(&tokens, locals.as_deref_mut()),
            None => Ok(Flow::Normal),
        }
    }

    fn run_for(
        &mut self,
        node: &ControlNode,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        let rest = node.rest.as_deref().unwrap_or_default();
        let (iterator, sequence_code) = split_for(rest)?;
        let mut segments = build_segments(node, &[ControlKind::Else])?;
        let else_tokens = pop_trailing_else(&mut segments);
        if segments.len() != 1 {
            return Err(AtmarkError::parse(
                "control 'for' expects at most one 'else'",
            ));
        }
        let sequence = self.evaluate(&sequence_code, locals.as_deref_mut())?;
        let items = sequence.iter_values().ok_or_else(|| {
            AtmarkError::eval(format!("cannot iterate over {}", sequence.type_name()))
        })?;
        let mut broke = false;
        for item in items {
            self.assign(&iterator, item, locals.as_deref_mut())?;
            match self.subrun(&segments[0].tokens, locals.as_deref_mut())? {
                Flow::Normal => {}
                Flow::Continue => continue,
                Flow::Break => {
                    broke = true;
                    break;
                }
            }
        }
        // The else segment runs iff the loop never broke, zero-iteration
        // loops included.
        if !broke {
            if let Some(tokens) = else_tokens {
                return self.subrun(&tokens, locals.as_deref_mut());
            }
        }
        Ok(Flow::Normal)
    }

    fn run_while(
        &mut self,
        node: &ControlNode,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        let condition = node.rest.as_deref().unwrap_or_default();
        let mut segments = build_segments(node, &[ControlKind::Else])?;
        let else_tokens = pop_trailing_else(&mut segments);
        if segments.len() != 1 {
            return Err(AtmarkError::parse(
                "control 'while' expects at most one 'else'",
            ));
        }
        let mut ended_by_condition = false;
        loop {
            if !self
                .evaluate(condition, locals.as_deref_mut())?
                .is_truthy()
            {
                ended_by_condition = true;
                break;
            }
            match self.subrun(&segments[0].tokens, locals.as_deref_mut())? {
                Flow::Normal => {}
                Flow::Continue => continue,
                Flow::Break => break,
            }
        }
        // The else segment runs iff the loop ended by its condition going
        // false, not by break.
        if ended_by_condition {
            if let Some(tokens) = else_tokens {
                return self.subrun(&tokens, locals.as_deref_mut());
            }
        }
        Ok(Flow::Normal)
    }

    fn run_try(
        &mut self,
        node: &ControlNode,
        mut locals: Option<&mut Bindings>,
    ) -> Result<Flow, AtmarkError> {
        let segments = build_segments(node, &[ControlKind::Except, ControlKind::Finally])?;
        if segments.len() == 1 {
            return Err(AtmarkError::parse("control 'try' needs 'except' or 'finally'"));
        }
        let last_kind = segments[segments.len() - 1].kind;
        if last_kind == ControlKind::Finally {
            if segments.len() != 2 {
                return Err(AtmarkError::parse(
                    "control 'try' can only have one 'finally'",
                ));
            }
            let body_outcome = self.subrun(&segments[0].tokens, locals.as_deref_mut());
            let final_outcome = self.subrun(&segments[1].tokens, locals.as_deref_mut());
            return match (body_outcome, final_outcome) {
                (_, Err(error)) => Err(error),
                (Err(error), Ok(_)) => Err(error),
                (Ok(flow), Ok(Flow::Normal)) => Ok(flow),
                (Ok(_), Ok(flow)) => Ok(flow),
            };
        }
        for segment in &segments[1..] {
            if segment.kind != ControlKind::Except {
                return Err(AtmarkError::parse(
                    "control 'try' cannot have 'except' and 'finally'",
                ));
            }
        }
        match self.subrun(&segments[0].tokens, locals.as_deref_mut()) {
            Ok(flow) => Ok(flow),
            // A host syntax error means the template is malformed; it is
            // never caught here.
            Err(error) if error.is_syntax() || error.is_transient() => Err(error),
            Err(error) => {
                for segment in &segments[1..] {
                    let (kind_name, variable) = parse_clause(segment.rest);
                    let matched = match &kind_name {
                        Some(kind) => kind == error.kind.name(),
                        None => true,
                    };
                    if matched {
                        if let Some(variable) = variable {
                            self.atomic(
                                &variable,
                                Value::String(error.message.clone()),
                                locals.as_deref_mut(),
                            );
                        }
                        return self.subrun(&segment.tokens, locals.as_deref_mut());
                    }
                }
                Err(error)
            }
        }
    }

    /// `@[def name(params)]body@[end def]`: capture the body source and
    /// bind a macro that expands it against call-bound locals.
    fn run_def(
        &mut self,
        node: &ControlNode,
        locals: Option<&mut Bindings>,
    ) -> Result<(), AtmarkError> {
        let signature = node.rest.as_deref().unwrap_or_default();
        let (name, params) = parse_signature(signature)?;
        let body: String = node
            .children
            .iter()
            .map(|token| token.source(self.prefix))
            .collect();
        let def = MacroDef {
            name: name.clone(),
            params,
            body,
        };
        self.atomic(&name, Value::Macro(Rc::new(def)), locals);
        Ok(())
    }

    // Hooks.

    pub fn add_hook(&mut self, name: &str, hook: Hook) -> Result<usize, AtmarkError> {
        let event = Self::hook_event(name)?;
        if self.hooks_enabled.is_none() {
            self.hooks_enabled = Some(true);
        }
        let id = self.next_hook_id;
        self.next_hook_id += 1;
        self.hooks.entry(event).or_default().push((id, hook));
        Ok(id)
    }

    pub fn remove_hook(&mut self, name: &str, id: usize) -> Result<(), AtmarkError> {
        let list = self
            .hooks
            .get_mut(name)
            .ok_or_else(|| AtmarkError::hook(format!("could not remove hook: {}", name)))?;
        let before = list.len();
        list.retain(|(hook_id, _)| *hook_id != id);
        if list.len() == before {
            return Err(AtmarkError::hook(format!("could not remove hook: {}", name)));
        }
        Ok(())
    }

    pub fn clear_hooks(&mut self, name: &str) {
        self.hooks.remove(name);
    }

    pub fn clear_all_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn enable_hooks(&mut self) {
        self.hooks_enabled = Some(true);
    }

    pub fn disable_hooks(&mut self) {
        self.hooks_enabled = Some(false);
    }

    pub fn are_hooks_enabled(&self) -> bool {
        self.hooks_enabled.unwrap_or(true)
    }

    fn hook_event(name: &str) -> Result<&'static str, AtmarkError> {
        HOOK_EVENTS
            .iter()
            .find(|event| **event == name)
            .copied()
            .ok_or_else(|| AtmarkError::hook(format!("unknown hook event: {}", name)))
    }

    /// Manually invoke the hooks for an event by name.
    pub fn invoke_hook_by_name(&mut self, name: &str) -> Result<(), AtmarkError> {
        let event = Self::hook_event(name)?;
        self.invoke_hook(event, &[]);
        Ok(())
    }

    fn invoke_hook(&mut self, name: &'static str, details: &[(&'static str, String)]) {
        if self.hooks_enabled != Some(true) {
            return;
        }
        if let Some(list) = self.hooks.get_mut(name) {
            let event = HookEvent { name, details };
            for (_, hook) in list.iter_mut() {
                hook(&event);
            }
        }
    }

    // Shutdown and error handling.

    /// Register a callable to be run at shutdown, in reverse registration
    /// order.
    pub fn at_exit(&mut self, callable: Value) -> Result<(), AtmarkError> {
        match callable {
            Value::Macro(_) | Value::Bound(_) => {
                self.finals.push(callable);
                Ok(())
            }
            other => Err(AtmarkError::eval(format!(
                "at_exit requires a callable, not {}",
                other.type_name()
            ))),
        }
    }

    fn finalize(&mut self) -> Result<(), AtmarkError> {
        while let Some(callable) = self.finals.pop() {
            let value = call_callable(self, callable, Vec::new(), None)?;
            if value != Value::Nil {
                let text = value.to_string();
                self.write(&text)?;
            }
        }
        Ok(())
    }

    /// Declare this interpreting session over.  Idempotent: registered
    /// finals run once, every remaining stream is closed (replaying its
    /// pending diversions), and further use fails.
    pub fn shutdown(&mut self) -> Result<(), AtmarkError> {
        if self.dead {
            return Ok(());
        }
        debug!("shutting down interpreter");
        self.invoke_hook("at_shutdown", &[]);
        let final_result = self.finalize();
        self.dead = true;
        let mut close_result = Ok(());
        while let Some(mut stream) = self.streams.pop() {
            if let Err(error) = stream.close() {
                if close_result.is_ok() {
                    close_result = Err(error);
                }
            }
        }
        final_result.and(close_result)
    }

    /// Wrap an error with the full nested-context backtrace.
    pub fn decorate(&self, mut error: AtmarkError) -> AtmarkError {
        for context in self.contexts.iter().rev() {
            error.push_frame(context.frame());
        }
        error
    }

    pub fn handle(&mut self, error: &AtmarkError) {
        self.invoke_hook("at_handle", &[("message", error.message.clone())]);
        error.report();
    }

    /// Reset the parsing state so the interpreter can keep accepting
    /// input.  The base stream survives so pending diversions still replay
    /// at shutdown.
    pub fn reset(&mut self) {
        self.contexts.clear();
        self.streams.truncate(1);
    }

    /// Handle an actual processing failure per the configured options.
    pub fn fail(&mut self, error: AtmarkError) {
        if self.options.buffered {
            if let Some(stream) = self.streams.first_mut() {
                stream.abort();
            }
        }
        let error = self.decorate(error);
        if self.options.raw_errors {
            eprintln!("{:?}", error);
        } else {
            self.handle(&error);
        }
        if self.options.exit_on_error {
            std::process::exit(FAILURE_CODE);
        }
        self.reset();
        if let Some(stream) = self.streams.first_mut() {
            stream.reset_state();
        }
    }

    /// Run an operation, resetting the parse state afterwards and routing
    /// any error through `fail`.  Returns whether no error occurred.
    pub fn wrap<F>(&mut self, operation: F) -> bool
    where
        F: FnOnce(&mut Self) -> Result<(), AtmarkError>,
    {
        match operation(self) {
            Ok(()) => {
                self.reset();
                true
            }
            Err(error) => {
                self.fail(error);
                false
            }
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.contexts.iter().rev().map(Context::frame).collect()
    }
}

/// Do an atomic expansion of the given source data, creating and shutting
/// down an interpreter dedicated to the task.  Normal output goes nowhere;
/// only the expansion result is returned.
pub fn expand_string(data: &str, globals: Option<Bindings>) -> Result<String, AtmarkError> {
    let options = Options {
        exit_on_error: false,
        ..Options::default()
    };
    let mut interp =
        Interpreter::with_config(Box::new(NullSink), DEFAULT_PREFIX, None, options, globals)?;
    let result = interp.expand(data, None);
    let shutdown = interp.shutdown();
    let expansion = result?;
    shutdown?;
    Ok(expansion)
}

fn escape_letter(c: char) -> Option<char> {
    match c as u32 {
        0x00 => Some('0'),
        0x07 => Some('a'),
        0x08 => Some('b'),
        0x1b => Some('e'),
        0x0c => Some('f'),
        0x7f => Some('h'),
        0x0a => Some('n'),
        0x0d => Some('r'),
        0x09 => Some('t'),
        0x0b => Some('v'),
        0x04 => Some('z'),
        _ => None,
    }
}

fn build_segments<'a>(
    node: &'a ControlNode,
    allowed: &[ControlKind],
) -> Result<Vec<Segment<'a>>, AtmarkError> {
    let mut segments = vec![Segment {
        kind: node.kind,
        rest: node.rest.as_deref(),
        tokens: Vec::new(),
    }];
    for child in &node.children {
        match child {
            Token::Control(sub) if sub.kind.is_secondary() => {
                if !allowed.contains(&sub.kind) {
                    return Err(AtmarkError::parse(format!(
                        "control unexpected secondary: '{}'",
                        sub.kind.word()
                    )));
                }
                segments.push(Segment {
                    kind: sub.kind,
                    rest: sub.rest.as_deref(),
                    tokens: Vec::new(),
                });
            }
            token => {
                if let Some(last) = segments.last_mut() {
                    last.tokens.push(token);
                }
            }
        }
    }
    Ok(segments)
}

fn pop_trailing_else<'a>(segments: &mut Vec<Segment<'a>>) -> Option<Vec<&'a Token>> {
    if segments.last().map(|segment| segment.kind) == Some(ControlKind::Else) {
        segments.pop().map(|segment| segment.tokens)
    } else {
        None
    }
}

/// Split `for` arguments at the first standalone `in` word:
/// `x in sequence` or `(a, b) in pairs`.
fn split_for(rest: &str) -> Result<(String, String), AtmarkError> {
    let chars: Vec<char> = rest.chars().collect();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut i = 0;
    while i + 1 < chars.len() {
        if chars[i] == 'i'
            && chars[i + 1] == 'n'
            && (i == 0 || !is_word(chars[i - 1]))
            && (i + 2 >= chars.len() || !is_word(chars[i + 2]))
        {
            let iterator: String = chars[..i].iter().collect();
            let sequence: String = chars[i + 2..].iter().collect();
            return Ok((iterator.trim().to_string(), sequence.trim().to_string()));
        }
        i += 1;
    }
    Err(AtmarkError::parse("control expected 'for x in sequence'"))
}

/// Parse an except clause: empty, `kind`, or `kind, variable`.
fn parse_clause(rest: Option<&str>) -> (Option<String>, Option<String>) {
    let rest = match rest {
        Some(rest) if !rest.trim().is_empty() => rest.trim(),
        _ => return (None, None),
    };
    match rest.split_once(',') {
        Some((kind, variable)) => {
            let kind = kind.trim();
            (
                if kind.is_empty() {
                    None
                } else {
                    Some(kind.to_string())
                },
                Some(variable.trim().to_string()),
            )
        }
        None => (Some(rest.to_string()), None),
    }
}

/// Parse a macro signature: `name` or `name(param, param)`.
fn parse_signature(signature: &str) -> Result<(String, Vec<String>), AtmarkError> {
    let signature = signature.trim();
    let is_identifier = |s: &str| {
        !s.is_empty()
            && s.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
            && s.chars().all(|c| c.is_alphanumeric() || c == '_')
    };
    match signature.split_once('(') {
        None => {
            if is_identifier(signature) {
                Ok((signature.to_string(), Vec::new()))
            } else {
                Err(AtmarkError::parse(format!(
                    "malformed macro signature: '{}'",
                    signature
                )))
            }
        }
        Some((name, params)) => {
            let name = name.trim();
            let params = params.trim();
            if !is_identifier(name) || !params.ends_with(')') {
                return Err(AtmarkError::parse(format!(
                    "malformed macro signature: '{}'",
                    signature
                )));
            }
            let inner = params[..params.len() - 1].trim();
            if inner.is_empty() {
                return Ok((name.to_string(), Vec::new()));
            }
            let mut names = Vec::new();
            for param in inner.split(',') {
                let param = param.trim();
                if !is_identifier(param) {
                    return Err(AtmarkError::parse(format!(
                        "malformed macro parameter: '{}'",
                        param
                    )));
                }
                names.push(param.to_string());
            }
            Ok((name.to_string(), names))
        }
    }
}

/// Parse an assignment target specification with optional destructuring.
fn parse_targets(spec: &str) -> Result<Target, AtmarkError> {
    parse_target_list(spec)
}

fn parse_target_list(spec: &str) -> Result<Target, AtmarkError> {
    let parts = split_top_commas(spec)?;
    if parts.len() == 1 {
        parse_one_target(&parts[0])
    } else {
        let targets = parts
            .iter()
            .map(|part| parse_one_target(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Target::Seq(targets))
    }
}

fn parse_one_target(spec: &str) -> Result<Target, AtmarkError> {
    let spec = spec.trim();
    if spec.starts_with('(') && spec.ends_with(')') {
        return parse_target_list(&spec[1..spec.len() - 1]);
    }
    let valid = !spec.is_empty()
        && spec.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && spec.chars().all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(Target::Name(spec.to_string()))
    } else {
        Err(AtmarkError::parse(format!(
            "unexpected assignment token: '{}'",
            spec
        )))
    }
}

fn split_top_commas(spec: &str) -> Result<Vec<String>, AtmarkError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in spec.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(AtmarkError::parse(format!(
                        "unbalanced assignment target: '{}'",
                        spec
                    )));
                }
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(AtmarkError::parse(format!(
            "unbalanced assignment target: '{}'",
            spec
        )));
    }
    parts.push(current);
    Ok(parts)
}
