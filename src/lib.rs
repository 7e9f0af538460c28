// atmark - an embedded @-markup template processor
//
// A prefix-triggered markup scanner over an incrementally fed buffer, an
// embedded expression/statement evaluator bridged through the Engine
// trait, a diversion/filter output subsystem, and structured control
// markup layered on top.

// Public modules
pub mod ast;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod interp;
pub mod lexer;
pub mod markup;
pub mod parser;
pub mod processor;
pub mod pseudo;
pub mod repl;
pub mod runner;
pub mod scanner;
pub mod stream;
pub mod value;

// Re-export commonly used items
pub use context::{Context, Units};
pub use error::{AtmarkError, ErrorKind, Frame, Span};
pub use evaluator::{Bindings, Builtin, Engine, Evaluator, ExprEngine};
pub use interp::{
    expand_string, Flow, Hook, HookEvent, Interpreter, Options, DEFAULT_CHUNK_SIZE,
    DEFAULT_PREFIX, DEFAULT_PSEUDO_NAME, FAILURE_CODE, HOOK_EVENTS,
};
pub use markup::{next_token, ControlKind, ControlNode, Token};
pub use processor::{Document, Processor};
pub use pseudo::PseudoOp;
pub use scanner::Scanner;
pub use stream::{
    BufferedStage, Diversion, FileSink, FilterStage, FunctionStage, LineBufferedStage,
    MaximallyBufferedStage, NullSink, NullStage, SizeBufferedStage, StdoutSink, Stream,
    StringSink, TextSink, TranslateStage,
};
pub use value::{MacroDef, Value};

// Re-export main entry points
pub use repl::start as interact;
pub use runner::{preprocess, process_document, Prep};
